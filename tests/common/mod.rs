//! In-memory ports for driving a whole node on the host

#![allow(dead_code)]

use embassy_time::{Duration, Instant};
use embedded_storage::{ReadStorage, Storage};
use node_rs::actuators::{ActuatorCommand, ActuatorDriver};
use node_rs::clock::Clock;
use node_rs::connectivity::{AccessPointRadio, RadioError, StationRadio};
use node_rs::credentials::Credentials;
use node_rs::node::{Node, NodeSettings, Parts, Platform};
use node_rs::ota::{FirmwareUpdater, SystemControl, UpdateResult};
use node_rs::portal::{FormResponse, PortalLink, ProvisioningForm};
use node_rs::session::{ConnectOptions, InboundMessage, LinkError, MqttLink, QoS};
use node_rs::telemetry::{SensorSnapshot, SensorSource};
use node_rs::time::NetworkTime;
use smart_leds::{RGB8, SmartLedsWrite};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

pub const MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xAA, 0xBB, 0xCC];
pub const NODE_ID: &str = "246F28AABBCC";
pub const COMMAND_TOPIC: &str = "devices/246F28AABBCC/commands";
pub const DATA_TOPIC: &str = "devices/246F28AABBCC/data";

#[derive(Clone, Default)]
pub struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    pub fn advance(&self, duration: Duration) {
        self.0.set(self.0.get() + duration.as_millis());
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.0.get())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Default)]
pub struct RadioState {
    /// Networks in range, with the secret they accept
    pub networks: Vec<(String, String)>,
    pub linked: bool,
    /// Network names of every join attempt
    pub joins: Vec<String>,
    pub access_point: Option<String>,
    pub ap_starts: u32,
}

#[derive(Clone, Default)]
pub struct ScriptedRadio(pub Rc<RefCell<RadioState>>);

impl ScriptedRadio {
    pub fn add_network(&self, name: &str, secret: &str) {
        self.0
            .borrow_mut()
            .networks
            .push((name.to_string(), secret.to_string()));
    }

    pub fn remove_networks(&self) {
        self.0.borrow_mut().networks.clear();
    }

    pub fn drop_link(&self) {
        self.0.borrow_mut().linked = false;
    }

    pub fn joins(&self) -> Vec<String> {
        self.0.borrow().joins.clone()
    }

    pub fn access_point(&self) -> Option<String> {
        self.0.borrow().access_point.clone()
    }
}

impl StationRadio for ScriptedRadio {
    fn begin_join(&mut self, credentials: &Credentials) -> Result<(), RadioError> {
        let mut state = self.0.borrow_mut();
        state.joins.push(credentials.network_name().to_string());
        let in_range = state.networks.iter().any(|(name, secret)| {
            name == credentials.network_name() && secret == credentials.secret()
        });
        state.linked = in_range;
        Ok(())
    }

    fn is_linked(&mut self) -> bool {
        self.0.borrow().linked
    }

    fn leave(&mut self) {
        self.0.borrow_mut().linked = false;
    }

    fn rssi(&mut self) -> Option<i8> {
        self.0.borrow().linked.then_some(-55)
    }
}

impl AccessPointRadio for ScriptedRadio {
    fn start_access_point(&mut self, name: &str, _address: [u8; 4]) -> Result<(), RadioError> {
        let mut state = self.0.borrow_mut();
        state.linked = false;
        state.access_point = Some(name.to_string());
        state.ap_starts += 1;
        Ok(())
    }

    fn stop_access_point(&mut self) {
        self.0.borrow_mut().access_point = None;
    }
}

/// RAM flash shared across simulated restarts; erased bytes read as 0xFF
#[derive(Clone)]
pub struct SharedFlash(pub Rc<RefCell<Vec<u8>>>);

impl SharedFlash {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(vec![0xFF; 0x10000])))
    }
}

impl ReadStorage for SharedFlash {
    type Error = ();

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), ()> {
        let start = offset as usize;
        let flash = self.0.borrow();
        let src = flash.get(start..start + bytes.len()).ok_or(())?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.0.borrow().len()
    }
}

impl Storage for SharedFlash {
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), ()> {
        let start = offset as usize;
        let mut flash = self.0.borrow_mut();
        let dst = flash.get_mut(start..start + bytes.len()).ok_or(())?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

#[derive(Default)]
pub struct PortalState {
    pub active: bool,
    pub submissions: VecDeque<ProvisioningForm>,
    pub responses: Vec<FormResponse>,
}

#[derive(Clone, Default)]
pub struct MockPortal(pub Rc<RefCell<PortalState>>);

impl MockPortal {
    pub fn submit(&self, network_name: &str, secret: &str) {
        self.0.borrow_mut().submissions.push_back(ProvisioningForm {
            network_name: network_name.into(),
            secret: secret.into(),
        });
    }

    pub fn is_active(&self) -> bool {
        self.0.borrow().active
    }

    pub fn responses(&self) -> Vec<FormResponse> {
        self.0.borrow().responses.clone()
    }
}

impl PortalLink for MockPortal {
    fn set_active(&mut self, active: bool) {
        self.0.borrow_mut().active = active;
    }

    fn next_submission(&mut self) -> Option<ProvisioningForm> {
        self.0.borrow_mut().submissions.pop_front()
    }

    fn respond(&mut self, response: FormResponse) {
        self.0.borrow_mut().responses.push(response);
    }
}

pub struct BrokerState {
    pub reachable: bool,
    pub connected: bool,
    pub connect_attempts: u32,
    pub subscriptions: Vec<(String, QoS)>,
    pub published: Vec<(String, String)>,
    pub inbound: VecDeque<InboundMessage>,
    pub will: Option<(String, String)>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connected: false,
            connect_attempts: 0,
            subscriptions: Vec::new(),
            published: Vec::new(),
            inbound: VecDeque::new(),
            will: None,
        }
    }
}

/// Recording broker link
#[derive(Clone, Default)]
pub struct FakeBroker(pub Rc<RefCell<BrokerState>>);

impl FakeBroker {
    pub fn set_reachable(&self, reachable: bool) {
        self.0.borrow_mut().reachable = reachable;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.0.borrow().connect_attempts
    }

    /// Queue a message as if the broker delivered it
    pub fn deliver(&self, topic: &str, payload: &str) {
        self.0.borrow_mut().inbound.push_back(InboundMessage {
            topic: topic.try_into().unwrap(),
            payload: heapless::Vec::from_slice(payload.as_bytes()).unwrap(),
        });
    }

    /// Payloads published on `topic`, oldest first
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.0
            .borrow()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Status values of every status message on the data topic
    pub fn statuses(&self) -> Vec<String> {
        self.published_on(DATA_TOPIC)
            .iter()
            .filter(|payload| !payload.contains("\"type\""))
            .filter_map(|payload| field(payload, "status"))
            .collect()
    }

    pub fn clear_published(&self) {
        self.0.borrow_mut().published.clear();
    }
}

/// Raw text of a top-level string field, enough for asserting on flat messages
pub fn field(payload: &str, name: &str) -> Option<String> {
    let key = format!("\"{}\":\"", name);
    let start = payload.find(&key)? + key.len();
    let end = payload[start..].find('"')? + start;
    Some(payload[start..end].to_string())
}

impl MqttLink for FakeBroker {
    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), LinkError> {
        let mut state = self.0.borrow_mut();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(LinkError::Transport);
        }
        state.connected = true;
        state.will = Some((
            options.will_topic.to_string(),
            String::from_utf8_lossy(options.will_payload).into_owned(),
        ));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.0.borrow_mut().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        let mut state = self.0.borrow_mut();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _qos: QoS,
        _retain: bool,
    ) -> Result<(), LinkError> {
        let mut state = self.0.borrow_mut();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        state.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, LinkError> {
        let mut state = self.0.borrow_mut();
        if !state.connected {
            return Err(LinkError::NotConnected);
        }
        Ok(state.inbound.pop_front())
    }
}

#[derive(Clone, Default)]
pub struct FixedSensors(pub Rc<Cell<SensorSnapshot>>);

impl FixedSensors {
    pub fn set(&self, snapshot: SensorSnapshot) {
        self.0.set(snapshot);
    }
}

impl SensorSource for FixedSensors {
    fn sample(&mut self) -> SensorSnapshot {
        self.0.get()
    }
}

/// Every command that reached the hardware
#[derive(Clone, Default)]
pub struct RecordingDriver(pub Rc<RefCell<Vec<ActuatorCommand>>>);

impl RecordingDriver {
    pub fn commands(&self) -> Vec<ActuatorCommand> {
        self.0.borrow().clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl ActuatorDriver for RecordingDriver {
    fn drive(&mut self, command: ActuatorCommand) {
        self.0.borrow_mut().push(command);
    }
}

#[derive(Clone)]
pub struct ScriptedUpdater(pub Rc<RefCell<(UpdateResult, Vec<String>)>>);

impl Default for ScriptedUpdater {
    fn default() -> Self {
        Self(Rc::new(RefCell::new((UpdateResult::NoUpdateAvailable, Vec::new()))))
    }
}

impl ScriptedUpdater {
    pub fn will_return(&self, result: UpdateResult) {
        self.0.borrow_mut().0 = result;
    }

    pub fn requested(&self) -> Vec<String> {
        self.0.borrow().1.clone()
    }
}

impl FirmwareUpdater for ScriptedUpdater {
    async fn apply_update(&mut self, url: &str) -> UpdateResult {
        let mut state = self.0.borrow_mut();
        state.1.push(url.to_string());
        state.0
    }
}

#[derive(Clone, Default)]
pub struct MockSystem(pub Rc<Cell<u32>>);

impl MockSystem {
    pub fn restarts(&self) -> u32 {
        self.0.get()
    }
}

impl SystemControl for MockSystem {
    fn restart(&mut self) {
        self.0.set(self.0.get() + 1);
    }

    fn free_heap(&self) -> u32 {
        150_000
    }

    fn uptime_ms(&self) -> u64 {
        42_000
    }
}

#[derive(Clone, Default)]
pub struct FixedTime(pub Rc<Cell<Option<u64>>>);

impl NetworkTime for FixedTime {
    async fn unix_time(&mut self) -> Option<u64> {
        self.0.get()
    }
}

#[derive(Clone, Default)]
pub struct RecordingLed(pub Rc<RefCell<Vec<RGB8>>>);

impl SmartLedsWrite for RecordingLed {
    type Error = ();
    type Color = RGB8;

    fn write<T, I>(&mut self, iterator: T) -> Result<(), ()>
    where
        T: IntoIterator<Item = I>,
        I: Into<RGB8>,
    {
        self.0.borrow_mut().extend(iterator.into_iter().map(Into::into));
        Ok(())
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Clock = ManualClock;
    type Radio = ScriptedRadio;
    type Flash = SharedFlash;
    type Portal = MockPortal;
    type Mqtt = FakeBroker;
    type Sensors = FixedSensors;
    type Outputs = RecordingDriver;
    type Updater = ScriptedUpdater;
    type System = MockSystem;
    type Time = FixedTime;
    type Led = RecordingLed;
}

/// A node plus handles on all of its ports
pub struct Harness {
    pub node: Node<TestPlatform>,
    pub clock: ManualClock,
    pub radio: ScriptedRadio,
    pub flash: SharedFlash,
    pub portal: MockPortal,
    pub broker: FakeBroker,
    pub sensors: FixedSensors,
    pub driver: RecordingDriver,
    pub updater: ScriptedUpdater,
    pub system: MockSystem,
    pub time: FixedTime,
    pub led: RecordingLed,
}

impl Harness {
    /// Boot a node on `flash` with a fresh set of every other port
    pub fn boot(flash: SharedFlash, radio: ScriptedRadio) -> Self {
        Self::boot_with(flash, radio, None)
    }

    pub fn boot_with(
        flash: SharedFlash,
        radio: ScriptedRadio,
        factory_credentials: Option<Credentials>,
    ) -> Self {
        let clock = ManualClock::default();
        let portal = MockPortal::default();
        let broker = FakeBroker::default();
        let sensors = FixedSensors::default();
        let driver = RecordingDriver::default();
        let updater = ScriptedUpdater::default();
        let system = MockSystem::default();
        let time = FixedTime::default();
        let led = RecordingLed::default();

        let parts = Parts::<TestPlatform> {
            mac: MAC,
            clock: clock.clone(),
            radio: radio.clone(),
            flash: flash.clone(),
            portal: portal.clone(),
            mqtt: broker.clone(),
            sensors: sensors.clone(),
            outputs: driver.clone(),
            updater: updater.clone(),
            system: system.clone(),
            time: time.clone(),
            led: led.clone(),
        };
        let settings = NodeSettings {
            factory_credentials,
            ..NodeSettings::default()
        };

        Self {
            node: Node::new(parts, settings),
            clock,
            radio,
            flash,
            portal,
            broker,
            sensors,
            driver,
            updater,
            system,
            time,
            led,
        }
    }

    pub fn tick(&mut self) {
        embassy_futures::block_on(self.node.tick());
        self.clock.advance(Duration::from_millis(100));
    }

    /// Tick in 100 ms steps until `duration` has passed
    pub fn run_for(&mut self, duration: Duration) {
        let end = self.clock.now() + duration;
        while self.clock.now() < end {
            self.tick();
        }
    }
}

pub fn credentials(name: &str, secret: &str) -> Credentials {
    Credentials::new(name, secret).unwrap()
}
