//! The node coordinator
//!
//! Owns every component and runs them once per tick in a fixed order: connectivity
//! first, then either the provisioning portal or the connected-only work (time sync,
//! broker session, inbound commands, sampling, automation, telemetry), then the
//! status LED.

use crate::actuators::{ActuatorCommand, ActuatorDriver, Actuators};
use crate::automation::AutomationEngine;
use crate::clock::Clock;
use crate::command::{CommandDispatcher, CommandHandlers};
use crate::config;
use crate::connectivity::{
    AccessPointRadio, ConnectivityManager, ConnectivityPolicy, ConnectivityState, StationRadio,
};
use crate::credentials::{CredentialStore, Credentials};
use crate::identity::DeviceIdentity;
use crate::indicator::StatusIndicator;
use crate::ota::{FirmwareUpdater, SystemControl, UpdateResult};
use crate::portal::{PortalLink, PortalOutcome, ProvisioningPortal};
use crate::session::{BrokerAuth, MqttLink, SessionManager, SessionPolicy, SessionStatus};
use crate::telemetry::{
    Payload, PayloadError, ReportContext, SensorSource, TelemetryPolicy, TelemetryPublisher,
    heartbeat_payload, status_payload, telemetry_payload,
};
use crate::time::{NetworkTime, WallClock};
use embassy_time::Duration;
use embedded_storage::Storage;
use log::{info, warn};
use smart_leds::{RGB8, SmartLedsWrite};

/// The hardware a node runs on
pub trait Platform {
    type Clock: Clock;
    type Radio: StationRadio + AccessPointRadio;
    type Flash: Storage;
    type Portal: PortalLink;
    type Mqtt: MqttLink;
    type Sensors: SensorSource;
    type Outputs: ActuatorDriver;
    type Updater: FirmwareUpdater;
    type System: SystemControl;
    type Time: NetworkTime;
    type Led: SmartLedsWrite<Color = RGB8>;
}

/// Port implementations handed to [`Node::new`]
pub struct Parts<P: Platform> {
    pub mac: [u8; 6],
    pub clock: P::Clock,
    pub radio: P::Radio,
    pub flash: P::Flash,
    pub portal: P::Portal,
    pub mqtt: P::Mqtt,
    pub sensors: P::Sensors,
    pub outputs: P::Outputs,
    pub updater: P::Updater,
    pub system: P::System,
    pub time: P::Time,
    pub led: P::Led,
}

/// Tunables, defaulting to the `config` constants
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub connectivity: ConnectivityPolicy,
    pub session: SessionPolicy,
    pub telemetry: TelemetryPolicy,
    pub auth: BrokerAuth,
    /// Used in memory when nothing was provisioned; never persisted
    pub factory_credentials: Option<Credentials>,
    pub credentials_offset: u32,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            connectivity: ConnectivityPolicy::default(),
            session: SessionPolicy::default(),
            telemetry: TelemetryPolicy::default(),
            auth: BrokerAuth::default(),
            factory_credentials: Credentials::new(config::WIFI_SSID, config::WIFI_PASSWORD).ok(),
            credentials_offset: config::CREDENTIALS_FLASH_OFFSET,
        }
    }
}

pub struct Node<P: Platform> {
    identity: DeviceIdentity,
    clock: P::Clock,
    radio: P::Radio,
    store: CredentialStore<P::Flash>,
    portal_link: P::Portal,
    portal: ProvisioningPortal,
    connectivity: ConnectivityManager,
    session: SessionManager<P::Mqtt>,
    dispatcher: CommandDispatcher,
    actuators: Actuators<P::Outputs>,
    automation: AutomationEngine,
    telemetry: TelemetryPublisher,
    wall_clock: WallClock,
    indicator: StatusIndicator<P::Led>,
    sensors: P::Sensors,
    updater: P::Updater,
    system: P::System,
    time: P::Time,
}

impl<P: Platform> Node<P> {
    /// Build the node; credentials are read from flash here and nowhere else at boot
    pub fn new(parts: Parts<P>, settings: NodeSettings) -> Self {
        let identity = DeviceIdentity::from_mac(parts.mac);
        info!(
            "[MAIN] Node {} data={} commands={}",
            identity.node_id(),
            identity.data_topic(),
            identity.command_topic()
        );

        let mut store = CredentialStore::new(parts.flash, settings.credentials_offset);
        let credentials = match store.load() {
            Some(stored) => {
                info!("[STORE] Loaded credentials for {}", stored.network_name());
                Some(stored)
            }
            None => settings.factory_credentials.clone(),
        };

        Self {
            connectivity: ConnectivityManager::new(credentials, settings.connectivity),
            session: SessionManager::new(parts.mqtt, &identity, settings.auth, settings.session),
            dispatcher: CommandDispatcher::new(identity.clone()),
            identity,
            clock: parts.clock,
            radio: parts.radio,
            store,
            portal_link: parts.portal,
            portal: ProvisioningPortal::default(),
            actuators: Actuators::new(parts.outputs),
            automation: AutomationEngine::default(),
            telemetry: TelemetryPublisher::new(settings.telemetry),
            wall_clock: WallClock::default(),
            indicator: StatusIndicator::new(parts.led),
            sensors: parts.sensors,
            updater: parts.updater,
            system: parts.system,
            time: parts.time,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn connectivity(&self) -> &ConnectivityManager {
        &self.connectivity
    }

    pub fn session(&self) -> &SessionManager<P::Mqtt> {
        &self.session
    }

    pub fn actuators(&self) -> &Actuators<P::Outputs> {
        &self.actuators
    }

    pub fn automation(&self) -> &AutomationEngine {
        &self.automation
    }

    pub fn portal(&self) -> &ProvisioningPortal {
        &self.portal
    }

    pub fn indicator(&self) -> &StatusIndicator<P::Led> {
        &self.indicator
    }

    pub fn wall_clock(&self) -> &WallClock {
        &self.wall_clock
    }

    /// One pass of the main loop
    pub async fn tick(&mut self) {
        if let Some(state) = self.connectivity.tick(&mut self.radio, &self.clock).await {
            self.on_state_change(state).await;
        }

        match self.connectivity.state() {
            ConnectivityState::Provisioning => self.service_portal(),
            ConnectivityState::StationConnected => self.run_connected().await,
            ConnectivityState::StationConnecting | ConnectivityState::StationRetrying => {}
        }

        let status = self
            .connectivity
            .indicator_status(self.session.is_connected());
        self.indicator.set_status(status);
        self.indicator.update();
    }

    /// Run the main loop forever
    pub async fn run(&mut self) -> ! {
        let period = Duration::from_millis(config::TICK_INTERVAL_MS);
        loop {
            self.tick().await;
            self.clock.sleep(period).await;
        }
    }

    async fn on_state_change(&mut self, state: ConnectivityState) {
        if self.connectivity.previous_state() == Some(ConnectivityState::StationConnected) {
            // Losing the station cancels everything built on top of it
            self.session.abandon().await;
        }
        if state == ConnectivityState::Provisioning {
            self.open_portal();
        }
    }

    fn open_portal(&mut self) {
        if let Err(e) = self.portal.open(&mut self.radio, &mut self.portal_link) {
            warn!("[PORTAL] Failed to start access point: {}", e);
        }
    }

    fn service_portal(&mut self) {
        if !self.portal.is_open() {
            self.open_portal();
            return;
        }

        match self
            .portal
            .service(&mut self.radio, &mut self.portal_link, &mut self.store)
        {
            PortalOutcome::Completed {
                credentials,
                persisted,
            } => {
                if !persisted {
                    warn!("[PORTAL] Credentials kept in memory for this boot only");
                }
                self.connectivity
                    .complete_provisioning(credentials, self.clock.now());
            }
            PortalOutcome::Rejected(_) | PortalOutcome::Idle => {}
        }
    }

    async fn run_connected(&mut self) {
        let now = self.clock.now();
        self.wall_clock.sync_if_due(now, &mut self.time).await;

        match self.session.ensure_connected(now).await {
            SessionStatus::JustConnected => {
                self.handlers().publish_status("online").await;
            }
            SessionStatus::RestartRequired => {
                self.system.restart();
                return;
            }
            SessionStatus::Connected | SessionStatus::Waiting => {}
        }

        if let Some(message) = self.session.tick().await {
            let (dispatcher, mut handlers) = self.split();
            // Errors are logged by the dispatcher
            let _ = dispatcher
                .on_message(&message.topic, &message.payload, &mut handlers)
                .await;
        }

        self.telemetry.poll_sample(now, &mut self.sensors);
        self.automate(now).await;

        if self.session.is_connected() {
            if self.telemetry.take_telemetry_due(now) {
                let snapshot = *self.telemetry.snapshot();
                self.handlers()
                    .publish(|ctx| telemetry_payload(ctx, &snapshot))
                    .await;
            }
            if self.telemetry.take_heartbeat_due(now) {
                self.handlers().publish(heartbeat_payload).await;
            }
        }
    }

    async fn automate(&mut self, now: embassy_time::Instant) {
        let hour = self.wall_clock.local_hour(now);
        let changes = self.automation.evaluate(
            hour,
            self.telemetry.snapshot(),
            self.actuators.state(),
        );

        let mut changed = false;
        for command in changes {
            changed |= self.actuators.apply(command);
            info!("[AUTO] {:?}", command);
        }
        if changed && self.session.is_connected() {
            self.handlers().publish_status("auto_control").await;
        }
    }

    fn handlers(&mut self) -> NodeHandlers<'_, P> {
        self.split().1
    }

    fn split(&mut self) -> (&mut CommandDispatcher, NodeHandlers<'_, P>) {
        (
            &mut self.dispatcher,
            NodeHandlers {
                identity: &self.identity,
                clock: &self.clock,
                radio: &mut self.radio,
                session: &mut self.session,
                actuators: &mut self.actuators,
                automation: &mut self.automation,
                wall_clock: &self.wall_clock,
                updater: &mut self.updater,
                system: &mut self.system,
            },
        )
    }
}

/// Borrowed view of the node that commands act on
struct NodeHandlers<'a, P: Platform> {
    identity: &'a DeviceIdentity,
    clock: &'a P::Clock,
    radio: &'a mut P::Radio,
    session: &'a mut SessionManager<P::Mqtt>,
    actuators: &'a mut Actuators<P::Outputs>,
    automation: &'a mut AutomationEngine,
    wall_clock: &'a WallClock,
    updater: &'a mut P::Updater,
    system: &'a mut P::System,
}

impl<P: Platform> NodeHandlers<'_, P> {
    /// Build a payload from the current node state and publish it on the data topic
    async fn publish<F>(&mut self, build: F) -> bool
    where
        F: FnOnce(&ReportContext<'_>) -> Result<Payload, PayloadError>,
    {
        let now = self.clock.now();
        let timestamp = self.wall_clock.timestamp(now);
        let state = *self.actuators.state();
        let ctx = ReportContext {
            timestamp: &timestamp,
            node_id: self.identity.node_id(),
            uptime_ms: self.system.uptime_ms(),
            free_heap: self.system.free_heap(),
            wifi_rssi: self.radio.rssi(),
            actuators: &state,
            smart_mode: self.automation.is_enabled(),
        };

        match build(&ctx) {
            Ok(payload) => {
                self.session
                    .publish(self.identity.data_topic(), &payload, now)
                    .await
            }
            Err(e) => {
                warn!("[TELEMETRY] Payload not built: {}", e);
                false
            }
        }
    }
}

impl<P: Platform> CommandHandlers for NodeHandlers<'_, P> {
    async fn publish_status(&mut self, status: &str) {
        self.publish(|ctx| status_payload(ctx, status)).await;
    }

    async fn restart(&mut self) {
        self.clock
            .sleep(Duration::from_millis(config::REBOOT_SETTLE_MS))
            .await;
        info!("[MAIN] Restarting");
        self.system.restart();
    }

    async fn apply_update(&mut self, url: &str) -> UpdateResult {
        info!("[OTA] Updating from {}", url);
        self.updater.apply_update(url).await
    }

    fn actuate(&mut self, command: ActuatorCommand) -> bool {
        self.actuators.apply(command)
    }

    fn set_smart_mode(&mut self, enabled: bool) {
        self.automation.set_enabled(enabled);
    }

    fn set_light_schedule(&mut self, on_hour: u8, off_hour: u8) {
        self.automation.set_light_schedule(on_hour, off_hour);
    }
}
