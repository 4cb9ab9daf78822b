//! MQTT session management
//!
//! Owns the broker link: reconnects on a fixed interval while the station is up,
//! subscribes to the command topics at QoS 1 and publishes with bounded retries.
//! The session is rebuilt from scratch on every reconnect.

use crate::clock::RetrySchedule;
use crate::config;
use crate::identity::{DeviceIdentity, Topic};
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant};
use heapless::{String, Vec};
use log::{debug, error, info, warn};

/// Delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// TCP connect or DNS failure
    Transport,
    /// Broker refused the connection or subscription
    Refused,
    /// Link is down
    NotConnected,
    Timeout,
}

impl core::fmt::Display for LinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkError::Transport => write!(f, "transport error"),
            LinkError::Refused => write!(f, "refused by broker"),
            LinkError::NotConnected => write!(f, "not connected"),
            LinkError::Timeout => write!(f, "timed out"),
        }
    }
}

pub const INBOUND_PAYLOAD_MAX: usize = config::MQTT_MAX_PAYLOAD;

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: Topic,
    pub payload: Vec<u8, INBOUND_PAYLOAD_MAX>,
}

/// Parameters of a broker connection
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    pub will_topic: &'a str,
    pub will_payload: &'a [u8],
    pub keep_alive_secs: u16,
}

/// Client side of a broker connection
#[allow(async_fn_in_trait)]
pub trait MqttLink {
    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), LinkError>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), LinkError>;

    /// Service keepalive and return the next received message without blocking
    async fn poll(&mut self) -> Result<Option<InboundMessage>, LinkError>;
}

/// Broker login
#[derive(Debug, Clone, Copy)]
pub struct BrokerAuth {
    pub username: &'static str,
    pub password: &'static str,
}

impl Default for BrokerAuth {
    fn default() -> Self {
        Self {
            username: config::MQTT_USERNAME,
            password: config::MQTT_PASSWORD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub reconnect_interval: Duration,
    pub fatal_failures: u32,
    pub publish_attempts: u32,
    pub max_payload: usize,
    pub keep_alive_secs: u16,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(config::MQTT_RECONNECT_INTERVAL_MS),
            fatal_failures: config::MQTT_FATAL_FAILURES,
            publish_attempts: config::MQTT_PUBLISH_ATTEMPTS,
            max_payload: config::MQTT_MAX_PAYLOAD,
            keep_alive_secs: config::MQTT_KEEP_ALIVE_SECS,
        }
    }
}

/// One established broker session
#[derive(Debug, Clone)]
pub struct MqttSession {
    subscriptions: Vec<(Topic, QoS), 4>,
    established_at: Instant,
}

impl MqttSession {
    pub fn subscriptions(&self) -> &[(Topic, QoS)] {
        &self.subscriptions
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }
}

/// Result of [`SessionManager::ensure_connected`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session was up already
    Connected,
    /// A new session was established this call
    JustConnected,
    /// Not connected; the next attempt is not due or just failed
    Waiting,
    /// Too many consecutive failures, the device should restart
    RestartRequired,
}

pub struct SessionManager<L> {
    link: L,
    client_id: String<24>,
    command_topic: Topic,
    last_command_topic: Topic,
    will_topic: Topic,
    will_payload: String<64>,
    auth: BrokerAuth,
    policy: SessionPolicy,
    session: Option<MqttSession>,
    reconnect: RetrySchedule,
    consecutive_failures: u32,
}

impl<L: MqttLink> SessionManager<L> {
    pub fn new(link: L, identity: &DeviceIdentity, auth: BrokerAuth, policy: SessionPolicy) -> Self {
        let mut will_payload = String::new();
        let _ = write!(
            will_payload,
            r#"{{"status":"offline","node_id":"{}"}}"#,
            identity.node_id()
        );

        Self {
            link,
            client_id: String::try_from(identity.client_id()).unwrap_or_default(),
            command_topic: String::try_from(identity.command_topic()).unwrap_or_default(),
            last_command_topic: String::try_from(identity.last_command_topic())
                .unwrap_or_default(),
            will_topic: String::try_from(identity.data_topic()).unwrap_or_default(),
            will_payload,
            auth,
            policy,
            session: None,
            reconnect: RetrySchedule::new(policy.reconnect_interval),
            consecutive_failures: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some() && self.link.is_connected()
    }

    pub fn session(&self) -> Option<&MqttSession> {
        self.session.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Connect when due. Call only while the station is connected.
    pub async fn ensure_connected(&mut self, now: Instant) -> SessionStatus {
        if self.session.is_some() {
            if self.link.is_connected() {
                return SessionStatus::Connected;
            }
            warn!("[MQTT] Broker connection lost");
            self.session = None;
        }

        if !self.reconnect.is_due(now) {
            return SessionStatus::Waiting;
        }
        self.reconnect.record_attempt(now);

        match self.establish(now).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                SessionStatus::JustConnected
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    "[MQTT] Connection attempt {}/{} failed: {}",
                    self.consecutive_failures, self.policy.fatal_failures, e
                );
                if self.consecutive_failures >= self.policy.fatal_failures {
                    error!("[MQTT] Broker unreachable, restart required");
                    SessionStatus::RestartRequired
                } else {
                    SessionStatus::Waiting
                }
            }
        }
    }

    /// Service keepalive and fetch one inbound message
    pub async fn tick(&mut self) -> Option<InboundMessage> {
        if self.session.is_none() {
            return None;
        }
        match self.link.poll().await {
            Ok(message) => message,
            Err(e) => {
                warn!("[MQTT] Session dropped: {}", e);
                self.session = None;
                None
            }
        }
    }

    /// Subscribe on the live session
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        let Some(session) = self.session.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        self.link.subscribe(topic, qos).await?;
        let topic = String::try_from(topic).map_err(|_| LinkError::Refused)?;
        if session.subscriptions.push((topic, qos)).is_err() {
            warn!("[MQTT] Subscription list full");
        }
        Ok(())
    }

    /// Publish with bounded retries. Oversize payloads are dropped, never truncated.
    pub async fn publish(&mut self, topic: &str, payload: &[u8], now: Instant) -> bool {
        if payload.len() > self.policy.max_payload {
            warn!(
                "[MQTT] Dropping {} byte payload for {}: limit is {} bytes",
                payload.len(),
                topic,
                self.policy.max_payload
            );
            return false;
        }

        for attempt in 1..=self.policy.publish_attempts {
            if !self.is_connected() {
                if attempt == 1 {
                    debug!("[MQTT] Not connected, cannot publish to {}", topic);
                    return false;
                }
                // Inline reconnects do not count toward the restart threshold
                if let Err(e) = self.establish(now).await {
                    warn!("[MQTT] Inline reconnect failed: {}", e);
                    continue;
                }
            }

            match self
                .link
                .publish(topic, payload, QoS::AtMostOnce, false)
                .await
            {
                Ok(()) => return true,
                Err(e) => warn!(
                    "[MQTT] Publish attempt {}/{} to {} failed: {}",
                    attempt, self.policy.publish_attempts, topic, e
                ),
            }
        }

        error!("[MQTT] Giving up on message for {}", topic);
        false
    }

    /// Drop the session because the station went away. Nothing is awaited.
    pub async fn abandon(&mut self) {
        if self.session.take().is_some() {
            info!("[MQTT] Session abandoned");
        }
        self.link.disconnect().await;
        self.consecutive_failures = 0;
        self.reconnect.reset();
    }

    async fn establish(&mut self, now: Instant) -> Result<(), LinkError> {
        self.session = None;
        let options = ConnectOptions {
            client_id: &self.client_id,
            username: self.auth.username,
            password: self.auth.password,
            will_topic: &self.will_topic,
            will_payload: self.will_payload.as_bytes(),
            keep_alive_secs: self.policy.keep_alive_secs,
        };
        info!("[MQTT] Connecting as {}", self.client_id);
        self.link.connect(&options).await?;

        let mut session = MqttSession {
            subscriptions: Vec::new(),
            established_at: now,
        };

        // Commands queued while offline arrive on reconnect only with QoS 1
        if let Err(e) = self
            .link
            .subscribe(&self.command_topic, QoS::AtLeastOnce)
            .await
        {
            warn!("[MQTT] Command subscription failed: {}", e);
            self.link.disconnect().await;
            return Err(e);
        }
        let _ = session
            .subscriptions
            .push((self.command_topic.clone(), QoS::AtLeastOnce));

        match self
            .link
            .subscribe(&self.last_command_topic, QoS::AtLeastOnce)
            .await
        {
            Ok(()) => {
                let _ = session
                    .subscriptions
                    .push((self.last_command_topic.clone(), QoS::AtLeastOnce));
            }
            Err(e) => warn!("[MQTT] Fallback subscription failed: {}", e),
        }

        info!("[MQTT] Connected, subscribed to {}", self.command_topic);
        self.session = Some(session);
        Ok(())
    }
}

const WILL_MAX: usize = 128;

/// Owned copy of [`ConnectOptions`] that can cross a channel
pub struct ConnectRequest {
    pub client_id: String<24>,
    pub username: String<64>,
    pub password: String<64>,
    pub will_topic: Topic,
    pub will_payload: Vec<u8, WILL_MAX>,
    pub keep_alive_secs: u16,
}

impl ConnectRequest {
    fn from_options(options: &ConnectOptions<'_>) -> Result<Self, LinkError> {
        Ok(Self {
            client_id: String::try_from(options.client_id).map_err(|_| LinkError::Refused)?,
            username: String::try_from(options.username).map_err(|_| LinkError::Refused)?,
            password: String::try_from(options.password).map_err(|_| LinkError::Refused)?,
            will_topic: String::try_from(options.will_topic).map_err(|_| LinkError::Refused)?,
            will_payload: Vec::from_slice(options.will_payload).map_err(|_| LinkError::Refused)?,
            keep_alive_secs: options.keep_alive_secs,
        })
    }
}

pub enum Request {
    Connect(ConnectRequest),
    Disconnect,
    Subscribe(Topic, QoS),
    Publish {
        topic: Topic,
        payload: Vec<u8, INBOUND_PAYLOAD_MAX>,
        qos: QoS,
        retain: bool,
    },
    Poll,
}

pub type Response = Result<Option<InboundMessage>, LinkError>;

/// Shared between the node loop and the task owning the broker socket
pub struct MqttChannels {
    pub requests: Channel<CriticalSectionRawMutex, Request, 1>,
    pub responses: Channel<CriticalSectionRawMutex, Response, 1>,
    connected: AtomicBool,
}

impl MqttChannels {
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            responses: Channel::new(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl Default for MqttChannels {
    fn default() -> Self {
        Self::new()
    }
}

/// Node side of the connection task
pub struct ChannelMqttLink {
    channels: &'static MqttChannels,
}

impl ChannelMqttLink {
    pub fn new(channels: &'static MqttChannels) -> Self {
        Self { channels }
    }

    async fn call(&mut self, request: Request) -> Response {
        self.channels.requests.send(request).await;
        self.channels.responses.receive().await
    }
}

impl MqttLink for ChannelMqttLink {
    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), LinkError> {
        let request = ConnectRequest::from_options(options)?;
        if self.is_connected() {
            warn!("[MQTT] Connect requested on a live connection, closing it first");
            let _ = self.call(Request::Disconnect).await;
        }
        self.call(Request::Connect(request)).await.map(|_| ())
    }

    async fn disconnect(&mut self) {
        let _ = self.call(Request::Disconnect).await;
    }

    fn is_connected(&self) -> bool {
        self.channels.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        let topic = String::try_from(topic).map_err(|_| LinkError::Refused)?;
        self.call(Request::Subscribe(topic, qos)).await.map(|_| ())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), LinkError> {
        let topic = String::try_from(topic).map_err(|_| LinkError::Refused)?;
        let payload = Vec::from_slice(payload).map_err(|_| LinkError::Refused)?;
        self.call(Request::Publish {
            topic,
            payload,
            qos,
            retain,
        })
        .await
        .map(|_| ())
    }

    async fn poll(&mut self) -> Result<Option<InboundMessage>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.call(Request::Poll).await
    }
}

/// Read one inbound packet, but only when bytes are already queued.
///
/// Nothing queued is an idle poll and `receive` is never started. Once started
/// it runs until it completes or `deadline` fires. A read cut short leaves the
/// stream mid-packet, so that counts as a lost connection.
pub async fn receive_queued<T, E: core::fmt::Debug>(
    queued: usize,
    receive: impl Future<Output = Result<T, E>>,
    deadline: impl Future<Output = ()>,
) -> Result<Option<T>, LinkError> {
    if queued == 0 {
        return Ok(None);
    }
    match select(receive, deadline).await {
        Either::First(Ok(message)) => Ok(Some(message)),
        Either::First(Err(e)) => {
            warn!("[MQTT] Receive failed: {:?}", e);
            Err(LinkError::Transport)
        }
        Either::Second(()) => {
            warn!("[MQTT] Inbound packet stalled with {} bytes queued", queued);
            Err(LinkError::Timeout)
        }
    }
}
