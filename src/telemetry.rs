//! Sensor sampling, telemetry, heartbeat and status payloads

use crate::actuators::{ActuatorState, RELAY_COUNT};
use crate::clock::RetrySchedule;
use crate::config;
use embassy_time::{Duration, Instant};
use serde::Serialize;

/// Encoding scratch space; larger than the publish ceiling so oversize payloads are
/// detected by the session instead of failing here
pub const ENCODE_BUFFER: usize = 1024;

pub type Payload = heapless::Vec<u8, ENCODE_BUFFER>;

/// Latest sensor readings; `None` when a sensor did not answer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorSnapshot {
    /// °C
    pub temperature: Option<f32>,
    /// %RH
    pub humidity: Option<f32>,
    /// Raw gas sensor reading
    pub gas_level: Option<u16>,
}

/// The sensor layer
pub trait SensorSource {
    fn sample(&mut self) -> SensorSnapshot;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    /// Did not fit the encode buffer
    TooLarge,
    Encode,
}

impl core::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PayloadError::TooLarge => write!(f, "payload too large"),
            PayloadError::Encode => write!(f, "payload encoding failed"),
        }
    }
}

/// Node-wide values every outbound message carries
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub timestamp: &'a str,
    pub node_id: &'a str,
    pub uptime_ms: u64,
    pub free_heap: u32,
    pub wifi_rssi: Option<i8>,
    pub actuators: &'a ActuatorState,
    pub smart_mode: bool,
}

#[derive(Serialize)]
struct TelemetryMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    timestamp: &'a str,
    status: &'a str,
    node_id: &'a str,
    uptime: u64,
    free_heap: u32,
    wifi_rssi: Option<i8>,
    temperature: Option<f32>,
    humidity: Option<f32>,
    gas_sensor: Option<u16>,
    servo_angle: u8,
    light: bool,
    fan: bool,
    real_model: bool,
    relays: [bool; RELAY_COUNT],
    smart_mode: bool,
}

#[derive(Serialize)]
struct StatusMessage<'a> {
    timestamp: &'a str,
    status: &'a str,
    node_id: &'a str,
    uptime: u64,
    free_heap: u32,
    wifi_rssi: Option<i8>,
    servo_angle: u8,
    light: bool,
    fan: bool,
    real_model: bool,
    relays: [bool; RELAY_COUNT],
    smart_mode: bool,
}

#[derive(Serialize)]
struct HeartbeatMessage<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    node_id: &'a str,
    status: &'a str,
    uptime: u64,
    wifi_rssi: Option<i8>,
}

fn encode<T: Serialize>(message: &T) -> Result<Payload, PayloadError> {
    match serde_json_core::to_vec::<_, ENCODE_BUFFER>(message) {
        Ok(payload) => Ok(payload),
        Err(serde_json_core::ser::Error::BufferFull) => Err(PayloadError::TooLarge),
        #[allow(unreachable_patterns)]
        Err(_) => Err(PayloadError::Encode),
    }
}

/// Full telemetry: sensors plus every actuator field
pub fn telemetry_payload(
    ctx: &ReportContext<'_>,
    snapshot: &SensorSnapshot,
) -> Result<Payload, PayloadError> {
    encode(&TelemetryMessage {
        kind: "sensor_data",
        timestamp: ctx.timestamp,
        status: "online",
        node_id: ctx.node_id,
        uptime: ctx.uptime_ms,
        free_heap: ctx.free_heap,
        wifi_rssi: ctx.wifi_rssi,
        temperature: snapshot.temperature,
        humidity: snapshot.humidity,
        gas_sensor: snapshot.gas_level,
        servo_angle: ctx.actuators.servo_angle,
        light: ctx.actuators.light,
        fan: ctx.actuators.fan,
        real_model: ctx.actuators.real_model,
        relays: ctx.actuators.relays,
        smart_mode: ctx.smart_mode,
    })
}

/// Status report, e.g. `online`, `servo_updated`, `rebooting`
pub fn status_payload(ctx: &ReportContext<'_>, status: &str) -> Result<Payload, PayloadError> {
    encode(&StatusMessage {
        timestamp: ctx.timestamp,
        status,
        node_id: ctx.node_id,
        uptime: ctx.uptime_ms,
        free_heap: ctx.free_heap,
        wifi_rssi: ctx.wifi_rssi,
        servo_angle: ctx.actuators.servo_angle,
        light: ctx.actuators.light,
        fan: ctx.actuators.fan,
        real_model: ctx.actuators.real_model,
        relays: ctx.actuators.relays,
        smart_mode: ctx.smart_mode,
    })
}

/// Minimal liveness message
pub fn heartbeat_payload(ctx: &ReportContext<'_>) -> Result<Payload, PayloadError> {
    encode(&HeartbeatMessage {
        kind: "heartbeat",
        node_id: ctx.node_id,
        status: "online",
        uptime: ctx.uptime_ms,
        wifi_rssi: ctx.wifi_rssi,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryPolicy {
    pub sample_interval: Duration,
    pub telemetry_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TelemetryPolicy {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(config::SENSOR_SAMPLE_INTERVAL_MS),
            telemetry_interval: Duration::from_millis(config::TELEMETRY_INTERVAL_MS),
            heartbeat_interval: Duration::from_millis(config::HEARTBEAT_INTERVAL_MS),
        }
    }
}

/// Keeps the latest snapshot and decides when telemetry and heartbeats go out
pub struct TelemetryPublisher {
    sample: RetrySchedule,
    telemetry: RetrySchedule,
    heartbeat: RetrySchedule,
    snapshot: SensorSnapshot,
}

impl TelemetryPublisher {
    pub fn new(policy: TelemetryPolicy) -> Self {
        Self {
            sample: RetrySchedule::new(policy.sample_interval),
            telemetry: RetrySchedule::new(policy.telemetry_interval),
            heartbeat: RetrySchedule::new(policy.heartbeat_interval),
            snapshot: SensorSnapshot::default(),
        }
    }

    /// Sample the sensors if the interval elapsed; returns whether a new snapshot was taken
    pub fn poll_sample<S: SensorSource>(&mut self, now: Instant, sensors: &mut S) -> bool {
        if !self.sample.is_due(now) {
            return false;
        }
        self.sample.record_attempt(now);
        self.snapshot = sensors.sample();
        true
    }

    pub fn snapshot(&self) -> &SensorSnapshot {
        &self.snapshot
    }

    /// True once per telemetry interval
    pub fn take_telemetry_due(&mut self, now: Instant) -> bool {
        take_due(&mut self.telemetry, now)
    }

    /// True once per heartbeat interval
    pub fn take_heartbeat_due(&mut self, now: Instant) -> bool {
        take_due(&mut self.heartbeat, now)
    }
}

fn take_due(schedule: &mut RetrySchedule, now: Instant) -> bool {
    if schedule.is_due(now) {
        schedule.record_attempt(now);
        true
    } else {
        false
    }
}
