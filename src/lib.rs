#![cfg_attr(not(test), no_std)]

//! ESP32-C3 Edge Node Library
//!
//! Connectivity lifecycle (station join, retry, provisioning portal), MQTT session
//! handling, command dispatch, local automation and telemetry for a Wi-Fi edge node.
//! Everything outside `hw` is hardware independent and runs under host tests.

extern crate alloc;

pub mod actuators;
pub mod automation;
pub mod clock;
pub mod command;
pub mod connectivity;
pub mod credentials;
pub mod dns;
pub mod identity;
pub mod indicator;
pub mod node;
pub mod ota;
pub mod portal;
pub mod session;
pub mod telemetry;
pub mod time;

#[cfg(feature = "esp32c3")]
pub mod hw;

/// Project version information
pub const VERSION: &str = "0.2.0-dev";

/// Default configuration constants
pub mod config {
    /// Factory WiFi credentials, used in memory when nothing was provisioned yet.
    /// Read from environment variables at compile time
    pub const WIFI_SSID: &str = env!("WIFI_SSID");
    pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");

    /// MQTT broker settings
    pub const MQTT_BROKER_HOST: &str = env!("MQTT_BROKER_HOST");
    pub const MQTT_BROKER_PORT: u16 = match u16::from_str_radix(env!("MQTT_BROKER_PORT"), 10) {
        Ok(port) => port,
        Err(_) => 1883,
    };
    pub const MQTT_USERNAME: &str = env!("MQTT_USERNAME");
    pub const MQTT_PASSWORD: &str = env!("MQTT_PASSWORD");

    /// Station join: number of link polls and the pause between them
    pub const WIFI_JOIN_POLLS: u32 = 20;
    pub const WIFI_JOIN_POLL_INTERVAL_MS: u64 = 500;

    /// Steady-state station retry interval in milliseconds
    pub const WIFI_RETRY_INTERVAL_MS: u64 = 30_000;

    /// Failed retries before the stored credentials are considered stale
    pub const WIFI_RETRY_ESCALATION: u32 = 3;

    /// Provisioning access point
    pub const PORTAL_AP_NAME: &str = "EdgeNode-Setup";
    pub const PORTAL_ADDRESS: [u8; 4] = [192, 168, 4, 1];
    pub const PORTAL_HTTP_PORT: u16 = 80;

    /// Credential field bounds in bytes
    pub const NETWORK_NAME_MAX: usize = 32;
    pub const SECRET_MAX: usize = 64;

    /// Flash region holding the two credential slots
    pub const CREDENTIALS_FLASH_OFFSET: u32 = 0x9000;

    /// Broker reconnect interval in milliseconds
    pub const MQTT_RECONNECT_INTERVAL_MS: u64 = 5_000;

    /// Consecutive failed broker connects that trigger a restart
    pub const MQTT_FATAL_FAILURES: u32 = 5;

    /// Attempts per published message
    pub const MQTT_PUBLISH_ATTEMPTS: u32 = 3;

    /// Largest payload the node will publish
    pub const MQTT_MAX_PAYLOAD: usize = 512;

    pub const MQTT_KEEP_ALIVE_SECS: u16 = 60;

    /// Telemetry timing in milliseconds
    pub const SENSOR_SAMPLE_INTERVAL_MS: u64 = 2_000;
    pub const TELEMETRY_INTERVAL_MS: u64 = 30_000;
    pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;

    /// Automation defaults
    pub const LIGHT_ON_HOUR: u8 = 18;
    pub const LIGHT_OFF_HOUR: u8 = 6;
    pub const TEMPERATURE_THRESHOLD_C: f32 = 30.0;
    pub const GAS_SAFETY_THRESHOLD: u16 = 2000;

    /// Wall clock
    pub const NTP_SERVER: &str = "pool.ntp.org";
    pub const NTP_RESYNC_INTERVAL_MS: u64 = 60_000;
    /// UTC+05:30
    pub const UTC_OFFSET_SECS: i32 = 19_800;

    /// Main loop period in milliseconds
    pub const TICK_INTERVAL_MS: u64 = 100;

    /// Pause between the "rebooting" status and the restart
    pub const REBOOT_SETTLE_MS: u64 = 2_000;

    /// Status LED data GPIO pin
    pub const LED_DATA_PIN: u8 = 8;
}

/// Error types for the edge node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    /// WiFi driver error
    WiFiError,
    /// Broker connection error
    MqttError,
    /// Flash storage error
    StorageError,
    /// Payload encoding or parsing error
    ProtocolError,
    /// Sensor or actuator error
    HardwareError,
    /// System error
    SystemError,
}

impl core::fmt::Display for NodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NodeError::WiFiError => write!(f, "wifi error"),
            NodeError::MqttError => write!(f, "mqtt error"),
            NodeError::StorageError => write!(f, "storage error"),
            NodeError::ProtocolError => write!(f, "protocol error"),
            NodeError::HardwareError => write!(f, "hardware error"),
            NodeError::SystemError => write!(f, "system error"),
        }
    }
}
