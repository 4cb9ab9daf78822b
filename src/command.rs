//! Inbound command decoding and dispatch
//!
//! A payload is decoded once into [`Command`]; everything after that is an exhaustive
//! match. Unknown actions decode to [`Command::Unrecognized`] and are dropped.

use crate::actuators::{ActuatorCommand, RelayId, clamp_servo_angle};
use crate::identity::DeviceIdentity;
use crate::ota::UpdateResult;
use log::{info, warn};
use heapless::String;
use serde::Deserialize;

/// Longest firmware image URL accepted
pub const URL_MAX: usize = 256;
/// Longest action name kept for logging
pub const ACTION_MAX: usize = 32;

/// A decoded command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Reboot,
    StatusRequest,
    FirmwareUpdate { url: String<URL_MAX> },
    /// Angle already clamped to 0..=180
    ServoAngle(u8),
    Light(bool),
    Fan(bool),
    Relay(RelayId, bool),
    RealModel(bool),
    SmartMode(bool),
    SetLightSchedule { on_hour: u8, off_hour: u8 },
    Unrecognized(String<ACTION_MAX>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// Not a JSON object with a string `action`
    Malformed,
    /// A field the action needs is absent
    MissingField(&'static str),
    /// A field is present but outside its range
    OutOfRange(&'static str),
}

impl core::fmt::Display for CommandError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CommandError::Malformed => write!(f, "malformed command"),
            CommandError::MissingField(field) => write!(f, "missing field `{}`", field),
            CommandError::OutOfRange(field) => write!(f, "field `{}` out of range", field),
        }
    }
}

// Owned strings so escaped JSON (`"http:\/\/host"`) decodes too
#[derive(Deserialize)]
struct RawCommand {
    action: String<ACTION_MAX>,
    #[serde(default)]
    url: Option<String<URL_MAX>>,
    #[serde(default)]
    angle: Option<i32>,
    #[serde(default)]
    state: Option<bool>,
    #[serde(default)]
    relay: Option<i32>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    on_hour: Option<i32>,
    #[serde(default)]
    off_hour: Option<i32>,
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, CommandError> {
    value.ok_or(CommandError::MissingField(field))
}

fn hour(value: Option<i32>, field: &'static str) -> Result<u8, CommandError> {
    let hour = required(value, field)?;
    if (0..=23).contains(&hour) {
        Ok(hour as u8)
    } else {
        Err(CommandError::OutOfRange(field))
    }
}

/// Decode a command payload
pub fn decode(payload: &[u8]) -> Result<Command, CommandError> {
    let mut unescaped = [0u8; URL_MAX];
    let (raw, _) = serde_json_core::from_slice_escaped::<RawCommand>(payload, &mut unescaped)
        .map_err(|_| CommandError::Malformed)?;

    let command = match raw.action.as_str() {
        "REBOOT" => Command::Reboot,
        "STATUS_REQUEST" => Command::StatusRequest,
        "FIRMWARE_UPDATE" => Command::FirmwareUpdate {
            url: required(raw.url, "url")?,
        },
        "SERVO_CONTROL" | "SERVO_ANGLE" => {
            Command::ServoAngle(clamp_servo_angle(required(raw.angle, "angle")?))
        }
        "LIGHT_CONTROL" => Command::Light(required(raw.state, "state")?),
        "FAN_CONTROL" => Command::Fan(required(raw.state, "state")?),
        "RELAY_CONTROL" => {
            let id = required(raw.relay, "relay")?;
            let state = required(raw.state, "state")?;
            let relay = RelayId::new(id).ok_or(CommandError::OutOfRange("relay"))?;
            Command::Relay(relay, state)
        }
        "REAL_MODEL_CONTROL" => Command::RealModel(required(raw.state, "state")?),
        "SMART_MODE" => Command::SmartMode(required(raw.enabled, "enabled")?),
        "SET_LIGHT_SCHEDULE" => Command::SetLightSchedule {
            on_hour: hour(raw.on_hour, "on_hour")?,
            off_hour: hour(raw.off_hour, "off_hour")?,
        },
        _ => Command::Unrecognized(raw.action.clone()),
    };
    Ok(command)
}

/// Everything a command can do to the node
#[allow(async_fn_in_trait)]
pub trait CommandHandlers {
    /// Publish a status message on the data topic
    async fn publish_status(&mut self, status: &str);

    /// Restart the device after letting the last status go out
    async fn restart(&mut self);

    async fn apply_update(&mut self, url: &str) -> UpdateResult;

    /// Route through the shared actuator path; returns whether hardware changed
    fn actuate(&mut self, command: ActuatorCommand) -> bool;

    fn set_smart_mode(&mut self, enabled: bool);

    fn set_light_schedule(&mut self, on_hour: u8, off_hour: u8);
}

/// Routes command-topic messages to the handlers
pub struct CommandDispatcher {
    identity: DeviceIdentity,
    accepted: u32,
    rejected: u32,
}

impl CommandDispatcher {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Commands executed (including ignored unknown actions)
    pub fn accepted(&self) -> u32 {
        self.accepted
    }

    /// Commands dropped for being malformed or invalid
    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    /// Handle one inbound message. Invalid input is logged and dropped.
    pub async fn on_message<H: CommandHandlers>(
        &mut self,
        topic: &str,
        payload: &[u8],
        handlers: &mut H,
    ) -> Result<(), CommandError> {
        if !self.identity.is_command_topic(topic) {
            warn!("[CMD] Ignoring message on {}", topic);
            return Ok(());
        }

        let command = match decode(payload) {
            Ok(command) => command,
            Err(e) => {
                self.rejected += 1;
                warn!("[CMD] Dropping command: {}", e);
                return Err(e);
            }
        };
        self.accepted += 1;
        info!("[CMD] {:?}", command);

        match command {
            Command::Reboot => {
                handlers.publish_status("rebooting").await;
                handlers.restart().await;
            }
            Command::StatusRequest => handlers.publish_status("online").await,
            Command::FirmwareUpdate { url } => {
                handlers.publish_status("updating").await;
                match handlers.apply_update(&url).await {
                    UpdateResult::Ok => {
                        handlers.publish_status("update_success").await;
                        handlers.restart().await;
                    }
                    UpdateResult::NoUpdateAvailable => {
                        handlers.publish_status("no_update_needed").await;
                    }
                    UpdateResult::Failed(reason) => {
                        warn!("[CMD] Firmware update failed: {}", reason);
                        handlers.publish_status("update_failed").await;
                    }
                }
            }
            Command::ServoAngle(angle) => {
                handlers.actuate(ActuatorCommand::Servo(angle));
                handlers.publish_status("servo_updated").await;
            }
            Command::Light(on) => {
                handlers.actuate(ActuatorCommand::Light(on));
                handlers.publish_status("light_updated").await;
            }
            Command::Fan(on) => {
                handlers.actuate(ActuatorCommand::Fan(on));
                handlers.publish_status("fan_updated").await;
            }
            Command::Relay(relay, on) => {
                handlers.actuate(ActuatorCommand::Relay(relay, on));
                handlers.publish_status("relay_updated").await;
            }
            Command::RealModel(on) => {
                handlers.actuate(ActuatorCommand::RealModel(on));
            }
            Command::SmartMode(enabled) => handlers.set_smart_mode(enabled),
            Command::SetLightSchedule { on_hour, off_hour } => {
                handlers.set_light_schedule(on_hour, off_hour)
            }
            Command::Unrecognized(action) => {
                warn!("[CMD] Unknown action {}, ignored", action);
            }
        }
        Ok(())
    }
}
