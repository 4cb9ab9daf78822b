//! Actuator state and the single path that changes outputs
//!
//! Commands and automation both end up in [`Actuators::apply`], which only touches
//! hardware when the requested value differs from the current one.

use embedded_hal::digital::OutputPin;
use embedded_hal::pwm::SetDutyCycle;
use log::{debug, warn};

pub const RELAY_COUNT: usize = 4;
pub const SERVO_MAX_ANGLE: u8 = 180;

/// Relay number, 1 to 4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayId(u8);

impl RelayId {
    pub fn new(id: i32) -> Option<Self> {
        if (1..=RELAY_COUNT as i32).contains(&id) {
            Some(Self(id as u8))
        } else {
            None
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

/// Snapshot of every controllable output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorState {
    pub light: bool,
    /// Cooling fan
    pub fan: bool,
    /// Auxiliary output
    pub real_model: bool,
    pub relays: [bool; RELAY_COUNT],
    pub servo_angle: u8,
}

impl Default for ActuatorState {
    fn default() -> Self {
        Self {
            light: false,
            fan: false,
            real_model: false,
            relays: [false; RELAY_COUNT],
            servo_angle: 90,
        }
    }
}

/// One requested output change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    Light(bool),
    Fan(bool),
    RealModel(bool),
    Relay(RelayId, bool),
    /// Already clamped to 0..=180
    Servo(u8),
}

/// Clamp a requested servo angle to the mechanical range
pub fn clamp_servo_angle(angle: i32) -> u8 {
    angle.clamp(0, SERVO_MAX_ANGLE as i32) as u8
}

/// Hardware side of the actuators
pub trait ActuatorDriver {
    fn drive(&mut self, command: ActuatorCommand);
}

/// Owner of [`ActuatorState`]
pub struct Actuators<D> {
    driver: D,
    state: ActuatorState,
    mutations: u32,
}

impl<D: ActuatorDriver> Actuators<D> {
    /// Wrap a driver and push the default state to it
    pub fn new(mut driver: D) -> Self {
        let state = ActuatorState::default();
        driver.drive(ActuatorCommand::Light(state.light));
        driver.drive(ActuatorCommand::Fan(state.fan));
        driver.drive(ActuatorCommand::RealModel(state.real_model));
        for id in 1..=RELAY_COUNT as i32 {
            if let Some(relay) = RelayId::new(id) {
                driver.drive(ActuatorCommand::Relay(relay, false));
            }
        }
        driver.drive(ActuatorCommand::Servo(state.servo_angle));
        Self {
            driver,
            state,
            mutations: 0,
        }
    }

    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    /// Number of hardware changes made since boot
    pub fn mutations(&self) -> u32 {
        self.mutations
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Apply `command`; returns whether anything changed
    pub fn apply(&mut self, command: ActuatorCommand) -> bool {
        let slot_changed = match command {
            ActuatorCommand::Light(on) => replace(&mut self.state.light, on),
            ActuatorCommand::Fan(on) => replace(&mut self.state.fan, on),
            ActuatorCommand::RealModel(on) => replace(&mut self.state.real_model, on),
            ActuatorCommand::Relay(id, on) => replace(&mut self.state.relays[id.index()], on),
            ActuatorCommand::Servo(angle) => {
                let angle = angle.min(SERVO_MAX_ANGLE);
                replace(&mut self.state.servo_angle, angle)
            }
        };

        if slot_changed {
            self.driver.drive(command);
            self.mutations += 1;
            debug!("[ACT] {:?}", command);
        }
        slot_changed
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Servo pulse period at 50 Hz
const SERVO_PERIOD_US: u32 = 20_000;
const SERVO_MIN_PULSE_US: u32 = 500;
const SERVO_MAX_PULSE_US: u32 = 2_500;

/// Pulse width for a servo angle
pub fn servo_pulse_us(angle: u8) -> u32 {
    let angle = u32::from(angle.min(SERVO_MAX_ANGLE));
    SERVO_MIN_PULSE_US
        + angle * (SERVO_MAX_PULSE_US - SERVO_MIN_PULSE_US) / u32::from(SERVO_MAX_ANGLE)
}

/// Outputs wired to GPIO pins and one PWM channel for the servo
pub struct GpioActuators<P, S> {
    light: P,
    fan: P,
    real_model: P,
    relays: [P; RELAY_COUNT],
    servo: S,
}

impl<P, S> GpioActuators<P, S>
where
    P: OutputPin,
    S: SetDutyCycle,
{
    pub fn new(light: P, fan: P, real_model: P, relays: [P; RELAY_COUNT], servo: S) -> Self {
        Self {
            light,
            fan,
            real_model,
            relays,
            servo,
        }
    }
}

impl<P, S> ActuatorDriver for GpioActuators<P, S>
where
    P: OutputPin,
    S: SetDutyCycle,
{
    fn drive(&mut self, command: ActuatorCommand) {
        let result = match command {
            ActuatorCommand::Light(on) => set_pin(&mut self.light, on),
            ActuatorCommand::Fan(on) => set_pin(&mut self.fan, on),
            ActuatorCommand::RealModel(on) => set_pin(&mut self.real_model, on),
            ActuatorCommand::Relay(id, on) => set_pin(&mut self.relays[id.index()], on),
            ActuatorCommand::Servo(angle) => {
                let pulse = servo_pulse_us(angle) as u16;
                self.servo
                    .set_duty_cycle_fraction(pulse, SERVO_PERIOD_US as u16)
                    .map_err(|_| ())
            }
        };
        if result.is_err() {
            warn!("[ACT] Failed to drive {:?}", command);
        }
    }
}

fn set_pin<P: OutputPin>(pin: &mut P, high: bool) -> Result<(), ()> {
    if high {
        pin.set_high().map_err(|_| ())
    } else {
        pin.set_low().map_err(|_| ())
    }
}
