//! Local automation: lighting schedule, climate control and the gas safety override

use crate::actuators::{ActuatorCommand, ActuatorState};
use crate::config;
use crate::telemetry::SensorSnapshot;
use heapless::Vec;
use log::{info, warn};

/// Rule parameters, changed only by the SET_LIGHT_SCHEDULE command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutomationRules {
    /// Hour (0-23) the light turns on
    pub light_on_hour: u8,
    /// Hour (0-23) the light turns off
    pub light_off_hour: u8,
    /// Fan runs above this temperature (°C)
    pub temperature_threshold: f32,
    /// Fan is forced on above this gas reading
    pub gas_threshold: u16,
}

impl Default for AutomationRules {
    fn default() -> Self {
        Self {
            light_on_hour: config::LIGHT_ON_HOUR,
            light_off_hour: config::LIGHT_OFF_HOUR,
            temperature_threshold: config::TEMPERATURE_THRESHOLD_C,
            gas_threshold: config::GAS_SAFETY_THRESHOLD,
        }
    }
}

impl AutomationRules {
    /// Whether `hour` falls in `[on, off)`, wrapping past midnight when off <= on
    pub fn light_window_contains(&self, hour: u8) -> bool {
        let (on, off) = (self.light_on_hour, self.light_off_hour);
        if on < off {
            hour >= on && hour < off
        } else {
            hour >= on || hour < off
        }
    }
}

pub struct AutomationEngine {
    rules: AutomationRules,
    enabled: bool,
    gas_override: bool,
}

impl Default for AutomationEngine {
    fn default() -> Self {
        Self::new(AutomationRules::default())
    }
}

impl AutomationEngine {
    /// Smart mode starts enabled
    pub fn new(rules: AutomationRules) -> Self {
        Self {
            rules,
            enabled: true,
            gas_override: false,
        }
    }

    pub fn rules(&self) -> &AutomationRules {
        &self.rules
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(
                "[AUTO] Smart mode {}",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.enabled = enabled;
    }

    /// Hours must already be validated to 0-23
    pub fn set_light_schedule(&mut self, on_hour: u8, off_hour: u8) {
        self.rules.light_on_hour = on_hour;
        self.rules.light_off_hour = off_hour;
        info!("[AUTO] Light schedule {}:00 -> {}:00", on_hour, off_hour);
    }

    /// Whether the gas override currently holds the fan on
    pub fn gas_override_active(&self) -> bool {
        self.gas_override
    }

    /// Work out which outputs must change. Only differing values are returned.
    ///
    /// `hour` is the local hour, `None` while wall-clock time is unknown.
    pub fn evaluate(
        &mut self,
        hour: Option<u8>,
        snapshot: &SensorSnapshot,
        state: &ActuatorState,
    ) -> Vec<ActuatorCommand, 2> {
        let mut changes = Vec::new();
        if !self.enabled {
            return changes;
        }

        if let Some(hour) = hour {
            let light = self.rules.light_window_contains(hour);
            if light != state.light {
                let _ = changes.push(ActuatorCommand::Light(light));
            }
        }

        // A missing reading keeps the override as it was
        if let Some(gas) = snapshot.gas_level {
            let above = gas > self.rules.gas_threshold;
            if above && !self.gas_override {
                warn!(
                    "[AUTO] Gas level {} above {}, forcing fan on",
                    gas, self.rules.gas_threshold
                );
            } else if !above && self.gas_override {
                info!("[AUTO] Gas level back to {}, override released", gas);
            }
            self.gas_override = above;
        }

        let fan = if self.gas_override {
            Some(true)
        } else {
            snapshot
                .temperature
                .map(|temperature| temperature > self.rules.temperature_threshold)
        };
        if let Some(fan) = fan {
            if fan != state.fan {
                let _ = changes.push(ActuatorCommand::Fan(fan));
            }
        }

        changes
    }
}
