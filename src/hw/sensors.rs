//! Analog sensors on ADC1
//!
//! Gas is the raw 12-bit reading. Temperature comes from an LM35-style analog
//! sensor (10 mV/°C). There is no humidity sensor on this board.

use crate::telemetry::{SensorSnapshot, SensorSource};
use crate::NodeError;
use esp_hal::analog::adc::{Adc, AdcPin};
use esp_hal::peripherals::{ADC1, GPIO2, GPIO3};
use log::warn;

pub type SensorAdc = Adc<'static, ADC1<'static>, esp_hal::Blocking>;
pub type GasPin = AdcPin<GPIO2<'static>, ADC1<'static>>;
pub type TemperaturePin = AdcPin<GPIO3<'static>, ADC1<'static>>;

/// Full scale at 11 dB attenuation
const FULL_SCALE_MV: u32 = 2500;
const ADC_MAX: u32 = 4095;
const READ_ATTEMPTS: u32 = 100;

pub struct AnalogSensors {
    adc: SensorAdc,
    gas: GasPin,
    temperature: TemperaturePin,
}

impl AnalogSensors {
    pub fn new(adc: SensorAdc, gas: GasPin, temperature: TemperaturePin) -> Self {
        Self {
            adc,
            gas,
            temperature,
        }
    }

    fn read_gas(&mut self) -> Result<u16, NodeError> {
        for _ in 0..READ_ATTEMPTS {
            if let Ok(raw) = self.adc.read_oneshot(&mut self.gas) {
                return Ok(raw);
            }
        }
        Err(NodeError::HardwareError)
    }

    fn read_temperature(&mut self) -> Result<f32, NodeError> {
        for _ in 0..READ_ATTEMPTS {
            if let Ok(raw) = self.adc.read_oneshot(&mut self.temperature) {
                let millivolts = u32::from(raw) * FULL_SCALE_MV / ADC_MAX;
                return Ok(millivolts as f32 / 10.0);
            }
        }
        Err(NodeError::HardwareError)
    }
}

impl SensorSource for AnalogSensors {
    fn sample(&mut self) -> SensorSnapshot {
        let gas_level = self
            .read_gas()
            .inspect_err(|e| warn!("[SENSOR] Gas read failed: {}", e))
            .ok();
        let temperature = self
            .read_temperature()
            .inspect_err(|e| warn!("[SENSOR] Temperature read failed: {}", e))
            .ok();

        SensorSnapshot {
            temperature,
            humidity: None,
            gas_level,
        }
    }
}
