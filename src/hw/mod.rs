//! ESP32-C3 implementations of the node ports
//!
//! Pin map:
//! - status LED (WS2812) on GPIO8
//! - gas sensor ADC on GPIO2, temperature sensor ADC on GPIO3
//! - servo PWM (LEDC, 50 Hz) on GPIO10
//! - light GPIO4, fan GPIO5, real model GPIO6
//! - relays 1-4 on GPIO7, GPIO1, GPIO20, GPIO21

pub mod mqtt;
pub mod portal;
pub mod sensors;
pub mod system;
pub mod wifi;

use crate::actuators::GpioActuators;
use crate::node::Platform;
use esp_hal::gpio::Output;
use esp_hal::ledc::LowSpeed;
use esp_hal::ledc::channel::Channel as LedcChannel;
use esp_hal_smartled::SmartLedsAdapter;
use esp_storage::FlashStorage;

/// RMT buffer length for one WS2812 pixel (24 bits plus end marker)
pub const STATUS_LED_BUFFER: usize = 25;

pub type StatusLed = SmartLedsAdapter<esp_hal::rmt::Channel<esp_hal::Blocking, 0>, STATUS_LED_BUFFER>;
pub type ServoPwm = LedcChannel<'static, LowSpeed>;

/// The board
pub struct EspPlatform;

impl Platform for EspPlatform {
    type Clock = system::EmbassyClock;
    type Radio = wifi::EspRadio;
    type Flash = FlashStorage;
    type Portal = crate::portal::ChannelPortalLink;
    type Mqtt = crate::session::ChannelMqttLink;
    type Sensors = sensors::AnalogSensors;
    type Outputs = GpioActuators<Output<'static>, ServoPwm>;
    type Updater = system::OtaUnavailable;
    type System = system::EspSystem;
    type Time = system::SntpClient;
    type Led = StatusLed;
}
