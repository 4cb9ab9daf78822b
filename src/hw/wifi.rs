//! WiFi radio for ESP32-C3
//!
//! Drives the esp-wifi 0.14.1 controller in either station or access point mode.
//! The station interface gets its address over DHCP through embassy-net, the access
//! point interface has a static address configured at boot.

use crate::connectivity::{AccessPointRadio, RadioError, StationRadio};
use crate::credentials::Credentials;
use embassy_net::Stack;
use esp_wifi::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, WifiController,
};
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RadioMode {
    Idle,
    Station,
    AccessPoint,
}

/// WiFi manager for both interfaces
pub struct EspRadio {
    controller: WifiController<'static>,
    station: Stack<'static>,
    mode: RadioMode,
}

impl EspRadio {
    pub fn new(controller: WifiController<'static>, station: Stack<'static>) -> Self {
        Self {
            controller,
            station,
            mode: RadioMode::Idle,
        }
    }

    fn ensure_started(&mut self) -> Result<(), RadioError> {
        if !self.controller.is_started().unwrap_or(false) {
            self.controller.start().map_err(|_| RadioError::Driver)?;
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Err(e) = self.controller.stop() {
            warn!("[WIFI] Failed to stop controller: {:?}", e);
        }
        self.mode = RadioMode::Idle;
    }
}

impl StationRadio for EspRadio {
    fn begin_join(&mut self, credentials: &Credentials) -> Result<(), RadioError> {
        info!(
            "[WIFI] Connecting to WiFi network: {}",
            credentials.network_name()
        );

        if self.mode == RadioMode::AccessPoint {
            self.stop();
        }

        let auth_method = if credentials.secret().is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let client_config = ClientConfiguration {
            ssid: credentials
                .network_name()
                .try_into()
                .map_err(|_| RadioError::Configuration)?,
            password: credentials
                .secret()
                .try_into()
                .map_err(|_| RadioError::Configuration)?,
            auth_method,
            ..Default::default()
        };

        self.controller
            .set_configuration(&Configuration::Client(client_config))
            .map_err(|_| RadioError::Configuration)?;
        self.ensure_started()?;
        self.controller.connect().map_err(|_| RadioError::Driver)?;
        self.mode = RadioMode::Station;
        Ok(())
    }

    fn is_linked(&mut self) -> bool {
        // Associated and holding a DHCP lease
        self.mode == RadioMode::Station
            && self.controller.is_connected().unwrap_or(false)
            && self.station.is_config_up()
    }

    fn leave(&mut self) {
        if self.mode != RadioMode::Station {
            return;
        }
        if let Err(e) = self.controller.disconnect() {
            warn!("[WIFI] Disconnect failed: {:?}", e);
        }
    }

    fn rssi(&mut self) -> Option<i8> {
        if self.mode != RadioMode::Station {
            return None;
        }
        self.controller
            .rssi()
            .ok()
            .map(|rssi| rssi.clamp(i8::MIN as i32, i8::MAX as i32) as i8)
    }
}

impl AccessPointRadio for EspRadio {
    fn start_access_point(&mut self, name: &str, address: [u8; 4]) -> Result<(), RadioError> {
        if self.mode != RadioMode::Idle {
            self.stop();
        }

        let ap_config = AccessPointConfiguration {
            ssid: name.try_into().map_err(|_| RadioError::Configuration)?,
            auth_method: AuthMethod::None,
            ..Default::default()
        };
        self.controller
            .set_configuration(&Configuration::AccessPoint(ap_config))
            .map_err(|_| RadioError::Configuration)?;
        self.ensure_started()?;
        self.mode = RadioMode::AccessPoint;

        let [a, b, c, d] = address;
        info!("[WIFI] Access point {} started at {}.{}.{}.{}", name, a, b, c, d);
        Ok(())
    }

    fn stop_access_point(&mut self) {
        if self.mode == RadioMode::AccessPoint {
            self.stop();
        }
    }
}
