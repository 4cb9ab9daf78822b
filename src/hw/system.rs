//! Clock, system control, SNTP and firmware update ports

use crate::clock::Clock;
use crate::config;
use crate::ota::{FirmwareUpdater, SystemControl, UpdateResult};
use crate::time::{NetworkTime, SNTP_PACKET_LEN, SNTP_PORT, parse_sntp_response, sntp_request};
use crate::NodeError;
use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, Stack};
use embassy_time::{Duration, Instant, Timer, with_timeout};
use log::{debug, info, warn};

const SNTP_TIMEOUT: Duration = Duration::from_secs(3);
const SNTP_LOCAL_PORT: u16 = 10123;

/// embassy-time backed clock
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        Timer::after(duration).await;
    }
}

pub struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        info!("[MAIN] Software reset");
        esp_hal::system::software_reset();
    }

    fn free_heap(&self) -> u32 {
        esp_alloc::HEAP.free() as u32
    }

    fn uptime_ms(&self) -> u64 {
        Instant::now().as_millis()
    }
}

/// No image transport is built in; every request reports failure
pub struct OtaUnavailable;

impl FirmwareUpdater for OtaUnavailable {
    async fn apply_update(&mut self, _url: &str) -> UpdateResult {
        UpdateResult::Failed("firmware updates are not supported by this build")
    }
}

/// SNTP over the station interface
pub struct SntpClient {
    stack: Stack<'static>,
}

impl SntpClient {
    pub fn new(stack: Stack<'static>) -> Self {
        Self { stack }
    }

    async fn query(&mut self) -> Result<u64, NodeError> {
        let addresses = self
            .stack
            .dns_query(config::NTP_SERVER, DnsQueryType::A)
            .await
            .map_err(|_| NodeError::WiFiError)?;
        let server = addresses.first().copied().ok_or(NodeError::WiFiError)?;

        let mut rx_meta = [PacketMetadata::EMPTY; 2];
        let mut tx_meta = [PacketMetadata::EMPTY; 2];
        let mut rx_buffer = [0u8; 128];
        let mut tx_buffer = [0u8; 128];
        let mut socket = UdpSocket::new(
            self.stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );
        socket
            .bind(SNTP_LOCAL_PORT)
            .map_err(|_| NodeError::SystemError)?;

        socket
            .send_to(&sntp_request(), IpEndpoint::new(server, SNTP_PORT))
            .await
            .map_err(|_| NodeError::ProtocolError)?;

        let mut reply = [0u8; SNTP_PACKET_LEN];
        let (len, _) = with_timeout(SNTP_TIMEOUT, socket.recv_from(&mut reply))
            .await
            .map_err(|_| NodeError::ProtocolError)?
            .map_err(|_| NodeError::ProtocolError)?;
        parse_sntp_response(&reply[..len]).ok_or(NodeError::ProtocolError)
    }
}

impl NetworkTime for SntpClient {
    async fn unix_time(&mut self) -> Option<u64> {
        match self.query().await {
            Ok(unix_secs) => Some(unix_secs),
            Err(e) => {
                debug!("[TIME] SNTP query to {} failed: {}", config::NTP_SERVER, e);
                None
            }
        }
    }
}

/// Halt on fatal bring-up errors, keeping the message on the console
pub fn halt(error: NodeError, context: &str) -> ! {
    warn!("[MAIN] {} failed: {}", context, error);
    loop {
        core::hint::spin_loop();
    }
}
