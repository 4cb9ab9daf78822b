//! Wall-clock time from SNTP
//!
//! The monotonic clock is anchored to a unix time once an SNTP answer arrives. Until
//! then the local hour is unknown and timestamps read `unknown`.

use crate::clock::RetrySchedule;
use crate::config;
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use core::fmt::Write;
use embassy_time::{Duration, Instant};
use log::{info, warn};

/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;
pub const SNTP_PACKET_LEN: usize = 48;
pub const SNTP_PORT: u16 = 123;

/// `YYYY-MM-DD HH:MM:SS` or `unknown`
pub type Timestamp = heapless::String<19>;

/// Source of the current unix time, e.g. an SNTP client
#[allow(async_fn_in_trait)]
pub trait NetworkTime {
    /// Seconds since the unix epoch, `None` when the server did not answer
    async fn unix_time(&mut self) -> Option<u64>;
}

pub struct WallClock {
    anchor: Option<(u64, Instant)>,
    utc_offset_secs: i32,
    resync: RetrySchedule,
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new(config::UTC_OFFSET_SECS)
    }
}

impl WallClock {
    pub fn new(utc_offset_secs: i32) -> Self {
        Self {
            anchor: None,
            utc_offset_secs,
            resync: RetrySchedule::new(Duration::from_millis(config::NTP_RESYNC_INTERVAL_MS)),
        }
    }

    pub fn is_synced(&self) -> bool {
        self.anchor.is_some()
    }

    /// Anchor unix time `unix_secs` at monotonic instant `now`
    pub fn set(&mut self, unix_secs: u64, now: Instant) {
        self.anchor = Some((unix_secs, now));
    }

    /// Query `source` if unsynced and the resync interval elapsed
    pub async fn sync_if_due<T: NetworkTime>(&mut self, now: Instant, source: &mut T) {
        if self.is_synced() || !self.resync.is_due(now) {
            return;
        }
        self.resync.record_attempt(now);
        match source.unix_time().await {
            Some(unix_secs) => {
                self.set(unix_secs, now);
                info!("[TIME] Synchronized, local time {}", self.timestamp(now));
            }
            None => warn!("[TIME] SNTP query failed, retrying later"),
        }
    }

    pub fn unix_time(&self, now: Instant) -> Option<u64> {
        let (unix_secs, at) = self.anchor?;
        Some(unix_secs + now.saturating_duration_since(at).as_secs())
    }

    pub fn local_time(&self, now: Instant) -> Option<NaiveDateTime> {
        let local = self.unix_time(now)? as i64 + i64::from(self.utc_offset_secs);
        DateTime::from_timestamp(local, 0).map(|utc| utc.naive_utc())
    }

    /// Local hour (0-23)
    pub fn local_hour(&self, now: Instant) -> Option<u8> {
        self.local_time(now).map(|time| time.hour() as u8)
    }

    pub fn timestamp(&self, now: Instant) -> Timestamp {
        let mut out = Timestamp::new();
        match self.local_time(now) {
            Some(time) => {
                let _ = write!(
                    out,
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    time.year(),
                    time.month(),
                    time.day(),
                    time.hour(),
                    time.minute(),
                    time.second()
                );
            }
            None => {
                let _ = out.push_str("unknown");
            }
        }
        out
    }
}

/// SNTP v4 client request
pub fn sntp_request() -> [u8; SNTP_PACKET_LEN] {
    let mut packet = [0u8; SNTP_PACKET_LEN];
    // LI 0, version 4, mode 3 (client)
    packet[0] = 0x23;
    packet
}

/// Transmit timestamp of a server reply as unix seconds
pub fn parse_sntp_response(packet: &[u8]) -> Option<u64> {
    if packet.len() < SNTP_PACKET_LEN {
        return None;
    }
    // mode 4 (server), stratum 0 is a kiss-of-death
    if packet[0] & 0x07 != 4 || packet[1] == 0 {
        return None;
    }
    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    u64::from(seconds).checked_sub(NTP_UNIX_OFFSET)
}
