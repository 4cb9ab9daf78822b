//! Firmware update and system control ports

/// Outcome of a firmware update request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// Image written; the device restarts into it
    Ok,
    /// The server has nothing newer
    NoUpdateAvailable,
    Failed(&'static str),
}

/// Fetches and flashes a firmware image
#[allow(async_fn_in_trait)]
pub trait FirmwareUpdater {
    async fn apply_update(&mut self, url: &str) -> UpdateResult;
}

/// Board-level controls
pub trait SystemControl {
    /// Cold restart; does not return on hardware
    fn restart(&mut self);

    /// Free heap in bytes
    fn free_heap(&self) -> u32;

    /// Milliseconds since boot
    fn uptime_ms(&self) -> u64;
}
