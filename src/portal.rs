//! Provisioning portal
//!
//! While the node is provisioning it hosts its own access point with a form for a
//! network name and secret. The HTTP, DHCP and DNS sockets live in the hardware
//! layer and reach this module through [`PortalLink`].

use crate::config;
use crate::connectivity::{AccessPointRadio, RadioError};
use crate::credentials::{CredentialError, CredentialStore, Credentials};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embedded_storage::Storage;
use log::{info, warn};

/// A submitted form, before validation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProvisioningForm {
    pub network_name: String,
    pub secret: String,
}

/// Answer shown to the person who submitted the form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormResponse {
    /// Stored; the node is leaving the portal to join
    Saved,
    /// Accepted for this boot only, the store write failed
    SavedNotPersisted,
    /// Input refused, the portal stays open
    Rejected(CredentialError),
}

/// Connection between the portal logic and the sockets serving the form
pub trait PortalLink {
    /// Start or stop serving the form and answering DNS
    fn set_active(&mut self, active: bool);

    /// Next pending submission, if any; never blocks
    fn next_submission(&mut self) -> Option<ProvisioningForm>;

    /// Reply to the submission last returned by `next_submission`
    fn respond(&mut self, response: FormResponse);
}

/// Result of servicing the portal for one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalOutcome {
    /// Nothing submitted
    Idle,
    /// A submission failed validation
    Rejected(CredentialError),
    /// Valid credentials received; the portal has been torn down
    Completed {
        credentials: Credentials,
        persisted: bool,
    },
}

pub struct ProvisioningPortal {
    ap_name: &'static str,
    address: [u8; 4],
    open: bool,
}

impl Default for ProvisioningPortal {
    fn default() -> Self {
        Self::new(config::PORTAL_AP_NAME, config::PORTAL_ADDRESS)
    }
}

impl ProvisioningPortal {
    pub fn new(ap_name: &'static str, address: [u8; 4]) -> Self {
        Self {
            ap_name,
            address,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn address(&self) -> [u8; 4] {
        self.address
    }

    /// Bring up the access point and start serving the form
    pub fn open<R, L>(&mut self, radio: &mut R, link: &mut L) -> Result<(), RadioError>
    where
        R: AccessPointRadio,
        L: PortalLink,
    {
        if self.open {
            return Ok(());
        }
        radio.start_access_point(self.ap_name, self.address)?;
        link.set_active(true);
        self.open = true;
        let [a, b, c, d] = self.address;
        info!(
            "[PORTAL] Access point {} up, form at http://{}.{}.{}.{}/",
            self.ap_name, a, b, c, d
        );
        Ok(())
    }

    /// Stop serving and tear the access point down
    pub fn close<R, L>(&mut self, radio: &mut R, link: &mut L)
    where
        R: AccessPointRadio,
        L: PortalLink,
    {
        if !self.open {
            return;
        }
        link.set_active(false);
        radio.stop_access_point();
        self.open = false;
        info!("[PORTAL] Access point closed");
    }

    /// Handle at most one submission
    pub fn service<R, L, S>(
        &mut self,
        radio: &mut R,
        link: &mut L,
        store: &mut CredentialStore<S>,
    ) -> PortalOutcome
    where
        R: AccessPointRadio,
        L: PortalLink,
        S: Storage,
    {
        if !self.open {
            return PortalOutcome::Idle;
        }
        let Some(form) = link.next_submission() else {
            return PortalOutcome::Idle;
        };

        let credentials = match Credentials::new(&form.network_name, &form.secret) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("[PORTAL] Rejected submission: {}", e);
                link.respond(FormResponse::Rejected(e));
                return PortalOutcome::Rejected(e);
            }
        };

        let persisted = match store.save(&credentials) {
            Ok(()) => {
                link.respond(FormResponse::Saved);
                true
            }
            Err(e) => {
                warn!(
                    "[PORTAL] Could not persist credentials ({}), using them for this boot only",
                    e
                );
                link.respond(FormResponse::SavedNotPersisted);
                false
            }
        };

        self.close(radio, link);
        PortalOutcome::Completed {
            credentials,
            persisted,
        }
    }
}

/// Shared between the node loop and the HTTP task
pub struct PortalChannels {
    submissions: Channel<CriticalSectionRawMutex, ProvisioningForm, 1>,
    responses: Channel<CriticalSectionRawMutex, FormResponse, 1>,
    active: AtomicBool,
}

impl PortalChannels {
    pub const fn new() -> Self {
        Self {
            submissions: Channel::new(),
            responses: Channel::new(),
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Hand a form to the node loop and wait for its answer.
    ///
    /// Returns `None` when another submission is still queued. The caller bounds
    /// the wait; an answer that lands after the caller gave up is discarded by the
    /// next submission.
    pub async fn submit(&self, form: ProvisioningForm) -> Option<FormResponse> {
        while self.responses.try_receive().is_ok() {}
        self.submissions.try_send(form).ok()?;
        Some(self.responses.receive().await)
    }
}

impl Default for PortalChannels {
    fn default() -> Self {
        Self::new()
    }
}

/// Node side of the portal tasks
pub struct ChannelPortalLink {
    channels: &'static PortalChannels,
}

impl ChannelPortalLink {
    pub fn new(channels: &'static PortalChannels) -> Self {
        Self { channels }
    }
}

impl PortalLink for ChannelPortalLink {
    fn set_active(&mut self, active: bool) {
        self.channels.active.store(active, Ordering::Release);
        if !active {
            // Drop anything submitted after the last service pass
            while self.channels.submissions.try_receive().is_ok() {}
        }
    }

    fn next_submission(&mut self) -> Option<ProvisioningForm> {
        self.channels.submissions.try_receive().ok()
    }

    fn respond(&mut self, response: FormResponse) {
        if self.channels.responses.try_send(response).is_err() {
            warn!("[PORTAL] No request waiting for the form response");
        }
    }
}

/// Parse an `application/x-www-form-urlencoded` body into a form.
/// Missing fields stay empty and are caught by validation. A field whose
/// percent-decoded bytes are not UTF-8 rejects the whole body.
pub fn parse_form_body(body: &str) -> Result<ProvisioningForm, CredentialError> {
    let mut form = ProvisioningForm::default();
    for pair in body.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match decode_component(key).as_deref() {
            Ok("network_name") => form.network_name = decode_component(value)?,
            Ok("secret") => form.secret = decode_component(value)?,
            _ => {}
        }
    }
    Ok(form)
}

fn decode_component(raw: &str) -> Result<String, CredentialError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8(out).map_err(|_| CredentialError::InvalidEncoding)
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}
