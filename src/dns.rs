//! Captive portal DNS responder
//!
//! Answers every A query with the portal address so a phone or laptop that joins
//! the provisioning access point opens the form on its own. Message parsing and
//! building is done by `edge-captive`.

use core::time::Duration;

use log::debug;

const ANSWER_TTL: Duration = Duration::from_secs(60);

/// Build the response to `query` into `out`, returning its length.
///
/// Returns `None` for anything that is not a well-formed DNS message or whose
/// response does not fit into `out`.
pub fn answer_query(query: &[u8], address: [u8; 4], out: &mut [u8]) -> Option<usize> {
    match edge_captive::reply(query, &address, ANSWER_TTL, out) {
        Ok(len) => Some(len),
        Err(e) => {
            debug!("[PORTAL] DNS query dropped: {:?}", e);
            None
        }
    }
}
