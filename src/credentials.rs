//! Station credentials and their flash persistence
//!
//! Two sector-aligned slots hold a record each. A save always goes to the slot that
//! does not hold the newest valid record, so a write torn by power loss leaves the
//! previous credentials readable on the next boot.
//!
//! Record layout (little endian, 112 bytes):
//!
//! | offset | size | field                       |
//! |--------|------|-----------------------------|
//! | 0      | 4    | magic `NCRD`                |
//! | 4      | 4    | sequence number             |
//! | 8      | 1    | network name length         |
//! | 9      | 1    | secret length               |
//! | 10     | 2    | reserved (zero)             |
//! | 12     | 32   | network name, zero padded   |
//! | 44     | 64   | secret, zero padded         |
//! | 108    | 4    | CRC-32 of bytes 0..108      |

use crate::config::{NETWORK_NAME_MAX, SECRET_MAX};
use crc::{CRC_32_ISO_HDLC, Crc};
use embedded_storage::Storage;
use heapless::String;
use log::{info, warn};

const MAGIC: [u8; 4] = *b"NCRD";
const RECORD_LEN: usize = 112;
const CRC_OFFSET: usize = 108;
const NAME_OFFSET: usize = 12;
const SECRET_OFFSET: usize = NAME_OFFSET + NETWORK_NAME_MAX;

/// Distance between the two slots, one flash sector
pub const SLOT_STRIDE: u32 = 4096;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Why a credential pair was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialError {
    EmptyNetworkName,
    NetworkNameTooLong,
    SecretTooLong,
    /// A submitted field did not decode to UTF-8
    InvalidEncoding,
}

impl core::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CredentialError::EmptyNetworkName => write!(f, "network name is empty"),
            CredentialError::NetworkNameTooLong => {
                write!(f, "network name exceeds {} bytes", NETWORK_NAME_MAX)
            }
            CredentialError::SecretTooLong => write!(f, "secret exceeds {} bytes", SECRET_MAX),
            CredentialError::InvalidEncoding => write!(f, "form field is not valid UTF-8"),
        }
    }
}

/// Station join credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    network_name: String<NETWORK_NAME_MAX>,
    secret: String<SECRET_MAX>,
}

impl Credentials {
    /// Validate bounds and build a credential pair
    pub fn new(network_name: &str, secret: &str) -> Result<Self, CredentialError> {
        if network_name.is_empty() {
            return Err(CredentialError::EmptyNetworkName);
        }
        let network_name =
            String::try_from(network_name).map_err(|_| CredentialError::NetworkNameTooLong)?;
        let secret = String::try_from(secret).map_err(|_| CredentialError::SecretTooLong)?;
        Ok(Self {
            network_name,
            secret,
        })
    }

    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

/// Credential store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The flash driver rejected a read or write
    Io,
    /// The record read back after writing does not match
    Verify,
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::Io => write!(f, "flash access failed"),
            StoreError::Verify => write!(f, "flash verify failed"),
        }
    }
}

struct Record {
    sequence: u32,
    credentials: Option<Credentials>,
}

/// Persistent credential store over any `embedded-storage` backend
pub struct CredentialStore<S> {
    storage: S,
    base: u32,
}

impl<S: Storage> CredentialStore<S> {
    /// `base` is the offset of the first slot, the second follows one sector later
    pub fn new(storage: S, base: u32) -> Self {
        Self { storage, base }
    }

    /// Newest valid credentials, `None` when the node was never provisioned
    pub fn load(&mut self) -> Option<Credentials> {
        match self.newest() {
            Some((_, record)) => record.credentials,
            None => {
                info!("[STORE] No stored credentials");
                None
            }
        }
    }

    /// Persist `credentials` into the slot not holding the newest record
    pub fn save(&mut self, credentials: &Credentials) -> Result<(), StoreError> {
        let (slot, sequence) = match self.newest() {
            Some((slot, record)) => (1 - slot, record.sequence.wrapping_add(1)),
            None => (0, 1),
        };

        let record = encode(sequence, credentials);
        let offset = self.slot_offset(slot);
        self.storage.write(offset, &record).map_err(|_| {
            warn!("[STORE] Write to slot {} failed", slot);
            StoreError::Io
        })?;

        let mut readback = [0u8; RECORD_LEN];
        self.storage
            .read(offset, &mut readback)
            .map_err(|_| StoreError::Io)?;
        if readback != record {
            warn!("[STORE] Slot {} verify mismatch", slot);
            return Err(StoreError::Verify);
        }

        info!(
            "[STORE] Saved credentials for {} (slot {}, seq {})",
            credentials.network_name(),
            slot,
            sequence
        );
        Ok(())
    }

    /// Give the backend back, used to simulate a restart in tests
    pub fn into_inner(self) -> S {
        self.storage
    }

    fn slot_offset(&self, slot: usize) -> u32 {
        self.base + slot as u32 * SLOT_STRIDE
    }

    fn newest(&mut self) -> Option<(usize, Record)> {
        let mut newest: Option<(usize, Record)> = None;
        for slot in 0..2 {
            let mut raw = [0u8; RECORD_LEN];
            if self.storage.read(self.slot_offset(slot), &mut raw).is_err() {
                warn!("[STORE] Read of slot {} failed", slot);
                continue;
            }
            let Some(record) = decode(&raw) else {
                continue;
            };
            let newer = match &newest {
                Some((_, current)) => record.sequence > current.sequence,
                None => true,
            };
            if newer {
                newest = Some((slot, record));
            }
        }
        newest
    }
}

fn encode(sequence: u32, credentials: &Credentials) -> [u8; RECORD_LEN] {
    let mut raw = [0u8; RECORD_LEN];
    let name = credentials.network_name().as_bytes();
    let secret = credentials.secret().as_bytes();

    raw[0..4].copy_from_slice(&MAGIC);
    raw[4..8].copy_from_slice(&sequence.to_le_bytes());
    raw[8] = name.len() as u8;
    raw[9] = secret.len() as u8;
    raw[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
    raw[SECRET_OFFSET..SECRET_OFFSET + secret.len()].copy_from_slice(secret);

    let crc = CHECKSUM.checksum(&raw[..CRC_OFFSET]);
    raw[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
    raw
}

fn decode(raw: &[u8; RECORD_LEN]) -> Option<Record> {
    if raw[0..4] != MAGIC {
        return None;
    }
    let stored_crc = u32::from_le_bytes([raw[108], raw[109], raw[110], raw[111]]);
    if CHECKSUM.checksum(&raw[..CRC_OFFSET]) != stored_crc {
        warn!("[STORE] Discarding record with bad checksum");
        return None;
    }

    let sequence = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let name_len = raw[8] as usize;
    let secret_len = raw[9] as usize;
    if name_len > NETWORK_NAME_MAX || secret_len > SECRET_MAX {
        return None;
    }

    let name = core::str::from_utf8(&raw[NAME_OFFSET..NAME_OFFSET + name_len]).ok()?;
    let secret = core::str::from_utf8(&raw[SECRET_OFFSET..SECRET_OFFSET + secret_len]).ok()?;

    // An empty name is the "never provisioned" sentinel
    let credentials = Credentials::new(name, secret).ok();
    Some(Record {
        sequence,
        credentials,
    })
}
