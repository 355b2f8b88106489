//! C7: transfer package (spec.md §4.C7/§6) — an out-of-band bootstrap
//! envelope for air-gapped enrollment: JSON payload plus an IEEE CRC32
//! computed over the payload exactly as serialized, so a corrupted or
//! hand-edited file is caught before its fields are ever trusted.

use crc32fast::Hasher;
use failure::ResultExt;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::Result;

const MAGIC: &str = "keymaster-transfer-v1";

/// The pending-account fields plus the bootstrap session's ephemeral
/// public key (spec.md §3 BootstrapSession / §4.C6 step 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub username: String,
    pub hostname: String,
    pub label: String,
    pub tags: String,
    pub ephemeral_public_key: String,
    pub nonce: String,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: String,
    payload: serde_json::Value,
    crc: u32,
}

/// 16 random bytes, hex-encoded (spec.md §3: "nonce").
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn crc32_of(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Encode a payload into the transfer package's JSON wire format.
pub fn encode(payload: &TransferPayload) -> Result<String> {
    let payload_value = serde_json::to_value(payload).context(ErrorKind::ErrOther("failed to serialize transfer payload".to_string()))?;
    let payload_bytes = serde_json::to_vec(&payload_value).context(ErrorKind::ErrOther("failed to encode transfer payload bytes".to_string()))?;
    let envelope = Envelope { magic: MAGIC.to_string(), payload: payload_value, crc: crc32_of(&payload_bytes) };
    serde_json::to_string(&envelope).context(ErrorKind::ErrOther("failed to encode transfer package".to_string())).map_err(Into::into)
}

/// Decode and validate a transfer package: checks the magic literal, then
/// recomputes the CRC32 over the payload's canonical bytes and compares
/// it against the recorded value. Either failure is reported as its own
/// error kind rather than folded into a generic parse error, matching the
/// distinction spec.md §6 draws between `ErrTransferMagic` and
/// `ErrTransferCorrupt`.
pub fn decode(data: &str) -> Result<TransferPayload> {
    let envelope: Envelope = serde_json::from_str(data).context(ErrorKind::ErrOther("malformed transfer package JSON".to_string()))?;

    if envelope.magic != MAGIC {
        return Err(ErrorKind::ErrTransferMagic.into());
    }

    let payload_bytes = serde_json::to_vec(&envelope.payload).context(ErrorKind::ErrOther("failed to re-encode transfer payload".to_string()))?;
    if crc32_of(&payload_bytes) != envelope.crc {
        return Err(ErrorKind::ErrTransferCorrupt.into());
    }

    serde_json::from_value(envelope.payload).context(ErrorKind::ErrOther("malformed transfer payload fields".to_string())).map_err(Into::into)
}
