//! Cross-process result encoding.
//!
//! A worker prints one envelope on stdout:
//!
//! ```json
//! { "version": 1, "responses": [ ... ] }
//! ```
//!
//! Only process boundaries use this; in-process runs pass responses directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::AuditResponse;

pub const WIRE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload is empty")]
    Empty,
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported payload version {0} (expected {WIRE_VERSION})")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    responses: Vec<AuditResponse>,
}

pub fn encode(responses: &[AuditResponse]) -> Result<String, WireError> {
    #[derive(Serialize)]
    struct EnvelopeRef<'a> {
        version: u32,
        responses: &'a [AuditResponse],
    }

    Ok(serde_json::to_string(&EnvelopeRef {
        version: WIRE_VERSION,
        responses,
    })?)
}

pub fn decode(payload: &str) -> Result<Vec<AuditResponse>, WireError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(WireError::Empty);
    }
    let envelope: Envelope = serde_json::from_str(payload)?;
    if envelope.version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(envelope.version));
    }
    Ok(envelope.responses)
}
