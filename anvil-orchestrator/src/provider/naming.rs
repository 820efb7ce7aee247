//! Instance naming
//!
//! `anvil-<job fragment>-<unix seconds>-<nonce>`: lowercase, starts with a
//! letter, at most 63 characters, and different on every attempt for the
//! same job.

use chrono::{DateTime, Utc};
use uuid::Uuid;

const PREFIX: &str = "anvil";

pub fn instance_name(job_id: Uuid, now: DateTime<Utc>) -> String {
    let job = job_id.simple().to_string();
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}-{}", PREFIX, &job[..8], now.timestamp(), &nonce[..6])
}

/// True if `name` is a valid Compute Engine resource name
pub fn is_valid(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 || !bytes[0].is_ascii_lowercase() {
        return false;
    }
    if bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}
