//! Hashing and signing utilities
//!
//! This module provides:
//! - Participant hashing (salted SHA-256, the only form in which attendee
//!   identity is ever stored)
//! - Content hashing over a canonicalized JSON form
//! - Deletion-certificate signatures (HMAC-SHA256)

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Hash a participant email with the owning user's salt.
///
/// The email is trimmed and lowercased first so that case and whitespace
/// variants collapse to one identity. The plaintext must never be persisted;
/// callers hash at the ingestion boundary and drop the original.
pub fn participant_hash(email: &str, salt: &str) -> String {
    let normalized = email.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Format an instant the way every hashed payload does: UTC, millisecond
/// precision, trailing `Z`.
pub fn format_instant_ms(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Hash a JSON value in canonical form.
///
/// `serde_json` maps serialize with sorted keys, so serializing the value
/// directly is already canonical as long as callers normalize instants via
/// [`format_instant_ms`] before insertion.
pub fn canonical_json_hash(value: &serde_json::Value) -> String {
    let serialized = value.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash an ordered sequence of key parts into a stable identifier.
///
/// Used for idempotency keys: the same logical write always lands on the
/// same key, retries included.
pub fn keyed_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    format!("{:x}", hasher.finalize())
}

/// Sign a journal digest for a deletion certificate.
///
/// # Errors
/// Fails only if the signing key is unusable for HMAC (empty keys are fine,
/// so in practice this does not fail).
pub fn sign_journal_digest(digest: &str, signing_key: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key)
        .map_err(|e| anyhow::anyhow!("failed to create HMAC: {e}"))?;
    mac.update(digest.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a deletion-certificate signature
pub fn verify_journal_signature(
    digest: &str,
    signature: &str,
    signing_key: &[u8],
) -> anyhow::Result<bool> {
    let expected = sign_journal_digest(digest, signing_key)?;
    Ok(expected == signature)
}
