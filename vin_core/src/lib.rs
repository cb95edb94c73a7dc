//! Protocol core for VIN, a confidential inference proxy running inside a TEE.
//!
//! This crate holds the pure protocol machinery, with no I/O:
//! - [`canonical`]: RFC 8785 (JCS) canonical JSON, SHA-256 hashing and the
//!   hex / base64url codecs every commitment in the protocol is built from
//! - [`crypto`]: the hybrid encryption scheme (secp256k1 ECDH → HKDF-SHA256 →
//!   AES-256-GCM) used to shuttle requests and responses
//! - [`cache`]: the bounded TTL cache backing the replay and DNS-pin maps
//! - [`request`]: the decrypted LLM request model and its validation rules
//! - [`receipt`]: building, signing and verifying receipts, with replay defense

pub mod cache;
pub mod canonical;
pub mod crypto;
pub mod receipt;
pub mod request;

/// Boxed error type used at crate boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
