//! Input Sanitization Module (ISM).
//!
//! A minimal TEE service that attests an input arrived from an approved
//! non-human source. Each instance owns an Ed25519 keypair, a monotonic
//! sequence counter and a bounded replay set; `attest` produces a signed
//! [`InputAttestation`] that downstream receipts can bind as an opaque
//! blob hash.
//!
//! External failure reasons are deliberately coarse: every source,
//! signature or replay failure surfaces the same `"Input rejected"` so a
//! caller cannot enumerate approved sources. The verbose reason goes to
//! the debug log only.
//!
//! Signature quirk, kept for verifier compatibility: the ISM signs
//! `sha256(jcs(payload))` rather than the canonical payload bytes.
//! [`verify_attestation`] reproduces this exactly.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use vin_core::{
    cache::TtlCache,
    canonical::{b64url_decode, b64url_encode, canonical_json, canonical_json_value, sha256},
};

pub const ATTESTATION_SCHEMA: &str = "ism.input.v0";

/// Default cap on accepted input size, bytes.
pub const DEFAULT_MAX_INPUT_SIZE: usize = 1_048_576;

/// Default capacity of the replay set.
pub const DEFAULT_REPLAY_CAPACITY: u64 = 10_000;

/// Default tolerated clock drift when verifying `received_at`, milliseconds.
pub const DEFAULT_MAX_CLOCK_DRIFT_MS: i64 = 300_000;

/// Kinds of approved non-human sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    BlockchainEvent,
    ApiSigned,
    IsmChain,
    Cron,
    VrfChallenge,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockchainEvent => "blockchain_event",
            Self::ApiSigned => "api_signed",
            Self::IsmChain => "ism_chain",
            Self::Cron => "cron",
            Self::VrfChallenge => "vrf_challenge",
        }
    }
}

/// A source this ISM instance accepts inputs from. Immutable after
/// construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovedSource {
    pub id: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Ed25519 public key (hex) for `api_signed` sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

/// An input submitted for attestation.
#[derive(Clone, Debug, Deserialize)]
pub struct RawInput {
    pub source_id: String,
    pub source_type: SourceType,
    /// Object data is canonicalized before hashing; string data is hashed
    /// as-is.
    pub data: Value,
    /// Base64url Ed25519 signature over the input bytes (`api_signed`).
    #[serde(default)]
    pub source_signature: Option<String>,
    #[serde(default)]
    pub block_hash: Option<String>,
}

/// A signed statement that an input came from an approved source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputAttestation {
    pub schema: String,
    pub ism_id: String,
    /// Hex Ed25519 public key; verification is self-describing.
    pub ism_pubkey: String,
    /// Hex SHA-256 over the input bytes.
    pub input_hash: String,
    pub input_type: String,
    pub input_source: String,
    /// Unix milliseconds.
    pub received_at: i64,
    /// Strictly increasing per instance, starting at 1.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tee_attestation: Option<Value>,
    /// Base64url Ed25519 signature over `sha256(jcs(payload))`.
    pub sig: String,
}

/// External error surface. Source, signature and replay failures all
/// collapse into [`IsmError::Rejected`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IsmError {
    #[error("Input rejected")]
    Rejected,

    #[error("Input too large")]
    TooLarge,

    #[error("Clock error")]
    Clock,
}

/// Millisecond clock, injected for testability.
pub type ClockSource = Box<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(-1)
}

pub struct Ism {
    id: String,
    signing: SigningKey,
    pubkey_hex: String,
    sources: HashMap<String, ApprovedSource>,
    sequence: AtomicU64,
    /// Keyed by `"{source_id}:{input_hash}"`. Process-local and volatile:
    /// a restart re-opens a bounded replay window.
    replay: TtlCache<String, ()>,
    max_input_size: usize,
    clock: ClockSource,
}

impl Ism {
    pub fn new(id: impl Into<String>, signing: SigningKey, sources: Vec<ApprovedSource>) -> Self {
        let pubkey_hex = hex::encode(signing.verifying_key().as_bytes());
        Self {
            id: id.into(),
            signing,
            pubkey_hex,
            sources: sources.into_iter().map(|s| (s.id.clone(), s)).collect(),
            sequence: AtomicU64::new(0),
            replay: TtlCache::bounded(DEFAULT_REPLAY_CAPACITY),
            max_input_size: DEFAULT_MAX_INPUT_SIZE,
            clock: Box::new(system_clock),
        }
    }

    pub fn with_max_input_size(mut self, max_input_size: usize) -> Self {
        self.max_input_size = max_input_size;
        self
    }

    pub fn with_replay_capacity(mut self, capacity: u64) -> Self {
        self.replay = TtlCache::bounded(capacity);
        self
    }

    pub fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    /// Hex Ed25519 public key of this instance.
    pub fn pubkey_hex(&self) -> &str {
        &self.pubkey_hex
    }

    /// Current sequence value (the last one issued).
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Attests an input. First failure wins; every policy failure surfaces
    /// the same opaque reason.
    pub fn attest(&self, input: &RawInput) -> Result<InputAttestation, IsmError> {
        let source = self.sources.get(&input.source_id).ok_or_else(|| {
            log::debug!("attest: unknown source");
            IsmError::Rejected
        })?;
        if source.source_type != input.source_type {
            log::debug!("attest: source type mismatch");
            return Err(IsmError::Rejected);
        }

        let bytes = input_bytes(&input.data).map_err(|_| IsmError::Rejected)?;
        if bytes.len() > self.max_input_size {
            return Err(IsmError::TooLarge);
        }
        let input_hash = hex::encode(sha256(&bytes));

        let replay_key = format!("{}:{}", input.source_id, input_hash);
        if self.replay.contains(&replay_key) {
            log::debug!("attest: duplicate input");
            return Err(IsmError::Rejected);
        }

        if source.source_type == SourceType::ApiSigned {
            if let Some(source_pubkey) = &source.pubkey {
                verify_source_signature(source_pubkey, input.source_signature.as_deref(), &bytes)
                    .map_err(|_| {
                        log::debug!("attest: source signature invalid");
                        IsmError::Rejected
                    })?;
            }
        }
        if source.source_type == SourceType::BlockchainEvent && input.block_hash.is_none() {
            log::debug!("attest: blockchain event without block hash");
            return Err(IsmError::Rejected);
        }

        self.replay.insert(replay_key, ());

        let now = (self.clock)();
        if now < 0 {
            return Err(IsmError::Clock);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let mut attestation = InputAttestation {
            schema: ATTESTATION_SCHEMA.to_string(),
            ism_id: self.id.clone(),
            ism_pubkey: self.pubkey_hex.clone(),
            input_hash,
            input_type: input.source_type.as_str().to_string(),
            input_source: input.source_id.clone(),
            received_at: now,
            sequence,
            source_signature: input.source_signature.clone(),
            source_pubkey: source.pubkey.clone(),
            block_hash: input.block_hash.clone(),
            tee_attestation: None,
            sig: String::new(),
        };

        let digest = payload_digest(&attestation).map_err(|_| IsmError::Rejected)?;
        let sig = self.signing.sign(&digest);
        attestation.sig = b64url_encode(&sig.to_bytes());
        Ok(attestation)
    }

    /// Verifies an attestation with the default clock and drift.
    pub fn verify(attestation: &InputAttestation) -> Result<(), IsmError> {
        verify_attestation(attestation, system_clock(), DEFAULT_MAX_CLOCK_DRIFT_MS)
    }
}

impl std::fmt::Debug for Ism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ism")
            .field("id", &self.id)
            .field("pubkey", &self.pubkey_hex)
            .field("sources", &self.sources.len())
            .field("sequence", &self.sequence())
            .finish()
    }
}

/// Stateless attestation verification using the public key embedded in the
/// attestation itself; any party (or another ISM instance) can run it.
pub fn verify_attestation(
    attestation: &InputAttestation,
    now_ms: i64,
    max_clock_drift_ms: i64,
) -> Result<(), IsmError> {
    if attestation.received_at > now_ms + max_clock_drift_ms {
        return Err(IsmError::Rejected);
    }

    let pubkey_bytes = hex::decode(&attestation.ism_pubkey)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or(IsmError::Rejected)?;
    let verifying = VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| IsmError::Rejected)?;

    let sig_bytes = b64url_decode(&attestation.sig)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
        .ok_or(IsmError::Rejected)?;
    let signature = Signature::from_bytes(&sig_bytes);

    let digest = payload_digest(attestation).map_err(|_| IsmError::Rejected)?;
    verifying
        .verify(&digest, &signature)
        .map_err(|_| IsmError::Rejected)
}

/// The signed digest: sha256 over the JCS bytes of the attestation minus
/// `sig`.
fn payload_digest(attestation: &InputAttestation) -> Result<[u8; 32], vin_core::canonical::CanonicalError> {
    let mut value = serde_json::to_value(attestation)
        .map_err(|err| vin_core::canonical::CanonicalError::Unrepresentable(err.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("sig");
    }
    let bytes = canonical_json_value(&value)?;
    Ok(sha256(&bytes))
}

/// Object inputs are canonicalized; string inputs are used as-is.
fn input_bytes(data: &Value) -> Result<Vec<u8>, vin_core::canonical::CanonicalError> {
    match data {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        other => canonical_json(other),
    }
}

fn verify_source_signature(
    pubkey_hex: &str,
    signature_b64: Option<&str>,
    message: &[u8],
) -> Result<(), ()> {
    let signature_b64 = signature_b64.ok_or(())?;
    let pubkey_bytes = hex::decode(pubkey_hex)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or(())?;
    let verifying = VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| ())?;
    let sig_bytes = b64url_decode(signature_b64)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
        .ok_or(())?;
    verifying
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use serde_json::json;

    fn signing_key() -> SigningKey {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        SigningKey::from_bytes(&seed)
    }

    fn cron_source(id: &str) -> ApprovedSource {
        ApprovedSource {
            id: id.to_string(),
            source_type: SourceType::Cron,
            pubkey: None,
            contract: None,
            chain_id: None,
        }
    }

    fn cron_input(source_id: &str, data: Value) -> RawInput {
        RawInput {
            source_id: source_id.to_string(),
            source_type: SourceType::Cron,
            data,
            source_signature: None,
            block_hash: None,
        }
    }

    #[test]
    fn attest_and_verify_round_trip() {
        let ism = Ism::new("ism-a", signing_key(), vec![cron_source("heartbeat-cron")]);
        let attestation = ism
            .attest(&cron_input("heartbeat-cron", json!({"beat": 1})))
            .unwrap();
        assert_eq!(attestation.schema, ATTESTATION_SCHEMA);
        assert_eq!(attestation.sequence, 1);
        assert_eq!(attestation.input_source, "heartbeat-cron");
        assert!(Ism::verify(&attestation).is_ok());
    }

    #[test]
    fn sequence_strictly_increases_per_instance() {
        let ism = Ism::new("ism-a", signing_key(), vec![cron_source("cron")]);
        let other = Ism::new("ism-b", signing_key(), vec![cron_source("cron")]);

        let a1 = ism.attest(&cron_input("cron", json!({"n": 1}))).unwrap();
        let a2 = ism.attest(&cron_input("cron", json!({"n": 2}))).unwrap();
        let b1 = other.attest(&cron_input("cron", json!({"n": 3}))).unwrap();
        assert_eq!(a1.sequence, 1);
        assert_eq!(a2.sequence, 2);
        assert_eq!(b1.sequence, 1);
    }

    #[test]
    fn duplicate_input_rejected_per_source() {
        let ism = Ism::new(
            "ism-a",
            signing_key(),
            vec![cron_source("cron-1"), cron_source("cron-2")],
        );
        let payload = json!({"tick": 42});
        assert!(ism.attest(&cron_input("cron-1", payload.clone())).is_ok());
        assert_eq!(
            ism.attest(&cron_input("cron-1", payload.clone())),
            Err(IsmError::Rejected)
        );
        // The same payload from a different source is a different input.
        assert!(ism.attest(&cron_input("cron-2", payload)).is_ok());
    }

    #[test]
    fn unknown_source_and_type_mismatch_are_opaque() {
        let ism = Ism::new("ism-a", signing_key(), vec![cron_source("cron")]);

        let err = ism
            .attest(&cron_input("not-approved", json!("x")))
            .unwrap_err();
        assert_eq!(err, IsmError::Rejected);
        assert_eq!(err.to_string(), "Input rejected");
        assert!(!err.to_string().contains("cron"));

        let mut wrong_type = cron_input("cron", json!("x"));
        wrong_type.source_type = SourceType::VrfChallenge;
        assert_eq!(ism.attest(&wrong_type), Err(IsmError::Rejected));
    }

    #[test]
    fn oversized_input_has_distinct_reason() {
        let ism = Ism::new("ism-a", signing_key(), vec![cron_source("cron")])
            .with_max_input_size(8);
        let err = ism
            .attest(&cron_input("cron", json!("0123456789abcdef")))
            .unwrap_err();
        assert_eq!(err.to_string(), "Input too large");
    }

    #[test]
    fn api_signed_source_requires_valid_signature() {
        let source_key = signing_key();
        let source = ApprovedSource {
            id: "feed".to_string(),
            source_type: SourceType::ApiSigned,
            pubkey: Some(hex::encode(source_key.verifying_key().as_bytes())),
            contract: None,
            chain_id: None,
        };
        let ism = Ism::new("ism-a", signing_key(), vec![source]);

        let data = json!({"price": 100});
        let message = canonical_json(&data).unwrap();
        let good_sig = b64url_encode(&source_key.sign(&message).to_bytes());

        let input = RawInput {
            source_id: "feed".to_string(),
            source_type: SourceType::ApiSigned,
            data: data.clone(),
            source_signature: Some(good_sig),
            block_hash: None,
        };
        let attestation = ism.attest(&input).unwrap();
        assert!(Ism::verify(&attestation).is_ok());

        // Signed under the wrong key: rejected.
        let wrong_key = signing_key();
        let bad_sig = b64url_encode(&wrong_key.sign(&message).to_bytes());
        let input = RawInput {
            source_id: "feed".to_string(),
            source_type: SourceType::ApiSigned,
            data: json!({"price": 101}),
            source_signature: Some(bad_sig),
            block_hash: None,
        };
        assert_eq!(ism.attest(&input), Err(IsmError::Rejected));

        // Missing signature: rejected.
        let input = RawInput {
            source_id: "feed".to_string(),
            source_type: SourceType::ApiSigned,
            data: json!({"price": 102}),
            source_signature: None,
            block_hash: None,
        };
        assert_eq!(ism.attest(&input), Err(IsmError::Rejected));
    }

    #[test]
    fn blockchain_event_requires_block_hash() {
        let source = ApprovedSource {
            id: "chain".to_string(),
            source_type: SourceType::BlockchainEvent,
            pubkey: None,
            contract: Some("0xabc".to_string()),
            chain_id: Some(8453),
        };
        let ism = Ism::new("ism-a", signing_key(), vec![source]);

        let mut input = RawInput {
            source_id: "chain".to_string(),
            source_type: SourceType::BlockchainEvent,
            data: json!({"event": "Transfer"}),
            source_signature: None,
            block_hash: None,
        };
        assert_eq!(ism.attest(&input), Err(IsmError::Rejected));

        input.block_hash = Some("0xdeadbeef".to_string());
        let attestation = ism.attest(&input).unwrap();
        assert_eq!(attestation.block_hash.as_deref(), Some("0xdeadbeef"));
    }

    #[test]
    fn cross_instance_verification_and_tamper_detection() {
        // ISM-A attests; anyone verifies using the embedded pubkey.
        let ism_a = Ism::new("ism-a", signing_key(), vec![cron_source("heartbeat-cron")]);
        let attestation = ism_a
            .attest(&cron_input("heartbeat-cron", json!({"beat": 7})))
            .unwrap();
        assert!(Ism::verify(&attestation).is_ok());

        let mut tampered = attestation.clone();
        let mut hash = tampered.input_hash.into_bytes();
        hash[0] = if hash[0] == b'0' { b'1' } else { b'0' };
        tampered.input_hash = String::from_utf8(hash).unwrap();
        assert_eq!(Ism::verify(&tampered), Err(IsmError::Rejected));

        let mut tampered = attestation.clone();
        tampered.sequence += 1;
        assert_eq!(Ism::verify(&tampered), Err(IsmError::Rejected));
    }

    #[test]
    fn future_attestations_rejected_beyond_drift() {
        let ism = Ism::new("ism-a", signing_key(), vec![cron_source("cron")])
            .with_clock(Box::new(|| 10_000_000));
        let attestation = ism.attest(&cron_input("cron", json!("x"))).unwrap();

        assert!(verify_attestation(&attestation, 10_000_000, DEFAULT_MAX_CLOCK_DRIFT_MS).is_ok());
        // Verifier clock far behind the issuer: outside drift.
        assert_eq!(
            verify_attestation(&attestation, 9_000_000, 300_000),
            Err(IsmError::Rejected)
        );
    }

    #[test]
    fn negative_clock_is_a_clock_error() {
        let ism = Ism::new("ism-a", signing_key(), vec![cron_source("cron")])
            .with_clock(Box::new(|| -1));
        assert_eq!(
            ism.attest(&cron_input("cron", json!("x"))),
            Err(IsmError::Clock)
        );
    }

    #[test]
    fn string_data_hashes_as_is() {
        let ism = Ism::new("ism-a", signing_key(), vec![cron_source("cron")]);
        let attestation = ism.attest(&cron_input("cron", json!("raw-text"))).unwrap();
        assert_eq!(
            attestation.input_hash,
            hex::encode(sha256(b"raw-text"))
        );
    }
}
