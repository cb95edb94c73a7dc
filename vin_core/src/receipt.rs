//! Receipt construction and verification.
//!
//! A receipt binds a commitment over the action request to hashes of the
//! produced text, signed with the node's Ed25519 key over the JCS encoding
//! of the payload (every field except `sig`). Verification is stateful only
//! for replay defense: a `(node_pubkey, nonce)` pair is recorded on first
//! verify and rejected while the receipt is still within its validity
//! window.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

use crate::{
    cache::TtlCache,
    canonical::{b64url_decode, b64url_encode, canonical_json_value, hash_json, hash_text},
    unix_now,
};

pub const RECEIPT_SCHEMA: &str = "vin.receipt.v0";
pub const RECEIPT_VERSION: &str = "0.1";

/// Default receipt validity window, seconds.
pub const DEFAULT_VALIDITY_SECS: u64 = 600;

/// Default capacity of the replay cache.
pub const DEFAULT_REPLAY_CAPACITY: u64 = 10_000;

/// Tolerated clock skew when checking `iat`, seconds.
pub const ISSUE_SKEW_SECS: u64 = 60;

const NONCE_BYTES: usize = 16;

/// The `attestation` sub-object of a receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<String>,
}

impl Default for AttestationRef {
    fn default() -> Self {
        Self {
            kind: "none".to_string(),
            report_hash: None,
            measurement: None,
        }
    }
}

/// The `payment` sub-object of a receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_commitment: Option<String>,
}

impl Default for PaymentRef {
    fn default() -> Self {
        Self {
            kind: "none".to_string(),
            payment_ref: None,
            payment_commitment: None,
        }
    }
}

/// A signed receipt. All `*_commitment` / `*_hash` fields are lowercase hex
/// SHA-256; `node_pubkey`, `nonce` and `sig` are base64url without padding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Receipt {
    pub schema: String,
    pub version: String,
    pub node_pubkey: String,
    pub request_id: String,
    pub action_type: String,
    pub policy_id: String,
    pub inputs_commitment: String,
    pub constraints_commitment: String,
    pub llm_commitment: String,
    pub output_clean_hash: String,
    pub output_transport_hash: String,
    pub iat: u64,
    pub exp: u64,
    pub nonce: String,
    pub attestation: AttestationRef,
    pub payment: PaymentRef,
    pub sig: String,
}

/// The request side of a receipt: what was asked, in committed form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRequest {
    pub request_id: String,
    pub action_type: String,
    pub policy_id: String,
    /// Human-readable summary. Not committed; for the confidential flow it
    /// carries `[commitment:<hex>]` so no plaintext leaves the enclave.
    #[serde(default)]
    pub prompt: String,
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<Value>,
}

/// The output side of a receipt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionOutput {
    /// Text as transported to the client.
    pub text: String,
    /// Text after any transport decoration is stripped. Equal to `text`
    /// for the proxy flow.
    pub clean_text: String,
}

/// Why a receipt failed verification. `as_str` yields the wire reason;
/// the order of checks in [`ReceiptEngine::verify`] decides which one a
/// given receipt reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid_schema")]
    InvalidSchema,

    #[error("issued_in_future")]
    IssuedInFuture,

    #[error("expired")]
    Expired,

    #[error("replay_detected")]
    ReplayDetected,

    #[error("inputs_commitment_mismatch")]
    InputsCommitmentMismatch,

    #[error("constraints_commitment_mismatch")]
    ConstraintsCommitmentMismatch,

    #[error("llm_commitment_mismatch")]
    LlmCommitmentMismatch,

    #[error("output_clean_hash_mismatch")]
    OutputCleanHashMismatch,

    #[error("output_transport_hash_mismatch")]
    OutputTransportHashMismatch,

    #[error("signature_invalid")]
    SignatureInvalid,
}

impl VerifyError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSchema => "invalid_schema",
            Self::IssuedInFuture => "issued_in_future",
            Self::Expired => "expired",
            Self::ReplayDetected => "replay_detected",
            Self::InputsCommitmentMismatch => "inputs_commitment_mismatch",
            Self::ConstraintsCommitmentMismatch => "constraints_commitment_mismatch",
            Self::LlmCommitmentMismatch => "llm_commitment_mismatch",
            Self::OutputCleanHashMismatch => "output_clean_hash_mismatch",
            Self::OutputTransportHashMismatch => "output_transport_hash_mismatch",
            Self::SignatureInvalid => "signature_invalid",
        }
    }
}

/// Builds and verifies receipts; owns the replay cache.
pub struct ReceiptEngine {
    signing: SigningKey,
    node_pubkey: String,
    validity: Duration,
    replay: TtlCache<String, u64>,
    now: fn() -> u64,
}

impl ReceiptEngine {
    pub fn new(signing: SigningKey, validity_secs: u64, replay_capacity: u64) -> Self {
        let node_pubkey = b64url_encode(signing.verifying_key().as_bytes());
        Self {
            signing,
            node_pubkey,
            validity: Duration::from_secs(validity_secs),
            replay: TtlCache::new(replay_capacity, Duration::from_secs(validity_secs)),
            now: unix_now,
        }
    }

    /// Replaces the clock. Test hook.
    #[cfg(test)]
    fn with_clock(mut self, now: fn() -> u64) -> Self {
        self.now = now;
        self
    }

    /// Base64url Ed25519 public key receipts are issued under.
    pub fn node_pubkey(&self) -> &str {
        &self.node_pubkey
    }

    /// Builds and signs a receipt over `(request, output)`.
    pub fn build(
        &self,
        request: &ActionRequest,
        output: &ActionOutput,
        attestation: AttestationRef,
        payment: PaymentRef,
    ) -> Result<Receipt, crate::canonical::CanonicalError> {
        let iat = (self.now)();
        let mut nonce = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce);

        let mut receipt = Receipt {
            schema: RECEIPT_SCHEMA.to_string(),
            version: RECEIPT_VERSION.to_string(),
            node_pubkey: self.node_pubkey.clone(),
            request_id: request.request_id.clone(),
            action_type: request.action_type.clone(),
            policy_id: request.policy_id.clone(),
            inputs_commitment: hash_json(&request.inputs)?,
            constraints_commitment: hash_json(&request.constraints.clone().unwrap_or(json!({})))?,
            llm_commitment: hash_json(&request.llm.clone().unwrap_or(json!({})))?,
            output_clean_hash: hash_text(&output.clean_text),
            output_transport_hash: hash_text(&output.text),
            iat,
            exp: iat + self.validity.as_secs(),
            nonce: b64url_encode(&nonce),
            attestation,
            payment,
            sig: String::new(),
        };

        let payload = signing_payload(&receipt)?;
        let sig = self.signing.sign(&payload);
        receipt.sig = b64url_encode(&sig.to_bytes());
        Ok(receipt)
    }

    /// Verifies a receipt against the request and output it claims to bind.
    ///
    /// Checks run in protocol order and the first failure wins. The replay
    /// record is written at step 3, before the commitment checks, so a
    /// receipt presented twice reports `replay_detected` even if an earlier
    /// presentation failed later checks.
    pub fn verify(
        &self,
        request: &ActionRequest,
        output: &ActionOutput,
        receipt: &Receipt,
    ) -> Result<(), VerifyError> {
        if receipt.schema != RECEIPT_SCHEMA {
            return Err(VerifyError::InvalidSchema);
        }

        let now = (self.now)();
        if receipt.iat > now + ISSUE_SKEW_SECS {
            return Err(VerifyError::IssuedInFuture);
        }
        if receipt.exp < now {
            return Err(VerifyError::Expired);
        }

        let replay_key = format!("{}:{}", receipt.node_pubkey, receipt.nonce);
        let ttl = Duration::from_secs(receipt.exp.saturating_sub(now).max(1));
        if !self
            .replay
            .insert_if_absent_with_ttl(replay_key, receipt.exp, ttl)
        {
            return Err(VerifyError::ReplayDetected);
        }
        self.replay.sweep();

        let inputs = hash_json(&request.inputs).map_err(|_| VerifyError::InputsCommitmentMismatch)?;
        if inputs != receipt.inputs_commitment {
            return Err(VerifyError::InputsCommitmentMismatch);
        }
        let constraints = hash_json(&request.constraints.clone().unwrap_or(json!({})))
            .map_err(|_| VerifyError::ConstraintsCommitmentMismatch)?;
        if constraints != receipt.constraints_commitment {
            return Err(VerifyError::ConstraintsCommitmentMismatch);
        }
        let llm = hash_json(&request.llm.clone().unwrap_or(json!({})))
            .map_err(|_| VerifyError::LlmCommitmentMismatch)?;
        if llm != receipt.llm_commitment {
            return Err(VerifyError::LlmCommitmentMismatch);
        }

        if hash_text(&output.clean_text) != receipt.output_clean_hash {
            return Err(VerifyError::OutputCleanHashMismatch);
        }
        if hash_text(&output.text) != receipt.output_transport_hash {
            return Err(VerifyError::OutputTransportHashMismatch);
        }

        verify_signature(receipt)
    }
}

impl std::fmt::Debug for ReceiptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptEngine")
            .field("node_pubkey", &self.node_pubkey)
            .field("validity", &self.validity)
            .finish()
    }
}

/// JCS bytes of the receipt with `sig` removed; this is what the node
/// signs and what any verifier must reproduce.
fn signing_payload(receipt: &Receipt) -> Result<Vec<u8>, crate::canonical::CanonicalError> {
    let mut value = serde_json::to_value(receipt)
        .map_err(|err| crate::canonical::CanonicalError::Unrepresentable(err.to_string()))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("sig");
    }
    canonical_json_value(&value)
}

/// Stateless signature check with the `node_pubkey` carried in the receipt.
fn verify_signature(receipt: &Receipt) -> Result<(), VerifyError> {
    let pubkey_bytes = b64url_decode(&receipt.node_pubkey)
        .ok()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or(VerifyError::SignatureInvalid)?;
    let verifying = VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| VerifyError::SignatureInvalid)?;

    let sig_bytes = b64url_decode(&receipt.sig)
        .ok()
        .and_then(|b| <[u8; 64]>::try_from(b).ok())
        .ok_or(VerifyError::SignatureInvalid)?;
    let signature = Signature::from_bytes(&sig_bytes);

    let payload = signing_payload(receipt).map_err(|_| VerifyError::SignatureInvalid)?;
    verifying
        .verify(&payload, &signature)
        .map_err(|_| VerifyError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn signing_key() -> SigningKey {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        SigningKey::from_bytes(&seed)
    }

    fn engine() -> ReceiptEngine {
        ReceiptEngine::new(signing_key(), DEFAULT_VALIDITY_SECS, 64)
    }

    fn request() -> ActionRequest {
        ActionRequest {
            request_id: "req-1".to_string(),
            action_type: "confidential_llm_call".to_string(),
            policy_id: "P2_CONFIDENTIAL_PROXY_V1".to_string(),
            prompt: "[commitment:abc]".to_string(),
            inputs: json!({"provider_url": "https://api.openai.com/v1/chat/completions",
                           "model": "gpt-4o-mini",
                           "messages": [{"role": "user", "content": "hi"}]}),
            constraints: None,
            llm: None,
        }
    }

    fn output() -> ActionOutput {
        ActionOutput {
            text: "hello".to_string(),
            clean_text: "hello".to_string(),
        }
    }

    #[test]
    fn build_then_verify_succeeds() {
        let engine = engine();
        let receipt = engine
            .build(
                &request(),
                &output(),
                AttestationRef::default(),
                PaymentRef::default(),
            )
            .unwrap();
        assert_eq!(receipt.schema, RECEIPT_SCHEMA);
        assert!(receipt.iat <= receipt.exp);
        assert!(engine.verify(&request(), &output(), &receipt).is_ok());
    }

    #[test]
    fn second_verify_is_replay() {
        let engine = engine();
        let receipt = engine
            .build(
                &request(),
                &output(),
                AttestationRef::default(),
                PaymentRef::default(),
            )
            .unwrap();
        assert!(engine.verify(&request(), &output(), &receipt).is_ok());
        assert_eq!(
            engine.verify(&request(), &output(), &receipt),
            Err(VerifyError::ReplayDetected)
        );
    }

    #[test]
    fn mutations_fail_with_matching_reason() {
        let engine = engine();
        let build = || {
            engine
                .build(
                    &request(),
                    &output(),
                    AttestationRef::default(),
                    PaymentRef::default(),
                )
                .unwrap()
        };

        let receipt = build();
        let mut out = output();
        out.clean_text.push('!');
        assert_eq!(
            engine.verify(&request(), &out, &receipt),
            Err(VerifyError::OutputCleanHashMismatch)
        );

        let receipt = build();
        let mut out = output();
        out.text.push('!');
        assert_eq!(
            engine.verify(&request(), &out, &receipt),
            Err(VerifyError::OutputTransportHashMismatch)
        );

        let receipt = build();
        let mut req = request();
        req.inputs = json!({"model": "tampered"});
        assert_eq!(
            engine.verify(&req, &output(), &receipt),
            Err(VerifyError::InputsCommitmentMismatch)
        );

        let mut receipt = build();
        let mut sig = b64url_decode(&receipt.sig).unwrap();
        sig[0] ^= 0x01;
        receipt.sig = b64url_encode(&sig);
        assert_eq!(
            engine.verify(&request(), &output(), &receipt),
            Err(VerifyError::SignatureInvalid)
        );
    }

    #[test]
    fn wrong_schema_rejected_first() {
        let engine = engine();
        let mut receipt = engine
            .build(
                &request(),
                &output(),
                AttestationRef::default(),
                PaymentRef::default(),
            )
            .unwrap();
        receipt.schema = "vin.receipt.v1".to_string();
        assert_eq!(
            engine.verify(&request(), &output(), &receipt),
            Err(VerifyError::InvalidSchema)
        );
    }

    #[test]
    fn expired_and_future_receipts_rejected() {
        fn past() -> u64 {
            1_000_000
        }
        fn present() -> u64 {
            1_000_000 + 7_200
        }

        let key = signing_key();
        let issued = ReceiptEngine::new(key.clone(), 600, 64)
            .with_clock(past)
            .build(
                &request(),
                &output(),
                AttestationRef::default(),
                PaymentRef::default(),
            )
            .unwrap();
        let verifier = ReceiptEngine::new(key.clone(), 600, 64).with_clock(present);
        assert_eq!(
            verifier.verify(&request(), &output(), &issued),
            Err(VerifyError::Expired)
        );

        let issued = ReceiptEngine::new(key.clone(), 600, 64)
            .with_clock(present)
            .build(
                &request(),
                &output(),
                AttestationRef::default(),
                PaymentRef::default(),
            )
            .unwrap();
        let verifier = ReceiptEngine::new(key, 600, 64).with_clock(past);
        assert_eq!(
            verifier.verify(&request(), &output(), &issued),
            Err(VerifyError::IssuedInFuture)
        );
    }

    #[test]
    fn payment_and_attestation_are_signed() {
        let engine = engine();
        let payment = PaymentRef {
            kind: "x402-v2".to_string(),
            payment_ref: None,
            payment_commitment: Some(hash_text("evidence")),
        };
        let receipt = engine
            .build(&request(), &output(), AttestationRef::default(), payment)
            .unwrap();
        assert_eq!(receipt.payment.kind, "x402-v2");
        assert!(engine.verify(&request(), &output(), &receipt).is_ok());

        // The sub-objects are part of the signed payload.
        let mut tampered = engine
            .build(
                &request(),
                &output(),
                AttestationRef::default(),
                PaymentRef::default(),
            )
            .unwrap();
        tampered.payment.kind = "x402-v2".to_string();
        assert_eq!(
            engine.verify(&request(), &output(), &tampered),
            Err(VerifyError::SignatureInvalid)
        );
    }

    #[test]
    fn cross_engine_verification() {
        // Receipts are self-describing: a different engine (different node
        // key) still verifies via the embedded node_pubkey.
        let issuer = engine();
        let verifier = engine();
        let receipt = issuer
            .build(
                &request(),
                &output(),
                AttestationRef::default(),
                PaymentRef::default(),
            )
            .unwrap();
        assert!(verifier.verify(&request(), &output(), &receipt).is_ok());
    }
}
