//! The request admission pipeline.
//!
//! Order is load-bearing: rate limit, payment gate, body parse, envelope
//! nonce replay check, user key parse, envelope open, schema validation,
//! commitment, outbound call, receipt, response sealing. The replay check
//! runs before any side effect so a duplicate nonce never reaches the
//! provider or mints a receipt.

use http::HeaderMap;
use rand::RngCore;
use serde_json::json;
use std::time::Duration;

use vin_core::{
    BoxError,
    cache::TtlCache,
    crypto::{self, EncryptedEnvelope},
    receipt::{ActionOutput, ActionRequest, AttestationRef, PaymentRef, Receipt, ReceiptEngine},
    request::LlmRequest,
};

use crate::{
    config::NodeConfig,
    keys::NodeKeypair,
    outbound::OutboundCaller,
    payment::PaymentGate,
    ratelimit::RateLimiter,
    tee::{AttestationInfo, TeeAdapter},
    types::{
        ApiError, GenerateBody, GenerateResponse, LegacyOutput, ResponsePlaintext, VerifyBody,
        VerifyResponse,
    },
};

pub const POLICY_ID: &str = "P2_CONFIDENTIAL_PROXY_V1";
pub const ACTION_TYPE: &str = "confidential_llm_call";

/// TTL of an envelope nonce in the request-level replay map.
const ENVELOPE_NONCE_TTL: Duration = Duration::from_secs(600);

/// The long-lived node: keys, caches, gates and the receipt engine.
pub struct Node {
    config: NodeConfig,
    keys: NodeKeypair,
    receipts: ReceiptEngine,
    payment: PaymentGate,
    outbound: OutboundCaller,
    limiter: RateLimiter,
    envelope_nonces: TtlCache<String, ()>,
    tee: TeeAdapter,
    attestation: AttestationInfo,
}

impl Node {
    /// Resolves keys and attestation, then assembles the node.
    pub async fn bootstrap(config: NodeConfig) -> Result<Self, BoxError> {
        let tee = TeeAdapter::new(config.platform_agent_url.clone());
        let keys = NodeKeypair::resolve(&tee, config.key_path.as_deref()).await?;
        let attestation = tee
            .attestation(
                &vin_core::canonical::sha256(keys.node_pubkey().as_bytes()),
                Some(keys.encryption_pubkey_hex().as_bytes()),
            )
            .await;
        Ok(Self::assemble(config, keys, tee, attestation))
    }

    /// Pure assembly; used by [`Self::bootstrap`] and tests.
    pub fn assemble(
        config: NodeConfig,
        keys: NodeKeypair,
        tee: TeeAdapter,
        attestation: AttestationInfo,
    ) -> Self {
        let receipts = ReceiptEngine::new(
            keys.signing().clone(),
            config.receipt_validity_seconds,
            config.replay_cache_max,
        );
        let payment = PaymentGate::new(&config);
        let limiter = RateLimiter::new(config.rate_burst, config.rate_per_second);
        let envelope_nonces = TtlCache::new(config.replay_cache_max, ENVELOPE_NONCE_TTL);
        Self {
            config,
            keys,
            receipts,
            payment,
            outbound: OutboundCaller::new(),
            limiter,
            envelope_nonces,
            tee,
            attestation,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_pubkey(&self) -> String {
        self.keys.node_pubkey()
    }

    pub fn encryption_pubkey_hex(&self) -> String {
        self.keys.encryption_pubkey_hex()
    }

    /// Attestation evidence fetched at startup; bound into receipts.
    pub fn attestation(&self) -> &AttestationInfo {
        &self.attestation
    }

    /// Fetches fresh attestation evidence from the platform agent,
    /// report-bound to the current node identity.
    pub async fn fetch_attestation(&self) -> AttestationInfo {
        self.tee
            .attestation(
                &vin_core::canonical::sha256(self.keys.node_pubkey().as_bytes()),
                Some(self.keys.encryption_pubkey_hex().as_bytes()),
            )
            .await
    }

    /// Admission pipeline for `POST /v1/generate`.
    pub async fn handle_generate(
        &self,
        headers: &HeaderMap,
        paid_query: bool,
        body: &[u8],
    ) -> Result<GenerateResponse, ApiError> {
        let client_key = RateLimiter::client_key(headers);
        if !self.limiter.check(&client_key) {
            return Err(ApiError::RateLimited);
        }

        let payment = self
            .payment
            .check(headers, paid_query)
            .map_err(ApiError::PaymentRequired)?;

        let body: GenerateBody = serde_json::from_slice(body)
            .map_err(|_| ApiError::InvalidPayload(Some("body must be a JSON object".to_string())))?;

        match (&body.encrypted_payload, &body.request) {
            (Some(_), _) => self.confidential_flow(body, payment).await,
            (None, Some(_)) if self.config.allow_legacy => self.legacy_flow(body, payment).await,
            (None, Some(_)) => Err(ApiError::LegacyModeDisabled),
            (None, None) => Err(ApiError::InvalidPayload(Some(
                "expected encrypted_payload or request".to_string(),
            ))),
        }
    }

    async fn confidential_flow(
        &self,
        body: GenerateBody,
        payment: PaymentRef,
    ) -> Result<GenerateResponse, ApiError> {
        let (Some(encrypted_payload), Some(ephemeral_pubkey), Some(nonce), Some(user_pubkey)) = (
            body.encrypted_payload,
            body.ephemeral_pubkey,
            body.nonce,
            body.user_pubkey,
        ) else {
            return Err(ApiError::InvalidPayload(Some(
                "confidential body requires encrypted_payload, ephemeral_pubkey, nonce, user_pubkey"
                    .to_string(),
            )));
        };

        // Replay check before any side effect.
        let nonce_key = nonce.to_ascii_lowercase();
        if !self.envelope_nonces.insert_if_absent(nonce_key, ()) {
            return Err(ApiError::ReplayDetected);
        }

        let user_key =
            crypto::parse_public_hex(&user_pubkey).map_err(|_| ApiError::InvalidPayload(None))?;

        let envelope = EncryptedEnvelope {
            ciphertext: encrypted_payload,
            ephemeral_pubkey,
            nonce: nonce.clone(),
        };
        let plaintext = crypto::open(self.keys.encryption(), &envelope).map_err(|err| {
            log::debug!("envelope open failed: {err}");
            ApiError::InvalidPayload(None)
        })?;

        let request: LlmRequest = serde_json::from_slice(&plaintext).map_err(|_| {
            ApiError::InvalidPayload(Some("decrypted payload is not a valid request".to_string()))
        })?;
        request
            .validate()
            .map_err(|err| ApiError::InvalidPayload(Some(err.to_string())))?;

        let (output, receipt) = self.run_inference(&request, payment).await?;

        let plaintext = ResponsePlaintext {
            text: output.text,
            usage: output.usage,
            request_nonce: nonce,
        };
        let plaintext =
            serde_json::to_vec(&plaintext).map_err(|_| ApiError::GenerationFailed)?;
        let sealed = crypto::seal(&user_key, &plaintext).map_err(|err| {
            log::error!("response sealing failed: {err}");
            ApiError::GenerationFailed
        })?;

        Ok(GenerateResponse::Confidential {
            encrypted_response: sealed.ciphertext,
            response_ephemeral_pubkey: sealed.ephemeral_pubkey,
            response_nonce: sealed.nonce,
            receipt,
        })
    }

    async fn legacy_flow(
        &self,
        body: GenerateBody,
        payment: PaymentRef,
    ) -> Result<GenerateResponse, ApiError> {
        let request = body.request.expect("caller checked presence");
        request
            .validate()
            .map_err(|err| ApiError::InvalidPayload(Some(err.to_string())))?;

        let (output, receipt) = self.run_inference(&request, payment).await?;
        Ok(GenerateResponse::Legacy {
            output: LegacyOutput {
                text: output.text,
                usage: output.usage,
            },
            receipt,
        })
    }

    /// Commitment, outbound call and receipt; shared by both branches.
    async fn run_inference(
        &self,
        request: &LlmRequest,
        payment: PaymentRef,
    ) -> Result<(crate::outbound::ProviderOutput, Receipt), ApiError> {
        let commitment = request.inputs_commitment().map_err(|err| {
            log::error!("inputs commitment failed: {err}");
            ApiError::GenerationFailed
        })?;

        let output = self.outbound.call(request).await?;

        let action_request = ActionRequest {
            request_id: fresh_request_id(),
            action_type: ACTION_TYPE.to_string(),
            policy_id: POLICY_ID.to_string(),
            prompt: format!("[commitment:{commitment}]"),
            inputs: request.commitment_subset(),
            constraints: None,
            llm: None,
        };
        let action_output = ActionOutput {
            text: output.text.clone(),
            clean_text: output.text.clone(),
        };

        let attestation = AttestationRef {
            kind: self.attestation.kind.clone(),
            report_hash: self
                .attestation
                .report
                .as_deref()
                .map(vin_core::canonical::hash_text),
            measurement: self.attestation.measurement.clone(),
        };
        let receipt = self
            .receipts
            .build(&action_request, &action_output, attestation, payment)
            .map_err(|err| {
                log::error!("receipt build failed: {err}");
                ApiError::GenerationFailed
            })?;

        log::info!(
            request_id = receipt.request_id.as_str(),
            model = request.model.as_str(),
            inputs_commitment = commitment.as_str();
            "inference receipt issued",
        );
        Ok((output, receipt))
    }

    /// Handler for `POST /v1/verify`.
    pub fn handle_verify(&self, body: &VerifyBody) -> VerifyResponse {
        match self
            .receipts
            .verify(&body.request, &body.output, &body.receipt)
        {
            Ok(()) => VerifyResponse {
                valid: true,
                reason: None,
            },
            Err(err) => VerifyResponse {
                valid: false,
                reason: Some(err.as_str()),
            },
        }
    }

    /// Policies this node serves.
    pub fn policies(&self) -> serde_json::Value {
        json!({
            "policies": [{"policy_id": POLICY_ID, "action_type": ACTION_TYPE}]
        })
    }
}

fn fresh_request_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
