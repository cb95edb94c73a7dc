//! Thin RPC wrapper over the TEE platform agent.
//!
//! The agent exposes attestation and key derivation over a local HTTP
//! endpoint. Every call has a short deadline and no retry; any failure
//! collapses into the "none" stub so the caller decides whether a missing
//! TEE is fatal.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use std::time::Duration;

use crate::APP_USER_AGENT;

/// Deadline for a single platform-agent RPC.
pub const TEE_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Attestation evidence as reported by the platform agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_pubkey: Option<String>,
}

impl AttestationInfo {
    /// The stub returned when no TEE is reachable.
    pub fn none() -> Self {
        Self {
            kind: "none".to_string(),
            available: false,
            report: None,
            measurement: None,
            signer_pubkey: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum TeeRpcError {
    #[error("no platform agent configured")]
    NotConfigured,

    #[error("platform agent request failed: {0}")]
    Request(String),

    #[error("platform agent returned error: {0}")]
    Rpc(String),
}

#[derive(Clone)]
pub struct TeeAdapter {
    http: reqwest::Client,
    endpoint: Option<String>,
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

impl TeeAdapter {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(2))
                .timeout(TEE_RPC_TIMEOUT)
                .user_agent(APP_USER_AGENT)
                .build()
                .expect("TEE reqwest client should build"),
            endpoint,
        }
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &impl Serialize,
    ) -> Result<T, TeeRpcError> {
        let endpoint = self.endpoint.as_ref().ok_or(TeeRpcError::NotConfigured)?;
        let res = self
            .http
            .post(endpoint)
            .json(&json!({"method": method, "params": params}))
            .send()
            .await
            .map_err(|err| TeeRpcError::Request(err.to_string()))?;
        if !res.status().is_success() {
            return Err(TeeRpcError::Rpc(format!("status {}", res.status().as_u16())));
        }
        let envelope: RpcEnvelope<T> = res
            .json()
            .await
            .map_err(|err| TeeRpcError::Request(err.to_string()))?;
        if let Some(error) = envelope.error {
            return Err(TeeRpcError::Rpc(error));
        }
        envelope
            .result
            .ok_or_else(|| TeeRpcError::Rpc("missing result".to_string()))
    }

    /// Whether a platform agent answers at the configured endpoint.
    pub async fn available(&self) -> bool {
        if self.endpoint.is_none() {
            return false;
        }
        self.rpc::<bool>("available", &json!({})).await.unwrap_or(false)
    }

    /// Derives secret bytes for a label. `None` on any failure.
    pub async fn derive_key(&self, path: &str) -> Option<Vec<u8>> {
        let derived: String = match self.rpc("derive_key", &json!({"path": path})).await {
            Ok(v) => v,
            Err(err) => {
                log::debug!("derive_key({path}) unavailable: {err}");
                return None;
            }
        };
        hex::decode(derived).ok()
    }

    /// Fetches attestation evidence binding `report_data` (and optionally a
    /// public key). Falls back to the "none" stub on any error.
    pub async fn attestation(
        &self,
        report_data: &[u8],
        binding_pubkey: Option<&[u8]>,
    ) -> AttestationInfo {
        let params = json!({
            "report_data": hex::encode(report_data),
            "binding_pubkey": binding_pubkey.map(hex::encode),
        });
        match self.rpc::<AttestationInfo>("attestation", &params).await {
            Ok(info) => info,
            Err(err) => {
                log::debug!("attestation unavailable: {err}");
                AttestationInfo::none()
            }
        }
    }
}
