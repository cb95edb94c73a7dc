//! Wire types for the HTTP surface and the client-facing error taxonomy.

use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use vin_core::{
    receipt::{ActionOutput, ActionRequest, Receipt},
    request::LlmRequest,
};

use crate::{
    outbound::{OutboundError, ProviderUsage},
    payment::{PAYMENT_REQUIRED_HEADER, PaymentChallenge},
};

/// Body of `POST /v1/generate`. Either the confidential envelope fields or
/// (when the legacy flag is enabled) a plaintext request.
#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub encrypted_payload: Option<String>,
    #[serde(default)]
    pub ephemeral_pubkey: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub user_pubkey: Option<String>,
    #[serde(default)]
    pub request: Option<LlmRequest>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateQuery {
    #[serde(default)]
    pub paid: Option<String>,
}

/// Plaintext sealed back to the user. `request_nonce` re-emits the
/// envelope nonce so the client can bind the response to its request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponsePlaintext {
    pub text: String,
    pub usage: ProviderUsage,
    pub request_nonce: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerateResponse {
    Confidential {
        encrypted_response: String,
        response_ephemeral_pubkey: String,
        response_nonce: String,
        receipt: Receipt,
    },
    Legacy {
        output: LegacyOutput,
        receipt: Receipt,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LegacyOutput {
    pub text: String,
    pub usage: ProviderUsage,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
    pub request: ActionRequest,
    pub output: ActionOutput,
    pub receipt: Receipt,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
}

/// Client-facing failures of the admission pipeline. Cryptographic failure
/// modes all collapse into `invalid_payload`; whatever detail is carried
/// never includes key material or request plaintext.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("rate_limited")]
    RateLimited,

    #[error("payment_required")]
    PaymentRequired(Box<PaymentChallenge>),

    #[error("invalid_payload")]
    InvalidPayload(Option<String>),

    #[error("replay_detected")]
    ReplayDetected,

    #[error("legacy_mode_disabled")]
    LegacyModeDisabled,

    #[error("upstream_error")]
    UpstreamError(u16),

    #[error("upstream_timeout")]
    UpstreamTimeout,

    #[error("generation_failed")]
    GenerationFailed,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::PaymentRequired(_) => "payment_required",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::ReplayDetected => "replay_detected",
            Self::LegacyModeDisabled => "legacy_mode_disabled",
            Self::UpstreamError(_) => "upstream_error",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::GenerationFailed => "generation_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::InvalidPayload(_) | Self::ReplayDetected => StatusCode::BAD_REQUEST,
            Self::LegacyModeDisabled => StatusCode::FORBIDDEN,
            Self::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::GenerationFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<OutboundError> for ApiError {
    fn from(err: OutboundError) -> Self {
        match err {
            OutboundError::Rejected(reason) => {
                log::info!("provider URL rejected pre-connect: {reason}");
                Self::InvalidPayload(None)
            }
            OutboundError::UpstreamStatus(status) => Self::UpstreamError(status),
            OutboundError::Timeout => Self::UpstreamTimeout,
            OutboundError::Transport(detail) | OutboundError::Malformed(detail) => {
                log::error!("provider call failed: {detail}");
                Self::GenerationFailed
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::PaymentRequired(challenge) => {
                let header = challenge.header_value();
                let mut response = (status, Json(*challenge)).into_response();
                if let Ok(value) = HeaderValue::from_str(&header) {
                    response.headers_mut().insert(PAYMENT_REQUIRED_HEADER, value);
                }
                response
            }
            Self::RateLimited => {
                let body = ErrorBody {
                    error: "rate_limited",
                    detail: None,
                    status: None,
                };
                let mut response = (status, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert("retry-after", HeaderValue::from_static("1"));
                response
            }
            Self::InvalidPayload(detail) => {
                let body = ErrorBody {
                    error: "invalid_payload",
                    detail: detail.as_deref(),
                    status: None,
                };
                (status, Json(body)).into_response()
            }
            Self::UpstreamError(code) => {
                let body = ErrorBody {
                    error: "upstream_error",
                    detail: None,
                    status: Some(code),
                };
                (status, Json(body)).into_response()
            }
            other => {
                let body = ErrorBody {
                    error: other.kind(),
                    detail: None,
                    status: None,
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_and_statuses() {
        assert_eq!(ApiError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::InvalidPayload(None).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::ReplayDetected.kind(), "replay_detected");
        assert_eq!(
            ApiError::UpstreamError(503).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::UpstreamTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn outbound_errors_map_to_kinds() {
        assert_eq!(
            ApiError::from(OutboundError::Rejected("host not in allowlist")).kind(),
            "invalid_payload"
        );
        assert!(matches!(
            ApiError::from(OutboundError::UpstreamStatus(503)),
            ApiError::UpstreamError(503)
        ));
        assert!(matches!(
            ApiError::from(OutboundError::Timeout),
            ApiError::UpstreamTimeout
        ));
        assert!(matches!(
            ApiError::from(OutboundError::Transport("reset".to_string())),
            ApiError::GenerationFailed
        ));
    }

    #[test]
    fn generate_body_accepts_both_shapes() {
        let confidential: GenerateBody = serde_json::from_str(
            r#"{"encrypted_payload":"YWJj","ephemeral_pubkey":"02ab","nonce":"00ff","user_pubkey":"02cd"}"#,
        )
        .unwrap();
        assert!(confidential.encrypted_payload.is_some());
        assert!(confidential.request.is_none());

        let legacy: GenerateBody = serde_json::from_str(
            r#"{"request":{"provider_url":"https://api.openai.com/v1/chat/completions",
                "api_key":"k","model":"m","messages":[{"role":"user","content":"x"}]}}"#,
        )
        .unwrap();
        assert!(legacy.request.is_some());
    }
}
