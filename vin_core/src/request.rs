//! The decrypted inference request and its validation rules.
//!
//! The API key never appears in logs, error payloads or commitments: the
//! inputs commitment is computed over `{provider_url, model, messages}`
//! only, so a third party can reproduce it without the secret, and the
//! `Debug` impl redacts the key.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use url::Url;

use crate::canonical::{CanonicalError, hash_json};

/// Maximum number of chat messages accepted per request.
pub const MAX_MESSAGES: usize = 100;

/// Maximum size of a single message content, in bytes.
pub const MAX_CONTENT_BYTES: usize = 1_048_576;

/// Upper bound on the `max_tokens` knob.
pub const MAX_MAX_TOKENS: u64 = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// A decrypted inference request.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmRequest {
    /// HTTPS URL of the third-party provider endpoint.
    pub provider_url: String,
    /// Provider API key. Redacted everywhere; excluded from commitments.
    pub api_key: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Extra headers forwarded to the provider (auth headers are stripped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

impl std::fmt::Debug for LlmRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmRequest")
            .field("provider_url", &self.provider_url)
            .field("api_key", &"[redacted]")
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Validation failures. `Display` output names the offending field only and
/// is safe to reflect to clients.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("provider_url must be a valid https URL")]
    InvalidProviderUrl,

    #[error("api_key must be non-empty")]
    EmptyApiKey,

    #[error("model must be non-empty")]
    EmptyModel,

    #[error("messages must contain between 1 and {MAX_MESSAGES} entries")]
    BadMessageCount,

    #[error("messages[{0}].content exceeds {MAX_CONTENT_BYTES} bytes")]
    ContentTooLarge(usize),

    #[error("max_tokens must be a positive integer <= {MAX_MAX_TOKENS}")]
    InvalidMaxTokens,

    #[error("temperature must be within [0, 2]")]
    InvalidTemperature,
}

impl LlmRequest {
    /// Strict validation per the protocol schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let url = Url::parse(&self.provider_url).map_err(|_| ValidationError::InvalidProviderUrl)?;
        if url.scheme() != "https" {
            return Err(ValidationError::InvalidProviderUrl);
        }
        if self.api_key.is_empty() {
            return Err(ValidationError::EmptyApiKey);
        }
        if self.model.is_empty() {
            return Err(ValidationError::EmptyModel);
        }
        if self.messages.is_empty() || self.messages.len() > MAX_MESSAGES {
            return Err(ValidationError::BadMessageCount);
        }
        for (i, msg) in self.messages.iter().enumerate() {
            if msg.content.len() > MAX_CONTENT_BYTES {
                return Err(ValidationError::ContentTooLarge(i));
            }
        }
        if let Some(max_tokens) = self.max_tokens {
            if max_tokens == 0 || max_tokens > MAX_MAX_TOKENS {
                return Err(ValidationError::InvalidMaxTokens);
            }
        }
        if let Some(t) = self.temperature {
            if !t.is_finite() || !(0.0..=2.0).contains(&t) {
                return Err(ValidationError::InvalidTemperature);
            }
        }
        Ok(())
    }

    /// The reproducible commitment over `{provider_url, model, messages}`.
    /// The API key is deliberately excluded.
    pub fn inputs_commitment(&self) -> Result<String, CanonicalError> {
        hash_json(&self.commitment_subset())
    }

    /// The committed subset as a JSON value, usable as a receipt's
    /// action-request inputs.
    pub fn commitment_subset(&self) -> serde_json::Value {
        json!({
            "provider_url": self.provider_url,
            "model": self.model,
            "messages": self.messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LlmRequest {
        LlmRequest {
            provider_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_key: "sk-secret".to_string(),
            model: "claude-3-haiku-20240307".to_string(),
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hi".to_string(),
            }],
            max_tokens: None,
            temperature: None,
            headers: None,
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn rejects_bad_fields() {
        let mut r = request();
        r.provider_url = "http://api.anthropic.com/v1/messages".to_string();
        assert!(matches!(
            r.validate(),
            Err(ValidationError::InvalidProviderUrl)
        ));

        let mut r = request();
        r.api_key = String::new();
        assert!(matches!(r.validate(), Err(ValidationError::EmptyApiKey)));

        let mut r = request();
        r.messages.clear();
        assert!(matches!(r.validate(), Err(ValidationError::BadMessageCount)));

        let mut r = request();
        r.max_tokens = Some(0);
        assert!(matches!(r.validate(), Err(ValidationError::InvalidMaxTokens)));

        let mut r = request();
        r.temperature = Some(2.5);
        assert!(matches!(
            r.validate(),
            Err(ValidationError::InvalidTemperature)
        ));
    }

    #[test]
    fn commitment_excludes_api_key() {
        let mut r = request();
        let commitment = r.inputs_commitment().unwrap();
        r.api_key = "different".to_string();
        assert_eq!(r.inputs_commitment().unwrap(), commitment);

        r.model = "other-model".to_string();
        assert_ne!(r.inputs_commitment().unwrap(), commitment);
    }

    #[test]
    fn strict_schema_rejects_unknown_fields() {
        let parsed: Result<LlmRequest, _> = serde_json::from_str(
            r#"{"provider_url":"https://api.openai.com/v1/chat/completions",
                "api_key":"k","model":"m","messages":[{"role":"user","content":"x"}],
                "unexpected":true}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let formatted = format!("{:?}", request());
        assert!(!formatted.contains("sk-secret"));
        assert!(formatted.contains("[redacted]"));
    }
}
