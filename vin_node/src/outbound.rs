//! SSRF-safe outbound calls to LLM providers.
//!
//! Every provider URL is vetted before a connection is attempted: https
//! only, host on a compile-time allowlist, resolved address outside the
//! blocked ranges (private, loopback, link-local, CGNAT, metadata;
//! IPv4-mapped IPv6 is unwrapped and re-checked). The resolved address is
//! pinned for 60 s and the connection is forced onto the pinned address,
//! closing the DNS-rebinding window between check and connect.
//!
//! The provider wire shape is selected by host substring: `anthropic.com`
//! speaks the Messages API, everything else the OpenAI-compatible chat
//! completions shape. Both are mapped to a common output.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use url::Url;

use vin_core::{
    cache::TtlCache,
    request::{LlmRequest, Role},
};

use crate::APP_USER_AGENT;

/// Hosts the node will speak to. Mutable only by source change.
pub const PROVIDER_ALLOWLIST: [&str; 9] = [
    "api.openai.com",
    "api.anthropic.com",
    "api.together.xyz",
    "api.groq.com",
    "generativelanguage.googleapis.com",
    "api.mistral.ai",
    "api.perplexity.ai",
    "api.deepseek.com",
    "openrouter.ai",
];

const DNS_PIN_TTL: Duration = Duration::from_secs(60);
const DNS_PIN_CAPACITY: u64 = 256;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);
const PROVIDER_DEADLINE: Duration = Duration::from_secs(120);
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_ANTHROPIC_MAX_TOKENS: u64 = 1024;

/// Headers the caller controls; client-supplied extras with these names
/// are dropped before forwarding.
const RESERVED_HEADERS: [&str; 7] = [
    "authorization",
    "x-api-key",
    "host",
    "content-length",
    "content-type",
    "connection",
    "transfer-encoding",
];

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    /// URL failed pre-connect vetting. The reason stays internal.
    #[error("provider URL rejected: {0}")]
    Rejected(&'static str),

    #[error("upstream responded with status {0}")]
    UpstreamStatus(u16),

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream response malformed: {0}")]
    Malformed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAiCompatible,
}

impl ProviderKind {
    /// Selected by host substring; unknown providers get the
    /// OpenAI-compatible shape.
    pub fn detect(host: &str) -> Self {
        if host.contains("anthropic.com") {
            Self::Anthropic
        } else {
            Self::OpenAiCompatible
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Provider response mapped to a common shape.
#[derive(Clone, Debug)]
pub struct ProviderOutput {
    pub text: String,
    pub model: String,
    pub usage: ProviderUsage,
}

pub struct OutboundCaller {
    pins: TtlCache<String, IpAddr>,
}

impl OutboundCaller {
    pub fn new() -> Self {
        Self {
            pins: TtlCache::new(DNS_PIN_CAPACITY, DNS_PIN_TTL),
        }
    }

    /// Vets the URL, resolves and pins the host, then issues the provider
    /// request under the overall deadline.
    pub async fn call(&self, request: &LlmRequest) -> Result<ProviderOutput, OutboundError> {
        let (url, host) = validate_provider_url(&request.provider_url)?;
        let addr = self.resolve_pinned(&host).await?;
        let port = url.port().unwrap_or(443);

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .https_only(true)
            .resolve(&host, SocketAddr::new(addr, port))
            .connect_timeout(Duration::from_secs(10))
            .timeout(PROVIDER_DEADLINE)
            .user_agent(APP_USER_AGENT)
            .build()
            .map_err(|err| OutboundError::Transport(err.to_string()))?;

        let kind = ProviderKind::detect(&host);
        let mut builder = client.post(url.clone()).json(&provider_body(kind, request));
        builder = match kind {
            ProviderKind::Anthropic => builder
                .header("x-api-key", &request.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            ProviderKind::OpenAiCompatible => builder.bearer_auth(&request.api_key),
        };
        if let Some(extra) = &request.headers {
            for (name, value) in extra {
                if !RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                    builder = builder.header(name, value);
                }
            }
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                OutboundError::Timeout
            } else {
                OutboundError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OutboundError::UpstreamStatus(status.as_u16()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| OutboundError::Malformed(err.to_string()))?;
        parse_provider_response(kind, body)
    }

    async fn resolve_pinned(&self, host: &str) -> Result<IpAddr, OutboundError> {
        if let Some(pinned) = self.pins.get(&host.to_string()) {
            return Ok(pinned);
        }

        let addrs = tokio::time::timeout(DNS_TIMEOUT, tokio::net::lookup_host((host, 443)))
            .await
            .map_err(|_| OutboundError::Rejected("DNS resolution timed out"))?
            .map_err(|_| OutboundError::Rejected("DNS resolution failed"))?;
        let addr = addrs
            .map(|sa| sa.ip())
            .next()
            .ok_or(OutboundError::Rejected("DNS returned no addresses"))?;
        if is_blocked_ip(addr) {
            return Err(OutboundError::Rejected("resolved address in blocked range"));
        }

        self.pins.insert(host.to_string(), addr);
        Ok(addr)
    }

    #[cfg(test)]
    fn pin(&self, host: &str, addr: IpAddr) {
        self.pins.insert(host.to_string(), addr);
    }
}

impl Default for OutboundCaller {
    fn default() -> Self {
        Self::new()
    }
}

/// Pre-connect URL vetting: https scheme and an allowlisted host.
pub fn validate_provider_url(raw: &str) -> Result<(Url, String), OutboundError> {
    let url = Url::parse(raw).map_err(|_| OutboundError::Rejected("unparseable URL"))?;
    if url.scheme() != "https" {
        return Err(OutboundError::Rejected("scheme is not https"));
    }
    let host = url
        .host_str()
        .ok_or(OutboundError::Rejected("URL has no host"))?
        .to_ascii_lowercase();
    if !PROVIDER_ALLOWLIST.contains(&host.as_str()) {
        return Err(OutboundError::Rejected("host not in allowlist"));
    }
    Ok((url, host))
}

/// Whether an address falls in a range the node must never contact:
/// private, loopback, link-local (incl. cloud metadata), CGNAT, `0/8`,
/// and their IPv6 counterparts. IPv4-mapped IPv6 is unwrapped first.
pub fn is_blocked_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_v4(mapped);
            }
            let first = v6.segments()[0];
            v6.is_unspecified()
                || v6.is_loopback()
                || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
                || (first & 0xfe00) == 0xfc00 // ULA fc00::/7
        }
    }
}

fn is_blocked_v4(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 0 // "this network"
        || o[0] == 10
        || o[0] == 127
        || (o[0] == 100 && (o[1] & 0xc0) == 64) // CGNAT 100.64/10
        || (o[0] == 169 && o[1] == 254) // link-local, cloud metadata
        || (o[0] == 172 && (o[1] & 0xf0) == 16) // 172.16/12
        || (o[0] == 192 && o[1] == 168)
}

fn provider_body(kind: ProviderKind, request: &LlmRequest) -> Value {
    match kind {
        ProviderKind::Anthropic => {
            let system: Vec<&str> = request
                .messages
                .iter()
                .filter(|m| m.role == Role::System)
                .map(|m| m.content.as_str())
                .collect();
            let messages: Vec<Value> = request
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| json!({"role": m.role, "content": m.content}))
                .collect();
            let mut body = json!({
                "model": request.model,
                "max_tokens": request.max_tokens.unwrap_or(DEFAULT_ANTHROPIC_MAX_TOKENS),
                "messages": messages,
            });
            if !system.is_empty() {
                body["system"] = Value::String(system.join("\n"));
            }
            if let Some(t) = request.temperature {
                body["temperature"] = json!(t);
            }
            body
        }
        ProviderKind::OpenAiCompatible => {
            let mut body = json!({
                "model": request.model,
                "messages": request.messages,
            });
            if let Some(max_tokens) = request.max_tokens {
                body["max_tokens"] = json!(max_tokens);
            }
            if let Some(t) = request.temperature {
                body["temperature"] = json!(t);
            }
            body
        }
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContent>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn parse_provider_response(kind: ProviderKind, body: Value) -> Result<ProviderOutput, OutboundError> {
    match kind {
        ProviderKind::Anthropic => {
            let res: AnthropicResponse = serde_json::from_value(body)
                .map_err(|err| OutboundError::Malformed(err.to_string()))?;
            let text: String = res
                .content
                .iter()
                .filter(|c| c.kind == "text")
                .map(|c| c.text.as_str())
                .collect();
            let usage = res
                .usage
                .map(|u| ProviderUsage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                })
                .unwrap_or_default();
            Ok(ProviderOutput {
                text,
                model: res.model,
                usage,
            })
        }
        ProviderKind::OpenAiCompatible => {
            let mut res: OpenAiResponse = serde_json::from_value(body)
                .map_err(|err| OutboundError::Malformed(err.to_string()))?;
            let choice = res
                .choices
                .pop()
                .ok_or_else(|| OutboundError::Malformed("no completion choice".to_string()))?;
            let usage = res
                .usage
                .map(|u| ProviderUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                })
                .unwrap_or_default();
            Ok(ProviderOutput {
                text: choice.message.content,
                model: res.model,
                usage,
            })
        }
    }
}
