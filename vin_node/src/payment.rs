//! x402 payment gate.
//!
//! Unauthenticated requests to a paid endpoint receive a structured 402
//! challenge (JSON body plus a base64 copy in the `PAYMENT-REQUIRED`
//! header). Acceptance checks headers in protocol order and records a
//! commitment over the accepted evidence for receipt binding; settlement
//! verification is an external facilitator's job.

use base64::{Engine, prelude::BASE64_STANDARD};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use vin_core::{canonical::sha256, receipt::PaymentRef};

use crate::config::NodeConfig;

pub const X402_VERSION: u32 = 2;
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";
pub const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";
pub const X_PAYMENT_HEADER: &str = "x-payment";

/// USDC on Base, the default settlement asset.
const DEFAULT_ASSET: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";
const MAX_TIMEOUT_SECONDS: u64 = 300;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentExtra {
    pub asset_transfer_method: String,
    pub name: String,
    pub version: String,
}

/// One accepted payment scheme in the 402 challenge.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    /// CAIP-2 network identifier, e.g. `eip155:8453`.
    pub network: String,
    /// Price in minor units of `asset`.
    pub amount: String,
    pub asset: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    pub extra: PaymentExtra,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub url: String,
    pub description: String,
    pub mime_type: String,
}

/// The 402 challenge body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentChallenge {
    #[serde(rename = "x402Version")]
    pub x402_version: u32,
    pub resource: ResourceInfo,
    pub accepts: Vec<PaymentRequirements>,
}

impl PaymentChallenge {
    /// The base64 copy of the challenge carried in `PAYMENT-REQUIRED`.
    pub fn header_value(&self) -> String {
        let body = serde_json::to_vec(self).expect("challenge serializes");
        BASE64_STANDARD.encode(body)
    }
}

pub struct PaymentGate {
    pay_to: String,
    price_amount: u64,
    network: String,
    test_mode: bool,
    enabled: bool,
}

impl PaymentGate {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            pay_to: config.pay_to.clone(),
            price_amount: config.price_amount,
            network: config.network.clone(),
            test_mode: config.test_mode,
            enabled: config.x402_enabled(),
        }
    }

    /// Decides whether a request is payment-valid.
    ///
    /// Header order matters: `PAYMENT-SIGNATURE` (v2) wins over `X-Payment`
    /// (v1), and `?paid=true` is honored only in test mode. On acceptance
    /// the returned [`PaymentRef`] carries `sha256(utf8(header))` so the
    /// evidence can be bound into the receipt.
    pub fn check(&self, headers: &HeaderMap, paid_query: bool) -> Result<PaymentRef, Box<PaymentChallenge>> {
        if !self.enabled {
            return Ok(PaymentRef::default());
        }

        if let Some(value) = header_str(headers, PAYMENT_SIGNATURE_HEADER) {
            return Ok(evidence("x402-v2", value));
        }
        if let Some(value) = header_str(headers, X_PAYMENT_HEADER) {
            return Ok(evidence("x402-v1", value));
        }
        if self.test_mode && paid_query {
            return Ok(PaymentRef {
                kind: "test".to_string(),
                payment_ref: None,
                payment_commitment: None,
            });
        }

        Err(Box::new(self.challenge()))
    }

    pub fn challenge(&self) -> PaymentChallenge {
        PaymentChallenge {
            x402_version: X402_VERSION,
            resource: ResourceInfo {
                url: "/v1/generate".to_string(),
                description: "Confidential LLM inference".to_string(),
                mime_type: "application/json".to_string(),
            },
            accepts: vec![PaymentRequirements {
                scheme: "exact".to_string(),
                network: self.network.clone(),
                amount: self.price_amount.to_string(),
                asset: DEFAULT_ASSET.to_string(),
                pay_to: self.pay_to.clone(),
                max_timeout_seconds: MAX_TIMEOUT_SECONDS,
                extra: PaymentExtra {
                    asset_transfer_method: "eip3009".to_string(),
                    name: "USDC".to_string(),
                    version: "2".to_string(),
                },
            }],
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn evidence(kind: &str, header_value: &str) -> PaymentRef {
    PaymentRef {
        kind: kind.to_string(),
        payment_ref: None,
        payment_commitment: Some(hex::encode(sha256(header_value.as_bytes()))),
    }
}
