//! Node configuration. These are the only knobs that change behavior.

use clap::Parser;
use std::path::PathBuf;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "VIN confidential inference node")]
pub struct NodeConfig {
    /// TCP port the HTTP surface listens on.
    #[clap(long, env = "VIN_PORT", default_value = "3402")]
    pub port: u16,

    /// Path for signing-key persistence. Unset means ephemeral keys.
    #[clap(long, env = "VIN_KEY_PATH")]
    pub key_path: Option<PathBuf>,

    /// Enables the `?paid=true` query parameter as payment evidence.
    #[clap(long, env = "VIN_TEST_MODE")]
    pub test_mode: bool,

    /// Enables the legacy non-encrypted request branch.
    #[clap(long, env = "VIN_ALLOW_LEGACY")]
    pub allow_legacy: bool,

    /// On-chain payment recipient. Empty disables the payment gate.
    #[clap(long, env = "VIN_PAY_TO", default_value = "")]
    pub pay_to: String,

    /// Price per call in minor units of the settlement asset.
    #[clap(long, env = "VIN_PRICE_AMOUNT", default_value = "10000")]
    pub price_amount: u64,

    /// Settlement network in CAIP-2 form.
    #[clap(long, env = "VIN_NETWORK", default_value = "eip155:8453")]
    pub network: String,

    /// Local TEE platform-agent RPC endpoint. Unset means no TEE.
    #[clap(long, env = "VIN_PLATFORM_AGENT_URL")]
    pub platform_agent_url: Option<String>,

    /// Maximum accepted request body size, bytes.
    #[clap(long, env = "VIN_MAX_INPUT_SIZE", default_value = "1048576")]
    pub max_input_size: usize,

    /// Capacity of the receipt and envelope-nonce replay caches.
    #[clap(long, env = "VIN_REPLAY_CACHE_MAX", default_value = "10000")]
    pub replay_cache_max: u64,

    /// Receipt validity window, seconds.
    #[clap(long, env = "VIN_RECEIPT_VALIDITY_SECONDS", default_value = "600")]
    pub receipt_validity_seconds: u64,

    /// Rate-limiter burst capacity per client.
    #[clap(long, env = "VIN_RATE_BURST", default_value = "100")]
    pub rate_burst: u32,

    /// Rate-limiter sustained refill, tokens per second.
    #[clap(long, env = "VIN_RATE_PER_SECOND", default_value = "10")]
    pub rate_per_second: u32,
}

impl NodeConfig {
    /// Payments are on iff a recipient is configured.
    pub fn x402_enabled(&self) -> bool {
        !self.pay_to.is_empty()
    }
}
