use clap::Parser;
use structured_logger::{Builder, async_json::new_writer};
use tokio_util::sync::CancellationToken;
use vin_node::{BoxError, ServerBuilder, config::NodeConfig, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv::dotenv().ok();
    Builder::with_level(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
        .with_target_writer("*", new_writer(tokio::io::stdout()))
        .init();

    let config = NodeConfig::parse();
    let cancel_token = CancellationToken::new();
    let signal = shutdown_signal(cancel_token.clone(), std::time::Duration::from_secs(3));

    ServerBuilder::new(config).serve(signal).await
}
