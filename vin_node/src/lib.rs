//! VIN node runtime: key management, payment gating, SSRF-safe outbound
//! calls, the request admission pipeline and the HTTP surface.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::signal;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod handler;
pub mod keys;
pub mod outbound;
pub mod payment;
pub mod pipeline;
pub mod ratelimit;
pub mod tee;
pub mod types;

pub use vin_core::BoxError;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub static APP_USER_AGENT: &str = concat!(
    "Mozilla/5.0 vin.node ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
);

/// Builds the node and serves the HTTP surface until `signal` resolves.
pub struct ServerBuilder {
    config: config::NodeConfig,
}

impl ServerBuilder {
    pub fn new(config: config::NodeConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self, signal: impl Future<Output = ()> + Send + 'static) -> Result<(), BoxError> {
        let port = self.config.port;
        let max_body = self.config.max_input_size;
        let node = pipeline::Node::bootstrap(self.config).await?;
        log::info!(
            node_pubkey = node.node_pubkey(),
            encryption_pubkey = node.encryption_pubkey_hex();
            "node identity resolved",
        );

        let app = handler::router(handler::AppState {
            node: Arc::new(node),
        })
        .layer(axum::extract::DefaultBodyLimit::max(max_body));

        let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
        let listener = create_reuse_port_listener(addr).await?;
        log::warn!("{}@{} listening on {:?}", APP_NAME, APP_VERSION, addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await?;
        Ok(())
    }
}

pub async fn shutdown_signal(cancel_token: CancellationToken, wait_duration: Duration) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("received termination signal, starting graceful shutdown");
    cancel_token.cancel();
    tokio::time::sleep(wait_duration).await;
}

pub async fn create_reuse_port_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener, BoxError> {
    let socket = match &addr {
        SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
        SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };

    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    Ok(listener)
}
