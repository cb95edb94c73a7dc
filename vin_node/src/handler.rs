//! The node's HTTP surface.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    APP_VERSION,
    pipeline::Node,
    types::{GenerateQuery, VerifyBody},
};

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", routing::get(health))
        .route("/v1/tee-pubkey", routing::get(tee_pubkey))
        .route("/v1/policies", routing::get(policies))
        .route("/v1/attestation", routing::get(attestation))
        .route("/v1/generate", routing::post(generate))
        .route("/v1/verify", routing::post(verify))
        .with_state(state)
}

/// GET /health
async fn health(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "node_pubkey": app.node.node_pubkey(),
        "encryption_pubkey": app.node.encryption_pubkey_hex(),
        "version": APP_VERSION,
        "x402": app.node.config().x402_enabled(),
        "confidential_proxy": true,
    }))
}

/// GET /v1/tee-pubkey
async fn tee_pubkey(State(app): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "encryption_pubkey": app.node.encryption_pubkey_hex(),
        "signing_pubkey": app.node.node_pubkey(),
        "attestation": app.node.attestation(),
    }))
}

/// GET /v1/policies
async fn policies(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.node.policies())
}

/// GET /v1/attestation
async fn attestation(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.node.fetch_attestation().await)
}

/// POST /v1/generate
async fn generate(
    State(app): State<AppState>,
    Query(query): Query<GenerateQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let paid_query = query.paid.as_deref() == Some("true");
    match app.node.handle_generate(&headers, paid_query, &body).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

/// POST /v1/verify
async fn verify(State(app): State<AppState>, Json(body): Json<VerifyBody>) -> impl IntoResponse {
    Json(app.node.handle_verify(&body))
}
