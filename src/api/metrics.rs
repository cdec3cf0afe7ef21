//! Prometheus metrics endpoint
//!
//! Membership gauges are refreshed from the store on every scrape; all other
//! instruments are updated where the events happen.

use axum::{
    Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::error::AppError;
use crate::metrics::REGISTRY;

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Result<Response, AppError> {
    state.membership.refresh_gauges().await;

    let encoder = TextEncoder::new();
    let metrics_text = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;

    Ok((
        [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
        metrics_text,
    )
        .into_response())
}

/// Create metrics router
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
