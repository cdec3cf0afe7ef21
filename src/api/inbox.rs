//! Relay inbox endpoint
//!
//! - POST /inbox: decode, verify, route, respond, then enqueue deliveries
//!
//! Responses are plain text: 202 on acceptance, 400 for anything that
//! could not be decoded or verified, 401 when the sender is not allowed to
//! do what it asked. Other methods get 405 from the router.

use axum::body::Bytes;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::Utc;
use http::HeaderMap;

use crate::AppState;
use crate::error::InboxRejection;
use crate::federation::inbox::decode_inbound;
use crate::metrics::{INBOX_ACTIVITIES_RECEIVED, INBOX_RESPONSES_TOTAL};

/// Create inbox router
pub fn inbox_router() -> Router<AppState> {
    Router::new().route("/inbox", post(inbox))
}

/// POST /inbox
///
/// # Steps
/// 1. Decode the activity and verify its HTTP signature
/// 2. Route it through handshake and fan-out
/// 3. Hand resulting jobs to the dispatcher without waiting on them,
///    refused activities included
async fn inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let received_at = Utc::now();
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let inbound = match decode_inbound(
        state.router.fetcher(),
        "POST",
        path,
        &headers,
        &body,
    )
    .await
    {
        Ok(inbound) => inbound,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected undecodable inbox request");
            return respond(Err(rejection));
        }
    };

    INBOX_ACTIVITIES_RECEIVED
        .with_label_values(&[inbound.activity.kind.as_str()])
        .inc();

    let outcome = state.router.route(&inbound, received_at).await;
    // A refusal can still carry a reply, e.g. the Reject for a blocked Follow.
    state.dispatcher.submit_all(outcome.jobs);

    if let Some(rejection) = outcome.rejection {
        tracing::info!(
            actor = %inbound.activity.actor,
            kind = %inbound.activity.kind,
            reason = %rejection,
            "Refused inbox activity"
        );
        return respond(Err(rejection));
    }

    respond(Ok(()))
}

fn respond(result: Result<(), InboxRejection>) -> Response {
    let status = match &result {
        Ok(()) => StatusCode::ACCEPTED,
        Err(rejection) => rejection.status(),
    };
    INBOX_RESPONSES_TOTAL
        .with_label_values(&[status.as_str()])
        .inc();

    match result {
        Ok(()) => (StatusCode::ACCEPTED, "").into_response(),
        Err(rejection) => rejection.into_response(),
    }
}
