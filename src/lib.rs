//! fedirelay - an ActivityPub relay
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - POST /inbox                                              │
//! │  - GET /metrics, GET /health                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Federation Layer                         │
//! │  - Addressing classification                                │
//! │  - Follow handshake, fan-out                                │
//! │  - Delivery dispatcher (retry, bounded concurrency)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Membership registry in SQLite (sqlx)                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: administrative membership operations
//! - `federation`: routing, handshake, fan-out and delivery
//! - `data`: membership store
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use federation::{
    DeliveryDispatcher, DeliveryTransport, EventSink, Handshake, HttpFetcher, HttpTransport,
    InboxRouter, RelayActor, RemoteFetcher, RequestSigner,
};

const ACTOR_CACHE_TTL: Duration = Duration::from_secs(3600);
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Application state shared across all handlers
///
/// Cheap to clone; every field is a shared handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Membership registry
    pub db: Arc<data::Database>,

    /// The relay's own actor identity
    pub relay: RelayActor,

    /// Outbound delivery queue
    pub dispatcher: Arc<DeliveryDispatcher>,

    /// Inbox routing engine
    pub router: Arc<InboxRouter>,

    /// Administrative membership operations
    pub membership: Arc<service::MembershipService>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Load or generate the relay signing key
    /// 3. Build HTTP client, fetcher and signed transport
    /// 4. Start the event consumer and delivery dispatcher
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = data::Database::connect(&config.database.path).await?;
        tracing::info!("Database connected");

        // 2. Relay key
        let key = Self::ensure_relay_key(&db, config.relay.key_bits).await?;
        let relay = RelayActor::from_base_url(&config.server.base_url());

        // 3. Outbound HTTP
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("fedirelay/", env!("CARGO_PKG_VERSION")))
            .timeout(config.delivery.request_timeout())
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let signer = RequestSigner::from_pem(relay.key_id.clone(), &key.private_key_pem)?;
        let transport = Arc::new(HttpTransport::new(http_client.clone(), signer));
        let fetcher = Arc::new(HttpFetcher::new(http_client, ACTOR_CACHE_TTL));

        // 4. Background tasks
        let state = Self::assemble(config, db, relay, fetcher, transport);
        state.membership.refresh_gauges().await;

        tracing::info!(actor = %state.relay.id, "Application state initialized successfully");
        Ok(state)
    }

    /// Initialize state around caller-provided remote collaborators.
    ///
    /// No signing key is created; `transport` is responsible for any
    /// signing it needs.
    pub async fn with_collaborators(
        config: config::AppConfig,
        fetcher: Arc<dyn RemoteFetcher>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Result<Self, error::AppError> {
        let db = data::Database::connect(&config.database.path).await?;
        let relay = RelayActor::from_base_url(&config.server.base_url());
        Ok(Self::assemble(config, db, relay, fetcher, transport))
    }

    fn assemble(
        config: config::AppConfig,
        db: data::Database,
        relay: RelayActor,
        fetcher: Arc<dyn RemoteFetcher>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        let db = Arc::new(db);
        let (events, _consumer) = EventSink::spawn(EVENT_QUEUE_CAPACITY);
        let dispatcher = Arc::new(DeliveryDispatcher::spawn(&config.delivery, transport));

        let handshake = Arc::new(Handshake::new(
            db.clone(),
            relay.clone(),
            config.relay.clone(),
            events,
        ));
        let router = Arc::new(InboxRouter::new(
            db.clone(),
            relay.clone(),
            handshake.clone(),
            fetcher,
        ));
        let membership = Arc::new(service::MembershipService::new(
            db.clone(),
            handshake,
            dispatcher.clone(),
        ));

        Self {
            config: Arc::new(config),
            db,
            relay,
            dispatcher,
            router,
            membership,
        }
    }

    /// Load the relay key, generating and persisting one on first start.
    async fn ensure_relay_key(
        db: &data::Database,
        bits: usize,
    ) -> Result<data::RelayKey, error::AppError> {
        if let Some(key) = db.get_relay_key().await? {
            tracing::info!("Relay key loaded");
            return Ok(key);
        }

        tracing::info!(bits, "Generating relay key...");
        let (private_key_pem, public_key_pem) =
            tokio::task::spawn_blocking(move || federation::generate_key_pair(bits))
                .await
                .map_err(|e| error::AppError::Internal(e.into()))??;

        let key = data::RelayKey {
            private_key_pem,
            public_key_pem,
            created_at: chrono::Utc::now(),
        };
        if db.insert_relay_key_if_absent(&key).await? {
            tracing::info!("Relay key created");
            return Ok(key);
        }

        // Another process stored its key first.
        db.get_relay_key().await?.ok_or_else(|| {
            error::AppError::Internal(anyhow::anyhow!("relay key vanished after insert race"))
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use axum::extract::DefaultBodyLimit;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::inbox_router())
        .merge(api::metrics_router())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use federation::{Actor, DeliveryError, FetchError, FetchedActivity};
    use futures::future::BoxFuture;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Offline;

    impl RemoteFetcher for Offline {
        fn fetch_actor<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Actor, FetchError>> {
            Box::pin(async move { Err(FetchError::InvalidUri(uri.to_string())) })
        }

        fn fetch_activity<'a>(
            &'a self,
            uri: &'a str,
        ) -> BoxFuture<'a, Result<FetchedActivity, FetchError>> {
            Box::pin(async move { Err(FetchError::InvalidUri(uri.to_string())) })
        }
    }

    impl DeliveryTransport for Offline {
        fn deliver<'a>(
            &'a self,
            _inbox_url: &'a str,
            _payload: &'a [u8],
        ) -> BoxFuture<'a, Result<(), DeliveryError>> {
            Box::pin(async { Err(DeliveryError::Network("offline".to_string())) })
        }
    }

    async fn app(dir: &TempDir) -> axum::Router {
        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "localhost".to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: dir.path().join("relay.db"),
            },
            relay: config::RelayConfig::default(),
            delivery: config::DeliveryConfig::default(),
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        let offline = Arc::new(Offline);
        let state = AppState::with_collaborators(config, offline.clone(), offline)
            .await
            .unwrap();
        build_router(state)
    }

    #[tokio::test]
    async fn health_responds_ok() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir)
            .await
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn inbox_only_accepts_post() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir)
            .await
            .oneshot(Request::put("/inbox").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn oversized_inbox_body_is_refused() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir)
            .await
            .oneshot(
                Request::post("/inbox")
                    .header("content-length", MAX_INBOX_BODY_BYTES + 1)
                    .body(Body::from(vec![b' '; MAX_INBOX_BODY_BYTES + 1]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn unsigned_inbox_post_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir)
            .await
            .oneshot(
                Request::post("/inbox")
                    .body(Body::from(r#"{"type":"Follow","actor":"https://a.example/actor"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
