//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use fedirelay::config;
use fedirelay::federation::{
    Activity, Actor, DeliveryError, DeliveryTransport, FetchError, FetchedActivity,
    RemoteFetcher, generate_key_pair, sign_request,
};
use fedirelay::AppState;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const RELAY_DOMAIN: &str = "relay.test";
pub const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// One key pair for every simulated remote server in the process.
fn shared_keypair() -> &'static (String, String) {
    static KEYPAIR: OnceLock<(String, String)> = OnceLock::new();
    KEYPAIR.get_or_init(|| generate_key_pair(1024).unwrap())
}

/// A simulated remote server with one actor
#[derive(Clone)]
pub struct RemotePeer {
    pub domain: String,
}

impl RemotePeer {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
        }
    }

    pub fn actor_id(&self) -> String {
        format!("https://{}/actor", self.domain)
    }

    pub fn inbox(&self) -> String {
        format!("https://{}/inbox", self.domain)
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor_id())
    }

    pub fn actor(&self) -> Actor {
        serde_json::from_value(json!({
            "id": self.actor_id(),
            "type": "Application",
            "inbox": self.inbox(),
            "publicKey": {
                "id": self.key_id(),
                "owner": self.actor_id(),
                "publicKeyPem": shared_keypair().1
            }
        }))
        .unwrap()
    }

    pub fn follow(&self, object: &str, to: Option<&str>) -> Value {
        let mut follow = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("https://{}/follows/{}", self.domain, ulid::Ulid::new()),
            "type": "Follow",
            "actor": self.actor_id(),
            "object": object
        });
        if let Some(to) = to {
            follow["to"] = json!([to]);
        }
        follow
    }

    pub fn public_create(&self) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("https://{}/notes/1/activity", self.domain),
            "type": "Create",
            "actor": self.actor_id(),
            "to": [PUBLIC],
            "object": {
                "id": format!("https://{}/notes/1", self.domain),
                "type": "Note",
                "content": "hello"
            }
        })
    }
}

/// Serves actor and object documents from memory.
#[derive(Default)]
pub struct StaticFetcher {
    actors: Mutex<HashMap<String, Actor>>,
    objects: Mutex<HashMap<String, Value>>,
}

impl StaticFetcher {
    pub fn add_peer(&self, peer: &RemotePeer) {
        self.actors
            .lock()
            .unwrap()
            .insert(peer.actor_id(), peer.actor());
    }

    pub fn add_object(&self, uri: &str, document: Value) {
        self.objects
            .lock()
            .unwrap()
            .insert(uri.to_string(), document);
    }
}

impl RemoteFetcher for StaticFetcher {
    fn fetch_actor<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Actor, FetchError>> {
        Box::pin(async move {
            let id = uri.split('#').next().unwrap_or(uri);
            self.actors
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or(FetchError::Status {
                    uri: uri.to_string(),
                    status: 404,
                })
        })
    }

    fn fetch_activity<'a>(
        &'a self,
        uri: &'a str,
    ) -> BoxFuture<'a, Result<FetchedActivity, FetchError>> {
        Box::pin(async move {
            let document = self
                .objects
                .lock()
                .unwrap()
                .get(uri)
                .cloned()
                .ok_or(FetchError::Status {
                    uri: uri.to_string(),
                    status: 404,
                })?;
            let activity: Activity = serde_json::from_value(document.clone()).unwrap();
            let actor = self.fetch_actor(&activity.actor).await?;
            Ok(FetchedActivity {
                activity,
                actor,
                body: serde_json::to_vec(&document).unwrap().into(),
            })
        })
    }
}

/// Records every delivery instead of sending it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Deliveries whose payload parses as JSON, as (inbox, activity).
    pub fn sent_json(&self) -> Vec<(String, Value)> {
        self.sent()
            .into_iter()
            .map(|(inbox, body)| (inbox, serde_json::from_slice(&body).unwrap()))
            .collect()
    }

    /// Wait until at least `count` deliveries were recorded.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, Value)> {
        for _ in 0..200 {
            if self.sent.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent_json()
    }
}

impl DeliveryTransport for RecordingTransport {
    fn deliver<'a>(
        &'a self,
        inbox_url: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            self.sent
                .lock()
                .unwrap()
                .push((inbox_url.to_string(), payload.to_vec()));
            Ok(())
        })
    }
}

/// Test server configuration knobs
#[derive(Default)]
pub struct TestOptions {
    pub manual_approval: bool,
    pub blocked_domains: Vec<String>,
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub fetcher: Arc<StaticFetcher>,
    pub transport: Arc<RecordingTransport>,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        fedirelay::metrics::init_metrics();

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: RELAY_DOMAIN.to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            relay: config::RelayConfig {
                manual_approval: options.manual_approval,
                blocked_domains: options.blocked_domains,
                ..config::RelayConfig::default()
            },
            delivery: config::DeliveryConfig {
                initial_backoff_ms: 10,
                ..config::DeliveryConfig::default()
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let fetcher = Arc::new(StaticFetcher::default());
        let transport = Arc::new(RecordingTransport::default());
        let state = AppState::with_collaborators(config, fetcher.clone(), transport.clone())
            .await
            .unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = fedirelay::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            fetcher,
            transport,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn relay_id(&self) -> String {
        format!("https://{}/actor", RELAY_DOMAIN)
    }

    /// Register `peer` with the fetcher so its signatures verify.
    pub fn peer(&self, domain: &str) -> RemotePeer {
        let peer = RemotePeer::new(domain);
        self.fetcher.add_peer(&peer);
        peer
    }

    /// POST `activity` to the inbox, signed as `peer`.
    pub async fn post_signed(&self, peer: &RemotePeer, activity: &Value) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        self.post_raw(peer, body).await
    }

    pub async fn post_raw(&self, peer: &RemotePeer, body: Vec<u8>) -> reqwest::Response {
        let url = self.url("/inbox");
        let headers = sign_request(
            "POST",
            &url,
            Some(&body),
            &shared_keypair().0,
            &peer.key_id(),
        )
        .unwrap();

        self.client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", headers.date)
            .header("Digest", headers.digest.unwrap())
            .header("Signature", headers.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}
