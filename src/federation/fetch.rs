//! Remote document fetching
//!
//! Resolves actor documents (for signature verification and delivery
//! inboxes) and announced objects given as bare URIs. Actor documents are
//! cached per URI with a TTL.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use super::activity::{Activity, Actor};
use crate::metrics::REMOTE_FETCHES_TOTAL;

const ACTIVITY_JSON: &str = "application/activity+json";
const ACCEPT_HEADER: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Remote fetch failure
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid remote URI {0}")]
    InvalidUri(String),

    #[error("refusing to fetch from non-public host {0}")]
    ForbiddenHost(String),

    #[error("request to {uri} failed: {source}")]
    Transport {
        uri: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{uri} answered HTTP {status}")]
    Status { uri: String, status: u16 },

    #[error("{uri} returned an unusable document: {reason}")]
    Document { uri: String, reason: String },
}

/// An announced object resolved from its origin server
#[derive(Debug, Clone)]
pub struct FetchedActivity {
    pub activity: Activity,
    pub actor: Actor,
    /// Document exactly as served by the origin
    pub body: Arc<[u8]>,
}

/// Collaborator that dereferences remote documents
pub trait RemoteFetcher: Send + Sync {
    fn fetch_actor<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Actor, FetchError>>;

    /// Fetch an actor from its origin even when a copy is cached.
    fn refresh_actor<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Actor, FetchError>> {
        self.fetch_actor(uri)
    }

    /// Evict expired cache entries. Fetchers without a cache do nothing.
    fn prune_cache(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    /// Fetch an object by URI along with the actor it is attributed to.
    fn fetch_activity<'a>(
        &'a self,
        uri: &'a str,
    ) -> BoxFuture<'a, Result<FetchedActivity, FetchError>>;
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }
    normalized
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Parse a remote URI and reject schemes and hosts the relay never contacts.
pub fn parse_public_uri(uri: &str) -> Result<url::Url, FetchError> {
    let parsed = url::Url::parse(uri).map_err(|_| FetchError::InvalidUri(uri.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUri(uri.to_string()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| FetchError::InvalidUri(uri.to_string()))?;
    if is_disallowed_host(host) {
        return Err(FetchError::ForbiddenHost(host.to_string()));
    }
    Ok(parsed)
}

/// Resolve DNS and reject hosts that look public but resolve internally.
async fn ensure_resolves_publicly(url: &url::Url) -> Result<(), FetchError> {
    let host = url
        .host_str()
        .ok_or_else(|| FetchError::InvalidUri(url.to_string()))?;
    let port = url.port_or_known_default().unwrap_or(443);

    let lookup = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| FetchError::InvalidUri(url.to_string()))?;

    let mut resolved_any = false;
    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(FetchError::ForbiddenHost(host.to_string()));
        }
    }
    if !resolved_any {
        return Err(FetchError::InvalidUri(url.to_string()));
    }
    Ok(())
}

/// Cached actor entry
#[derive(Debug, Clone)]
struct CachedActor {
    actor: Actor,
    cached_at: Instant,
}

/// Actor document cache
///
/// Thread-safe cache keyed by actor URI (fragment stripped).
pub struct ActorCache {
    entries: RwLock<HashMap<String, CachedActor>>,
    ttl: Duration,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

impl ActorCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn key(uri: &str) -> &str {
        uri.split('#').next().unwrap_or(uri)
    }

    pub async fn get(&self, uri: &str) -> Option<Actor> {
        let entries = self.entries.read().await;
        entries
            .get(Self::key(uri))
            .filter(|cached| cached.cached_at.elapsed() < self.ttl)
            .map(|cached| cached.actor.clone())
    }

    pub async fn insert(&self, uri: &str, actor: Actor) {
        let mut entries = self.entries.write().await;
        entries.insert(
            Self::key(uri).to_string(),
            CachedActor {
                actor,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop an entry whose key no longer verifies.
    pub async fn invalidate(&self, uri: &str) {
        self.entries.write().await.remove(Self::key(uri));
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let total = entries.len();
        let valid = entries
            .values()
            .filter(|cached| cached.cached_at.elapsed() < self.ttl)
            .count();
        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    pub async fn prune_expired(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, cached| cached.cached_at.elapsed() < ttl);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned expired actor cache entries");
        }
    }
}

/// Fetcher backed by reqwest
pub struct HttpFetcher {
    http_client: reqwest::Client,
    cache: ActorCache,
}

impl HttpFetcher {
    pub fn new(http_client: reqwest::Client, cache_ttl: Duration) -> Self {
        Self {
            http_client,
            cache: ActorCache::new(cache_ttl),
        }
    }

    async fn load_actor(&self, uri: &str) -> Result<Actor, FetchError> {
        let actor_uri = ActorCache::key(uri);
        let (document, _) = self.get_document("actor", actor_uri).await?;
        let actor: Actor = serde_json::from_value(document).map_err(|e| FetchError::Document {
            uri: actor_uri.to_string(),
            reason: e.to_string(),
        })?;

        self.cache.insert(uri, actor.clone()).await;
        Ok(actor)
    }

    async fn get_document(&self, kind: &str, uri: &str) -> Result<(Value, Vec<u8>), FetchError> {
        let result = self.get_document_inner(uri).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        REMOTE_FETCHES_TOTAL.with_label_values(&[kind, status]).inc();
        result
    }

    async fn get_document_inner(&self, uri: &str) -> Result<(Value, Vec<u8>), FetchError> {
        let url = parse_public_uri(uri)?;
        ensure_resolves_publicly(&url).await?;

        let transport = |source| FetchError::Transport {
            uri: uri.to_string(),
            source,
        };
        let response = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .send()
            .await
            .map_err(transport)?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                uri: uri.to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport)?.to_vec();
        let value = serde_json::from_slice(&body).map_err(|e| FetchError::Document {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        Ok((value, body))
    }
}

/// Actor a fetched object is attributed to: `actor`, else `attributedTo`.
pub fn attributed_actor(document: &Value) -> Option<&str> {
    ["actor", "attributedTo"].iter().find_map(|field| {
        match document.get(*field)? {
            Value::String(uri) => Some(uri.as_str()),
            Value::Object(map) => map.get("id").and_then(Value::as_str),
            Value::Array(items) => items.iter().find_map(|item| match item {
                Value::String(uri) => Some(uri.as_str()),
                Value::Object(map) => map.get("id").and_then(Value::as_str),
                _ => None,
            }),
            _ => None,
        }
    })
}

impl RemoteFetcher for HttpFetcher {
    fn fetch_actor<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Actor, FetchError>> {
        Box::pin(async move {
            if let Some(actor) = self.cache.get(uri).await {
                tracing::debug!(actor = %uri, "Actor cache hit");
                return Ok(actor);
            }
            self.load_actor(uri).await
        })
    }

    fn refresh_actor<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<Actor, FetchError>> {
        Box::pin(async move {
            self.cache.invalidate(uri).await;
            self.load_actor(uri).await
        })
    }

    fn prune_cache(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.cache.prune_expired().await;
            let stats = self.cache.stats().await;
            tracing::debug!(entries = stats.total_entries, "Actor cache pruned");
        })
    }

    fn fetch_activity<'a>(
        &'a self,
        uri: &'a str,
    ) -> BoxFuture<'a, Result<FetchedActivity, FetchError>> {
        Box::pin(async move {
            let (document, body) = self.get_document("activity", uri).await?;
            let actor_uri = attributed_actor(&document)
                .map(str::to_string)
                .ok_or_else(|| FetchError::Document {
                    uri: uri.to_string(),
                    reason: "no actor or attributedTo".to_string(),
                })?;

            let mut activity: Activity =
                serde_json::from_value(document).map_err(|e| FetchError::Document {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                })?;
            if activity.actor.is_empty() {
                activity.actor = actor_uri.clone();
            }

            let actor = self.fetch_actor(&actor_uri).await?;
            Ok(FetchedActivity {
                activity,
                actor,
                body: body.into(),
            })
        })
    }
}
