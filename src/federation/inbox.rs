//! Inbox routing
//!
//! Turns one decoded, verified inbound activity into a response verdict and
//! the delivery jobs it causes. Nothing here sends anything: the caller
//! hands the returned jobs to the dispatcher after responding.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::activity::{Activity, Actor, RelayActor};
use super::addressing::{Dialect, classify};
use super::delivery::DeliveryJob;
use super::fanout::{FanOut, FanOutKind, fan_out_kind};
use super::fetch::{FetchError, RemoteFetcher};
use super::handshake::{Handshake, HandshakeOutcome, Verdict};
use super::signature::{key_id_matches_actor, parse_signature_header, verify_signature};
use crate::data::{Database, Member, MembershipState, normalize_domain};
use crate::error::{AppError, InboxRejection};
use crate::metrics::{DIALECT_CLASSIFICATIONS, FEDERATION_DELAY_SECONDS};

/// Delays outside this window are clock skew or backfill, not federation lag.
const MAX_OBSERVED_DELAY_SECS: f64 = 86_400.0;

/// A validated inbound request
#[derive(Debug, Clone)]
pub struct InboundActivity {
    pub activity: Activity,
    pub actor: Actor,
    /// Request body exactly as received
    pub body: Arc<[u8]>,
}

/// Decode and verify an inbox POST.
///
/// `path` is the request path and query as received, for `(request-target)`.
pub async fn decode_inbound(
    fetcher: &dyn RemoteFetcher,
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
) -> Result<InboundActivity, InboxRejection> {
    let activity = Activity::from_slice(body)
        .map_err(|e| InboxRejection::Decode(format!("malformed activity: {}", e)))?;
    if activity.actor.is_empty() {
        return Err(InboxRejection::Decode("activity has no actor".to_string()));
    }

    let signature = headers
        .get("signature")
        .ok_or_else(|| InboxRejection::Decode("missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| InboxRejection::Decode("invalid Signature header".to_string()))?;
    let key_id = parse_signature_header(signature)?.key_id;
    if !key_id_matches_actor(&key_id, &activity.actor) {
        return Err(InboxRejection::Decode(
            "signature keyId does not belong to the activity actor".to_string(),
        ));
    }

    let fetch_failed = |e: FetchError| InboxRejection::Decode(e.to_string());
    let verify = |actor: &Actor| -> Result<(), AppError> {
        if actor.id != activity.actor {
            return Err(AppError::Validation(
                "resolved actor does not match the activity actor".to_string(),
            ));
        }
        let public_key = actor.public_key.as_ref().ok_or(AppError::InvalidSignature)?;
        verify_signature(method, path, headers, Some(body), &public_key.public_key_pem)
    };

    let mut actor = fetcher.fetch_actor(&key_id).await.map_err(fetch_failed)?;
    match verify(&actor) {
        Ok(()) => {}
        // The cached copy may predate a key rotation.
        Err(AppError::InvalidSignature) => {
            tracing::debug!(actor = %activity.actor, "Signature did not verify, refetching actor");
            actor = fetcher.refresh_actor(&key_id).await.map_err(fetch_failed)?;
            verify(&actor)?;
        }
        Err(e) => return Err(e.into()),
    }

    Ok(InboundActivity {
        activity,
        actor,
        body: Arc::from(body),
    })
}

/// What the inbox should answer and send
#[derive(Debug)]
pub struct RouteOutcome {
    pub jobs: Vec<DeliveryJob>,
    /// `None` means 202
    pub rejection: Option<InboxRejection>,
}

impl RouteOutcome {
    fn acknowledged() -> Self {
        Self {
            jobs: Vec::new(),
            rejection: None,
        }
    }

    fn fanned_out(jobs: Vec<DeliveryJob>) -> Self {
        Self {
            jobs,
            rejection: None,
        }
    }

    fn refused(rejection: InboxRejection) -> Self {
        Self {
            jobs: Vec::new(),
            rejection: Some(rejection),
        }
    }

    fn from_handshake(outcome: HandshakeOutcome) -> Self {
        let jobs = outcome
            .replies
            .into_iter()
            .filter_map(|reply| match reply.into_job() {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::error!(error = %e, "Dropping unserializable reply");
                    None
                }
            })
            .collect();
        let rejection = match outcome.verdict {
            Verdict::Accepted => None,
            Verdict::Unauthorized(reason) => Some(InboxRejection::Unauthorized(reason)),
        };
        Self { jobs, rejection }
    }
}

/// Inbox routing engine
pub struct InboxRouter {
    db: Arc<Database>,
    relay: RelayActor,
    handshake: Arc<Handshake>,
    fanout: FanOut,
    fetcher: Arc<dyn RemoteFetcher>,
}

impl InboxRouter {
    pub fn new(
        db: Arc<Database>,
        relay: RelayActor,
        handshake: Arc<Handshake>,
        fetcher: Arc<dyn RemoteFetcher>,
    ) -> Self {
        Self {
            fanout: FanOut::new(db.clone()),
            db,
            relay,
            handshake,
            fetcher,
        }
    }

    pub fn fetcher(&self) -> &dyn RemoteFetcher {
        self.fetcher.as_ref()
    }

    /// Dialect of `activity` against the current follower set.
    pub async fn classify(&self, activity: &Activity) -> Dialect {
        let follower_inboxes = match self.db.follower_inboxes().await {
            Ok(inboxes) => inboxes,
            Err(e) => {
                tracing::error!(error = %e, "Could not read follower inboxes, classifying without them");
                Default::default()
            }
        };
        classify(activity, &self.relay.id, &follower_inboxes)
    }

    pub async fn route(&self, inbound: &InboundActivity, received_at: DateTime<Utc>) -> RouteOutcome {
        let activity = &inbound.activity;
        observe_federation_delay(activity, received_at);

        let dialect = self.classify(activity).await;
        DIALECT_CLASSIFICATIONS
            .with_label_values(&[dialect.as_str()])
            .inc();
        tracing::debug!(
            activity_id = %activity.id,
            kind = %activity.kind,
            actor = %activity.actor,
            dialect = dialect.as_str(),
            "Routing inbound activity"
        );

        match self.handshake.handle(dialect, activity, &inbound.actor).await {
            Ok(Some(outcome)) => return RouteOutcome::from_handshake(outcome),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    activity_id = %activity.id,
                    kind = %activity.kind,
                    "Handshake failed, acknowledging without reply"
                );
                return RouteOutcome::acknowledged();
            }
        }

        let result = match fan_out_kind(dialect, &activity.kind) {
            FanOutKind::Broadcast => self.broadcast(inbound).await,
            FanOutKind::Announce => self.announce(inbound).await,
            FanOutKind::None => Ok(RouteOutcome::acknowledged()),
        };

        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, activity_id = %activity.id, "Fan-out failed");
            RouteOutcome::acknowledged()
        })
    }

    fn sender_domain(inbound: &InboundActivity) -> Option<String> {
        inbound
            .actor
            .domain()
            .or_else(|| inbound.activity.actor_domain())
            .map(|d| normalize_domain(&d))
    }

    async fn broadcast(&self, inbound: &InboundActivity) -> Result<RouteOutcome, AppError> {
        let Some(domain) = Self::sender_domain(inbound) else {
            return Ok(RouteOutcome::refused(InboxRejection::Unauthorized(
                "actor has no resolvable host".to_string(),
            )));
        };
        let subscribed = self
            .db
            .get_subscriber(&domain)
            .await?
            .is_some_and(|s| s.state == MembershipState::Active);
        if !subscribed {
            return Ok(RouteOutcome::refused(InboxRejection::Unauthorized(
                "to use the relay service, please subscribe in advance".to_string(),
            )));
        }

        let jobs = self.fanout.broadcast(&domain, inbound.body.clone()).await?;
        tracing::info!(
            activity_id = %inbound.activity.id,
            kind = %inbound.activity.kind,
            origin = %domain,
            destinations = jobs.len(),
            "Relaying activity"
        );
        Ok(RouteOutcome::fanned_out(jobs))
    }

    async fn announce(&self, inbound: &InboundActivity) -> Result<RouteOutcome, AppError> {
        let member = match Self::sender_domain(inbound) {
            Some(domain) => self.db.find_member(&domain).await?,
            None => None,
        };
        let Some(member) = member.filter(Member::is_active) else {
            return Ok(RouteOutcome::refused(InboxRejection::Unauthorized(
                "to use the relay service, please follow in advance".to_string(),
            )));
        };

        let Some(object_uri) = inbound.activity.object_uri() else {
            tracing::debug!(actor = %inbound.activity.actor, "Skipped Announce with embedded object");
            return Ok(RouteOutcome::acknowledged());
        };

        let original = match self.fetcher.fetch_activity(object_uri).await {
            Ok(original) => original,
            Err(e) => {
                tracing::debug!(actor = %inbound.activity.actor, error = %e, "Failed to resolve Announce object");
                return Ok(RouteOutcome::refused(InboxRejection::Decode(e.to_string())));
            }
        };

        let jobs = self.fanout.announce(member.domain(), original.body).await?;
        tracing::info!(
            object = %object_uri,
            announcer = member.domain(),
            original_actor = %original.actor.id,
            destinations = jobs.len(),
            "Relaying announced object"
        );
        Ok(RouteOutcome::fanned_out(jobs))
    }
}

/// Record the lag between an activity's `published` time and its arrival.
pub fn observe_federation_delay(activity: &Activity, received_at: DateTime<Utc>) {
    let Some(published) = activity.published_at() else {
        return;
    };
    let delay = (received_at - published).num_milliseconds() as f64 / 1000.0;
    if !(0.0..=MAX_OBSERVED_DELAY_SECS).contains(&delay) {
        return;
    }
    FEDERATION_DELAY_SECONDS
        .with_label_values(&[activity.kind.as_str()])
        .observe(delay);
}
