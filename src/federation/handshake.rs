//! Follow handshake
//!
//! Follow / Undo / Accept / Reject processing against the membership
//! registry. Every mutation for a domain happens while holding that
//! domain's lock, so a Follow and an Undo from the same server arriving on
//! different connections apply one after the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use super::activity::builder::{self, ReplyKind};
use super::activity::{Activity, ActivityType, Actor, PUBLIC_AUDIENCE, RelayActor};
use super::addressing::Dialect;
use super::delivery::DeliveryJob;
use super::notify::{EventSink, RelayEvent};
use crate::config::RelayConfig;
use crate::data::{
    Collection, Database, Follower, Member, MembershipState, Subscriber, normalize_domain,
};
use crate::error::AppError;
use crate::metrics::UNWRAP_FAILURES_TOTAL;

/// Handshake step selected for an inbound activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Follow,
    Undo,
    AcceptFollow,
    RejectFollow,
    /// Not a handshake activity in this dialect
    None,
}

/// Handshake transition table, keyed by dialect and activity type.
pub fn transition(dialect: Dialect, kind: &ActivityType) -> Transition {
    use Dialect::{RelayDirected, Unaddressed};

    match (dialect, kind) {
        (RelayDirected | Unaddressed, ActivityType::Follow) => Transition::Follow,
        (RelayDirected | Unaddressed, ActivityType::Undo) => Transition::Undo,
        (RelayDirected, ActivityType::Accept) => Transition::AcceptFollow,
        (RelayDirected, ActivityType::Reject) => Transition::RejectFollow,
        _ => Transition::None,
    }
}

/// An activity the relay sends back as part of a handshake
#[derive(Debug, Clone)]
pub struct Reply {
    pub inbox_url: String,
    pub activity: Value,
}

impl Reply {
    pub fn into_job(self) -> Result<DeliveryJob, AppError> {
        let payload = serde_json::to_vec(&self.activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize reply: {}", e)))?;
        Ok(DeliveryJob::new(self.inbox_url, payload.into()))
    }
}

/// Whether the sender gets a 202 or a 401
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Unauthorized(String),
}

/// Result of one handshake step
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub replies: Vec<Reply>,
    pub verdict: Verdict,
}

impl HandshakeOutcome {
    fn acknowledged() -> Self {
        Self {
            replies: Vec::new(),
            verdict: Verdict::Accepted,
        }
    }

    fn accepted(replies: Vec<Reply>) -> Self {
        Self {
            replies,
            verdict: Verdict::Accepted,
        }
    }

    fn rejected(reply: Reply, reason: impl Into<String>) -> Self {
        Self {
            replies: vec![reply],
            verdict: Verdict::Unauthorized(reason.into()),
        }
    }
}

/// Per-domain mutual exclusion
///
/// Entries are removed once no task holds or waits on them.
#[derive(Default)]
pub struct DomainLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while a domain's membership is being changed
pub struct DomainGuard<'a> {
    owner: &'a DomainLocks,
    domain: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DomainLocks {
    pub async fn lock(&self, domain: &str) -> DomainGuard<'_> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(domain.to_string()).or_default().clone()
        };
        let guard = entry.lock_owned().await;
        DomainGuard {
            owner: self,
            domain: domain.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of domains with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Drop for DomainGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(|p| p.into_inner());
        self.guard.take();
        if locks
            .get(&self.domain)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&self.domain);
        }
    }
}

/// What the administrator removed and the Reject sent for it
#[derive(Debug, Clone)]
pub struct Removal {
    pub collection: Collection,
    pub reply: Reply,
}

/// Follow handshake state machine
pub struct Handshake {
    db: Arc<Database>,
    relay: RelayActor,
    config: RelayConfig,
    locks: DomainLocks,
    events: EventSink,
}

impl Handshake {
    pub fn new(db: Arc<Database>, relay: RelayActor, config: RelayConfig, events: EventSink) -> Self {
        Self {
            db,
            relay,
            config,
            locks: DomainLocks::default(),
            events,
        }
    }

    pub fn locks(&self) -> &DomainLocks {
        &self.locks
    }

    async fn is_blocked(&self, domain: &str) -> Result<bool, AppError> {
        Ok(self.config.is_statically_blocked(domain) || self.db.is_domain_blocked(domain).await?)
    }

    fn sender_domain(activity: &Activity, actor: &Actor) -> Option<String> {
        actor
            .domain()
            .or_else(|| activity.actor_domain())
            .map(|d| normalize_domain(&d))
    }

    /// Reply to `original` at the sender's delivery inbox.
    fn reply(&self, original: &Activity, actor: &Actor, kind: ReplyKind) -> Reply {
        Reply {
            inbox_url: actor.delivery_inbox().to_string(),
            activity: builder::reply_to(&self.relay, original, kind),
        }
    }

    /// Reply rebuilt from a stored record, for decisions made after the fact.
    fn reply_for_record(
        &self,
        kind: ReplyKind,
        activity_id: &str,
        actor_id: &str,
        inbox_url: &str,
        followed: &str,
    ) -> Reply {
        let object = builder::embed(activity_id, "Follow", actor_id, Value::from(followed));
        Reply {
            inbox_url: inbox_url.to_string(),
            activity: builder::reply(&self.relay, kind, object, actor_id),
        }
    }

    /// Dispatch an inbound activity through the transition table.
    pub async fn handle(
        &self,
        dialect: Dialect,
        activity: &Activity,
        actor: &Actor,
    ) -> Result<Option<HandshakeOutcome>, AppError> {
        let outcome = match transition(dialect, &activity.kind) {
            Transition::Follow => self.follow(activity, actor).await?,
            Transition::Undo => self.undo(activity, actor).await?,
            Transition::AcceptFollow => self.accept_follow(activity, actor).await?,
            Transition::RejectFollow => self.reject_follow(activity, actor).await?,
            Transition::None => return Ok(None),
        };
        Ok(Some(outcome))
    }

    /// Admit, queue or refuse a Follow.
    pub async fn follow(&self, activity: &Activity, actor: &Actor) -> Result<HandshakeOutcome, AppError> {
        let Some(domain) = Self::sender_domain(activity, actor) else {
            return Ok(HandshakeOutcome::rejected(
                self.reply(activity, actor, ReplyKind::Reject),
                "actor has no resolvable host",
            ));
        };
        let _guard = self.locks.lock(&domain).await;

        if self.is_blocked(&domain).await? {
            tracing::info!(%domain, "Refusing follow from blocked domain");
            self.events.emit(RelayEvent::Rejected {
                domain: domain.clone(),
                reason: "blocked".to_string(),
            });
            return Ok(HandshakeOutcome::rejected(
                self.reply(activity, actor, ReplyKind::Reject),
                "this domain is blocked by the relay",
            ));
        }

        let now = Utc::now();
        match activity.object_uri() {
            Some(PUBLIC_AUDIENCE) => {
                let existing = self.db.get_subscriber(&domain).await?;
                let already_active =
                    existing.is_some_and(|s| s.state == MembershipState::Active);
                let state = if self.config.manual_approval && !already_active {
                    MembershipState::Pending
                } else {
                    MembershipState::Active
                };

                self.db
                    .upsert_subscriber(&Subscriber {
                        domain: domain.clone(),
                        activity_id: activity.id.clone(),
                        actor_id: actor.id.clone(),
                        inbox_url: actor.delivery_inbox().to_string(),
                        state,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;

                if state == MembershipState::Pending {
                    tracing::info!(%domain, "Follow request awaiting approval");
                    self.events.emit(RelayEvent::PendingRequest { domain });
                    return Ok(HandshakeOutcome::acknowledged());
                }

                tracing::info!(%domain, "Accepted subscriber");
                self.events.emit(RelayEvent::Follow {
                    domain,
                    collection: Collection::Subscriber.as_str(),
                });
                Ok(HandshakeOutcome::accepted(vec![self.reply(
                    activity,
                    actor,
                    ReplyKind::Accept,
                )]))
            }
            Some(object) if object == self.relay.id => {
                self.db
                    .upsert_follower(&Follower {
                        domain: domain.clone(),
                        activity_id: activity.id.clone(),
                        actor_id: actor.id.clone(),
                        inbox_url: actor.delivery_inbox().to_string(),
                        mutual: false,
                        created_at: now,
                        updated_at: now,
                    })
                    .await?;

                tracing::info!(%domain, "Accepted follower, following back");
                self.events.emit(RelayEvent::Follow {
                    domain,
                    collection: Collection::Follower.as_str(),
                });
                let follow_back = Reply {
                    inbox_url: actor.delivery_inbox().to_string(),
                    activity: builder::follow(&self.relay, &actor.id),
                };
                Ok(HandshakeOutcome::accepted(vec![
                    self.reply(activity, actor, ReplyKind::Accept),
                    follow_back,
                ]))
            }
            other => {
                tracing::info!(%domain, object = ?other, "Refusing follow of unknown object");
                self.events.emit(RelayEvent::Rejected {
                    domain,
                    reason: "unsupported follow object".to_string(),
                });
                Ok(HandshakeOutcome::rejected(
                    self.reply(activity, actor, ReplyKind::Reject),
                    "only the public collection or the relay actor can be followed",
                ))
            }
        }
    }

    /// Nested Follow of an Undo/Accept/Reject, or `None` to acknowledge and ignore.
    fn inner_follow(&self, outer: &Activity) -> Option<Activity> {
        match outer.unwrap_inner_activity() {
            Ok(inner) if inner.kind == ActivityType::Follow => Some(inner),
            Ok(inner) => {
                tracing::debug!(
                    outer = %outer.kind,
                    inner = %inner.kind,
                    "Ignoring nested activity that is not a Follow"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    activity_id = %outer.id,
                    actor = %outer.actor,
                    outer = %outer.kind,
                    error = %e,
                    "Acknowledging activity with unreadable nested object"
                );
                UNWRAP_FAILURES_TOTAL
                    .with_label_values(&[outer.kind.as_str()])
                    .inc();
                None
            }
        }
    }

    /// Remove the sender's membership, whichever collection holds it.
    pub async fn undo(&self, activity: &Activity, actor: &Actor) -> Result<HandshakeOutcome, AppError> {
        if self.inner_follow(activity).is_none() {
            return Ok(HandshakeOutcome::acknowledged());
        }
        let Some(domain) = Self::sender_domain(activity, actor) else {
            return Ok(HandshakeOutcome::acknowledged());
        };
        let _guard = self.locks.lock(&domain).await;

        match self.db.delete_member(&domain).await? {
            Some(removed) => {
                tracing::info!(%domain, collection = removed.collection().as_str(), "Unfollowed");
                self.events.emit(RelayEvent::Unfollow { domain });
            }
            None => tracing::debug!(%domain, "Undo from a domain with no membership"),
        }
        Ok(HandshakeOutcome::acknowledged())
    }

    /// A peer accepted the relay's follow-back.
    pub async fn accept_follow(
        &self,
        activity: &Activity,
        actor: &Actor,
    ) -> Result<HandshakeOutcome, AppError> {
        let Some(inner) = self.inner_follow(activity) else {
            return Ok(HandshakeOutcome::acknowledged());
        };
        if inner.actor != self.relay.id {
            tracing::debug!(actor = %actor.id, "Accept for a follow the relay did not send");
            return Ok(HandshakeOutcome::acknowledged());
        }
        let Some(domain) = Self::sender_domain(activity, actor) else {
            return Ok(HandshakeOutcome::acknowledged());
        };
        let _guard = self.locks.lock(&domain).await;

        if self.db.mark_follower_mutual(&domain).await? {
            tracing::info!(%domain, "Mutual follow established");
            self.events.emit(RelayEvent::Accepted { domain });
        }
        Ok(HandshakeOutcome::acknowledged())
    }

    /// A peer refused the relay's follow-back: drop it as a follower.
    pub async fn reject_follow(
        &self,
        activity: &Activity,
        actor: &Actor,
    ) -> Result<HandshakeOutcome, AppError> {
        if self.inner_follow(activity).is_none() {
            return Ok(HandshakeOutcome::acknowledged());
        }
        let Some(domain) = Self::sender_domain(activity, actor) else {
            return Ok(HandshakeOutcome::acknowledged());
        };
        let _guard = self.locks.lock(&domain).await;

        if self.db.delete_follower(&domain).await? {
            tracing::info!(%domain, "Follower removed after rejecting follow-back");
            self.events.emit(RelayEvent::Unfollow { domain });
        }
        Ok(HandshakeOutcome::acknowledged())
    }

    // =========================================================================
    // Administrative operations
    // =========================================================================

    /// Drop a member and tell it so, using the reply shape of the
    /// collection it joined.
    pub async fn unfollow_domain(&self, domain: &str) -> Result<Option<Removal>, AppError> {
        let domain = normalize_domain(domain);
        let _guard = self.locks.lock(&domain).await;
        self.remove_member_locked(&domain).await
    }

    async fn remove_member_locked(&self, domain: &str) -> Result<Option<Removal>, AppError> {
        let Some(member) = self.db.delete_member(domain).await? else {
            return Ok(None);
        };

        let reply = match &member {
            Member::Subscriber(s) => self.reply_for_record(
                ReplyKind::Reject,
                &s.activity_id,
                &s.actor_id,
                &s.inbox_url,
                PUBLIC_AUDIENCE,
            ),
            Member::Follower(f) => self.reply_for_record(
                ReplyKind::Reject,
                &f.activity_id,
                &f.actor_id,
                &f.inbox_url,
                &self.relay.id,
            ),
        };

        tracing::info!(domain, collection = member.collection().as_str(), "Removed member");
        self.events.emit(RelayEvent::Unfollow {
            domain: domain.to_string(),
        });
        Ok(Some(Removal {
            collection: member.collection(),
            reply,
        }))
    }

    /// Activate a pending subscriber and send its Accept.
    pub async fn approve_pending(&self, domain: &str) -> Result<Option<Reply>, AppError> {
        let domain = normalize_domain(domain);
        let _guard = self.locks.lock(&domain).await;

        let Some(subscriber) = self
            .db
            .get_subscriber(&domain)
            .await?
            .filter(|s| s.state == MembershipState::Pending)
        else {
            return Ok(None);
        };
        if !self.db.activate_subscriber(&domain).await? {
            return Ok(None);
        }

        tracing::info!(%domain, "Approved pending subscriber");
        self.events.emit(RelayEvent::Follow {
            domain,
            collection: Collection::Subscriber.as_str(),
        });
        Ok(Some(self.reply_for_record(
            ReplyKind::Accept,
            &subscriber.activity_id,
            &subscriber.actor_id,
            &subscriber.inbox_url,
            PUBLIC_AUDIENCE,
        )))
    }

    /// Discard a pending subscriber and send its Reject.
    pub async fn deny_pending(&self, domain: &str) -> Result<Option<Reply>, AppError> {
        let domain = normalize_domain(domain);
        let _guard = self.locks.lock(&domain).await;

        let Some(subscriber) = self
            .db
            .get_subscriber(&domain)
            .await?
            .filter(|s| s.state == MembershipState::Pending)
        else {
            return Ok(None);
        };
        self.db.delete_subscriber(&domain).await?;

        tracing::info!(%domain, "Denied pending subscriber");
        self.events.emit(RelayEvent::Rejected {
            domain,
            reason: "denied by administrator".to_string(),
        });
        Ok(Some(self.reply_for_record(
            ReplyKind::Reject,
            &subscriber.activity_id,
            &subscriber.actor_id,
            &subscriber.inbox_url,
            PUBLIC_AUDIENCE,
        )))
    }

    /// Block a domain, removing any membership it holds.
    pub async fn block_domain(&self, domain: &str) -> Result<Option<Removal>, AppError> {
        let domain = normalize_domain(domain);
        let _guard = self.locks.lock(&domain).await;

        self.db.insert_domain_block(&domain).await?;
        tracing::info!(%domain, "Domain blocked");
        self.events.emit(RelayEvent::Blocked {
            domain: domain.clone(),
        });
        self.remove_member_locked(&domain).await
    }

    pub async fn unblock_domain(&self, domain: &str) -> Result<bool, AppError> {
        let domain = normalize_domain(domain);
        let removed = self.db.delete_domain_block(&domain).await?;
        if removed {
            tracing::info!(%domain, "Domain unblocked");
        }
        Ok(removed)
    }
}
