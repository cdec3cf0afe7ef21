//! Membership service
//!
//! Administrative operations on the relay's registry. Each operation that
//! produces a reply hands it to the delivery dispatcher before returning.

use std::sync::Arc;

use crate::data::{Database, Follower, MembershipCounts, MembershipState, Subscriber};
use crate::error::AppError;
use crate::federation::delivery::DeliveryDispatcher;
use crate::federation::handshake::{Handshake, Reply};
use crate::metrics::MEMBERSHIP_SIZE;

/// Membership service
pub struct MembershipService {
    db: Arc<Database>,
    handshake: Arc<Handshake>,
    dispatcher: Arc<DeliveryDispatcher>,
}

impl MembershipService {
    pub fn new(
        db: Arc<Database>,
        handshake: Arc<Handshake>,
        dispatcher: Arc<DeliveryDispatcher>,
    ) -> Self {
        Self {
            db,
            handshake,
            dispatcher,
        }
    }

    pub async fn subscribers(&self) -> Result<Vec<Subscriber>, AppError> {
        self.db.list_subscribers(None).await
    }

    pub async fn pending_subscribers(&self) -> Result<Vec<Subscriber>, AppError> {
        self.db.list_subscribers(Some(MembershipState::Pending)).await
    }

    pub async fn followers(&self) -> Result<Vec<Follower>, AppError> {
        self.db.list_followers().await
    }

    pub async fn blocked_domains(&self) -> Result<Vec<String>, AppError> {
        self.db.list_domain_blocks().await
    }

    /// Remove a member and send it a Reject.
    ///
    /// Returns `false` when the domain held no membership.
    pub async fn unfollow(&self, domain: &str) -> Result<bool, AppError> {
        let removal = self.handshake.unfollow_domain(domain).await?;
        let removed = removal.is_some();
        if let Some(removal) = removal {
            self.send(removal.reply)?;
        }
        self.refresh_gauges().await;
        Ok(removed)
    }

    /// Activate a pending subscriber and send its Accept.
    pub async fn approve(&self, domain: &str) -> Result<bool, AppError> {
        let reply = self.handshake.approve_pending(domain).await?;
        self.finish(reply).await
    }

    /// Discard a pending subscriber and send its Reject.
    pub async fn deny(&self, domain: &str) -> Result<bool, AppError> {
        let reply = self.handshake.deny_pending(domain).await?;
        self.finish(reply).await
    }

    /// Block a domain. An existing member is evicted with a Reject.
    pub async fn block(&self, domain: &str) -> Result<(), AppError> {
        if let Some(removal) = self.handshake.block_domain(domain).await? {
            self.send(removal.reply)?;
        }
        self.refresh_gauges().await;
        Ok(())
    }

    pub async fn unblock(&self, domain: &str) -> Result<bool, AppError> {
        self.handshake.unblock_domain(domain).await
    }

    /// Registry sizes: active subscribers, pending requests and followers.
    pub async fn counts(&self) -> Result<MembershipCounts, AppError> {
        self.db.membership_counts().await
    }

    /// Publish current registry sizes to the membership gauges.
    pub async fn refresh_gauges(&self) {
        match self.counts().await {
            Ok(counts) => {
                MEMBERSHIP_SIZE
                    .with_label_values(&["subscribers"])
                    .set(counts.active_subscribers);
                MEMBERSHIP_SIZE
                    .with_label_values(&["pending"])
                    .set(counts.pending_subscribers);
                MEMBERSHIP_SIZE
                    .with_label_values(&["followers"])
                    .set(counts.followers);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to refresh membership gauges"),
        }
    }

    async fn finish(&self, reply: Option<Reply>) -> Result<bool, AppError> {
        let Some(reply) = reply else {
            return Ok(false);
        };
        self.send(reply)?;
        self.refresh_gauges().await;
        Ok(true)
    }

    fn send(&self, reply: Reply) -> Result<(), AppError> {
        self.dispatcher.submit(reply.into_job()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryConfig, RelayConfig};
    use crate::federation::activity::{PUBLIC_AUDIENCE, RelayActor};
    use crate::federation::delivery::{DeliveryError, DeliveryTransport};
    use crate::federation::notify::EventSink;
    use chrono::Utc;
    use futures::future::BoxFuture;
    use serde_json::Value;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl DeliveryTransport for RecordingTransport {
        fn deliver<'a>(
            &'a self,
            inbox_url: &'a str,
            payload: &'a [u8],
        ) -> BoxFuture<'a, Result<(), DeliveryError>> {
            Box::pin(async move {
                let activity = serde_json::from_slice(payload).unwrap();
                self.sent
                    .lock()
                    .unwrap()
                    .push((inbox_url.to_string(), activity));
                Ok(())
            })
        }
    }

    struct Fixture {
        service: MembershipService,
        db: Arc<Database>,
        dispatcher: Arc<DeliveryDispatcher>,
        transport: Arc<RecordingTransport>,
        _dir: TempDir,
    }

    async fn fixture(manual_approval: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&dir.path().join("relay.db")).await.unwrap());
        let (events, _) = EventSink::channel(8);
        let handshake = Arc::new(Handshake::new(
            db.clone(),
            RelayActor::from_base_url("https://relay.example"),
            RelayConfig {
                manual_approval,
                ..RelayConfig::default()
            },
            events,
        ));
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Arc::new(DeliveryDispatcher::spawn(
            &DeliveryConfig::default(),
            transport.clone(),
        ));
        Fixture {
            service: MembershipService::new(db.clone(), handshake, dispatcher.clone()),
            db,
            dispatcher,
            transport,
            _dir: dir,
        }
    }

    async fn insert_subscriber(db: &Database, domain: &str, state: MembershipState) {
        db.upsert_subscriber(&Subscriber {
            domain: domain.to_string(),
            activity_id: format!("https://{domain}/follows/1"),
            actor_id: format!("https://{domain}/actor"),
            inbox_url: format!("https://{domain}/inbox"),
            state,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn approve_sends_accept_and_activates() {
        let f = fixture(true).await;
        insert_subscriber(&f.db, "p.example", MembershipState::Pending).await;

        assert!(f.service.approve("p.example").await.unwrap());
        assert!(!f.service.approve("p.example").await.unwrap());
        f.dispatcher.shutdown().await;

        let sent = f.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://p.example/inbox");
        assert_eq!(sent[0].1["type"], "Accept");
        assert_eq!(sent[0].1["object"]["object"], PUBLIC_AUDIENCE);
        drop(sent);

        let subscriber = f.db.get_subscriber("p.example").await.unwrap().unwrap();
        assert_eq!(subscriber.state, MembershipState::Active);
    }

    #[tokio::test]
    async fn deny_sends_reject_and_forgets() {
        let f = fixture(true).await;
        insert_subscriber(&f.db, "p.example", MembershipState::Pending).await;

        assert!(f.service.deny("p.example").await.unwrap());
        f.dispatcher.shutdown().await;

        assert_eq!(f.transport.sent.lock().unwrap()[0].1["type"], "Reject");
        assert!(f.db.get_subscriber("p.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unfollow_unknown_domain_sends_nothing() {
        let f = fixture(false).await;
        assert!(!f.service.unfollow("nobody.example").await.unwrap());
        f.dispatcher.shutdown().await;
        assert!(f.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn block_evicts_member_and_lists_block() {
        let f = fixture(false).await;
        insert_subscriber(&f.db, "a.example", MembershipState::Active).await;

        f.service.block("A.Example").await.unwrap();
        f.dispatcher.shutdown().await;

        assert_eq!(f.service.blocked_domains().await.unwrap(), vec!["a.example"]);
        assert!(f.service.subscribers().await.unwrap().is_empty());
        assert_eq!(f.transport.sent.lock().unwrap()[0].1["type"], "Reject");

        assert!(f.service.unblock("a.example").await.unwrap());
        assert!(f.service.blocked_domains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counts_reflect_registry() {
        let f = fixture(false).await;
        insert_subscriber(&f.db, "a.example", MembershipState::Active).await;
        insert_subscriber(&f.db, "p.example", MembershipState::Pending).await;

        let counts = f.service.counts().await.unwrap();
        assert_eq!(counts.active_subscribers, 1);
        assert_eq!(counts.pending_subscribers, 1);
        assert_eq!(counts.followers, 0);
        assert_eq!(f.service.pending_subscribers().await.unwrap().len(), 1);
    }
}
