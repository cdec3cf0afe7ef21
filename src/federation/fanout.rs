//! Fan-out
//!
//! Expands one qualifying activity into one delivery job per registered
//! server. The destination set is read once from the store; jobs created
//! from that snapshot are independent of later membership changes.

use std::collections::HashSet;
use std::sync::Arc;

use super::activity::ActivityType;
use super::addressing::Dialect;
use super::delivery::DeliveryJob;
use crate::data::{Database, DeliveryTarget};
use crate::error::AppError;

/// Kind of rebroadcast an inbound activity qualifies for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutKind {
    /// Public Create/Update/Delete/Move, sent to active subscribers
    Broadcast,
    /// Relay-directed Announce, resolved and sent to subscribers and followers
    Announce,
    None,
}

pub fn fan_out_kind(dialect: Dialect, kind: &ActivityType) -> FanOutKind {
    match (dialect, kind) {
        (Dialect::PublicBroadcast, kind) if kind.is_broadcastable() => FanOutKind::Broadcast,
        (Dialect::RelayDirected, ActivityType::Announce) => FanOutKind::Announce,
        _ => FanOutKind::None,
    }
}

/// Build one job per target, skipping the origin domain and repeated inboxes.
pub fn jobs_for_targets(
    targets: Vec<DeliveryTarget>,
    origin_domain: Option<&str>,
    payload: Arc<[u8]>,
) -> Vec<DeliveryJob> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|target| origin_domain != Some(target.domain.as_str()))
        .filter(|target| seen.insert(target.inbox_url.clone()))
        .map(|target| DeliveryJob::new(target.inbox_url, payload.clone()))
        .collect()
}

/// Fan-out engine
pub struct FanOut {
    db: Arc<Database>,
}

impl FanOut {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Rebroadcast the original bytes to every active subscriber but the origin.
    pub async fn broadcast(
        &self,
        origin_domain: &str,
        payload: Arc<[u8]>,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let targets = self.db.delivery_targets(false).await?;
        let jobs = jobs_for_targets(targets, Some(origin_domain), payload);
        tracing::debug!(origin = %origin_domain, destinations = jobs.len(), "Broadcast fan-out");
        Ok(jobs)
    }

    /// Send a resolved announced object to subscribers and followers.
    pub async fn announce(
        &self,
        announcer_domain: &str,
        payload: Arc<[u8]>,
    ) -> Result<Vec<DeliveryJob>, AppError> {
        let targets = self.db.delivery_targets(true).await?;
        let jobs = jobs_for_targets(targets, Some(announcer_domain), payload);
        tracing::debug!(
            announcer = %announcer_domain,
            destinations = jobs.len(),
            "Announce fan-out"
        );
        Ok(jobs)
    }
}
