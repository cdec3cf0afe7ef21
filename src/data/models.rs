//! Data models
//!
//! Rust structs representing the relay's membership registry.
//! Every record is keyed by the remote server's domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Membership
// =============================================================================

/// Which registry collection a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Followed the relay with the public-audience convention
    Subscriber,
    /// Followed the relay actor directly and is followed back
    Follower,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Subscriber => "subscriber",
            Collection::Follower => "follower",
        }
    }
}

/// Admission state of a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    /// Awaiting manual approval, receives nothing
    Pending,
    /// Receives rebroadcasts
    Active,
}

impl MembershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipState::Pending => "pending",
            MembershipState::Active => "active",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MembershipState::Pending),
            "active" => Some(MembershipState::Active),
            _ => None,
        }
    }
}

/// Server registered through the public-audience Follow convention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub domain: String,
    /// Id of the Follow activity that created this record
    pub activity_id: String,
    pub actor_id: String,
    pub inbox_url: String,
    pub state: MembershipState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Server registered through a Follow addressed at the relay actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follower {
    pub domain: String,
    /// Id of the Follow activity that created this record
    pub activity_id: String,
    pub actor_id: String,
    pub inbox_url: String,
    /// Set once the peer has accepted the relay's own follow-back
    pub mutual: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registry record from either collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    Subscriber(Subscriber),
    Follower(Follower),
}

impl Member {
    pub fn collection(&self) -> Collection {
        match self {
            Member::Subscriber(_) => Collection::Subscriber,
            Member::Follower(_) => Collection::Follower,
        }
    }

    pub fn domain(&self) -> &str {
        match self {
            Member::Subscriber(s) => &s.domain,
            Member::Follower(f) => &f.domain,
        }
    }

    /// Pending subscribers are registered but not yet members in good standing.
    pub fn is_active(&self) -> bool {
        match self {
            Member::Subscriber(s) => s.state == MembershipState::Active,
            Member::Follower(_) => true,
        }
    }
}

/// A destination captured by a fan-out snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTarget {
    pub domain: String,
    pub inbox_url: String,
}

/// Registry sizes, used for gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipCounts {
    pub active_subscribers: i64,
    pub pending_subscribers: i64,
    pub followers: i64,
}

/// Persisted relay signing key
#[derive(Debug, Clone)]
pub struct RelayKey {
    pub private_key_pem: String,
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// Normalize a domain for use as a registry key.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}
