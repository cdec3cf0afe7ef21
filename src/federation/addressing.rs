//! Addressing classification
//!
//! Maps an inbound activity's recipients onto one of three routing
//! dialects. Pure: the follower inbox set is a snapshot taken by the caller.

use std::collections::HashSet;

use super::activity::{Activity, PUBLIC_AUDIENCE};

/// Addressing convention an inbound activity follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Addressed to the public audience
    PublicBroadcast,
    /// Addressed to the relay actor or to a known follower's inbox
    RelayDirected,
    /// Neither
    Unaddressed,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::PublicBroadcast => "public_broadcast",
            Dialect::RelayDirected => "relay_directed",
            Dialect::Unaddressed => "unaddressed",
        }
    }
}

/// Classify an activity. First match wins: public, then relay-directed.
pub fn classify(activity: &Activity, relay_id: &str, follower_inboxes: &HashSet<String>) -> Dialect {
    let mut recipients = activity.to.iter().chain(activity.cc.iter());

    if activity.is_addressed_to(PUBLIC_AUDIENCE) {
        Dialect::PublicBroadcast
    } else if recipients.any(|r| r == relay_id || follower_inboxes.contains(r)) {
        Dialect::RelayDirected
    } else {
        Dialect::Unaddressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RELAY: &str = "https://relay.example/actor";

    fn activity(to: serde_json::Value, cc: serde_json::Value) -> Activity {
        serde_json::from_value(json!({
            "type": "Create",
            "actor": "https://a.example/u",
            "to": to,
            "cc": cc
        }))
        .unwrap()
    }

    fn followers() -> HashSet<String> {
        HashSet::from(["https://b.example/inbox".to_string()])
    }

    #[test]
    fn public_audience_wins_over_relay_id() {
        let both = activity(json!([RELAY]), json!([PUBLIC_AUDIENCE]));
        assert_eq!(classify(&both, RELAY, &followers()), Dialect::PublicBroadcast);
    }

    #[test]
    fn relay_id_or_follower_inbox_is_relay_directed() {
        let to_relay = activity(json!([RELAY]), json!([]));
        assert_eq!(classify(&to_relay, RELAY, &HashSet::new()), Dialect::RelayDirected);

        let to_follower = activity(json!([]), json!(["https://b.example/inbox"]));
        assert_eq!(classify(&to_follower, RELAY, &followers()), Dialect::RelayDirected);
    }

    #[test]
    fn anything_else_is_unaddressed() {
        let other = activity(json!(["https://c.example/u"]), json!([]));
        assert_eq!(classify(&other, RELAY, &followers()), Dialect::Unaddressed);

        let empty = activity(json!(null), json!(null));
        assert_eq!(classify(&empty, RELAY, &followers()), Dialect::Unaddressed);
    }

    #[test]
    fn classification_is_total_over_recipient_combinations() {
        let candidates = [PUBLIC_AUDIENCE, RELAY, "https://b.example/inbox", "https://c.example/u"];
        for to in &candidates {
            for cc in &candidates {
                let dialect = classify(&activity(json!([to]), json!([cc])), RELAY, &followers());
                let expected = if *to == PUBLIC_AUDIENCE || *cc == PUBLIC_AUDIENCE {
                    Dialect::PublicBroadcast
                } else if [to, cc].iter().any(|r| **r != "https://c.example/u") {
                    Dialect::RelayDirected
                } else {
                    Dialect::Unaddressed
                };
                assert_eq!(dialect, expected, "to={to} cc={cc}");
            }
        }
    }
}
