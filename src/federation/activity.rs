//! Activity model
//!
//! Decoded inbound activities and actors, plus the builders for the
//! activities the relay emits itself.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

/// Well-known public audience collection
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// ActivityPub Activity types the relay distinguishes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Follow,
    Undo,
    Accept,
    Reject,
    Announce,
    Create,
    Update,
    Delete,
    Move,
    Other(String),
}

impl ActivityType {
    /// Parse activity type from string
    pub fn parse(s: &str) -> Self {
        match s {
            "Follow" => Self::Follow,
            "Undo" => Self::Undo,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Announce" => Self::Announce,
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Move" => Self::Move,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Follow => "Follow",
            Self::Undo => "Undo",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Announce => "Announce",
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Move => "Move",
            Self::Other(other) => other,
        }
    }

    /// Content-carrying types relayed from the public-broadcast dialect
    pub fn is_broadcastable(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete | Self::Move)
    }
}

impl<'de> Deserialize<'de> for ActivityType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept both a single string and an array of strings for audience fields.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<Value>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(single)) => vec![single],
        Some(OneOrMany::Many(values)) => values
            .into_iter()
            .filter_map(|value| match value {
                Value::String(s) => Some(s),
                Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
    })
}

/// The actor field may be a bare URI or an embedded object with an `id`.
fn uri_or_object_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Object(map)) => map
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    })
}

/// A decoded federation message
///
/// Immutable once decoded. `object` is kept as raw JSON because it is
/// polymorphic: a URI, an embedded object, or a nested activity.
#[derive(Debug, Clone, Deserialize)]
pub struct Activity {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(default, deserialize_with = "uri_or_object_id")]
    pub actor: String,
    #[serde(default)]
    pub object: Option<Value>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default)]
    pub published: Option<String>,
}

/// Nested activity could not be extracted from an Undo/Accept/Reject
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnwrapError {
    #[error("activity has no object")]
    MissingObject,
    #[error("object is a bare reference, not an embedded activity")]
    BareReference,
    #[error("embedded object is not a well-formed activity: {0}")]
    Malformed(String),
}

impl Activity {
    /// Parse an activity from raw JSON bytes.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// True when `uri` appears in `to` or `cc`.
    pub fn is_addressed_to(&self, uri: &str) -> bool {
        self.to.iter().chain(self.cc.iter()).any(|r| r == uri)
    }

    /// The object as a bare URI, when it is one.
    pub fn object_uri(&self) -> Option<&str> {
        self.object.as_ref().and_then(Value::as_str)
    }

    /// The id of the object, whether it is a URI or embedded.
    pub fn object_id(&self) -> Option<&str> {
        match self.object.as_ref()? {
            Value::String(uri) => Some(uri),
            Value::Object(map) => map.get("id").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Extract the nested activity of an Undo/Accept/Reject.
    pub fn unwrap_inner_activity(&self) -> Result<Activity, UnwrapError> {
        match self.object.as_ref() {
            None | Some(Value::Null) => Err(UnwrapError::MissingObject),
            Some(Value::String(_)) => Err(UnwrapError::BareReference),
            Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
                .map_err(|e| UnwrapError::Malformed(e.to_string())),
            Some(_) => Err(UnwrapError::Malformed(
                "object is neither a string nor a map".to_string(),
            )),
        }
    }

    /// Raw `published` timestamp from the activity, or failing that its
    /// embedded object.
    pub fn published_raw(&self) -> Option<&str> {
        if let Some(published) = self.published.as_deref().filter(|p| !p.is_empty()) {
            return Some(published);
        }
        self.object
            .as_ref()
            .and_then(|object| object.get("published"))
            .and_then(Value::as_str)
    }

    /// Parsed `published` timestamp, if present and in an accepted format.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_raw().and_then(parse_published)
    }

    /// Host part of the actor URI, lowercased.
    pub fn actor_domain(&self) -> Option<String> {
        host_of(&self.actor)
    }
}

/// Parse the timestamp formats seen in the wild.
///
/// RFC 3339 covers both second and fractional precision with an offset;
/// offset-less `Z`-suffixed forms fall through to the naive parsers.
pub fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.fZ", "%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Lowercased host of a URI.
pub fn host_of(uri: &str) -> Option<String> {
    url::Url::parse(uri)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ActorEndpoints {
    #[serde(rename = "sharedInbox", default)]
    pub shared_inbox: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActorPublicKey {
    pub id: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(rename = "publicKeyPem")]
    pub public_key_pem: String,
}

/// Resolved identity of a remote sender
#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(rename = "preferredUsername", default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub inbox: String,
    #[serde(default)]
    pub endpoints: Option<ActorEndpoints>,
    #[serde(rename = "publicKey", default)]
    pub public_key: Option<ActorPublicKey>,
}

impl Actor {
    pub fn domain(&self) -> Option<String> {
        host_of(&self.id)
    }

    /// Shared inbox when advertised, personal inbox otherwise.
    pub fn delivery_inbox(&self) -> &str {
        self.endpoints
            .as_ref()
            .and_then(|endpoints| endpoints.shared_inbox.as_deref())
            .filter(|inbox| !inbox.is_empty())
            .unwrap_or(&self.inbox)
    }
}

/// The relay's own identity, derived from configuration at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayActor {
    pub id: String,
    pub inbox: String,
    pub key_id: String,
}

impl RelayActor {
    pub fn from_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let id = format!("{base}/actor");
        Self {
            inbox: format!("{base}/inbox"),
            key_id: format!("{id}#main-key"),
            id,
        }
    }

    /// Fresh unique id for an activity the relay originates.
    pub fn new_activity_id(&self) -> String {
        format!("{}/activities/{}", self.id, ulid::Ulid::new())
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use super::{Activity, RelayActor};
    use serde_json::Value;

    /// Kinds of reply the relay sends to a Follow
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ReplyKind {
        Accept,
        Reject,
    }

    impl ReplyKind {
        pub fn as_str(&self) -> &'static str {
            match self {
                ReplyKind::Accept => "Accept",
                ReplyKind::Reject => "Reject",
            }
        }
    }

    /// Minimal embedding of the activity being replied to.
    ///
    /// The original `id` is carried over unchanged so the peer can
    /// correlate the reply with its request.
    pub fn embed(id: &str, kind: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "id": id,
            "type": kind,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept or Reject addressed back to `recipient`.
    pub fn reply(relay: &RelayActor, kind: ReplyKind, object: Value, recipient: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": relay.new_activity_id(),
            "type": kind.as_str(),
            "actor": relay.id,
            "object": object,
            "to": [recipient]
        })
    }

    /// Reply to a received activity.
    pub fn reply_to(relay: &RelayActor, original: &Activity, kind: ReplyKind) -> Value {
        let object = embed(
            &original.id,
            original.kind.as_str(),
            &original.actor,
            original.object.clone().unwrap_or(Value::Null),
        );
        reply(relay, kind, object, &original.actor)
    }

    /// Build the relay's own Follow, used to follow back a mutual follower.
    pub fn follow(relay: &RelayActor, target_actor: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": relay.new_activity_id(),
            "type": "Follow",
            "actor": relay.id,
            "object": target_actor,
            "to": [target_actor]
        })
    }
}
