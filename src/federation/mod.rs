//! Federation module
//!
//! Handles:
//! - Activity model and relay-authored replies
//! - Addressing classification
//! - Follow handshake and membership changes
//! - Fan-out and signed delivery with retry
//! - HTTP Signatures
//! - Remote actor/object fetching

pub mod activity;
pub mod addressing;
pub mod delivery;
pub mod fanout;
pub mod fetch;
pub mod handshake;
pub mod inbox;
pub mod notify;
pub mod signature;

pub use activity::{Activity, ActivityType, Actor, PUBLIC_AUDIENCE, RelayActor};
pub use addressing::{Dialect, classify};
pub use delivery::{
    DeliveryDispatcher, DeliveryError, DeliveryJob, DeliveryStatsSnapshot, DeliveryTransport,
    HttpTransport, RetryPolicy,
};
pub use fanout::{FanOut, FanOutKind, fan_out_kind};
pub use fetch::{ActorCache, FetchError, FetchedActivity, HttpFetcher, RemoteFetcher};
pub use handshake::{Handshake, HandshakeOutcome, Removal, Reply, Transition, Verdict, transition};
pub use inbox::{InboundActivity, InboxRouter, RouteOutcome, decode_inbound};
pub use notify::{EventSink, RelayEvent};
pub use signature::{
    RequestSigner, generate_digest, generate_key_pair, key_id_matches_actor,
    parse_signature_header, sign_request, verify_signature,
};
