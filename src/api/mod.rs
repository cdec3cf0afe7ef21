//! API layer
//!
//! HTTP handlers for:
//! - The relay inbox (federation)
//! - Metrics (Prometheus)

mod inbox;
pub mod metrics;

pub use inbox::inbox_router;
pub use metrics::metrics_router;
