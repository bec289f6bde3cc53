//! Stat batching in front of a forwarding service.
//!
//! Payloads are grouped by routing key (source, node, zone). Each key gets its
//! own batch buffer task that merges compatible payloads into one batch and
//! flushes it to the [`ForwardingService`] when the batch is full, when its
//! oldest measurement has waited long enough, or when an incompatible payload
//! arrives.
//!
//! ```text
//! caller ─▶ BatchingForwarder ─▶ Registry ─▶ BatchBuffer (one task per key)
//!                                                 │ flush
//!                                                 ▼
//!                                         ForwardingService::forward
//! ```

pub mod buffer;
pub mod config;
pub mod errors;
pub mod forwarder;
pub mod inflight;
pub mod merge;
pub mod metrics_defs;
pub mod registry;
pub mod service;
pub mod timer;
pub mod types;

#[cfg(test)]
mod testutils;

pub use config::{BatchConfig, ValidationError};
pub use errors::{BatchError, ForwardError};
pub use forwarder::BatchingForwarder;
pub use service::{ForwardResponse, ForwardingService};
pub use types::{Measurement, ProxyIdentity, RoutingKey, Sample, StatPayload};
