use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ForwardError;
use crate::types::StatPayload;

/// Number of measurements a forward accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub accepted: usize,
}

/// Delivery backend that the batcher flushes into.
///
/// The batcher runs every `forward` call on its own task, so implementations may
/// take as long as the network requires without holding up batching.
#[async_trait]
pub trait ForwardingService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delivers one flushed batch.
    async fn forward(&self, payload: &StatPayload) -> Result<ForwardResponse, ForwardError>;

    /// Runs a query against the backend. Passed through unmodified by the batcher.
    async fn query(
        &self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, ForwardError>;

    /// Releases the backend once every batch has been delivered.
    async fn close(&self) -> Result<(), ForwardError>;
}
