use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Smallest input queue handed to a batch buffer, whatever the batch size.
const MIN_QUEUE_CAPACITY: usize = 16;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("max_accumulation_delay_secs must be at least 1 second")]
    InvalidMaxDelay,

    #[error("max_batch_size must be at least 1")]
    InvalidMaxBatchSize,

    #[error("queue_capacity cannot be 0")]
    InvalidQueueCapacity,
}

/// Batching configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Longest time a measurement may wait in a buffer before it is flushed
    #[serde(default = "default_max_delay_secs")]
    pub max_accumulation_delay_secs: u64,
    /// Number of measurements that triggers an immediate flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Depth of each buffer's input queue, in payloads
    ///
    /// Defaults to twice `max_batch_size` so that callers are not held up by
    /// a buffer that is busy flushing.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Upper bound on how long `close` waits for buffered and in-flight batches
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
}

fn default_max_delay_secs() -> u64 {
    1
}

fn default_max_batch_size() -> usize {
    1000
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_accumulation_delay_secs: default_max_delay_secs(),
            max_batch_size: default_max_batch_size(),
            queue_capacity: None,
            shutdown_timeout_secs: None,
        }
    }
}

impl BatchConfig {
    /// Validates the batching configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_accumulation_delay_secs < 1 {
            return Err(ValidationError::InvalidMaxDelay);
        }

        if self.max_batch_size < 1 {
            return Err(ValidationError::InvalidMaxBatchSize);
        }

        if self.queue_capacity == Some(0) {
            return Err(ValidationError::InvalidQueueCapacity);
        }

        Ok(())
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_accumulation_delay_secs)
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or_else(|| {
            self.max_batch_size
                .saturating_mul(2)
                .max(MIN_QUEUE_CAPACITY)
        })
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.map(Duration::from_secs)
    }
}
