use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::buffer::BufferContext;
use crate::config::{BatchConfig, ValidationError};
use crate::errors::{BatchError, Result};
use crate::inflight::InFlight;
use crate::metrics_defs::MEASUREMENTS_ACCEPTED;
use crate::registry::Registry;
use crate::service::{ForwardResponse, ForwardingService};
use crate::timer::{TimerFactory, TokioTimerFactory};
use crate::types::{RoutingKey, StatPayload};
use shared::counter;

/// Batches payloads per routing key in front of a forwarding service.
///
/// `forward` hands a payload to the buffer for its source, node and zone and
/// reports it as accepted straight away. Buffers flush to the wrapped service
/// when they fill up, when their oldest measurement has waited for the
/// configured delay, or when a payload cannot share a batch with what is
/// already buffered. Delivery is best effort: failures after acceptance are
/// logged, never reported back to the caller.
pub struct BatchingForwarder {
    service: Arc<dyn ForwardingService>,
    registry: Registry,
    in_flight: Arc<InFlight>,
    shutdown_timeout: Option<Duration>,
    closed: AtomicBool,
    // Held for the whole drain; true once the service has been closed.
    drained: Mutex<bool>,
}

impl BatchingForwarder {
    pub fn new(
        config: BatchConfig,
        service: Arc<dyn ForwardingService>,
    ) -> Result<Self, ValidationError> {
        Self::with_timers(config, service, Arc::new(TokioTimerFactory))
    }

    /// Creates a forwarder whose buffers get their flush timers from `timers`.
    pub fn with_timers(
        config: BatchConfig,
        service: Arc<dyn ForwardingService>,
        timers: Arc<dyn TimerFactory>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;

        let in_flight = Arc::new(InFlight::new());
        let context = BufferContext::new(&config, service.clone(), timers, in_flight.clone());

        Ok(Self {
            service,
            registry: Registry::new(context),
            in_flight,
            shutdown_timeout: config.shutdown_timeout(),
            closed: AtomicBool::new(false),
            drained: Mutex::new(false),
        })
    }

    /// Queues `payload` for batching and reports all of its measurements as accepted.
    ///
    /// Only waits if the buffer's input queue is full, never on delivery.
    pub async fn forward(&self, payload: StatPayload) -> Result<ForwardResponse> {
        let key = RoutingKey::for_payload(&payload)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::Closed);
        }

        let accepted = payload.measurements.len();
        if accepted == 0 {
            return Ok(ForwardResponse { accepted });
        }

        let sender = self.registry.lookup_or_create(&key)?;
        sender.send(payload).await.map_err(|_| BatchError::Closed)?;

        counter!(MEASUREMENTS_ACCEPTED).increment(accepted as u64);
        Ok(ForwardResponse { accepted })
    }

    /// Runs a query against the wrapped service.
    pub async fn query(&self, request: serde_json::Value) -> Result<serde_json::Value> {
        Ok(self.service.query(request).await?)
    }

    /// Flushes every buffer, waits for all forwards to complete and closes the
    /// wrapped service.
    ///
    /// Calls made while a drain is running wait for it to finish. Once the
    /// service is closed, later calls return immediately. After a
    /// [`BatchError::DrainTimeout`] the next call waits for the remaining
    /// forwards again.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);

        let mut drained = self.drained.lock().await;
        if *drained {
            return Ok(());
        }

        let buffers = self.registry.close_all();
        tracing::info!(buffers = buffers.len(), "Draining batch buffers");

        let drain = async {
            for buffer in buffers {
                if let Err(e) = buffer.await {
                    tracing::error!("Batch buffer task failed: {}", e);
                }
            }
            self.in_flight.wait_idle().await;
        };

        match self.shutdown_timeout {
            Some(limit) => tokio::time::timeout(limit, drain).await.map_err(|_| {
                BatchError::DrainTimeout {
                    pending: self.in_flight.count(),
                }
            })?,
            None => drain.await,
        }

        tracing::info!(service = self.service.name(), "Batches drained, closing service");
        self.service.close().await?;
        *drained = true;
        Ok(())
    }

    /// Number of forward calls that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    /// Number of routing keys with a live batch buffer.
    pub fn buffer_count(&self) -> usize {
        self.registry.len()
    }
}
