use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

use crate::errors::ForwardError;
use crate::service::{ForwardResponse, ForwardingService};
use crate::types::{Measurement, StatPayload};

/// Forwarding service that records every batch it is given.
///
/// Batches are recorded as soon as `forward` is called. A gated forwarder then
/// holds every call open until the gate receives a permit.
pub struct RecordingForwarder {
    tx: mpsc::UnboundedSender<StatPayload>,
    gate: Option<Arc<Semaphore>>,
    failing: AtomicBool,
    completed: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingForwarder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StatPayload>) {
        Self::build(None)
    }

    pub fn gated() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<StatPayload>,
        Arc<Semaphore>,
    ) {
        let gate = Arc::new(Semaphore::new(0));
        let (forwarder, rx) = Self::build(Some(gate.clone()));
        (forwarder, rx, gate)
    }

    fn build(gate: Option<Arc<Semaphore>>) -> (Arc<Self>, mpsc::UnboundedReceiver<StatPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = Arc::new(Self {
            tx,
            gate,
            failing: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        (forwarder, rx)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of forward calls that ran to completion.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ForwardingService for RecordingForwarder {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn forward(&self, payload: &StatPayload) -> Result<ForwardResponse, ForwardError> {
        let _ = self.tx.send(payload.clone());

        if let Some(gate) = &self.gate {
            // The permit goes back on drop, so one release opens the gate for everyone
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| ForwardError::Upstream(e.to_string()))?;
        }

        self.completed.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(ForwardError::Upstream("recording forwarder is failing".into()));
        }

        Ok(ForwardResponse {
            accepted: payload.measurements.len(),
        })
    }

    async fn query(
        &self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, ForwardError> {
        Ok(serde_json::json!({ "echo": request }))
    }

    async fn close(&self) -> Result<(), ForwardError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Builds a payload with one value measurement per name.
pub fn payload_with(source: &str, zone: &str, names: &[&str]) -> StatPayload {
    StatPayload::new(source, zone).with_measurements(
        names
            .iter()
            .map(|name| Measurement::value(*name, 1_700_000_000_000, 1.0)),
    )
}

pub async fn recv_batch(rx: &mut mpsc::UnboundedReceiver<StatPayload>) -> StatPayload {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for a batch")
        .expect("forwarder dropped")
}

pub async fn assert_no_batch(rx: &mut mpsc::UnboundedReceiver<StatPayload>) {
    let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(result.is_err(), "unexpected batch: {result:?}");
}
