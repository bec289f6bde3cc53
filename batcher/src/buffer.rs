//! Per-routing-key batch buffer.
//!
//! Each buffer is a single task that owns its accumulation window, its flush
//! timer and the receiving end of its input queue. Nothing else touches the
//! window, so the loop needs no locking.
//!
//! # States
//!
//! ```text
//!            payload                     size / incompatible
//!   Idle ─────────────────▶ Accumulating ───────────────────┐
//!    ▲                          │    ▲                      │ flush
//!    │       timer fired        │    └──────────────────────┘
//!    └──────────────────────────┘      (remainder or new window)
//!
//!   queue closed: flush whatever is accumulated, then stop
//! ```
//!
//! Flushed batches are handed to a delivery task owned by the buffer, which
//! forwards them one at a time in flush order. Buffers for different keys
//! deliver concurrently.
//!
//! The timer is armed only when a window opens. Payloads merged into an open
//! window never move its deadline.
//!
//! When a payload and a timer expiry are both ready the payload is handled
//! first. A size flush caused by that payload stops the timer and the stale
//! expiry is discarded; otherwise the expiry flushes a window that now includes
//! the payload. Either way a single flush results.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BatchConfig;
use crate::inflight::{InFlight, InFlightGuard};
use crate::merge::{Fragment, MergeOutcome};
use crate::metrics_defs::{FLUSH_SIZE, FLUSHES, FORWARD_FAILURES};
use crate::service::ForwardingService;
use crate::timer::{FlushTimer, TimerFactory};
use crate::types::{RoutingKey, StatPayload};
use shared::{counter, histogram};

/// Why a window was flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushReason {
    /// The window reached the maximum batch size
    Size,
    /// The maximum accumulation delay elapsed
    Delay,
    /// An incoming payload could not be merged into the window
    Incompatible,
    /// The input queue was closed
    Shutdown,
}

impl FlushReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Delay => "delay",
            FlushReason::Incompatible => "incompatible",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// Everything a new buffer needs besides its routing key.
#[derive(Clone)]
pub struct BufferContext {
    pub service: Arc<dyn ForwardingService>,
    pub timers: Arc<dyn TimerFactory>,
    pub in_flight: Arc<InFlight>,
    pub max_delay: Duration,
    pub max_batch_size: usize,
    pub queue_capacity: usize,
}

impl BufferContext {
    pub fn new(
        config: &BatchConfig,
        service: Arc<dyn ForwardingService>,
        timers: Arc<dyn TimerFactory>,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            service,
            timers,
            in_flight,
            max_delay: config.max_delay(),
            max_batch_size: config.max_batch_size,
            queue_capacity: config.queue_capacity(),
        }
    }
}

/// Handle to a running batch buffer.
pub struct BatchBuffer {
    tx: mpsc::Sender<StatPayload>,
    handle: JoinHandle<()>,
}

impl BatchBuffer {
    /// Starts the buffer task for `key`. Must be called from within a tokio runtime.
    pub fn spawn(key: RoutingKey, context: &BufferContext) -> Self {
        let (tx, rx) = mpsc::channel(context.queue_capacity);
        let delivery = Delivery::spawn(key.clone(), context.service.clone());

        let actor = BufferActor {
            timer: context.timers.create(&key),
            key,
            rx,
            state: BufferState::Idle,
            delivery,
            in_flight: context.in_flight.clone(),
            max_delay: context.max_delay,
            max_batch_size: context.max_batch_size,
        };
        let handle = tokio::spawn(actor.run());

        Self { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<StatPayload> {
        self.tx.clone()
    }

    /// Closes the input queue. The returned task completes once the buffer has
    /// flushed what it holds and every flushed batch has been forwarded, as soon
    /// as any outstanding senders are dropped.
    pub fn close(self) -> JoinHandle<()> {
        drop(self.tx);
        self.handle
    }
}

enum BufferState {
    Idle,
    Accumulating(Fragment),
}

struct BufferActor {
    key: RoutingKey,
    rx: mpsc::Receiver<StatPayload>,
    timer: Box<dyn FlushTimer>,
    state: BufferState,
    delivery: Delivery,
    in_flight: Arc<InFlight>,
    max_delay: Duration,
    max_batch_size: usize,
}

impl BufferActor {
    async fn run(mut self) {
        tracing::debug!(key = %self.key, "Batch buffer started");

        loop {
            tokio::select! {
                biased;

                received = self.rx.recv() => match received {
                    Some(payload) => self.on_payload(payload),
                    None => break,
                },
                _ = self.timer.fired() => self.on_timer(),
            }
        }

        self.on_close();

        let Delivery { tx, handle } = self.delivery;
        drop(tx);
        if let Err(e) = handle.await {
            tracing::error!(key = %self.key, "Batch delivery task failed: {}", e);
        }
        tracing::debug!(key = %self.key, "Batch buffer stopped");
    }

    fn on_payload(&mut self, payload: StatPayload) {
        let incoming = Fragment::from(payload);

        // Whether the measurements now buffered belong to a window that has no deadline yet
        let (mut window, mut opened) = match std::mem::replace(&mut self.state, BufferState::Idle) {
            BufferState::Idle => (incoming, true),
            BufferState::Accumulating(mut current) => match current.merge(incoming) {
                MergeOutcome::Merged => (current, false),
                MergeOutcome::Incompatible { reason, incoming } => {
                    tracing::debug!(key = %self.key, %reason, "Payload incompatible with open batch");
                    self.flush(current, FlushReason::Incompatible);
                    (incoming, true)
                }
            },
        };

        while window.len() >= self.max_batch_size {
            let batch = window.split_head(self.max_batch_size);
            self.flush(batch, FlushReason::Size);
            opened = true;
        }

        if window.is_empty() {
            self.timer.stop();
            return;
        }

        if opened {
            self.timer.reset(self.max_delay);
        }
        self.state = BufferState::Accumulating(window);
    }

    fn on_timer(&mut self) {
        if let BufferState::Accumulating(window) =
            std::mem::replace(&mut self.state, BufferState::Idle)
        {
            self.flush(window, FlushReason::Delay);
        }
    }

    fn on_close(&mut self) {
        self.timer.stop();
        if let BufferState::Accumulating(window) =
            std::mem::replace(&mut self.state, BufferState::Idle)
        {
            self.flush(window, FlushReason::Shutdown);
        }
    }

    /// Queues the window for delivery behind every batch flushed before it.
    ///
    /// Delivery failures are logged with the full payload and otherwise dropped.
    fn flush(&self, window: Fragment, reason: FlushReason) {
        let payload = window.into_payload(&self.key);
        let size = payload.measurements.len();

        counter!(FLUSHES, "reason" => reason.as_str()).increment(1);
        histogram!(FLUSH_SIZE).record(size as f64);
        tracing::debug!(key = %self.key, reason = reason.as_str(), size, "Flushing batch");

        let guard = self.in_flight.begin();
        if let Err(mpsc::error::SendError((payload, _guard))) =
            self.delivery.tx.send((payload, guard))
        {
            counter!(FORWARD_FAILURES).increment(1);
            tracing::error!(key = %self.key, ?payload, "Delivery task is gone, dropping batch");
        }
    }
}

type Queued = (StatPayload, InFlightGuard);

/// Forwards a buffer's flushed batches in the order they were flushed.
struct Delivery {
    tx: mpsc::UnboundedSender<Queued>,
    handle: JoinHandle<()>,
}

impl Delivery {
    fn spawn(key: RoutingKey, service: Arc<dyn ForwardingService>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(deliver(key, service, rx));
        Self { tx, handle }
    }
}

/// Runs until the buffer drops its sender and the queue is empty.
async fn deliver(
    key: RoutingKey,
    service: Arc<dyn ForwardingService>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
) {
    while let Some((payload, _guard)) = rx.recv().await {
        match service.forward(&payload).await {
            Ok(response) => tracing::trace!(
                %key,
                service = service.name(),
                accepted = response.accepted,
                "Batch forwarded"
            ),
            Err(error) => {
                counter!(FORWARD_FAILURES).increment(1);
                tracing::error!(
                    %key,
                    service = service.name(),
                    %error,
                    ?payload,
                    "Failed to forward batch"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{RecordingForwarder, assert_no_batch, payload_with, recv_batch};
    use crate::timer::manual::{ManualTimerHandle, ManualTimers};
    use crate::types::ProxyIdentity;

    fn key() -> RoutingKey {
        RoutingKey::new("s1", "s1", "z1")
    }

    fn spawn_buffer(
        max_batch_size: usize,
        service: Arc<RecordingForwarder>,
    ) -> (BatchBuffer, ManualTimerHandle, Arc<InFlight>) {
        let timers = ManualTimers::default();
        let in_flight = Arc::new(InFlight::new());
        let config = BatchConfig {
            max_accumulation_delay_secs: 5,
            max_batch_size,
            ..Default::default()
        };
        let context = BufferContext::new(
            &config,
            service,
            Arc::new(timers.clone()),
            in_flight.clone(),
        );
        let buffer = BatchBuffer::spawn(key(), &context);
        let handle = timers.handle(&key()).unwrap();
        (buffer, handle, in_flight)
    }

    #[tokio::test]
    async fn test_delay_flush() {
        let (service, mut batches) = RecordingForwarder::new();
        let (buffer, timer, _) = spawn_buffer(10, service);
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a"])).await.unwrap();
        tx.send(payload_with("s1", "z1", &["b", "c"])).await.unwrap();
        timer.wait_armed().await;
        assert_eq!(timer.last_delay(), Some(Duration::from_secs(5)));

        assert!(timer.fire());
        let batch = recv_batch(&mut batches).await;
        assert_eq!(batch.measurements.len(), 3);
        assert_eq!(batch.source, "s1");
        assert_eq!(batch.zone, "z1");
        assert_eq!(timer.resets(), 1);

        // Back to idle, the timer waits for the next payload
        assert!(!timer.is_armed());
        assert_no_batch(&mut batches).await;
    }

    #[tokio::test]
    async fn test_size_flush_carries_remainder() {
        let (service, mut batches) = RecordingForwarder::new();
        let (buffer, timer, _) = spawn_buffer(3, service);
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a", "b", "c", "d", "e"]))
            .await
            .unwrap();

        let batch = recv_batch(&mut batches).await;
        let names: Vec<&str> = batch.measurements.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        // The remainder opens a fresh window
        timer.wait_armed().await;
        assert!(timer.fire());
        let batch = recv_batch(&mut batches).await;
        let names: Vec<&str> = batch.measurements.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["d", "e"]);
    }

    #[tokio::test]
    async fn test_exact_size_flush_leaves_timer_stopped() {
        let (service, mut batches) = RecordingForwarder::new();
        let (buffer, timer, _) = spawn_buffer(2, service);
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a", "b"])).await.unwrap();
        assert_eq!(recv_batch(&mut batches).await.measurements.len(), 2);
        assert_eq!(timer.resets(), 0);
        assert!(!timer.is_armed());

        // The next window is timed from its own first measurement
        tx.send(payload_with("s1", "z1", &["c"])).await.unwrap();
        timer.wait_armed().await;
        assert_eq!(timer.resets(), 1);
    }

    #[tokio::test]
    async fn test_merge_does_not_move_deadline() {
        let (service, mut batches) = RecordingForwarder::new();
        let (buffer, timer, _) = spawn_buffer(10, service);
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a"])).await.unwrap();
        timer.wait_armed().await;

        tx.send(payload_with("s1", "z1", &["b"])).await.unwrap();
        tx.send(payload_with("s1", "z1", &["c"])).await.unwrap();
        assert!(timer.fire());

        let batch = recv_batch(&mut batches).await;
        assert_eq!(batch.measurements.len(), 3);
        assert_eq!(timer.resets(), 1);
    }

    #[tokio::test]
    async fn test_identity_change_splits_batches() {
        let (service, mut batches) = RecordingForwarder::new();
        let (buffer, timer, _) = spawn_buffer(10, service);
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a"]).with_proxy(ProxyIdentity::new("p1", "1")))
            .await
            .unwrap();
        tx.send(payload_with("s1", "z1", &["b"]).with_proxy(ProxyIdentity::new("p2", "1")))
            .await
            .unwrap();

        // Flushed without size or delay being reached
        let first = recv_batch(&mut batches).await;
        assert_eq!(first.proxy, ProxyIdentity::new("p1", "1"));
        assert_eq!(first.measurements[0].name, "a");

        // The new window got its own deadline
        timer.wait_armed().await;
        assert_eq!(timer.resets(), 2);
        assert!(timer.fire());

        let second = recv_batch(&mut batches).await;
        assert_eq!(second.proxy, ProxyIdentity::new("p2", "1"));
        assert_eq!(second.measurements.len(), 1);
        assert_eq!(second.measurements[0].name, "b");
    }

    #[tokio::test]
    async fn test_limit_set_union_and_conflict() {
        let (service, mut batches) = RecordingForwarder::new();
        let (buffer, timer, _) = spawn_buffer(10, service);
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a"]).with_limit_set("default", vec![0.1, 0.2, 0.4, 0.8]))
            .await
            .unwrap();
        tx.send(payload_with("s1", "z1", &["b"]).with_limit_set("l1", vec![1.0, 5.0]))
            .await
            .unwrap();
        tx.send(payload_with("s1", "z1", &["c"]).with_limit_set("default", vec![1.0, 2.0, 4.0, 8.0]))
            .await
            .unwrap();

        let merged = recv_batch(&mut batches).await;
        assert_eq!(merged.measurements.len(), 2);
        let names: Vec<&str> = merged.limit_sets.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["default", "l1"]);

        timer.wait_armed().await;
        assert!(timer.fire());
        let conflicting = recv_batch(&mut batches).await;
        assert_eq!(conflicting.measurements.len(), 1);
        assert_eq!(conflicting.limit_sets["default"], vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[tokio::test]
    async fn test_payload_wins_tie_with_timer() {
        let (service, mut batches) = RecordingForwarder::new();
        let (buffer, timer, _) = spawn_buffer(2, service);
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a"])).await.unwrap();
        timer.wait_armed().await;

        // Both ready before the buffer task runs again
        tx.try_send(payload_with("s1", "z1", &["b"])).unwrap();
        assert!(timer.fire());

        let batch = recv_batch(&mut batches).await;
        assert_eq!(batch.measurements.len(), 2);

        // The expiry belonged to the window that was flushed by size
        assert_no_batch(&mut batches).await;
        assert!(!timer.is_armed());
    }

    #[tokio::test]
    async fn test_close_flushes_pending_window() {
        let (service, mut batches) = RecordingForwarder::new();
        let (buffer, timer, in_flight) = spawn_buffer(10, service);
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a", "b"])).await.unwrap();
        drop(tx);
        buffer.close().await.unwrap();
        in_flight.wait_idle().await;

        let batch = recv_batch(&mut batches).await;
        assert_eq!(batch.measurements.len(), 2);
        assert!(!timer.is_armed());
        assert_no_batch(&mut batches).await;
    }

    #[tokio::test]
    async fn test_batches_are_forwarded_one_at_a_time() {
        let (service, mut batches, gate) = RecordingForwarder::gated();
        let (buffer, _timer, in_flight) = spawn_buffer(1, service.clone());
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a"])).await.unwrap();
        tx.send(payload_with("s1", "z1", &["b"])).await.unwrap();
        assert_eq!(recv_batch(&mut batches).await.measurements[0].name, "a");

        // "b" is flushed but queued behind the open forward of "a"
        assert_no_batch(&mut batches).await;
        assert_eq!(in_flight.count(), 2);

        gate.add_permits(1);
        assert_eq!(recv_batch(&mut batches).await.measurements[0].name, "b");
        in_flight.wait_idle().await;
        assert_eq!(service.completed(), 2);
    }

    #[tokio::test]
    async fn test_forward_failure_is_swallowed() {
        let (service, mut batches) = RecordingForwarder::new();
        service.set_failing(true);
        let (buffer, timer, in_flight) = spawn_buffer(1, service.clone());
        let tx = buffer.sender();

        tx.send(payload_with("s1", "z1", &["a"])).await.unwrap();
        recv_batch(&mut batches).await;
        in_flight.wait_idle().await;

        // The buffer keeps working after a failed delivery
        service.set_failing(false);
        tx.send(payload_with("s1", "z1", &["b"])).await.unwrap();
        assert_eq!(recv_batch(&mut batches).await.measurements[0].name, "b");
        assert!(!timer.is_armed());
    }
}
