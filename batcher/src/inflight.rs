use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

use crate::metrics_defs::FORWARDS_INFLIGHT;
use shared::gauge;

/// Counts forward calls that were submitted but have not completed yet.
#[derive(Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Registers a forward call. The call counts as in flight until the guard is dropped.
    pub fn begin(self: &Arc<Self>) -> InFlightGuard {
        let previous = self.count.fetch_add(1, Ordering::AcqRel);
        gauge!(FORWARDS_INFLIGHT).set((previous + 1) as f64);
        InFlightGuard {
            in_flight: self.clone(),
        }
    }

    /// Waits until no forward call is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking so a completion in between is not missed.
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn end(&self) {
        let previous = self.count.fetch_sub(1, Ordering::AcqRel);
        gauge!(FORWARDS_INFLIGHT).set((previous - 1) as f64);
        if previous == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.end();
    }
}
