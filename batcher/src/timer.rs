//! Flush timers for batch buffers.
//!
//! Each batch buffer owns one [`FlushTimer`] that it arms when a window opens
//! and stops when the window is flushed early. Production buffers use
//! [`TokioTimer`]; tests inject manual timers they fire explicitly.

use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

use crate::types::RoutingKey;

#[async_trait]
pub trait FlushTimer: Send {
    /// Arms the timer to fire `after` from now, replacing any pending deadline.
    fn reset(&mut self, after: Duration);

    /// Disarms the timer. A stopped timer never fires.
    fn stop(&mut self);

    /// Completes when the armed deadline is reached, and stays pending while
    /// the timer is stopped.
    ///
    /// Must be cancellation safe: dropping the future before it completes
    /// leaves the deadline armed.
    async fn fired(&mut self);
}

/// Creates the flush timer of each new batch buffer.
pub trait TimerFactory: Send + Sync {
    fn create(&self, key: &RoutingKey) -> Box<dyn FlushTimer>;
}

/// Flush timer backed by the tokio clock.
#[derive(Default)]
pub struct TokioTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl TokioTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlushTimer for TokioTimer {
    fn reset(&mut self, after: Duration) {
        let deadline = Instant::now() + after;
        if let Some(sleep) = self.sleep.as_mut() {
            sleep.as_mut().reset(deadline);
            return;
        }
        self.sleep = Some(Box::pin(tokio::time::sleep_until(deadline)));
    }

    fn stop(&mut self) {
        self.sleep = None;
    }

    async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioTimerFactory;

impl TimerFactory for TokioTimerFactory {
    fn create(&self, _key: &RoutingKey) -> Box<dyn FlushTimer> {
        Box::new(TokioTimer::new())
    }
}
