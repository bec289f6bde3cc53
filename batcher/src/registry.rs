use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::buffer::{BatchBuffer, BufferContext};
use crate::errors::BatchError;
use crate::metrics_defs::ACTIVE_BUFFERS;
use crate::types::{RoutingKey, StatPayload};
use shared::gauge;

struct Buffers {
    by_key: HashMap<RoutingKey, BatchBuffer>,
    // Set once by close_all; no buffer may be created afterwards.
    closed: bool,
}

/// Batch buffers by routing key, created on first use and kept until shutdown.
pub struct Registry {
    buffers: RwLock<Buffers>,
    context: BufferContext,
}

impl Registry {
    pub fn new(context: BufferContext) -> Self {
        Registry {
            buffers: RwLock::new(Buffers {
                by_key: HashMap::new(),
                closed: false,
            }),
            context,
        }
    }

    /// Returns the input queue of the buffer for `key`, starting the buffer if needed.
    pub fn lookup_or_create(
        &self,
        key: &RoutingKey,
    ) -> Result<mpsc::Sender<StatPayload>, BatchError> {
        {
            let read_guard = self.buffers.read();
            if let Some(buffer) = read_guard.by_key.get(key) {
                return Ok(buffer.sender());
            }
            if read_guard.closed {
                return Err(BatchError::Closed);
            }
        }

        let mut write_guard = self.buffers.write();
        if write_guard.closed {
            return Err(BatchError::Closed);
        }
        // Another caller may have created it between the two locks
        if let Some(buffer) = write_guard.by_key.get(key) {
            return Ok(buffer.sender());
        }

        let buffer = BatchBuffer::spawn(key.clone(), &self.context);
        let sender = buffer.sender();
        write_guard.by_key.insert(key.clone(), buffer);

        gauge!(ACTIVE_BUFFERS).set(write_guard.by_key.len() as f64);
        tracing::debug!(%key, "Created batch buffer");

        Ok(sender)
    }

    /// Closes every buffer's input queue and empties the registry.
    ///
    /// Returns the buffer tasks, which finish after their final flush. This does
    /// not wait for the forwards those flushes start.
    pub fn close_all(&self) -> Vec<JoinHandle<()>> {
        let mut write_guard = self.buffers.write();
        write_guard.closed = true;

        let handles: Vec<_> = write_guard
            .by_key
            .drain()
            .map(|(_, buffer)| buffer.close())
            .collect();

        gauge!(ACTIVE_BUFFERS).set(0.0);
        handles
    }

    pub fn len(&self) -> usize {
        self.buffers.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
