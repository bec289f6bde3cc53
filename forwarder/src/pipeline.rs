//! Feeds newline-delimited JSON payloads into the batching forwarder.

use batcher::{BatchError, BatchingForwarder, StatPayload};
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("could not read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("batcher error: {0}")]
    Batch(#[from] BatchError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub lines: usize,
    pub accepted: usize,
    pub skipped: usize,
}

/// Reads payloads from `reader` until it is exhausted or `shutdown` completes.
///
/// Lines that are not valid payloads are logged and skipped. The forwarder is
/// not closed here.
pub async fn run_pipeline<R, S>(
    reader: R,
    forwarder: &BatchingForwarder,
    shutdown: S,
) -> Result<PipelineStats, PipelineError>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut stats = PipelineStats::default();
    let mut lines = reader.lines();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, no longer reading input");
                break;
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        stats.lines += 1;

        let payload: StatPayload = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, line = stats.lines, "Skipping malformed payload");
                stats.skipped += 1;
                continue;
            }
        };

        match forwarder.forward(payload).await {
            Ok(response) => stats.accepted += response.accepted,
            Err(BatchError::MissingRoutingField(field)) => {
                tracing::warn!(field, line = stats.lines, "Skipping payload without routing field");
                stats.skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(stats)
}
