use async_trait::async_trait;
use batcher::{ForwardError, ForwardResponse, ForwardingService, StatPayload};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Forwarding service that writes each flushed batch as one line of JSON.
pub struct JsonLinesForwarder<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesForwarder<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> ForwardingService for JsonLinesForwarder<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &'static str {
        "json-lines"
    }

    async fn forward(&self, payload: &StatPayload) -> Result<ForwardResponse, ForwardError> {
        let mut line = serde_json::to_vec(payload)?;
        line.push(b'\n');

        // One write per batch so concurrent flushes never interleave within a line
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;

        Ok(ForwardResponse {
            accepted: payload.measurements.len(),
        })
    }

    async fn query(
        &self,
        _request: serde_json::Value,
    ) -> Result<serde_json::Value, ForwardError> {
        Err(ForwardError::Unsupported("query"))
    }

    async fn close(&self) -> Result<(), ForwardError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}
