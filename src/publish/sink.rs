// src/publish/sink.rs

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use super::event::Event;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("collector returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("collector rejected events: {text} (code {code})")]
    Collector { code: i64, text: String },
    #[error("unreadable collector response: {0}")]
    Decode(String),
    #[error("encoding events: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for event batches. Batches may be resubmitted verbatim after a
/// failure, so implementations must tolerate duplicates.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send_batch(&self, events: &[Event]) -> Result<(), SinkError>;

    /// Cheap connectivity probe run before a real publish.
    async fn health_check(&self) -> Result<(), SinkError>;
}

/// Accepts everything and sends nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunSink;

#[async_trait]
impl Sink for DryRunSink {
    async fn send_batch(&self, events: &[Event]) -> Result<(), SinkError> {
        debug!(events = events.len(), "dry run, batch not sent");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
