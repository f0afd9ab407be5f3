//! Persistence targets for finished run records.
//!
//! The orchestrator hands every finalized [`RunRecord`] to exactly one
//! [`MonitorSink`]. Sink failures are logged by the caller and never surface
//! as pipeline events.

use crate::pipeline::monitor::RunRecord;
use crate::types::{AppError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait MonitorSink: Send + Sync {
    async fn persist(&self, record: &RunRecord) -> Result<()>;
}

/// Discards records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl MonitorSink for NoopSink {
    async fn persist(&self, _record: &RunRecord) -> Result<()> {
        Ok(())
    }
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl MonitorSink for TracingSink {
    async fn persist(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        tracing::info!(
            target: "ares_pipeline::runs",
            run_id = %record.run_id,
            outcome = ?record.outcome,
            total_tokens = record.total_token_usage.total_tokens,
            record = %json,
            "run record"
        );
        Ok(())
    }
}

/// Appends one JSON line per run to a file, creating parent directories.
#[derive(Debug, Clone)]
pub struct JsonlFileSink {
    path: PathBuf,
}

impl JsonlFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MonitorSink for JsonlFileSink {
    async fn persist(&self, record: &RunRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                AppError::Persistence(format!("cannot open {}: {}", self.path.display(), e))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!(
            path = %self.path.display(),
            run_id = %record.run_id,
            "run record persisted"
        );
        Ok(())
    }
}
