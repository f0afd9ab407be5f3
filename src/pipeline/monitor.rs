//! Run Monitor
//!
//! Tracks the stage lifecycle of a single run: start/end timestamps,
//! structured details and token usage per stage. It is the one object shared
//! by concurrently running workers, so every mutation goes through an
//! internal lock.
//!
//! Stages are stored flat and append-only; a [`StageHandle`] is the index of
//! the stage it refers to. When monitoring is disabled every call is a no-op
//! and [`RunMonitor::snapshot`] returns an empty record.

use crate::types::TokenUsage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use uuid::Uuid;

/// Structured details attached to a stage.
pub type StageDetails = serde_json::Map<String, Value>;

/// Reference to a stage opened on a [`RunMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageHandle(Option<usize>);

impl StageHandle {
    /// Handle returned while monitoring is disabled.
    pub const DISABLED: StageHandle = StageHandle(None);

    pub fn is_recorded(&self) -> bool {
        self.0.is_some()
    }
}

/// A named, timed interval of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: usize,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub details: StageDetails,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

impl Stage {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// The `error` detail, if the stage recorded one.
    pub fn error(&self) -> Option<&str> {
        self.details.get("error").and_then(Value::as_str)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    ClarificationRequested,
    Failed,
    Aborted,
    Cancelled,
}

/// Aggregate of every stage in a run; the unit handed to a monitor sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub outcome: Option<RunOutcome>,
    pub stages: Vec<Stage>,
    pub total_token_usage: TokenUsage,
}

impl RunRecord {
    pub fn open_stage_count(&self) -> usize {
        self.stages.iter().filter(|s| s.is_open()).count()
    }

    /// First stage with exactly this name.
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stages_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a Stage> + 'a {
        self.stages.iter().filter(move |s| s.name.starts_with(prefix))
    }

    /// Sum of the token usage recorded on every stage.
    pub fn stage_token_usage(&self) -> TokenUsage {
        self.stages.iter().map(|s| s.token_usage).sum()
    }
}

struct StageEntry {
    stage: Stage,
    started: Instant,
}

#[derive(Default)]
struct MonitorState {
    stages: Vec<StageEntry>,
    outcome: Option<RunOutcome>,
    finished_at: Option<DateTime<Utc>>,
    duration_ms: Option<u64>,
}

/// Thread-safe stage tracker for one run.
pub struct RunMonitor {
    run_id: Uuid,
    enabled: AtomicBool,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<MonitorState>,
}

impl RunMonitor {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            enabled: AtomicBool::new(true),
            started_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// A monitor that records nothing until [`enable`](Self::enable) is called.
    pub fn disabled(run_id: Uuid) -> Self {
        let monitor = Self::new(run_id);
        monitor.disable();
        monitor
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Open a stage and return its handle.
    pub fn start_stage(&self, name: impl Into<String>, details: Value) -> StageHandle {
        if !self.is_enabled() {
            return StageHandle::DISABLED;
        }

        let name = name.into();
        let mut state = self.state.lock();
        let id = state.stages.len();
        let mut stage = Stage {
            id,
            name,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            details: StageDetails::new(),
            token_usage: TokenUsage::default(),
        };
        merge_details(&mut stage.details, details);

        tracing::trace!(stage = %stage.name, id, "stage started");
        state.stages.push(StageEntry {
            stage,
            started: Instant::now(),
        });
        StageHandle(Some(id))
    }

    /// Close a stage, merging in final details and usage.
    ///
    /// Closing an already-closed stage is ignored.
    pub fn end_stage(&self, handle: StageHandle, details: Value, usage: TokenUsage) {
        self.with_open_stage(handle, "end", |entry| {
            merge_details(&mut entry.stage.details, details);
            entry.stage.token_usage += usage;
            close(entry);
        });
    }

    /// Close a stage with an `error` detail.
    pub fn fail_stage(
        &self,
        handle: StageHandle,
        error: impl std::fmt::Display,
        usage: TokenUsage,
    ) {
        self.end_stage(
            handle,
            serde_json::json!({ "error": error.to_string() }),
            usage,
        );
    }

    /// Add usage to an open stage; may be called any number of times.
    pub fn record_token_usage(&self, handle: StageHandle, usage: TokenUsage) {
        self.with_open_stage(handle, "record usage on", |entry| {
            entry.stage.token_usage += usage;
        });
    }

    /// Merge details into an open stage without closing it.
    pub fn record_details(&self, handle: StageHandle, details: Value) {
        self.with_open_stage(handle, "record details on", |entry| {
            merge_details(&mut entry.stage.details, details);
        });
    }

    /// Force-close open stages, stamp the outcome and return the final record.
    pub fn finalize(&self, outcome: RunOutcome) -> RunRecord {
        {
            let mut state = self.state.lock();
            for entry in state.stages.iter_mut().filter(|e| e.stage.is_open()) {
                tracing::warn!(stage = %entry.stage.name, "closing stage left open at finalize");
                entry.stage.details.insert(
                    "error".to_string(),
                    Value::String("stage still open when the run finalized".to_string()),
                );
                entry
                    .stage
                    .details
                    .insert("forced_close".to_string(), Value::Bool(true));
                close(entry);
            }
            state.outcome = Some(outcome);
            state.finished_at = Some(Utc::now());
            state.duration_ms = Some(self.started.elapsed().as_millis() as u64);
        }
        self.snapshot()
    }

    /// Current view of the run.
    pub fn snapshot(&self) -> RunRecord {
        let state = self.state.lock();
        let duration_ms = state
            .duration_ms
            .unwrap_or_else(|| self.started.elapsed().as_millis() as u64);

        let stages: Vec<Stage> = if self.is_enabled() {
            state.stages.iter().map(|e| e.stage.clone()).collect()
        } else {
            Vec::new()
        };
        let total_token_usage = stages.iter().map(|s| s.token_usage).sum();

        RunRecord {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: state.finished_at,
            duration_ms,
            outcome: state.outcome,
            stages,
            total_token_usage,
        }
    }

    fn with_open_stage<F>(&self, handle: StageHandle, action: &str, f: F)
    where
        F: FnOnce(&mut StageEntry),
    {
        let Some(id) = handle.0 else {
            return;
        };
        if !self.is_enabled() {
            return;
        }

        let mut state = self.state.lock();
        match state.stages.get_mut(id) {
            Some(entry) if entry.stage.is_open() => f(entry),
            Some(entry) => {
                tracing::debug!(stage = %entry.stage.name, "cannot {} closed stage", action);
            }
            None => {
                tracing::warn!(id, "cannot {} unknown stage", action);
            }
        }
    }
}

fn close(entry: &mut StageEntry) {
    entry.stage.ended_at = Some(Utc::now());
    entry.stage.duration_ms = Some(entry.started.elapsed().as_millis() as u64);
    tracing::trace!(stage = %entry.stage.name, "stage ended");
}

fn merge_details(target: &mut StageDetails, details: Value) {
    match details {
        Value::Null => {}
        Value::Object(map) => target.extend(map),
        other => {
            target.insert("value".to_string(), other);
        }
    }
}
