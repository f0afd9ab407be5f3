//! Concurrent Source Dispatcher
//!
//! Runs one worker per planned source, bounded by
//! `min(plan size, max_concurrency)`, and yields each [`QueryResult`] as soon
//! as its worker finishes. Results therefore arrive in completion order, not
//! submission order.
//!
//! Every worker opens exactly one `dispatch:<source_id>` stage on the run
//! monitor and closes it exactly once, whatever the outcome. A failing,
//! panicking or timed-out executor only affects its own result; siblings keep
//! running and the stream always yields one item per source unless it is
//! abandoned.

use crate::agents::{Plan, QueryExecutor, Scope, SourceResponse};
use crate::pipeline::context::RunContext;
use crate::pipeline::monitor::RunMonitor;
use crate::types::{AppError, Result, TokenUsage};
use futures::{FutureExt, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::Instrument;

/// Stage name prefix for per-source worker stages.
pub const DISPATCH_STAGE_PREFIX: &str = "dispatch:";

/// Immutable input to one worker.
#[derive(Debug, Clone)]
pub struct QueryTask {
    pub source_id: String,
    pub research_statement: String,
    pub scope: Scope,
    pub ctx: RunContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceErrorKind {
    /// The worker exceeded its per-task timeout.
    Timeout,
    /// The executor returned an error or panicked.
    ExecutorError,
    /// The run stopped waiting before the worker finished.
    Abandoned,
}

impl std::fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceErrorKind::Timeout => write!(f, "timeout"),
            SourceErrorKind::ExecutorError => write!(f, "executor_error"),
            SourceErrorKind::Abandoned => write!(f, "abandoned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Success(SourceResponse),
    Failure {
        error_kind: SourceErrorKind,
        message: String,
    },
}

/// Result of one worker, always tagged with its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub source_id: String,
    pub outcome: QueryOutcome,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl QueryResult {
    pub fn success(source_id: impl Into<String>, response: SourceResponse) -> Self {
        Self {
            source_id: source_id.into(),
            outcome: QueryOutcome::Success(response),
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn failure(
        source_id: impl Into<String>,
        error_kind: SourceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            outcome: QueryOutcome::Failure {
                error_kind,
                message: message.into(),
            },
            attempts: 0,
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, QueryOutcome::Success(_))
    }
}

/// Fans a plan out to a [`QueryExecutor`].
#[derive(Clone)]
pub struct Dispatcher {
    executor: Arc<dyn QueryExecutor>,
    monitor: Arc<RunMonitor>,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn QueryExecutor>, monitor: Arc<RunMonitor>) -> Self {
        Self { executor, monitor }
    }

    /// Launch one worker per source and return the completion-ordered results.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(
        &self,
        plan: &Plan,
        research_statement: &str,
        scope: Scope,
        ctx: &RunContext,
    ) -> DispatchStream {
        let slots = ctx.config.concurrency_for(plan.len());
        let semaphore = Arc::new(Semaphore::new(slots));
        // One slot per source so finished workers never wait on the consumer.
        let (tx, rx) = mpsc::channel(plan.len().max(1));
        let mut workers = JoinSet::new();

        tracing::info!(
            sources = plan.len(),
            concurrency = slots,
            %scope,
            "dispatching research to sources"
        );

        for source_id in plan.sources() {
            let task = QueryTask {
                source_id: source_id.clone(),
                research_statement: research_statement.to_string(),
                scope,
                ctx: ctx.clone(),
            };
            let executor = Arc::clone(&self.executor);
            let monitor = Arc::clone(&self.monitor);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let span = tracing::info_span!("source_worker", source_id = %source_id);

            workers.spawn(
                async move {
                    let result = run_worker(task, executor, monitor, semaphore).await;
                    // Receiver gone means the run abandoned us; discard.
                    let _ = tx.send(result).await;
                }
                .instrument(span),
            );
        }
        drop(tx);

        DispatchStream {
            rx,
            workers,
            pending: plan.sources().to_vec(),
        }
    }
}

async fn run_worker(
    task: QueryTask,
    executor: Arc<dyn QueryExecutor>,
    monitor: Arc<RunMonitor>,
    semaphore: Arc<Semaphore>,
) -> QueryResult {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return QueryResult::failure(
                &task.source_id,
                SourceErrorKind::ExecutorError,
                "worker pool closed",
            )
        }
    };

    let stage = monitor.start_stage(
        format!("{}{}", DISPATCH_STAGE_PREFIX, task.source_id),
        json!({
            "source_id": task.source_id,
            "scope": task.scope,
        }),
    );
    let started = Instant::now();
    let mut attempts = 0u32;

    let outcome = timeout(
        task.ctx.config.task_timeout,
        execute_with_retries(executor.as_ref(), &task, &mut attempts),
    )
    .await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let outcome = match outcome {
        Ok(Ok(response)) => {
            tracing::debug!(attempts, duration_ms, "source succeeded");
            monitor.end_stage(
                stage,
                json!({
                    "status": "success",
                    "items": response.content.item_count(),
                    "doc_ids": response.doc_ids,
                    "attempts": attempts,
                }),
                response.usage,
            );
            QueryOutcome::Success(response)
        }
        Ok(Err(err)) => {
            tracing::warn!(attempts, error = %err, "source failed");
            monitor.end_stage(
                stage,
                json!({
                    "status": "failure",
                    "error_kind": SourceErrorKind::ExecutorError,
                    "error": err.to_string(),
                    "attempts": attempts,
                }),
                TokenUsage::default(),
            );
            QueryOutcome::Failure {
                error_kind: SourceErrorKind::ExecutorError,
                message: err.to_string(),
            }
        }
        Err(_) => {
            let message = format!("timed out after {:?}", task.ctx.config.task_timeout);
            tracing::warn!(attempts, "source {}", message);
            monitor.end_stage(
                stage,
                json!({
                    "status": "failure",
                    "error_kind": SourceErrorKind::Timeout,
                    "error": message,
                    "attempts": attempts,
                }),
                TokenUsage::default(),
            );
            QueryOutcome::Failure {
                error_kind: SourceErrorKind::Timeout,
                message,
            }
        }
    };

    QueryResult {
        source_id: task.source_id,
        outcome,
        attempts,
        duration_ms,
    }
}

/// Call the executor, retrying errors with exponential backoff.
async fn execute_with_retries(
    executor: &dyn QueryExecutor,
    task: &QueryTask,
    attempts: &mut u32,
) -> Result<SourceResponse> {
    let max_attempts = task.ctx.config.max_retries.saturating_add(1);
    loop {
        *attempts += 1;
        let result = AssertUnwindSafe(executor.execute(task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(AppError::Executor("executor panicked".to_string())));

        match result {
            Ok(response) => return Ok(response),
            Err(err) if *attempts < max_attempts => {
                let backoff = task.ctx.config.backoff_for(*attempts);
                tracing::debug!(attempt = *attempts, ?backoff, error = %err, "retrying source");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Completion-ordered stream of worker results.
///
/// Dropping the stream aborts any workers still running.
pub struct DispatchStream {
    rx: mpsc::Receiver<QueryResult>,
    workers: JoinSet<()>,
    pending: Vec<String>,
}

impl DispatchStream {
    /// Sources whose result has not been yielded yet, in plan order.
    pub fn pending(&self) -> &[String] {
        &self.pending
    }

    /// Stop waiting: abort the remaining workers and return their sources.
    ///
    /// Results they might still produce are discarded.
    pub fn abandon(mut self) -> Vec<String> {
        self.workers.abort_all();
        self.rx.close();
        std::mem::take(&mut self.pending)
    }
}

impl Stream for DispatchStream {
    type Item = QueryResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.rx.poll_recv(cx);
        if let Poll::Ready(Some(result)) = &polled {
            if let Some(idx) = this.pending.iter().position(|s| *s == result.source_id) {
                this.pending.remove(idx);
            }
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.pending.len()))
    }
}
