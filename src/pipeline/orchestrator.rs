//! Pipeline Orchestrator
//!
//! The top-level state machine of a run:
//!
//! ```text
//! Init -> Routing -> DirectResponding -------------------------> Finalizing -> Done
//!                 \-> Clarifying -> Planning -> Dispatching         ^
//!                                   -> Aggregating -> Synthesizing --/
//! ```
//!
//! Each run executes on its own tokio task and pushes [`OutputEvent`]s into a
//! bounded channel, so a slow consumer applies backpressure to the producer
//! while dispatched workers keep running and buffer their results. Every
//! path ends in `Finalizing`: open stages are closed, the [`RunRecord`] is
//! computed and handed to the monitor sink, whose failure is only logged.

use crate::agents::{
    AgentOutput, AgentStream, Clarifier, ClarificationResult, DirectResponder, Plan, Planner,
    QueryExecutor, Router, RoutingDecision, Scope, StreamChunk, Summarizer,
};
use crate::pipeline::aggregator::{aggregate, AggregateResult, FailedSource};
use crate::pipeline::context::RunContext;
use crate::pipeline::dispatcher::{DispatchStream, Dispatcher, QueryResult};
use crate::pipeline::events::{CompletionSummary, OutputEvent, StatusUpdate};
use crate::pipeline::monitor::{RunMonitor, RunOutcome, RunRecord, StageHandle};
use crate::sink::{MonitorSink, NoopSink};
use crate::types::{AppError, Conversation, Result, TokenUsage};
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// States of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Routing,
    DirectResponding,
    Clarifying,
    Planning,
    Dispatching,
    Aggregating,
    Synthesizing,
    Finalizing,
    Done,
    Aborted,
}

/// Why a run left its normal path.
enum Halt {
    Failed(AppError),
    /// The consumer dropped the event stream.
    Cancelled,
}

impl From<AppError> for Halt {
    fn from(err: AppError) -> Self {
        Halt::Failed(err)
    }
}

type Step = std::result::Result<PipelineState, Halt>;

struct Collaborators {
    router: Arc<dyn Router>,
    clarifier: Arc<dyn Clarifier>,
    planner: Arc<dyn Planner>,
    responder: Arc<dyn DirectResponder>,
    summarizer: Arc<dyn Summarizer>,
    executor: Arc<dyn QueryExecutor>,
    sink: Arc<dyn MonitorSink>,
}

/// The query-answering pipeline.
///
/// Cheap to clone; every run gets its own monitor and producer task.
#[derive(Clone)]
pub struct Pipeline {
    collaborators: Arc<Collaborators>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Start a run and return its lazy event sequence.
    ///
    /// Must be called from within a tokio runtime. Dropping the returned
    /// stream cancels the run; it is still finalized and persisted.
    pub fn run(&self, conversation: Conversation, ctx: RunContext) -> EventStream {
        let (tx, rx) = mpsc::channel(ctx.config.event_buffer.max(1));
        let monitor = Arc::new(RunMonitor::new(ctx.run_id));
        if !ctx.config.monitoring_enabled {
            monitor.disable();
        }

        let run_id = ctx.run_id;
        let started = Instant::now();
        let span = tracing::info_span!("pipeline_run", run_id = %run_id);
        let run = PipelineRun {
            agents: Arc::clone(&self.collaborators),
            conversation,
            ctx,
            tx,
            monitor,
            started,
            emitted: 0,
            clarification: None,
            plan: Plan::default(),
            results: Vec::new(),
            abandoned: Vec::new(),
            aggregate: None,
        };
        let handle = tokio::spawn(run.execute().instrument(span));

        EventStream { run_id, rx, handle }
    }
}

/// Assembles a [`Pipeline`] from its collaborators.
#[derive(Default)]
pub struct PipelineBuilder {
    router: Option<Arc<dyn Router>>,
    clarifier: Option<Arc<dyn Clarifier>>,
    planner: Option<Arc<dyn Planner>>,
    responder: Option<Arc<dyn DirectResponder>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    sink: Option<Arc<dyn MonitorSink>>,
}

impl PipelineBuilder {
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn clarifier(mut self, clarifier: Arc<dyn Clarifier>) -> Self {
        self.clarifier = Some(clarifier);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn direct_responder(mut self, responder: Arc<dyn DirectResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Where finished run records go (default: discarded)
    pub fn sink(mut self, sink: Arc<dyn MonitorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| {
                AppError::Configuration(format!("pipeline is missing a {}", name))
            })
        }

        Ok(Pipeline {
            collaborators: Arc::new(Collaborators {
                router: required(self.router, "router")?,
                clarifier: required(self.clarifier, "clarifier")?,
                planner: required(self.planner, "planner")?,
                responder: required(self.responder, "direct responder")?,
                summarizer: required(self.summarizer, "summarizer")?,
                executor: required(self.executor, "query executor")?,
                sink: self.sink.unwrap_or_else(|| Arc::new(NoopSink)),
            }),
        })
    }
}

/// Events of one run, in the order they were produced.
pub struct EventStream {
    run_id: uuid::Uuid,
    rx: mpsc::Receiver<OutputEvent>,
    handle: JoinHandle<RunRecord>,
}

impl EventStream {
    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// Stop consuming and wait for the run to finalize.
    ///
    /// Events not yet consumed are dropped, which cancels a run that is
    /// still producing.
    pub async fn finish(self) -> Result<RunRecord> {
        let EventStream { rx, handle, .. } = self;
        drop(rx);
        handle
            .await
            .map_err(|e| AppError::Internal(format!("pipeline task failed: {}", e)))
    }

    /// Consume every event, then wait for the finalized record.
    pub async fn collect_all(mut self) -> Result<(Vec<OutputEvent>, RunRecord)> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        let record = self.finish().await?;
        Ok((events, record))
    }
}

impl Stream for EventStream {
    type Item = OutputEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// State carried through one execution of the state machine.
struct PipelineRun {
    agents: Arc<Collaborators>,
    conversation: Conversation,
    ctx: RunContext,
    tx: mpsc::Sender<OutputEvent>,
    monitor: Arc<RunMonitor>,
    /// Start of the run; the run timeout counts from here.
    started: Instant,
    emitted: usize,
    clarification: Option<ClarificationResult>,
    plan: Plan,
    results: Vec<QueryResult>,
    abandoned: Vec<String>,
    aggregate: Option<AggregateResult>,
}

impl PipelineRun {
    async fn execute(mut self) -> RunRecord {
        let mut state = PipelineState::Init;
        let mut outcome = RunOutcome::Completed;

        loop {
            let step = match state {
                PipelineState::Init => self.init(),
                PipelineState::Routing => self.route().await,
                PipelineState::DirectResponding => self.respond_directly().await,
                PipelineState::Clarifying => self.clarify(&mut outcome).await,
                PipelineState::Planning => self.plan().await,
                PipelineState::Dispatching => self.dispatch().await,
                PipelineState::Aggregating => self.aggregate(),
                PipelineState::Synthesizing => self.synthesize().await,
                PipelineState::Finalizing | PipelineState::Done | PipelineState::Aborted => break,
            };

            let next = match step {
                Ok(next) => next,
                Err(Halt::Cancelled) => {
                    tracing::info!(?state, "event stream dropped by consumer, cancelling run");
                    outcome = RunOutcome::Cancelled;
                    PipelineState::Finalizing
                }
                Err(Halt::Failed(err)) => {
                    tracing::error!(?state, error = %err, "run failed");
                    outcome = if self.emitted == 0 {
                        RunOutcome::Aborted
                    } else {
                        RunOutcome::Failed
                    };
                    // A closed channel here only means nobody is listening.
                    let _ = self.emit(OutputEvent::error(&err)).await;
                    PipelineState::Finalizing
                }
            };

            tracing::debug!(from = ?state, to = ?next, "pipeline transition");
            state = next;
        }

        let terminal = if outcome == RunOutcome::Aborted {
            PipelineState::Aborted
        } else {
            PipelineState::Done
        };
        let record = self.finalize(outcome).await;
        tracing::info!(
            state = ?terminal,
            ?outcome,
            stages = record.stages.len(),
            total_tokens = record.total_token_usage.total_tokens,
            duration_ms = record.duration_ms,
            "run finished"
        );
        record
    }

    /// Send an event, suspending while the consumer is behind.
    async fn emit(&mut self, event: OutputEvent) -> std::result::Result<(), Halt> {
        self.tx.send(event).await.map_err(|_| Halt::Cancelled)?;
        self.emitted += 1;
        Ok(())
    }

    fn init(&self) -> Step {
        self.conversation.validate()?;
        tracing::info!(messages = self.conversation.len(), "run started");
        Ok(PipelineState::Routing)
    }

    async fn route(&mut self) -> Step {
        let router = Arc::clone(&self.agents.router);
        let decision = self
            .invoke(
                "routing",
                "router",
                json!({ "messages": self.conversation.len() }),
                router.decide(&self.conversation, &self.ctx),
                |decision| json!({ "decision": decision }),
            )
            .await?;

        tracing::info!(?decision, "routed conversation");
        Ok(match decision {
            RoutingDecision::DirectResponse => PipelineState::DirectResponding,
            RoutingDecision::Research => PipelineState::Clarifying,
        })
    }

    async fn respond_directly(&mut self) -> Step {
        let stage = self.monitor.start_stage("direct_response", Value::Null);
        let responder = Arc::clone(&self.agents.responder);
        let stream = match catch_panic(responder.respond(&self.conversation, &self.ctx)).await {
            Ok(stream) => stream,
            Err(err) => {
                self.monitor.fail_stage(stage, &err, TokenUsage::default());
                return Err(agent_error("direct_responder", err).into());
            }
        };

        self.relay(stage, stream, "direct_responder").await?;
        self.emit(OutputEvent::Completion(CompletionSummary::default()))
            .await?;
        Ok(PipelineState::Finalizing)
    }

    async fn clarify(&mut self, outcome: &mut RunOutcome) -> Step {
        let clarifier = Arc::clone(&self.agents.clarifier);
        let clarification = self
            .invoke(
                "clarification",
                "clarifier",
                Value::Null,
                clarifier.clarify(&self.conversation, &self.ctx),
                |c: &ClarificationResult| {
                    json!({
                        "sufficient": c.sufficient,
                        "scope": c.scope,
                        "research_statement": c.research_statement,
                        "questions": c.questions,
                    })
                },
            )
            .await?;

        if !clarification.sufficient {
            tracing::info!(
                questions = clarification.questions.len(),
                "clarification needed"
            );
            *outcome = RunOutcome::ClarificationRequested;
            self.emit(OutputEvent::ClarificationRequest {
                questions: clarification.questions,
            })
            .await?;
            self.emit(OutputEvent::Completion(CompletionSummary::default()))
                .await?;
            return Ok(PipelineState::Finalizing);
        }

        self.clarification = Some(clarification);
        Ok(PipelineState::Planning)
    }

    async fn plan(&mut self) -> Step {
        let statement = self.research_statement().to_string();
        let planner = Arc::clone(&self.agents.planner);
        let sources = self
            .invoke(
                "planning",
                "planner",
                json!({ "research_statement": statement }),
                planner.plan(&statement, &self.ctx),
                |sources| json!({ "sources": sources }),
            )
            .await?;

        let plan = Plan::new(sources)?;
        if let Some(allowed) = &self.ctx.config.allowed_sources {
            plan.restrict_to(allowed)?;
        }

        tracing::info!(sources = ?plan.sources(), "plan ready");
        self.emit(OutputEvent::Plan(plan.clone())).await?;

        if plan.is_empty() {
            self.emit(OutputEvent::Completion(CompletionSummary::default()))
                .await?;
            return Ok(PipelineState::Finalizing);
        }

        self.plan = plan;
        Ok(PipelineState::Dispatching)
    }

    async fn dispatch(&mut self) -> Step {
        let stage = self.monitor.start_stage(
            "dispatching",
            json!({ "sources": self.plan.sources(), "scope": self.scope() }),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.agents.executor),
            Arc::clone(&self.monitor),
        );
        let statement = self.research_statement().to_string();
        let mut stream = dispatcher.dispatch(&self.plan, &statement, self.scope(), &self.ctx);
        // An already-passed deadline abandons every source not yet finished.
        let deadline = self.ctx.config.run_timeout.map(|limit| self.started + limit);

        loop {
            let wait = tokio::select! {
                _ = self.tx.closed() => DispatchWait::ConsumerGone,
                wait = next_before(&mut stream, deadline) => wait,
            };

            match wait {
                DispatchWait::Result(result) => {
                    let status = StatusUpdate::for_result(&result);
                    self.results.push(result);
                    if let Err(halt) = self.emit(OutputEvent::StatusUpdate(status)).await {
                        // Dropping the stream aborts the remaining workers.
                        drop(stream);
                        self.monitor
                            .fail_stage(stage, "cancelled by consumer", TokenUsage::default());
                        return Err(halt);
                    }
                }
                DispatchWait::Finished => break,
                DispatchWait::ConsumerGone => {
                    drop(stream);
                    self.monitor
                        .fail_stage(stage, "cancelled by consumer", TokenUsage::default());
                    return Err(Halt::Cancelled);
                }
                DispatchWait::TimedOut => {
                    self.abandoned = stream.abandon();
                    tracing::warn!(
                        abandoned = ?self.abandoned,
                        "run timeout reached while dispatching"
                    );
                    for source_id in self.abandoned.clone() {
                        let status = StatusUpdate::for_failed(&FailedSource::abandoned(source_id));
                        if let Err(halt) = self.emit(OutputEvent::StatusUpdate(status)).await {
                            self.monitor
                                .fail_stage(stage, "cancelled by consumer", TokenUsage::default());
                            return Err(halt);
                        }
                    }
                    break;
                }
            }
        }

        let succeeded = self.results.iter().filter(|r| r.is_success()).count();
        self.monitor.end_stage(
            stage,
            json!({
                "completed": self.results.len(),
                "succeeded": succeeded,
                "abandoned": self.abandoned,
            }),
            TokenUsage::default(),
        );
        Ok(PipelineState::Aggregating)
    }

    fn aggregate(&mut self) -> Step {
        let stage = self
            .monitor
            .start_stage("aggregation", json!({ "scope": self.scope() }));

        let mut aggregate = aggregate(&self.results, self.scope());
        aggregate.total_sources = self.plan.len();
        aggregate.add_abandoned(self.abandoned.drain(..));

        self.monitor.end_stage(
            stage,
            json!({
                "results": aggregate.result_count(),
                "succeeded": aggregate.succeeded,
                "failed": aggregate.failed.iter().map(|f| &f.source_id).collect::<Vec<_>>(),
            }),
            TokenUsage::default(),
        );
        tracing::info!(
            succeeded = aggregate.succeeded.len(),
            total = aggregate.total_sources,
            "aggregated source results"
        );

        self.aggregate = Some(aggregate);
        Ok(PipelineState::Synthesizing)
    }

    async fn synthesize(&mut self) -> Step {
        let aggregate = self
            .aggregate
            .take()
            .ok_or_else(|| AppError::Internal("synthesis reached without aggregate".to_string()))?;

        match aggregate.scope {
            Scope::Metadata => {
                self.emit(OutputEvent::StatusUpdate(StatusUpdate::Listing {
                    text: aggregate.format_listing(),
                }))
                .await?;
            }
            Scope::Research if !aggregate.has_results() => {
                self.emit(OutputEvent::StatusUpdate(StatusUpdate::note(
                    "No sources returned results to summarize",
                )))
                .await?;
            }
            Scope::Research => {
                let statement = self.research_statement().to_string();
                let stage = self.monitor.start_stage(
                    "synthesis",
                    json!({ "sources": aggregate.succeeded }),
                );
                let summarizer = Arc::clone(&self.agents.summarizer);
                let stream =
                    match catch_panic(summarizer.summarize(&statement, &aggregate, &self.ctx)).await
                    {
                        Ok(stream) => stream,
                        Err(err) => {
                            self.monitor.fail_stage(stage, &err, TokenUsage::default());
                            return Err(agent_error("summarizer", err).into());
                        }
                    };
                self.relay(stage, stream, "summarizer").await?;
            }
        }

        self.emit(OutputEvent::Completion(aggregate.summary())).await?;
        Ok(PipelineState::Finalizing)
    }

    async fn finalize(self, outcome: RunOutcome) -> RunRecord {
        let PipelineRun {
            agents, monitor, tx, ..
        } = self;
        // Close the event stream before the (possibly slow) sink call.
        drop(tx);

        let record = monitor.finalize(outcome);
        if let Err(err) = agents.sink.persist(&record).await {
            tracing::error!(error = %err, "failed to persist run record");
        }
        record
    }

    /// Invoke a sequential agent inside its own stage.
    async fn invoke<T, F, D>(
        &self,
        stage_name: &str,
        agent: &str,
        details: Value,
        call: F,
        describe: D,
    ) -> Result<T>
    where
        F: Future<Output = Result<AgentOutput<T>>>,
        D: FnOnce(&T) -> Value,
    {
        let stage = self.monitor.start_stage(stage_name, details);
        match catch_panic(call).await {
            Ok(output) => {
                self.monitor
                    .end_stage(stage, describe(&output.value), output.usage);
                Ok(output.value)
            }
            Err(err) => {
                self.monitor.fail_stage(stage, &err, TokenUsage::default());
                Err(agent_error(agent, err))
            }
        }
    }

    /// Forward a streaming agent's text as `TextChunk` events.
    async fn relay(
        &mut self,
        stage: StageHandle,
        mut stream: AgentStream,
        agent: &str,
    ) -> std::result::Result<(), Halt> {
        let mut chunks = 0usize;
        let mut characters = 0usize;

        loop {
            let item = match AssertUnwindSafe(stream.next()).catch_unwind().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => Err(AppError::Internal(format!("{} panicked while streaming", agent))),
            };

            match item {
                Ok(StreamChunk::Text(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    chunks += 1;
                    characters += text.chars().count();
                    if let Err(halt) = self.emit(OutputEvent::TextChunk(text)).await {
                        self.monitor
                            .fail_stage(stage, "cancelled by consumer", TokenUsage::default());
                        return Err(halt);
                    }
                }
                Ok(StreamChunk::Usage(usage)) => self.monitor.record_token_usage(stage, usage),
                Err(err) => {
                    self.monitor.end_stage(
                        stage,
                        json!({ "error": err.to_string(), "chunks": chunks }),
                        TokenUsage::default(),
                    );
                    return Err(agent_error(agent, err).into());
                }
            }
        }

        self.monitor.end_stage(
            stage,
            json!({ "chunks": chunks, "characters": characters }),
            TokenUsage::default(),
        );
        Ok(())
    }

    fn research_statement(&self) -> &str {
        self.clarification
            .as_ref()
            .map(|c| c.research_statement.as_str())
            .unwrap_or_default()
    }

    fn scope(&self) -> Scope {
        self.clarification
            .as_ref()
            .map(|c| c.scope)
            .unwrap_or_default()
    }
}

enum DispatchWait {
    Result(QueryResult),
    Finished,
    TimedOut,
    ConsumerGone,
}

/// Next worker result, bounded by the run deadline if there is one.
async fn next_before(stream: &mut DispatchStream, deadline: Option<Instant>) -> DispatchWait {
    let next = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(next) => next,
            Err(_) => return DispatchWait::TimedOut,
        },
        None => stream.next().await,
    };

    match next {
        Some(result) => DispatchWait::Result(result),
        None => DispatchWait::Finished,
    }
}

/// Turn a panic inside an agent future into an internal error.
async fn catch_panic<T, F>(call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(AppError::Internal("agent panicked".to_string())))
}

/// Attribute an error to the agent that raised it, keeping internal errors as-is.
fn agent_error(agent: &str, err: AppError) -> AppError {
    match err {
        AppError::Agent { .. } | AppError::Internal(_) => err,
        other => AppError::agent(agent, other),
    }
}
