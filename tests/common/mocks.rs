//! Scripted collaborators for pipeline tests.
//!
//! Every agent returns a fixed answer with a fixed token usage, so tests can
//! assert exact event sequences and token totals without a model.

use ares_pipeline::agents::{
    AgentOutput, AgentStream, ClarificationResult, Clarifier, DirectResponder, MetadataItem,
    Planner, QueryExecutor, Router, RoutingDecision, Scope, SourceResponse, StreamChunk,
    Summarizer,
};
use ares_pipeline::pipeline::{AggregateResult, QueryTask};
use ares_pipeline::{
    AppError, Conversation, MonitorSink, Pipeline, Result, RunContext, RunRecord, TokenUsage,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ROUTER_USAGE: TokenUsage = usage(10, 2);
pub const CLARIFIER_USAGE: TokenUsage = usage(20, 5);
pub const PLANNER_USAGE: TokenUsage = usage(15, 3);
pub const RESPONDER_USAGE: TokenUsage = usage(8, 4);
pub const SUMMARIZER_USAGE: TokenUsage = usage(40, 12);
pub const SOURCE_USAGE: TokenUsage = usage(6, 2);

const fn usage(prompt_tokens: u64, completion_tokens: u64) -> TokenUsage {
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        cost: 0.0,
    }
}

/// Where a scripted agent should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Router,
    Clarifier,
    Planner,
    DirectResponder,
    /// The summarizer call itself errors before any stream exists.
    SummarizerCall,
    /// The summarizer stream errors after its first chunk.
    SummarizerStream,
    RouterPanic,
    /// The summarizer stream panics after its first chunk.
    SummarizerStreamPanic,
}

/// Router, clarifier, planner and both streaming agents in one script.
pub struct ScriptedAgents {
    pub decision: RoutingDecision,
    pub clarification: ClarificationResult,
    pub plan: Vec<String>,
    pub reply: Vec<String>,
    pub fail_at: Option<FailAt>,
    /// How long the router thinks before deciding.
    pub router_delay: Duration,
    pub planner_calls: AtomicUsize,
    pub summarizer_calls: AtomicUsize,
    /// Sources the summarizer was given, per call.
    pub summarized_sources: Mutex<Vec<Vec<String>>>,
}

impl ScriptedAgents {
    pub fn direct(reply: &[&str]) -> Self {
        Self {
            decision: RoutingDecision::DirectResponse,
            clarification: ClarificationResult::sufficient("", Scope::Research),
            plan: vec![],
            reply: reply.iter().map(|s| s.to_string()).collect(),
            fail_at: None,
            router_delay: Duration::ZERO,
            planner_calls: AtomicUsize::new(0),
            summarizer_calls: AtomicUsize::new(0),
            summarized_sources: Mutex::new(vec![]),
        }
    }

    pub fn research(scope: Scope, plan: &[&str]) -> Self {
        Self {
            decision: RoutingDecision::Research,
            clarification: ClarificationResult::sufficient("Q3 sales by region", scope),
            plan: plan.iter().map(|s| s.to_string()).collect(),
            ..Self::direct(&["Sales ", "grew ", "in Q3."])
        }
    }

    pub fn needing_clarification(questions: &[&str]) -> Self {
        Self {
            decision: RoutingDecision::Research,
            clarification: ClarificationResult::needs_clarification(
                questions.iter().map(|s| s.to_string()).collect(),
            ),
            ..Self::direct(&[])
        }
    }

    pub fn failing_at(mut self, fail_at: FailAt) -> Self {
        self.fail_at = Some(fail_at);
        self
    }

    pub fn with_router_delay(mut self, ms: u64) -> Self {
        self.router_delay = Duration::from_millis(ms);
        self
    }

    fn fails(&self, at: FailAt) -> bool {
        self.fail_at == Some(at)
    }

    fn reply_stream(&self, usage: TokenUsage, fail_after_first: bool) -> AgentStream {
        let mut chunks: Vec<Result<StreamChunk>> = self
            .reply
            .iter()
            .map(|text| Ok(StreamChunk::Text(text.clone())))
            .collect();
        if fail_after_first {
            chunks.truncate(1);
            chunks.push(Err(AppError::LLM("stream interrupted".to_string())));
        } else {
            chunks.push(Ok(StreamChunk::Usage(usage)));
        }
        stream::iter(chunks).boxed()
    }

    fn panicking_stream(&self) -> AgentStream {
        let first = self.reply.first().cloned().unwrap_or_default();
        stream::iter(0..2)
            .map(move |i| {
                if i == 0 {
                    Ok(StreamChunk::Text(first.clone()))
                } else {
                    panic!("summarizer lost its model mid-stream")
                }
            })
            .boxed()
    }
}

#[async_trait]
impl Router for ScriptedAgents {
    async fn decide(
        &self,
        _: &Conversation,
        _: &RunContext,
    ) -> Result<AgentOutput<RoutingDecision>> {
        if !self.router_delay.is_zero() {
            tokio::time::sleep(self.router_delay).await;
        }
        if self.fails(FailAt::RouterPanic) {
            panic!("router crashed");
        }
        if self.fails(FailAt::Router) {
            return Err(AppError::LLM("router model unavailable".to_string()));
        }
        Ok(AgentOutput::new(self.decision, ROUTER_USAGE))
    }
}

#[async_trait]
impl Clarifier for ScriptedAgents {
    async fn clarify(
        &self,
        _: &Conversation,
        _: &RunContext,
    ) -> Result<AgentOutput<ClarificationResult>> {
        if self.fails(FailAt::Clarifier) {
            return Err(AppError::LLM("clarifier model unavailable".to_string()));
        }
        Ok(AgentOutput::new(self.clarification.clone(), CLARIFIER_USAGE))
    }
}

#[async_trait]
impl Planner for ScriptedAgents {
    async fn plan(&self, _: &str, _: &RunContext) -> Result<AgentOutput<Vec<String>>> {
        self.planner_calls.fetch_add(1, Ordering::SeqCst);
        if self.fails(FailAt::Planner) {
            return Err(AppError::LLM("planner model unavailable".to_string()));
        }
        Ok(AgentOutput::new(self.plan.clone(), PLANNER_USAGE))
    }
}

#[async_trait]
impl DirectResponder for ScriptedAgents {
    async fn respond(&self, _: &Conversation, _: &RunContext) -> Result<AgentStream> {
        if self.fails(FailAt::DirectResponder) {
            return Err(AppError::LLM("responder model unavailable".to_string()));
        }
        Ok(self.reply_stream(RESPONDER_USAGE, false))
    }
}

#[async_trait]
impl Summarizer for ScriptedAgents {
    async fn summarize(
        &self,
        _: &str,
        aggregate: &AggregateResult,
        _: &RunContext,
    ) -> Result<AgentStream> {
        self.summarizer_calls.fetch_add(1, Ordering::SeqCst);
        self.summarized_sources
            .lock()
            .push(aggregate.succeeded.clone());
        if self.fails(FailAt::SummarizerCall) {
            return Err(AppError::LLM("summarizer model unavailable".to_string()));
        }
        if self.fails(FailAt::SummarizerStreamPanic) {
            return Ok(self.panicking_stream());
        }
        Ok(self.reply_stream(SUMMARIZER_USAGE, self.fails(FailAt::SummarizerStream)))
    }
}

/// How a scripted source behaves.
#[derive(Debug, Clone)]
pub enum SourceBehavior {
    /// Answer after a delay.
    Answer(Duration),
    /// Fail after a delay.
    Fail(Duration),
    /// Fail the first attempt, then answer.
    Flaky,
    /// Never answer.
    Hang,
}

/// Per-source scripted executor that tracks concurrency.
#[derive(Default)]
pub struct ScriptedExecutor {
    behaviors: HashMap<String, SourceBehavior>,
    metadata: HashMap<String, Vec<MetadataItem>>,
    calls: Mutex<HashMap<String, usize>>,
    running: AtomicUsize,
    pub peak_concurrency: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: &str, behavior: SourceBehavior) -> Self {
        self.behaviors.insert(source.to_string(), behavior);
        self
    }

    pub fn answer_ms(self, source: &str, ms: u64) -> Self {
        self.source(source, SourceBehavior::Answer(Duration::from_millis(ms)))
    }

    /// Items returned in metadata scope; defaults to one item per source.
    pub fn with_items(mut self, source: &str, items: &[(&str, &str)]) -> Self {
        self.metadata.insert(
            source.to_string(),
            items
                .iter()
                .map(|(id, title)| MetadataItem::new(*id, *title))
                .collect(),
        );
        self
    }

    pub fn calls(&self, source: &str) -> usize {
        self.calls.lock().get(source).copied().unwrap_or_default()
    }

    fn respond(&self, task: &QueryTask) -> SourceResponse {
        let response = match task.scope {
            Scope::Research => {
                SourceResponse::detail(format!("{} says sales grew", task.source_id))
                    .with_doc_ids(vec![format!("{}-doc", task.source_id)])
            }
            Scope::Metadata => SourceResponse::metadata(
                self.metadata
                    .get(&task.source_id)
                    .cloned()
                    .unwrap_or_else(|| vec![MetadataItem::new("1", "Quarterly report")]),
            ),
        };
        response.with_usage(SOURCE_USAGE)
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute(&self, task: &QueryTask) -> Result<SourceResponse> {
        let attempt = {
            let mut calls = self.calls.lock();
            let count = calls.entry(task.source_id.clone()).or_default();
            *count += 1;
            *count
        };
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrency.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .get(&task.source_id)
            .cloned()
            .unwrap_or(SourceBehavior::Answer(Duration::ZERO));

        let result = match behavior {
            SourceBehavior::Answer(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.respond(task))
            }
            SourceBehavior::Fail(delay) => {
                tokio::time::sleep(delay).await;
                Err(AppError::Executor(format!("{} is down", task.source_id)))
            }
            SourceBehavior::Flaky if attempt == 1 => {
                Err(AppError::Executor(format!("{} hiccup", task.source_id)))
            }
            SourceBehavior::Flaky => Ok(self.respond(task)),
            SourceBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Ok(self.respond(task))
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Keeps every persisted record.
#[derive(Default)]
pub struct CapturingSink {
    pub records: Mutex<Vec<RunRecord>>,
}

#[async_trait]
impl MonitorSink for CapturingSink {
    async fn persist(&self, record: &RunRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Always fails, counting attempts.
#[derive(Default)]
pub struct FailingSink {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl MonitorSink for FailingSink {
    async fn persist(&self, _record: &RunRecord) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Persistence("disk full".to_string()))
    }
}

pub fn build_pipeline(
    agents: Arc<ScriptedAgents>,
    executor: Arc<ScriptedExecutor>,
    sink: Arc<dyn MonitorSink>,
) -> Pipeline {
    Pipeline::builder()
        .router(agents.clone())
        .clarifier(agents.clone())
        .planner(agents.clone())
        .direct_responder(agents.clone())
        .summarizer(agents)
        .executor(executor)
        .sink(sink)
        .build()
        .expect("all collaborators provided")
}
