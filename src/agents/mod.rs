//! Pipeline collaborators
//!
//! Every decision the pipeline makes is delegated to a pluggable agent. The
//! orchestrator only knows these traits; [`llm`] provides LLM-backed defaults
//! and tests supply scripted ones.

pub mod llm;

use crate::pipeline::aggregator::AggregateResult;
use crate::pipeline::context::RunContext;
use crate::pipeline::dispatcher::QueryTask;
use crate::types::{AppError, Conversation, Result, TokenUsage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// Re-export commonly used types
pub use llm::{
    LlmClarifier, LlmDirectResponder, LlmPlanner, LlmRouter, LlmSourceExecutor, LlmSummarizer,
    SourceDescriptor,
};

/// A value produced by an agent together with what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput<T> {
    pub value: T,
    pub usage: TokenUsage,
}

impl<T> AgentOutput<T> {
    pub fn new(value: T, usage: TokenUsage) -> Self {
        Self { value, usage }
    }

    /// Output with no recorded token usage.
    pub fn free(value: T) -> Self {
        Self {
            value,
            usage: TokenUsage::default(),
        }
    }
}

/// Where a conversation should go next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingDecision {
    /// Answer from the conversation alone.
    DirectResponse,
    /// Clarify, plan and query data sources.
    Research,
}

/// What a research run should return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// A deduplicated listing of matching items per source.
    Metadata,
    /// Full synthesized detail.
    #[default]
    Research,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Metadata => write!(f, "metadata"),
            Scope::Research => write!(f, "research"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationResult {
    pub sufficient: bool,
    pub research_statement: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub questions: Vec<String>,
}

impl ClarificationResult {
    pub fn sufficient(research_statement: impl Into<String>, scope: Scope) -> Self {
        Self {
            sufficient: true,
            research_statement: research_statement.into(),
            scope,
            questions: vec![],
        }
    }

    pub fn needs_clarification(questions: Vec<String>) -> Self {
        Self {
            sufficient: false,
            research_statement: String::new(),
            scope: Scope::default(),
            questions,
        }
    }
}

/// Ordered set of data sources selected for one research run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    sources: Vec<String>,
}

impl Plan {
    /// Build a plan, dropping repeated source ids while keeping first-seen order.
    pub fn new<I, S>(sources: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();

        for source in sources {
            let source = source.into().trim().to_string();
            if source.is_empty() {
                return Err(AppError::InvalidInput(
                    "plan contains an empty source id".to_string(),
                ));
            }
            if seen.insert(source.clone()) {
                ordered.push(source);
            }
        }

        Ok(Self { sources: ordered })
    }

    /// Reject sources outside `allowed`.
    pub fn restrict_to(&self, allowed: &[String]) -> Result<()> {
        let unknown: Vec<&str> = self
            .sources
            .iter()
            .filter(|s| !allowed.contains(s))
            .map(String::as_str)
            .collect();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(AppError::InvalidInput(format!(
                "plan references unknown sources: {}",
                unknown.join(", ")
            )))
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.sources.iter().any(|s| s == source_id)
    }
}

/// An item listed by a source in metadata scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl MetadataItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            attributes: serde_json::Map::new(),
        }
    }

    /// Identity used for deduplication: the id, or the title when no id is set.
    pub fn identity(&self) -> &str {
        if self.id.is_empty() {
            &self.title
        } else {
            &self.id
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SourceContent {
    Detail(String),
    Metadata(Vec<MetadataItem>),
}

impl SourceContent {
    /// Number of items (metadata) or 1 for a non-empty detail payload.
    pub fn item_count(&self) -> usize {
        match self {
            SourceContent::Detail(detail) => usize::from(!detail.trim().is_empty()),
            SourceContent::Metadata(items) => items.len(),
        }
    }
}

/// What a query executor returns for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResponse {
    pub content: SourceContent,
    #[serde(default)]
    pub doc_ids: Vec<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl SourceResponse {
    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            content: SourceContent::Detail(detail.into()),
            doc_ids: vec![],
            usage: TokenUsage::default(),
        }
    }

    pub fn metadata(items: Vec<MetadataItem>) -> Self {
        Self {
            content: SourceContent::Metadata(items),
            doc_ids: vec![],
            usage: TokenUsage::default(),
        }
    }

    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = doc_ids;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// A piece of a streamed agent response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Text(String),
    /// Usage reported by the model; may arrive more than once.
    Usage(TokenUsage),
}

/// Lazy text stream produced by streaming agents.
pub type AgentStream = BoxStream<'static, Result<StreamChunk>>;

// ============= Collaborator Traits =============

#[async_trait]
pub trait Router: Send + Sync {
    async fn decide(
        &self,
        conversation: &Conversation,
        ctx: &RunContext,
    ) -> Result<AgentOutput<RoutingDecision>>;
}

#[async_trait]
pub trait Clarifier: Send + Sync {
    async fn clarify(
        &self,
        conversation: &Conversation,
        ctx: &RunContext,
    ) -> Result<AgentOutput<ClarificationResult>>;
}

/// Selects data sources for a clarified research statement.
///
/// Returns raw source ids; the orchestrator turns them into a validated [`Plan`].
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, research_statement: &str, ctx: &RunContext)
        -> Result<AgentOutput<Vec<String>>>;
}

#[async_trait]
pub trait DirectResponder: Send + Sync {
    async fn respond(&self, conversation: &Conversation, ctx: &RunContext) -> Result<AgentStream>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        research_statement: &str,
        aggregate: &AggregateResult,
        ctx: &RunContext,
    ) -> Result<AgentStream>;
}

/// Runs one source's own query-and-synthesis.
///
/// Implementations must be cancel-safe: the dispatcher drops the future on
/// timeout or when the run is abandoned.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, task: &QueryTask) -> Result<SourceResponse>;
}
