//! LLM-backed pipeline agents.
//!
//! Each agent wraps an [`LLMClient`] and is forgiving about model output:
//! answers are matched by keyword or by the first JSON value embedded in the
//! reply, and fall back to a safe default when nothing parses.

use crate::agents::{
    AgentOutput, AgentStream, ClarificationResult, Clarifier, DirectResponder, MetadataItem,
    Planner, QueryExecutor, Router, RoutingDecision, Scope, SourceResponse, StreamChunk,
    Summarizer,
};
use crate::llm::{LLMChunk, LLMClient, LLMStream};
use crate::pipeline::aggregator::AggregateResult;
use crate::pipeline::context::RunContext;
use crate::pipeline::dispatcher::QueryTask;
use crate::types::{AppError, Conversation, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;

/// A data source the planner may choose from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: String,
    pub description: String,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
        }
    }
}

fn with_system(system: &str, conversation: &Conversation) -> Vec<(String, String)> {
    let mut messages = Vec::with_capacity(conversation.len() + 1);
    messages.push(("system".to_string(), system.to_string()));
    messages.extend(conversation.as_pairs());
    messages
}

fn into_agent_stream(stream: LLMStream) -> AgentStream {
    stream
        .map(|chunk| {
            chunk.map(|chunk| match chunk {
                LLMChunk::Text(text) => StreamChunk::Text(text),
                LLMChunk::Usage(usage) => StreamChunk::Usage(usage),
            })
        })
        .boxed()
}

/// Find the first balanced `open ... close` block, skipping over JSON strings.
fn extract_json(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..start + offset + c.len_utf8()]);
            }
        }
    }
    None
}

pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    extract_json(text, '{', '}')
}

pub(crate) fn extract_json_array(text: &str) -> Option<&str> {
    extract_json(text, '[', ']')
}

// ============= Router =============

/// Decides between answering directly and researching.
pub struct LlmRouter {
    llm: Arc<dyn LLMClient>,
}

impl LlmRouter {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self { llm }
    }

    /// Parse routing decision from LLM output
    ///
    /// Accepts a bare label, a label inside a sentence, or a label with
    /// punctuation. Unrecognised output routes to research.
    pub(crate) fn parse_routing_decision(output: &str) -> RoutingDecision {
        let trimmed = output.trim().to_lowercase();

        for word in trimmed.split(|c: char| !c.is_alphanumeric() && c != '_') {
            match word {
                "direct" | "direct_response" | "respond" => return RoutingDecision::DirectResponse,
                "research" => return RoutingDecision::Research,
                _ => {}
            }
        }

        tracing::debug!(
            "Router could not parse output '{}', defaulting to research",
            output
        );
        RoutingDecision::Research
    }
}

const ROUTER_PROMPT: &str = r#"You decide how a user's latest message should be handled.

- direct: greetings, small talk, or questions answerable from the conversation alone
- research: anything that needs information from the organisation's data sources

Respond with ONLY one word: direct or research."#;

#[async_trait]
impl Router for LlmRouter {
    async fn decide(
        &self,
        conversation: &Conversation,
        _ctx: &RunContext,
    ) -> Result<AgentOutput<RoutingDecision>> {
        let response = self
            .llm
            .generate_with_history(&with_system(ROUTER_PROMPT, conversation))
            .await?;
        Ok(AgentOutput::new(
            Self::parse_routing_decision(&response.content),
            response.usage,
        ))
    }
}

// ============= Clarifier =============

/// Turns a conversation into a research statement, or asks follow-up questions.
pub struct LlmClarifier {
    llm: Arc<dyn LLMClient>,
}

#[derive(Deserialize)]
struct RawClarification {
    #[serde(default = "default_true")]
    sufficient: bool,
    #[serde(default)]
    research_statement: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    questions: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl LlmClarifier {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self { llm }
    }

    pub(crate) fn parse_clarification(
        output: &str,
        fallback_statement: &str,
    ) -> ClarificationResult {
        let raw = extract_json_object(output)
            .and_then(|json| serde_json::from_str::<RawClarification>(json).ok());

        let Some(raw) = raw else {
            tracing::debug!("Clarifier returned no usable JSON, treating request as sufficient");
            return ClarificationResult::sufficient(fallback_statement, Scope::Research);
        };

        let questions: Vec<String> = raw
            .questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();

        if !raw.sufficient {
            if questions.is_empty() {
                return ClarificationResult::needs_clarification(vec![
                    "Could you tell me more about what you are looking for?".to_string(),
                ]);
            }
            return ClarificationResult::needs_clarification(questions);
        }

        let scope = match raw.scope.as_deref().map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("metadata") => Scope::Metadata,
            _ => Scope::Research,
        };
        let statement = raw.research_statement.trim();
        let statement = if statement.is_empty() {
            fallback_statement
        } else {
            statement
        };
        ClarificationResult::sufficient(statement, scope)
    }
}

const CLARIFIER_PROMPT: &str = r#"You prepare research requests.

Read the conversation and decide whether the latest request is specific enough to research.
Use scope "metadata" when the user wants a list of matching documents or records, and
"research" when they want an answer synthesized from their content.

Respond with ONLY a JSON object:
{"sufficient": true, "research_statement": "<self-contained request>",
 "scope": "research" | "metadata", "questions": []}
When the request is ambiguous set "sufficient" to false and list the questions to ask."#;

#[async_trait]
impl Clarifier for LlmClarifier {
    async fn clarify(
        &self,
        conversation: &Conversation,
        _ctx: &RunContext,
    ) -> Result<AgentOutput<ClarificationResult>> {
        let fallback = conversation
            .last_user_message()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let response = self
            .llm
            .generate_with_history(&with_system(CLARIFIER_PROMPT, conversation))
            .await?;

        Ok(AgentOutput::new(
            Self::parse_clarification(&response.content, fallback),
            response.usage,
        ))
    }
}

// ============= Planner =============

/// Chooses which data sources to query.
pub struct LlmPlanner {
    llm: Arc<dyn LLMClient>,
    sources: Vec<SourceDescriptor>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LLMClient>, sources: Vec<SourceDescriptor>) -> Self {
        Self { llm, sources }
    }

    fn system_prompt(&self) -> String {
        let catalog = self
            .sources
            .iter()
            .map(|s| format!("- {}: {}", s.id, s.description))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You select the data sources needed to answer a research request.\n\n\
             Available sources:\n{}\n\n\
             Respond with ONLY a JSON array of source ids, e.g. [\"{}\"]. \
             Respond with [] when no source is relevant.",
            catalog,
            self.sources.first().map(|s| s.id.as_str()).unwrap_or("source_id")
        )
    }

    /// Source ids from a JSON array, or known ids mentioned in prose.
    pub(crate) fn parse_plan(&self, output: &str) -> Vec<String> {
        if let Some(ids) = extract_json_array(output)
            .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
        {
            return ids;
        }

        let lowered = output.to_lowercase();
        self.sources
            .iter()
            .filter(|s| lowered.contains(&s.id.to_lowercase()))
            .map(|s| s.id.clone())
            .collect()
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        research_statement: &str,
        _ctx: &RunContext,
    ) -> Result<AgentOutput<Vec<String>>> {
        let response = self
            .llm
            .generate_with_system(&self.system_prompt(), research_statement)
            .await?;
        Ok(AgentOutput::new(
            self.parse_plan(&response.content),
            response.usage,
        ))
    }
}

// ============= Streaming responders =============

/// Answers conversational turns without touching data sources.
pub struct LlmDirectResponder {
    llm: Arc<dyn LLMClient>,
}

impl LlmDirectResponder {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self { llm }
    }
}

const DIRECT_PROMPT: &str =
    "You are a helpful assistant. Answer the user's latest message concisely.";

#[async_trait]
impl DirectResponder for LlmDirectResponder {
    async fn respond(&self, conversation: &Conversation, _ctx: &RunContext) -> Result<AgentStream> {
        let stream = self
            .llm
            .stream_with_history(&with_system(DIRECT_PROMPT, conversation))
            .await?;
        Ok(into_agent_stream(stream))
    }
}

/// Writes the final answer from aggregated source details.
pub struct LlmSummarizer {
    llm: Arc<dyn LLMClient>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LLMClient>) -> Self {
        Self { llm }
    }

    pub(crate) fn build_prompt(research_statement: &str, aggregate: &AggregateResult) -> String {
        let mut prompt = format!(
            "Research request:\n{}\n\nFindings by source:\n\n{}",
            research_statement,
            aggregate.combined_detail()
        );
        if !aggregate.failed.is_empty() {
            let unavailable = aggregate
                .failed
                .iter()
                .map(|f| f.source_id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            prompt.push_str(&format!("\n\nUnavailable sources: {}", unavailable));
        }
        prompt
    }
}

const SUMMARIZER_PROMPT: &str = "You write the final answer to a research request from the \
findings of several data sources. Cite sources by their id in brackets. Mention unavailable \
sources only if they limit the answer.";

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        research_statement: &str,
        aggregate: &AggregateResult,
        _ctx: &RunContext,
    ) -> Result<AgentStream> {
        let messages = vec![
            ("system".to_string(), SUMMARIZER_PROMPT.to_string()),
            (
                "user".to_string(),
                Self::build_prompt(research_statement, aggregate),
            ),
        ];
        let stream = self.llm.stream_with_history(&messages).await?;
        Ok(into_agent_stream(stream))
    }
}

// ============= Source executor =============

/// Answers a source query by prompting a model with the source's description.
pub struct LlmSourceExecutor {
    llm: Arc<dyn LLMClient>,
    sources: Vec<SourceDescriptor>,
}

#[derive(Deserialize)]
struct RawItem {
    #[serde(default)]
    id: serde_json::Value,
    #[serde(default, alias = "name")]
    title: String,
}

impl LlmSourceExecutor {
    pub fn new(llm: Arc<dyn LLMClient>, sources: Vec<SourceDescriptor>) -> Self {
        Self { llm, sources }
    }

    /// Items from a JSON array, or one item per bullet line.
    pub(crate) fn parse_items(output: &str) -> Vec<MetadataItem> {
        if let Some(raw) = extract_json_array(output)
            .and_then(|json| serde_json::from_str::<Vec<RawItem>>(json).ok())
        {
            return raw
                .into_iter()
                .filter(|item| !item.title.trim().is_empty())
                .map(|item| {
                    let id = match item.id {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    MetadataItem::new(id, item.title.trim())
                })
                .collect();
        }

        output
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                line.strip_prefix("- ")
                    .or_else(|| line.strip_prefix("* "))
                    .map(str::trim)
                    .filter(|title| !title.is_empty())
                    .map(|title| MetadataItem::new("", title))
            })
            .collect()
    }
}

#[async_trait]
impl QueryExecutor for LlmSourceExecutor {
    async fn execute(&self, task: &QueryTask) -> Result<SourceResponse> {
        let source = self
            .sources
            .iter()
            .find(|s| s.id == task.source_id)
            .ok_or_else(|| AppError::Executor(format!("unknown source '{}'", task.source_id)))?;

        let system = match task.scope {
            Scope::Research => format!(
                "You answer questions using the data source '{}': {}. \
                 Report only what this source contains.",
                source.id, source.description
            ),
            Scope::Metadata => format!(
                "You list records from the data source '{}': {}. \
                 Respond with ONLY a JSON array of objects with \"id\" and \"title\".",
                source.id, source.description
            ),
        };

        let response = self
            .llm
            .generate_with_system(&system, &task.research_statement)
            .await
            .map_err(|e| AppError::Executor(format!("{}: {}", source.id, e)))?;

        Ok(match task.scope {
            Scope::Research => SourceResponse::detail(response.content),
            Scope::Metadata => {
                let items = Self::parse_items(&response.content);
                let doc_ids = items
                    .iter()
                    .filter(|i| !i.id.is_empty())
                    .map(|i| i.id.clone())
                    .collect();
                SourceResponse::metadata(items).with_doc_ids(doc_ids)
            }
        }
        .with_usage(response.usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LLMResponse;
    use crate::types::{Message, TokenUsage};
    use rstest::rstest;

    struct CannedLlm(&'static str);

    #[async_trait]
    impl LLMClient for CannedLlm {
        async fn generate_with_system(&self, _: &str, _: &str) -> Result<LLMResponse> {
            Ok(LLMResponse::new(self.0, TokenUsage::new(12, 4)))
        }

        async fn generate_with_history(&self, _: &[(String, String)]) -> Result<LLMResponse> {
            Ok(LLMResponse::new(self.0, TokenUsage::new(12, 4)))
        }

        async fn stream_with_history(&self, _: &[(String, String)]) -> Result<LLMStream> {
            let words: Vec<Result<LLMChunk>> = self
                .0
                .split_inclusive(' ')
                .map(|w| Ok(LLMChunk::Text(w.to_string())))
                .chain(std::iter::once(Ok(LLMChunk::Usage(TokenUsage::new(3, 3)))))
                .collect();
            Ok(futures::stream::iter(words).boxed())
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    fn sources() -> Vec<SourceDescriptor> {
        vec![
            SourceDescriptor::new("sales_db", "quarterly sales figures"),
            SourceDescriptor::new("hr_db", "employee records"),
        ]
    }

    #[rstest]
    #[case("research", RoutingDecision::Research)]
    #[case("  Direct  ", RoutingDecision::DirectResponse)]
    #[case("I would route this to research.", RoutingDecision::Research)]
    #[case("direct_response", RoutingDecision::DirectResponse)]
    #[case("no idea", RoutingDecision::Research)]
    fn test_parse_routing_decision(#[case] output: &str, #[case] expected: RoutingDecision) {
        assert_eq!(LlmRouter::parse_routing_decision(output), expected);
    }

    #[test]
    fn test_extract_json_skips_braces_in_strings() {
        let text = r#"Sure! {"research_statement": "a } b", "sufficient": true} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"research_statement": "a } b", "sufficient": true}"#)
        );
        assert_eq!(extract_json_array("none here"), None);
        assert_eq!(extract_json_array("ids: [\"a\", [\"b\"]] ok"), Some("[\"a\", [\"b\"]]"));
    }

    #[test]
    fn test_parse_clarification() {
        let parsed = LlmClarifier::parse_clarification(
            r#"```json
{"sufficient": true, "research_statement": "Q3 revenue by region", "scope": "Metadata"}
```"#,
            "fallback",
        );
        assert_eq!(
            parsed,
            ClarificationResult::sufficient("Q3 revenue by region", Scope::Metadata)
        );

        let parsed = LlmClarifier::parse_clarification(
            r#"{"sufficient": false, "questions": ["Which quarter?", " "]}"#,
            "fallback",
        );
        assert!(!parsed.sufficient);
        assert_eq!(parsed.questions, vec!["Which quarter?".to_string()]);

        let parsed = LlmClarifier::parse_clarification("not json", "what were Q3 sales?");
        assert_eq!(parsed, ClarificationResult::sufficient("what were Q3 sales?", Scope::Research));
    }

    #[test]
    fn test_parse_plan() {
        let planner = LlmPlanner::new(Arc::new(CannedLlm("")), sources());
        assert_eq!(
            planner.parse_plan(r#"Use ["sales_db"]"#),
            vec!["sales_db".to_string()]
        );
        assert_eq!(
            planner.parse_plan("I'd check HR_DB and sales_db."),
            vec!["sales_db".to_string(), "hr_db".to_string()]
        );
        assert!(planner.parse_plan("[]").is_empty());
    }

    #[test]
    fn test_parse_items() {
        let items = LlmSourceExecutor::parse_items(
            r#"[{"id": 7, "title": "Q3 report"}, {"name": "Memo"}, {"id": "x", "title": " "}]"#,
        );
        assert_eq!(items, vec![MetadataItem::new("7", "Q3 report"), MetadataItem::new("", "Memo")]);

        let items = LlmSourceExecutor::parse_items("Found:\n- Budget\n* Minutes\nnothing else");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].title, "Minutes");
    }

    #[tokio::test]
    async fn test_router_reports_usage() {
        let router = LlmRouter::new(Arc::new(CannedLlm("direct")));
        let conversation = Conversation::new(vec![Message::user("hi")]);
        let output = router.decide(&conversation, &RunContext::default()).await.unwrap();
        assert_eq!(output.value, RoutingDecision::DirectResponse);
        assert_eq!(output.usage.total_tokens, 16);
    }

    #[tokio::test]
    async fn test_direct_responder_streams_text_and_usage() {
        let responder = LlmDirectResponder::new(Arc::new(CannedLlm("hello there")));
        let conversation = Conversation::new(vec![Message::user("hi")]);
        let chunks: Vec<StreamChunk> = responder
            .respond(&conversation, &RunContext::default())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks[0], StreamChunk::Text("hello ".to_string()));
        assert_eq!(chunks[1], StreamChunk::Text("there".to_string()));
        assert_eq!(chunks[2], StreamChunk::Usage(TokenUsage::new(3, 3)));
    }

    #[tokio::test]
    async fn test_executor_rejects_unknown_source() {
        let executor = LlmSourceExecutor::new(Arc::new(CannedLlm("[]")), sources());
        let task = QueryTask {
            source_id: "crm".to_string(),
            research_statement: "anything".to_string(),
            scope: Scope::Metadata,
            ctx: RunContext::default(),
        };
        let err = executor.execute(&task).await.unwrap_err();
        assert!(matches!(err, AppError::Executor(_)));
    }

    #[tokio::test]
    async fn test_executor_metadata_scope_collects_doc_ids() {
        let executor = LlmSourceExecutor::new(
            Arc::new(CannedLlm(r#"[{"id": "d1", "title": "Q3"}, {"title": "Memo"}]"#)),
            sources(),
        );
        let task = QueryTask {
            source_id: "sales_db".to_string(),
            research_statement: "Q3 documents".to_string(),
            scope: Scope::Metadata,
            ctx: RunContext::default(),
        };
        let response = executor.execute(&task).await.unwrap();
        assert_eq!(response.content.item_count(), 2);
        assert_eq!(response.doc_ids, vec!["d1".to_string()]);
        assert_eq!(response.usage.total_tokens, 16);
    }
}
