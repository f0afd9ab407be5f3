//! # A.R.E.S Pipeline
//!
//! The query-answering pipeline behind A.R.E.S research runs: a conversation
//! is routed, clarified into a research statement, planned onto a set of data
//! sources, dispatched to those sources concurrently, aggregated and finally
//! synthesized into a streamed answer.
//!
//! Every decision is delegated to a pluggable agent trait (see [`agents`]),
//! so the orchestration can be driven by LLMs in production and by scripted
//! agents in tests.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ares_pipeline::{Conversation, Message, Pipeline, RunContext};
//! use futures::StreamExt;
//!
//! let pipeline = Pipeline::builder()
//!     .router(router)
//!     .clarifier(clarifier)
//!     .planner(planner)
//!     .direct_responder(responder)
//!     .summarizer(summarizer)
//!     .executor(executor)
//!     .build()?;
//!
//! let conversation = Conversation::new(vec![Message::user("What were Q3 sales?")]);
//! let mut events = pipeline.run(conversation, RunContext::default());
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event);
//! }
//! let record = events.finish().await?;
//! println!("{} tokens", record.total_token_usage.total_tokens);
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `ollama` | Ollama local inference (default) |
//!
//! ## Modules
//!
//! - [`pipeline`] - Orchestrator, dispatcher, aggregator and run monitor
//! - [`agents`] - Collaborator traits and LLM-backed implementations
//! - [`llm`] - LLM client implementations
//! - [`sink`] - Persistence of finished run records
//! - [`types`] - Common types and error handling
//! - [`utils`] - TOML configuration

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

/// Pipeline collaborators and their LLM-backed defaults.
pub mod agents;
/// Command-line interface for the `ares-pipeline` binary.
pub mod cli;
/// LLM provider clients and abstractions.
pub mod llm;
/// Run orchestration, dispatch, aggregation and monitoring.
pub mod pipeline;
/// Run record persistence.
pub mod sink;
/// Core types (conversation, token usage, errors).
pub mod types;
/// Configuration utilities.
pub mod utils;

// Re-export commonly used types
pub use llm::{LLMClient, LLMClientFactory, LLMResponse, Provider};
pub use pipeline::{
    AggregateResult, CompletionSummary, Credential, EventStream, OutputEvent, Pipeline,
    PipelineBuilder, PipelineState, RunConfig, RunContext, RunMonitor, RunOutcome, RunRecord,
    StatusUpdate,
};
pub use sink::{JsonlFileSink, MonitorSink, NoopSink, TracingSink};
pub use types::{AppError, Conversation, ErrorKind, Message, Result, TokenUsage};
pub use utils::toml_config::{PipelineConfig, PipelineConfigManager};
