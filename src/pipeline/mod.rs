//! The query-answering pipeline.
//!
//! - [`orchestrator`] - the run state machine and its event stream
//! - [`dispatcher`] - parallel, bounded fan-out of per-source queries
//! - [`aggregator`] - merging of per-source results by scope
//! - [`monitor`] - thread-safe stage and token accounting
//! - [`events`] - events surfaced to the caller
//! - [`context`] - per-run configuration and credentials

pub mod aggregator;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod monitor;
pub mod orchestrator;

pub use aggregator::{aggregate, AggregateResult, FailedSource};
pub use context::{Credential, RunConfig, RunContext};
pub use dispatcher::{
    DispatchStream, Dispatcher, QueryOutcome, QueryResult, QueryTask, SourceErrorKind,
};
pub use events::{CompletionSummary, ErrorEvent, OutputEvent, SourceOutcome, StatusUpdate};
pub use monitor::{RunMonitor, RunOutcome, RunRecord, Stage, StageHandle};
pub use orchestrator::{EventStream, Pipeline, PipelineBuilder, PipelineState};
