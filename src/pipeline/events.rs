//! Outward-facing events produced by a pipeline run.

use crate::agents::Plan;
use crate::pipeline::aggregator::FailedSource;
use crate::pipeline::dispatcher::{QueryOutcome, QueryResult, SourceErrorKind};
use crate::types::{AppError, ErrorKind};
use serde::{Deserialize, Serialize};

/// One item of the lazy sequence returned by [`Pipeline::run`](crate::Pipeline::run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutputEvent {
    /// A fragment of streamed answer text.
    TextChunk(String),
    StatusUpdate(StatusUpdate),
    ClarificationRequest { questions: Vec<String> },
    Plan(Plan),
    Completion(CompletionSummary),
    Error(ErrorEvent),
}

impl OutputEvent {
    /// Whether this event ends the meaningful part of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputEvent::Completion(_) | OutputEvent::Error(_))
    }

    pub fn error(err: &AppError) -> Self {
        OutputEvent::Error(ErrorEvent {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusUpdate {
    /// A dispatched source finished (or was abandoned).
    Source {
        source_id: String,
        outcome: SourceOutcome,
    },
    /// Formatted listing of metadata items per source.
    Listing { text: String },
    /// Free-form progress note.
    Note { message: String },
}

impl StatusUpdate {
    pub fn note(message: impl Into<String>) -> Self {
        StatusUpdate::Note {
            message: message.into(),
        }
    }

    pub fn for_result(result: &QueryResult) -> Self {
        let outcome = match &result.outcome {
            QueryOutcome::Success(response) => SourceOutcome::Succeeded {
                items: response.content.item_count(),
                doc_ids: response.doc_ids.clone(),
            },
            QueryOutcome::Failure {
                error_kind,
                message,
            } => SourceOutcome::Failed {
                error_kind: *error_kind,
                message: message.clone(),
            },
        };
        StatusUpdate::Source {
            source_id: result.source_id.clone(),
            outcome,
        }
    }

    pub fn for_failed(failed: &FailedSource) -> Self {
        StatusUpdate::Source {
            source_id: failed.source_id.clone(),
            outcome: SourceOutcome::Failed {
                error_kind: failed.error_kind,
                message: failed.message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Succeeded { items: usize, doc_ids: Vec<String> },
    Failed { error_kind: SourceErrorKind, message: String },
}

/// Final summary of a run that was not cut short by a fatal error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    /// Sources that returned results.
    pub succeeded_sources: usize,
    /// Sources that were planned.
    pub total_sources: usize,
    /// Number of aggregated results (detail payloads or listed items).
    pub result_count: usize,
    #[serde(default)]
    pub failed: Vec<FailedSource>,
}

impl CompletionSummary {
    /// "N of M sources returned results".
    pub fn describe(&self) -> String {
        format!(
            "{} of {} sources returned results",
            self.succeeded_sources, self.total_sources
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::SourceResponse;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = OutputEvent::TextChunk("hello".to_string());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "text_chunk");
        assert_eq!(json["data"], "hello");

        let event = OutputEvent::ClarificationRequest {
            questions: vec!["Which quarter?".to_string()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "clarification_request");
        assert_eq!(json["data"]["questions"][0], "Which quarter?");
    }

    #[test]
    fn test_status_for_success_counts_items() {
        let result = QueryResult::success(
            "db_a",
            SourceResponse::metadata(vec![
                crate::agents::MetadataItem::new("1", "a"),
                crate::agents::MetadataItem::new("2", "b"),
            ])
            .with_doc_ids(vec!["1".to_string(), "2".to_string()]),
        );
        match StatusUpdate::for_result(&result) {
            StatusUpdate::Source { source_id, outcome } => {
                assert_eq!(source_id, "db_a");
                assert_eq!(
                    outcome,
                    SourceOutcome::Succeeded {
                        items: 2,
                        doc_ids: vec!["1".to_string(), "2".to_string()]
                    }
                );
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_completion_describe() {
        let summary = CompletionSummary {
            succeeded_sources: 1,
            total_sources: 2,
            ..Default::default()
        };
        assert_eq!(summary.describe(), "1 of 2 sources returned results");
    }

    #[test]
    fn test_terminal_events() {
        assert!(OutputEvent::Completion(CompletionSummary::default()).is_terminal());
        assert!(OutputEvent::error(&AppError::Internal("x".into())).is_terminal());
        assert!(!OutputEvent::TextChunk(String::new()).is_terminal());
    }
}
