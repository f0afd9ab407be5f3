//! Result aggregation.
//!
//! Merges worker results according to the requested [`Scope`]: research scope
//! keeps each successful source's detail in completion order, metadata scope
//! deduplicates listed items per source. Failed sources are carried along so
//! the final summary can say how many sources actually answered.

use crate::agents::{MetadataItem, Scope, SourceContent};
use crate::pipeline::dispatcher::{QueryOutcome, QueryResult, SourceErrorKind};
use crate::pipeline::events::CompletionSummary;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSource {
    pub source_id: String,
    pub error_kind: SourceErrorKind,
    pub message: String,
}

impl FailedSource {
    /// A source the run stopped waiting for.
    pub fn abandoned(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            error_kind: SourceErrorKind::Abandoned,
            message: "run timed out before the source finished".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDetail {
    pub source_id: String,
    pub detail: String,
    #[serde(default)]
    pub doc_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceListing {
    pub source_id: String,
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub scope: Scope,
    /// Number of planned sources.
    pub total_sources: usize,
    /// Research scope: one entry per successful source, in completion order.
    #[serde(default)]
    pub details: Vec<SourceDetail>,
    /// Metadata scope: deduplicated items grouped by source.
    #[serde(default)]
    pub listings: Vec<SourceListing>,
    /// Sources that returned results.
    #[serde(default)]
    pub succeeded: Vec<String>,
    #[serde(default)]
    pub failed: Vec<FailedSource>,
}

impl AggregateResult {
    /// An aggregate over no sources at all.
    pub fn empty(scope: Scope) -> Self {
        Self {
            scope,
            total_sources: 0,
            details: vec![],
            listings: vec![],
            succeeded: vec![],
            failed: vec![],
        }
    }

    /// Detail payloads (research) or deduplicated items (metadata).
    pub fn result_count(&self) -> usize {
        match self.scope {
            Scope::Research => self.details.len(),
            Scope::Metadata => self.listings.iter().map(|l| l.items.len()).sum(),
        }
    }

    pub fn has_results(&self) -> bool {
        self.result_count() > 0
    }

    /// Record sources the run stopped waiting for.
    pub fn add_abandoned(&mut self, sources: impl IntoIterator<Item = String>) {
        self.failed
            .extend(sources.into_iter().map(FailedSource::abandoned));
    }

    pub fn summary(&self) -> CompletionSummary {
        CompletionSummary {
            succeeded_sources: self.succeeded.len(),
            total_sources: self.total_sources,
            result_count: self.result_count(),
            failed: self.failed.clone(),
        }
    }

    /// Research details joined into one document, each headed by its source.
    pub fn combined_detail(&self) -> String {
        self.details
            .iter()
            .map(|d| format!("[{}]\n{}", d.source_id, d.detail.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Human-readable listing of metadata items per source.
    pub fn format_listing(&self) -> String {
        let mut out = String::new();
        let sources_with_items = self.listings.iter().filter(|l| !l.items.is_empty()).count();
        let _ = writeln!(
            out,
            "Found {} item(s) across {} source(s):",
            self.result_count(),
            sources_with_items
        );

        for listing in &self.listings {
            let _ = writeln!(out, "\n{} ({}):", listing.source_id, listing.items.len());
            if listing.items.is_empty() {
                let _ = writeln!(out, "  (no matching items)");
            }
            for item in &listing.items {
                if item.id.is_empty() || item.id == item.title {
                    let _ = writeln!(out, "  - {}", item.title);
                } else {
                    let _ = writeln!(out, "  - {} [{}]", item.title, item.id);
                }
            }
        }

        if !self.failed.is_empty() {
            let _ = writeln!(out, "\nUnavailable:");
            for failed in &self.failed {
                let _ = writeln!(
                    out,
                    "  - {} ({}): {}",
                    failed.source_id, failed.error_kind, failed.message
                );
            }
        }

        out.trim_end().to_string()
    }
}

/// Merge worker results for `scope`, preserving the order they were given in.
pub fn aggregate(results: &[QueryResult], scope: Scope) -> AggregateResult {
    let mut aggregate = AggregateResult {
        total_sources: results.len(),
        ..AggregateResult::empty(scope)
    };
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for result in results {
        let response = match &result.outcome {
            QueryOutcome::Success(response) => response,
            QueryOutcome::Failure {
                error_kind,
                message,
            } => {
                aggregate.failed.push(FailedSource {
                    source_id: result.source_id.clone(),
                    error_kind: *error_kind,
                    message: message.clone(),
                });
                continue;
            }
        };

        if !aggregate.succeeded.contains(&result.source_id) {
            aggregate.succeeded.push(result.source_id.clone());
        }

        match scope {
            Scope::Research => {
                let detail = match &response.content {
                    SourceContent::Detail(detail) => detail.clone(),
                    SourceContent::Metadata(items) => items
                        .iter()
                        .map(|i| format!("- {}", i.title))
                        .collect::<Vec<_>>()
                        .join("\n"),
                };
                aggregate.details.push(SourceDetail {
                    source_id: result.source_id.clone(),
                    detail,
                    doc_ids: response.doc_ids.clone(),
                });
            }
            Scope::Metadata => {
                let idx = match aggregate
                    .listings
                    .iter()
                    .position(|l| l.source_id == result.source_id)
                {
                    Some(idx) => idx,
                    None => {
                        aggregate.listings.push(SourceListing {
                            source_id: result.source_id.clone(),
                            items: vec![],
                        });
                        aggregate.listings.len() - 1
                    }
                };

                let SourceContent::Metadata(items) = &response.content else {
                    tracing::debug!(
                        source_id = %result.source_id,
                        "detail payload ignored in metadata scope"
                    );
                    continue;
                };

                for item in items {
                    let key = (result.source_id.clone(), item.identity().to_string());
                    if seen.insert(key) {
                        aggregate.listings[idx].items.push(item.clone());
                    }
                }
            }
        }
    }

    aggregate
}
