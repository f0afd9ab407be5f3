//! Colored output helpers for CLI
//!
//! Provides consistent, colored terminal output for the pipeline CLI.

use crate::pipeline::events::{OutputEvent, SourceOutcome, StatusUpdate};
use owo_colors::OwoColorize;
use std::io::{self, Write};

/// Output style configuration
pub struct Output {
    /// Whether to use colored output
    pub colored: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

impl Output {
    /// Create a new output helper with colors enabled
    pub fn new() -> Self {
        Self { colored: true }
    }

    /// Create a new output helper with colors disabled
    pub fn no_color() -> Self {
        Self { colored: false }
    }

    /// Print a success message with a checkmark
    pub fn success(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "✓".green().bold(), message.green());
        } else {
            println!("  [OK] {}", message);
        }
    }

    /// Print an info message
    pub fn info(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "•".blue(), message);
        } else {
            println!("  [INFO] {}", message);
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.colored {
            println!("  {} {}", "⚠".yellow().bold(), message.yellow());
        } else {
            println!("  [WARN] {}", message);
        }
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.colored {
            eprintln!("  {} {}", "✗".red().bold(), message.red());
        } else {
            eprintln!("  [ERROR] {}", message);
        }
    }

    /// Print a header for a section
    pub fn header(&self, title: &str) {
        if self.colored {
            println!("\n  {}", title.bright_white().bold().underline());
        } else {
            println!("\n  === {} ===", title);
        }
    }

    /// Print a key-value pair
    pub fn kv(&self, key: &str, value: &str) {
        if self.colored {
            println!("    {}: {}", key.dimmed(), value.bright_white());
        } else {
            println!("    {}: {}", key, value);
        }
    }

    /// Print a list item
    pub fn list_item(&self, item: &str) {
        if self.colored {
            println!("    {} {}", "•".blue(), item);
        } else {
            println!("    - {}", item);
        }
    }

    /// Print a hint/tip message
    pub fn hint(&self, message: &str) {
        if self.colored {
            println!("\n  {}", message.dimmed().italic());
        } else {
            println!("\n  [TIP] {}", message);
        }
    }

    /// Print a table header row
    pub fn table_header(&self, columns: &[&str]) {
        let header: String = columns
            .iter()
            .map(|c| format!("{:<15}", c))
            .collect::<Vec<_>>()
            .join(" ");
        if self.colored {
            println!("    {}", header.bright_white().bold());
            println!("    {}", "─".repeat(columns.len() * 16).dimmed());
        } else {
            println!("    {}", header);
            println!("    {}", "-".repeat(columns.len() * 16));
        }
    }

    /// Print a table row
    pub fn table_row(&self, values: &[&str]) {
        let row: String = values
            .iter()
            .map(|v| format!("{:<15}", v))
            .collect::<Vec<_>>()
            .join(" ");
        println!("    {}", row);
    }

    /// Print a fragment of streamed answer text without a newline
    pub fn text_chunk(&self, text: &str) {
        print!("{}", text);
        io::stdout().flush().ok();
    }

    /// Print newline
    pub fn newline(&self) {
        println!();
    }

    /// Render one pipeline event for a terminal.
    ///
    /// `in_text` tracks whether the cursor is mid-answer, so status lines
    /// start on a fresh line.
    pub fn event(&self, event: &OutputEvent, in_text: &mut bool) {
        if let OutputEvent::TextChunk(text) = event {
            self.text_chunk(text);
            *in_text = true;
            return;
        }
        if std::mem::take(in_text) {
            self.newline();
        }

        match event {
            OutputEvent::TextChunk(_) => {}
            OutputEvent::Plan(plan) => {
                if plan.is_empty() {
                    self.info("No data sources selected");
                } else {
                    self.info(&format!("Querying {}", plan.sources().join(", ")));
                }
            }
            OutputEvent::StatusUpdate(status) => self.status(status),
            OutputEvent::ClarificationRequest { questions } => {
                self.header("More information needed");
                for question in questions {
                    self.list_item(question);
                }
            }
            OutputEvent::Completion(summary) => {
                if summary.total_sources > 0 {
                    self.success(&summary.describe());
                } else {
                    self.success("Done");
                }
            }
            OutputEvent::Error(err) => {
                self.error(&format!("{:?} error: {}", err.kind, err.message));
            }
        }
    }

    fn status(&self, status: &StatusUpdate) {
        match status {
            StatusUpdate::Source { source_id, outcome } => match outcome {
                SourceOutcome::Succeeded { items, .. } => {
                    self.info(&format!("{} returned {} result(s)", source_id, items))
                }
                SourceOutcome::Failed {
                    error_kind,
                    message,
                } => self.warning(&format!("{} failed ({}): {}", source_id, error_kind, message)),
            },
            StatusUpdate::Listing { text } => {
                self.newline();
                for line in text.lines() {
                    println!("  {}", line);
                }
            }
            StatusUpdate::Note { message } => self.info(message),
        }
    }
}
