#![allow(dead_code)]

pub mod mocks;

use ares_pipeline::{Conversation, Message, OutputEvent};

pub fn question(text: &str) -> Conversation {
    Conversation::new(vec![Message::user(text)])
}

/// Concatenated text of all `TextChunk` events.
pub fn answer_text(events: &[OutputEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            OutputEvent::TextChunk(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
