//! LLM Provider Clients
//!
//! The LLM-backed agents in [`crate::agents::llm`] talk to models through the
//! [`LLMClient`] trait. Providers are enabled via Cargo features:
//! - `ollama` - Local Ollama server (default)

/// Core LLM client trait and streaming response types.
pub mod client;

#[cfg(feature = "ollama")]
pub mod ollama;

pub use client::{LLMChunk, LLMClient, LLMClientFactory, LLMResponse, LLMStream, Provider};
