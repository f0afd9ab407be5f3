//! LLM client abstraction used by the LLM-backed agents.

use crate::types::{Result, TokenUsage};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Generic LLM client trait for provider abstraction
///
/// Agents only talk to this trait, so a run can be driven by any provider
/// (or by a scripted client in tests).
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Generate with system prompt
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<LLMResponse>;

    /// Generate with conversation history
    async fn generate_with_history(
        &self,
        messages: &[(String, String)], // (role, content) pairs
    ) -> Result<LLMResponse>;

    /// Stream a completion over conversation history
    ///
    /// Usage, when the provider reports it, arrives as a final
    /// [`LLMChunk::Usage`].
    async fn stream_with_history(&self, messages: &[(String, String)]) -> Result<LLMStream>;

    /// Get the model name/identifier
    fn model_name(&self) -> &str;
}

/// Response from an LLM generation request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LLMResponse {
    pub content: String,
    pub usage: TokenUsage,
}

impl LLMResponse {
    pub fn new(content: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            content: content.into(),
            usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LLMChunk {
    Text(String),
    Usage(TokenUsage),
}

pub type LLMStream = BoxStream<'static, Result<LLMChunk>>;

/// Provider enum for runtime selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// Ollama local LLM provider
    ///
    /// # Example
    /// ```rust,ignore
    /// let provider = Provider::Ollama {
    ///     base_url: "http://localhost:11434".to_string(),
    ///     model: "llama3.2".to_string(),
    /// };
    /// ```
    Ollama { base_url: String, model: String },
}

impl Provider {
    /// Create a client instance for this provider
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the provider's feature is not compiled in.
    pub async fn create_client(&self) -> Result<Box<dyn LLMClient>> {
        match self {
            #[cfg(feature = "ollama")]
            Provider::Ollama { base_url, model } => Ok(Box::new(
                super::ollama::OllamaClient::new(base_url.clone(), model.clone()).await?,
            )),

            #[cfg(not(feature = "ollama"))]
            Provider::Ollama { model, .. } => Err(crate::types::AppError::Configuration(format!(
                "Ollama support is not compiled in (requested model '{}'); \
                 enable the `ollama` feature",
                model
            ))),
        }
    }

    /// Check if this provider is compiled in
    pub fn is_implemented(&self) -> bool {
        match self {
            Provider::Ollama { .. } => cfg!(feature = "ollama"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Ollama { .. } => "Ollama",
        }
    }

    pub fn model(&self) -> &str {
        match self {
            Provider::Ollama { model, .. } => model,
        }
    }
}

/// Configuration-based client factory
pub struct LLMClientFactory {
    default_provider: Provider,
}

impl LLMClientFactory {
    pub fn new(default_provider: Provider) -> Self {
        Self { default_provider }
    }

    /// Create a client using the default provider
    pub async fn create_default(&self) -> Result<Box<dyn LLMClient>> {
        self.default_provider.create_client().await
    }

    pub fn default_provider(&self) -> &Provider {
        &self.default_provider
    }

    pub fn is_default_implemented(&self) -> bool {
        self.default_provider.is_implemented()
    }
}

/// Split `scheme://host[:port]` into `scheme://host` and a port.
pub fn split_host_port(base_url: &str, default_port: u16) -> (String, u16) {
    let (scheme, rest) = base_url
        .trim_end_matches('/')
        .split_once("://")
        .unwrap_or(("http", base_url.trim_end_matches('/')));

    match rest.rsplit_once(':') {
        Some((host, port)) => (
            format!("{}://{}", scheme, host),
            port.parse().unwrap_or(default_port),
        ),
        None => (format!("{}://{}", scheme, rest), default_port),
    }
}
