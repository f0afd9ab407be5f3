//! TOML-based configuration for the pipeline
//!
//! A single file (`ares-pipeline.toml` by default) describes logging, run
//! limits, the LLM provider, the available data sources and where run records
//! go. Every section is optional; missing values fall back to defaults.
//!
//! Use [`PipelineConfigManager`] for lock-free shared access to the current
//! configuration and manual reloads.

use crate::agents::llm::SourceDescriptor;
use crate::llm::Provider;
use crate::pipeline::context::{Credential, RunConfig};
use crate::sink::{JsonlFileSink, MonitorSink, NoopSink, TracingSink};
use crate::types::AppError;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub llm: LlmConfig,

    /// Data sources the planner may select, keyed by source id
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

// ============= Server Configuration =============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============= Pipeline Configuration =============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Per-source limit, covering all retries
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Optional limit for the whole run
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,

    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    #[serde(default = "default_true")]
    pub monitoring: bool,

    /// Name of the env var holding the data-source credential
    #[serde(default)]
    pub credential_env: Option<String>,

    /// Reject plans naming sources outside `[sources]`
    #[serde(default = "default_true")]
    pub restrict_to_sources: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout_secs(),
            run_timeout_secs: None,
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            max_concurrency: default_max_concurrency(),
            event_buffer: default_event_buffer(),
            monitoring: true,
            credential_env: None,
            restrict_to_sources: true,
        }
    }
}

fn default_task_timeout_secs() -> u64 {
    60
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_max_concurrency() -> usize {
    8
}

fn default_event_buffer() -> usize {
    32
}

fn default_true() -> bool {
    true
}

// ============= LLM Configuration =============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_ollama_url(),
            model: default_model(),
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

// ============= Sources & Monitor =============

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Tracing,
    Jsonl,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub sink: SinkKind,

    /// Output file for the `jsonl` sink
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Environment variable '{0}' referenced in config is not set")]
    MissingEnvVar(String),
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate limits, sources and env var availability
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;

        if pipeline.task_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.task_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if pipeline.run_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "pipeline.run_timeout_secs must be greater than 0 when set".to_string(),
            ));
        }
        if pipeline.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.max_concurrency must be at least 1".to_string(),
            ));
        }
        if pipeline.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.event_buffer must be at least 1".to_string(),
            ));
        }

        if let Some(env) = &pipeline.credential_env {
            self.validate_env_var(env)?;
        }

        if self.llm.provider != "ollama" {
            return Err(ConfigError::ValidationError(format!(
                "unsupported llm.provider '{}' (supported: ollama)",
                self.llm.provider
            )));
        }

        for id in self.sources.keys() {
            if id.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "source ids must not be empty".to_string(),
                ));
            }
        }

        if self.monitor.sink == SinkKind::Jsonl && self.monitor.path.is_none() {
            return Err(ConfigError::ValidationError(
                "monitor.path is required for the jsonl sink".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_env_var(&self, name: &str) -> Result<(), ConfigError> {
        std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
        Ok(())
    }

    /// Run limits derived from `[pipeline]` and `[sources]`
    pub fn to_run_config(&self) -> RunConfig {
        let p = &self.pipeline;
        let mut config = RunConfig::default()
            .with_task_timeout(Duration::from_secs(p.task_timeout_secs))
            .with_max_retries(p.max_retries)
            .with_retry_backoff(Duration::from_millis(p.retry_backoff_ms))
            .with_max_concurrency(p.max_concurrency)
            .with_event_buffer(p.event_buffer);

        if let Some(secs) = p.run_timeout_secs {
            config = config.with_run_timeout(Duration::from_secs(secs));
        }
        if p.restrict_to_sources && !self.sources.is_empty() {
            config = config.with_allowed_sources(self.sources.keys().cloned().collect());
        }
        if !p.monitoring {
            config = config.without_monitoring();
        }
        config
    }

    /// Credential from the configured env var, empty when none is configured
    pub fn credential(&self) -> Result<Credential, ConfigError> {
        match &self.pipeline.credential_env {
            Some(env) => {
                Credential::from_env(env).ok_or_else(|| ConfigError::MissingEnvVar(env.clone()))
            }
            None => Ok(Credential::default()),
        }
    }

    pub fn provider(&self) -> Provider {
        Provider::Ollama {
            base_url: self.llm.base_url.clone(),
            model: self.llm.model.clone(),
        }
    }

    pub fn source_descriptors(&self) -> Vec<SourceDescriptor> {
        self.sources
            .iter()
            .map(|(id, source)| SourceDescriptor::new(id.clone(), source.description.clone()))
            .collect()
    }

    pub fn build_sink(&self) -> Arc<dyn MonitorSink> {
        match (self.monitor.sink, &self.monitor.path) {
            (SinkKind::Jsonl, Some(path)) => Arc::new(JsonlFileSink::new(path.clone())),
            (SinkKind::Jsonl, None) | (SinkKind::None, _) => Arc::new(NoopSink),
            (SinkKind::Tracing, _) => Arc::new(TracingSink),
        }
    }
}

/// Thread-safe configuration holder with lock-free reads
pub struct PipelineConfigManager {
    config: Arc<ArcSwap<PipelineConfig>>,
    config_path: Option<PathBuf>,
}

impl PipelineConfigManager {
    /// Load the initial config from `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(ConfigError::ReadError)?
                .join(path)
        };

        let config = PipelineConfig::load(&path)?;

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path: Some(path),
        })
    }

    /// Wrap an in-memory config; `reload` is unavailable
    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path: None,
        }
    }

    /// Get the current configuration (lockless read)
    pub fn config(&self) -> Arc<PipelineConfig> {
        self.config.load_full()
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Reload the configuration from disk, keeping the old one on error
    pub fn reload(&self) -> Result<(), ConfigError> {
        let path = self.config_path.as_ref().ok_or_else(|| {
            ConfigError::ValidationError("configuration was not loaded from a file".to_string())
        })?;
        info!("Reloading configuration from {:?}", path);

        let new_config = PipelineConfig::load(path)?;
        self.config.store(Arc::new(new_config));

        info!("Configuration reloaded successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn create_test_config() -> String {
        r#"
[server]
log_level = "debug"
json_logs = true

[pipeline]
task_timeout_secs = 5
run_timeout_secs = 30
max_retries = 2
retry_backoff_ms = 100
max_concurrency = 4

[llm]
model = "qwen2.5"

[sources.sales_db]
description = "Quarterly sales figures"

[sources.hr_db]
description = "Employee records"

[monitor]
sink = "jsonl"
path = "runs/runs.jsonl"
"#
        .to_string()
    }

    #[test]
    fn test_parse_config() {
        let config = PipelineConfig::parse(&create_test_config()).unwrap();

        assert_eq!(config.server.log_level, "debug");
        assert!(config.server.json_logs);
        assert_eq!(config.pipeline.event_buffer, 32);
        assert_eq!(config.llm.base_url, "http://localhost:11434");
        assert_eq!(config.llm.model, "qwen2.5");
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.monitor.sink, SinkKind::Jsonl);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config =
            PipelineConfig::parse(include_str!("../../ares-pipeline.example.toml")).unwrap();
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.to_run_config().max_retries, 1);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = PipelineConfig::parse("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.to_run_config(), RunConfig::default());
    }

    #[test]
    fn test_to_run_config() {
        let config = PipelineConfig::parse(&create_test_config()).unwrap();
        let run = config.to_run_config();

        assert_eq!(run.task_timeout, Duration::from_secs(5));
        assert_eq!(run.run_timeout, Some(Duration::from_secs(30)));
        assert_eq!(run.max_retries, 2);
        assert_eq!(run.retry_backoff, Duration::from_millis(100));
        assert_eq!(run.max_concurrency, 4);
        assert_eq!(
            run.allowed_sources,
            Some(vec!["hr_db".to_string(), "sales_db".to_string()])
        );
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let result = PipelineConfig::parse("[pipeline]\nmax_concurrency = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_jsonl_requires_path() {
        let result = PipelineConfig::parse("[monitor]\nsink = \"jsonl\"\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validation_missing_env_var() {
        let result = PipelineConfig::parse(
            "[pipeline]\ncredential_env = \"ARES_PIPELINE_TEST_UNSET_CREDENTIAL\"\n",
        );
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = PipelineConfig::parse("[pipeline\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = PipelineConfig::load("/nonexistent/ares-pipeline.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_source_descriptors_and_provider() {
        let config = PipelineConfig::parse(&create_test_config()).unwrap();
        let sources = config.source_descriptors();
        assert_eq!(sources[0], SourceDescriptor::new("hr_db", "Employee records"));
        assert_eq!(config.provider().model(), "qwen2.5");
    }

    #[test]
    fn test_manager_reload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nmax_retries = 1").unwrap();

        let manager = PipelineConfigManager::new(file.path()).unwrap();
        assert_eq!(manager.config().pipeline.max_retries, 1);

        let mut rewritten = fs::File::create(file.path()).unwrap();
        writeln!(rewritten, "[pipeline]\nmax_retries = 3").unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.config().pipeline.max_retries, 3);

        // An invalid file keeps the previous config.
        let mut broken = fs::File::create(file.path()).unwrap();
        writeln!(broken, "[pipeline]\nmax_concurrency = 0").unwrap();
        assert!(manager.reload().is_err());
        assert_eq!(manager.config().pipeline.max_retries, 3);
    }

    #[test]
    fn test_from_config_cannot_reload() {
        let manager = PipelineConfigManager::from_config(PipelineConfig::default());
        assert!(manager.config_path().is_none());
        assert!(manager.reload().is_err());
    }
}
