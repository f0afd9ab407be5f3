//! Per-run identity, credential and configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Opaque credential made available to collaborators for the run.
///
/// The pipeline never inspects it; `Debug` output is redacted.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(secret: impl AsRef<str>) -> Self {
        Self(Arc::from(secret.as_ref()))
    }

    /// Read the credential from an environment variable.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var).ok().map(Self::new)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "Credential(<empty>)")
        } else {
            write!(f, "Credential(<redacted>)")
        }
    }
}

/// Timeouts, retries and concurrency limits for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Bound on a single source worker, retries included (default: 60 seconds)
    pub task_timeout: Duration,

    /// Bound on the whole run measured from its start; sources still pending
    /// when it passes are abandoned (default: none)
    pub run_timeout: Option<Duration>,

    /// Extra attempts after an executor error (default: 0)
    pub max_retries: u32,

    /// Delay before the first retry, doubled for each later one (default: 250ms)
    pub retry_backoff: Duration,

    /// Maximum number of workers running at once (default: 8)
    pub max_concurrency: usize,

    /// Capacity of the outward event channel (default: 32)
    pub event_buffer: usize,

    /// Whether the run monitor records stages (default: true)
    pub monitoring_enabled: bool,

    /// If set, plans may only reference these sources
    pub allowed_sources: Option<Vec<String>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(60),
            run_timeout: None,
            max_retries: 0,
            retry_backoff: Duration::from_millis(250),
            max_concurrency: 8,
            event_buffer: 32,
            monitoring_enabled: true,
            allowed_sources: None,
        }
    }
}

impl RunConfig {
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Clamped to at least one worker.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn with_allowed_sources(mut self, sources: Vec<String>) -> Self {
        self.allowed_sources = Some(sources);
        self
    }

    /// Disable stage recording (useful when monitoring overhead must be avoided)
    pub fn without_monitoring(mut self) -> Self {
        self.monitoring_enabled = false;
        self
    }

    /// Worker slots for a plan of `plan_len` sources.
    pub fn concurrency_for(&self, plan_len: usize) -> usize {
        plan_len.min(self.max_concurrency).max(1)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_backoff.saturating_mul(factor)
    }
}

/// Everything a run carries through every collaborator call.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub credential: Credential,
    pub config: RunConfig,
}

impl RunContext {
    pub fn new(credential: Credential, config: RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            credential,
            config,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Credential::default(), RunConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.task_timeout, Duration::from_secs(60));
        assert_eq!(config.run_timeout, None);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.max_concurrency, 8);
        assert!(config.monitoring_enabled);
    }

    #[test]
    fn test_config_builder_chaining() {
        let config = RunConfig::default()
            .with_task_timeout(Duration::from_millis(200))
            .with_run_timeout(Duration::from_secs(5))
            .with_max_retries(2)
            .with_max_concurrency(0)
            .without_monitoring();

        assert_eq!(config.task_timeout, Duration::from_millis(200));
        assert_eq!(config.run_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.max_concurrency, 1);
        assert!(!config.monitoring_enabled);
    }

    #[test]
    fn test_concurrency_bound() {
        let config = RunConfig::default().with_max_concurrency(3);
        assert_eq!(config.concurrency_for(2), 2);
        assert_eq!(config.concurrency_for(10), 3);
        assert_eq!(config.concurrency_for(0), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = RunConfig::default().with_retry_backoff(Duration::from_millis(100));
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("sk-secret");
        assert_eq!(format!("{:?}", cred), "Credential(<redacted>)");
        assert_eq!(cred.expose(), "sk-secret");
    }
}
