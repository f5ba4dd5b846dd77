use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, Result},
    invoker::CriticPolicy,
    provider::ModelHandle,
};

/// Ordered fallback and feedback chains for one kind of generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelChain {
    /// Tried in order until one succeeds.
    pub primary: Vec<ModelHandle>,
    /// Reviewers for the accepted candidate.
    #[serde(default)]
    pub critics: Vec<ModelHandle>,
    /// Critique rounds to run; 0 disables the feedback phase.
    #[serde(default)]
    pub max_feedback_loops: usize,
}

impl ModelChain {
    pub fn new(primary: Vec<ModelHandle>) -> Self {
        Self {
            primary,
            ..Default::default()
        }
    }

    pub fn with_critics(mut self, critics: Vec<ModelHandle>, max_feedback_loops: usize) -> Self {
        self.critics = critics;
        self.max_feedback_loops = max_feedback_loops;
        self
    }
}

/// Global configuration for the delivery pipeline.
///
/// Every field is optional in the serialized form:
///
/// ```rust
/// use structured_delivery::PipelineConfig;
///
/// let config = PipelineConfig::from_json_str(r#"{
///     "models": { "primary": [{ "provider": "openai", "model": "gpt-4o-mini" }] },
///     "concurrency": 4,
///     "ready_throttle_ms": 50
/// }"#).unwrap();
/// assert_eq!(config.concurrency, Some(4));
/// assert_eq!(config.poll_ready_interval_ms, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub models: ModelChain,
    pub critic_policy: CriticPolicy,
    /// Window in which ready-queue readiness checks are coalesced (default: 0)
    pub ready_throttle_ms: u64,
    /// Periodic readiness polling for ready queues (default: disabled)
    pub poll_ready_interval_ms: Option<u64>,
    /// Maximum workers in flight (default: unbounded)
    pub concurrency: Option<usize>,
}

impl PipelineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(PipelineError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_ready_interval_ms == Some(0) {
            return Err(PipelineError::Config(
                "poll_ready_interval_ms must be positive".to_string(),
            ));
        }
        if self.models.max_feedback_loops > 0 && self.models.critics.is_empty() {
            return Err(PipelineError::Config(
                "max_feedback_loops is set but no critics are configured".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_models(mut self, models: ModelChain) -> Self {
        self.models = models;
        self
    }

    pub fn with_critic_policy(mut self, policy: CriticPolicy) -> Self {
        self.critic_policy = policy;
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    pub fn with_ready_throttle(mut self, window: Duration) -> Self {
        self.ready_throttle_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_poll_ready_interval(mut self, interval: Duration) -> Self {
        self.poll_ready_interval_ms = Some(u64::try_from(interval.as_millis().max(1)).unwrap_or(u64::MAX));
        self
    }

    pub fn ready_throttle(&self) -> Duration {
        Duration::from_millis(self.ready_throttle_ms)
    }

    pub fn poll_ready_interval(&self) -> Option<Duration> {
        self.poll_ready_interval_ms.map(Duration::from_millis)
    }
}
