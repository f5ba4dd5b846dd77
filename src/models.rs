use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorInfo, PipelineError, Result};

/// Which chain a model attempt belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Primary,
    Critic,
}

/// Information about an individual model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAttempt {
    pub model: String,
    pub phase: AttemptPhase,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelAttempt {
    pub fn success(model: impl Into<String>, phase: AttemptPhase) -> Self {
        Self {
            model: model.into(),
            phase,
            success: true,
            error: None,
        }
    }

    pub fn failure(model: impl Into<String>, phase: AttemptPhase, error: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            phase,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Trace of everything the invoker tried for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationReport {
    pub attempts: Vec<ModelAttempt>,
    /// Primary model whose answer was accepted.
    pub accepted_model: Option<String>,
    /// Number of critic revisions applied to the candidate.
    pub revisions: usize,
    /// Feedback loop iterations that ran.
    pub feedback_loops: usize,
}

impl InvocationReport {
    /// Attempts made against the given chain.
    pub fn attempts_in(&self, phase: AttemptPhase) -> impl Iterator<Item = &ModelAttempt> {
        self.attempts.iter().filter(move |a| a.phase == phase)
    }
}

/// Result of one top-level invocation, however many models were tried.
#[derive(Debug, Clone)]
pub enum GenerationOutcome<T> {
    Success {
        data: T,
        report: InvocationReport,
    },
    Failure {
        error: ErrorInfo,
        /// Last unvalidated response, when a model answered but was rejected.
        data: Option<Value>,
        report: InvocationReport,
    },
}

impl<T> GenerationOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Success { data, .. } => Some(data),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    pub fn report(&self) -> &InvocationReport {
        match self {
            Self::Success { report, .. } | Self::Failure { report, .. } => report,
        }
    }

    /// Convert into a `Result`, dropping the report.
    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Failure { error, .. } => Err(match error.model {
                Some(model) => PipelineError::provider(model, error.message),
                None => PipelineError::Context(error.message),
            }),
        }
    }
}
