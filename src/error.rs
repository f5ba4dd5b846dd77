use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Detailed error types for the delivery pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Provider error from {model}: {message}")]
    Provider { model: String, message: String },

    #[error("All {attempted} models failed. Last error: {last_error}")]
    ModelsExhausted {
        attempted: usize,
        last_error: Box<PipelineError>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Patch error: {0}")]
    Patch(#[from] json_patch::PatchError),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Parse error: {message}\n\nRaw response:\n{raw_text}\n\nSuggestion: {suggestion}")]
    ParseWithContext {
        message: String,
        raw_text: String,
        suggestion: String,
    },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Worker failed on item {index}: {source}")]
    Worker {
        index: usize,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Queued call {index} failed during drain: {message}")]
    Drain { index: usize, message: String },

    #[error("Ready queue was dropped before the entry was drained")]
    QueueClosed,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Context error: {0}")]
    Context(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A model call failed or returned an unusable response.
    Provider,
    /// The partial-object source failed mid-stream.
    Stream,
    /// A per-item worker failed.
    Worker,
    /// A queued call failed while its batch was drained.
    Drain,
    /// A payload did not match its schema.
    Validation,
    /// Invalid configuration.
    Config,
    Other,
}

/// Serializable summary of an error, safe to hand to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl From<&PipelineError> for ErrorInfo {
    fn from(err: &PipelineError) -> Self {
        let model = match err {
            PipelineError::Provider { model, .. } => Some(model.clone()),
            PipelineError::ModelsExhausted { last_error, .. } => match last_error.as_ref() {
                PipelineError::Provider { model, .. } => Some(model.clone()),
                _ => None,
            },
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            model,
        }
    }
}

impl PipelineError {
    /// Create a provider error attributed to a model.
    pub fn provider(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Wrap a worker failure with the index of the input it was processing.
    pub fn worker(index: usize, source: PipelineError) -> Self {
        Self::Worker {
            index,
            source: Box::new(source),
        }
    }

    /// Create a parse error with helpful context.
    pub fn parse_error(err: serde_json::Error, raw_text: &str) -> Self {
        let suggestion = Self::suggest_parse_fix(&err, raw_text);
        Self::ParseWithContext {
            message: err.to_string(),
            raw_text: Self::truncate_for_display(raw_text, 500),
            suggestion,
        }
    }

    /// Classify this error into the pipeline's error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider { .. } | Self::ModelsExhausted { .. } | Self::ParseWithContext { .. } => {
                ErrorKind::Provider
            }
            Self::Stream(_) => ErrorKind::Stream,
            Self::Worker { .. } => ErrorKind::Worker,
            Self::Drain { .. } | Self::QueueClosed => ErrorKind::Drain,
            Self::Validation(_) | Self::Schema(_) => ErrorKind::Validation,
            Self::Config(_) => ErrorKind::Config,
            Self::Json(_)
            | Self::Patch(_)
            | Self::Persistence(_)
            | Self::Context(_)
            | Self::Io(_) => ErrorKind::Other,
        }
    }

    /// Serializable summary of this error.
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::from(self)
    }

    fn suggest_parse_fix(err: &serde_json::Error, raw_text: &str) -> String {
        let err_msg = err.to_string().to_lowercase();

        if err_msg.contains("expected value at line 1 column 1") {
            if raw_text.trim().is_empty() {
                return "The model returned an empty response. The next model in the chain \
                        will be tried."
                    .to_string();
            }
            if !raw_text.trim().starts_with(['{', '[']) {
                return "The model returned non-JSON text. Ask for JSON output explicitly \
                        in the system instruction."
                    .to_string();
            }
        }

        if err_msg.contains("eof while parsing") {
            return "The response was cut off. Raise max_tokens for this request.".to_string();
        }

        if err_msg.contains("missing field") {
            return "The model omitted a required field. Consider making the field \
                    optional with Option<T> or adding a description."
                .to_string();
        }

        if err_msg.contains("invalid type") {
            return "Type mismatch in response. Check that your schema types match \
                    what the model is likely to return (e.g., use f64 for numbers)."
                .to_string();
        }

        "Check that your schema matches the expected response format.".to_string()
    }

    fn truncate_for_display(text: &str, max_len: usize) -> String {
        if text.len() <= max_len {
            return text.to_string();
        }
        let mut cut = max_len;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!(
            "{}... [truncated, {} total chars]",
            &text[..cut],
            text.len()
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Extension trait for adding context to errors.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn with_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<PipelineError>> ResultExt<T> for std::result::Result<T, E> {
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let base_err = e.into();
            PipelineError::Context(format!("{}: {}", context.into(), base_err))
        })
    }
}
