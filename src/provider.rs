//! The model-calling capability the pipeline consumes.
//!
//! Concrete providers live outside this crate. They implement [`ModelCaller`] and are
//! selected per [`ModelHandle`] through a [`ProviderRegistry`] lookup table, so the
//! invoker never sees a provider SDK.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{PipelineError, Result},
    request::GenerationRequest,
    schema::parse_model_text,
};

/// Stream of partial snapshots for one generation.
pub type SnapshotStream = BoxStream<'static, Result<Value>>;

/// Which backend family a [`ModelHandle`] resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Custom(String),
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAi => f.write_str("openai"),
            Self::Anthropic => f.write_str("anthropic"),
            Self::Gemini => f.write_str("gemini"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Opaque reference to a callable model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub provider: ProviderKind,
    pub model: String,
    /// Provider-specific settings (endpoint, deployment, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl ModelHandle {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Stable label used in logs and attempt reports, e.g. `openai/gpt-4o`.
    pub fn label(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

/// Something that can run a [`GenerationRequest`] against a model.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// Run the request to completion and return the parsed JSON response.
    async fn generate(&self, model: &ModelHandle, request: &GenerationRequest) -> Result<Value>;

    /// Run the request and return its partial snapshots as they grow.
    ///
    /// The default emits the complete response as a single snapshot.
    async fn stream(&self, model: &ModelHandle, request: &GenerationRequest) -> Result<SnapshotStream> {
        let value = self.generate(model, request).await?;
        Ok(Box::pin(stream::once(async move { Ok(value) })))
    }
}

/// Lookup table from provider family to its implementation.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    callers: HashMap<ProviderKind, Arc<dyn ModelCaller>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the implementation used for every handle of `kind`.
    pub fn register(mut self, kind: ProviderKind, caller: impl ModelCaller + 'static) -> Self {
        self.callers.insert(kind, Arc::new(caller));
        self
    }

    pub fn contains(&self, kind: &ProviderKind) -> bool {
        self.callers.contains_key(kind)
    }

    fn resolve(&self, model: &ModelHandle) -> Result<&Arc<dyn ModelCaller>> {
        self.callers.get(&model.provider).ok_or_else(|| {
            PipelineError::Config(format!(
                "no provider registered for '{}' (model {})",
                model.provider, model.model
            ))
        })
    }
}

#[async_trait]
impl ModelCaller for ProviderRegistry {
    async fn generate(&self, model: &ModelHandle, request: &GenerationRequest) -> Result<Value> {
        self.resolve(model)?.generate(model, request).await
    }

    async fn stream(&self, model: &ModelHandle, request: &GenerationRequest) -> Result<SnapshotStream> {
        self.resolve(model)?.stream(model, request).await
    }
}

/// Handler used to short-circuit model calls during tests.
///
/// The handler receives a lightweight view of the call and returns the raw text the
/// model would have produced.
pub type MockHandler = Arc<dyn Fn(MockRequest) -> Result<String> + Send + Sync>;

/// Minimal view of a model call passed to a [`MockHandler`].
#[derive(Debug, Clone)]
pub struct MockRequest {
    /// Model label, e.g. `openai/gpt-4o`.
    pub model: String,
    pub system_instruction: Option<String>,
    /// The last message of the conversation.
    pub last_message: String,
    pub message_count: usize,
}

/// [`ModelCaller`] backed by a closure, for tests that must not touch the network.
#[derive(Clone)]
pub struct MockModelCaller {
    handler: MockHandler,
}

impl MockModelCaller {
    pub fn new(handler: impl Fn(MockRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl ModelCaller for MockModelCaller {
    async fn generate(&self, model: &ModelHandle, request: &GenerationRequest) -> Result<Value> {
        let mock = MockRequest {
            model: model.label(),
            system_instruction: request.system_instruction.clone(),
            last_message: request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            message_count: request.messages.len(),
        };
        let raw = (self.handler)(mock)?;
        parse_model_text(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn request() -> GenerationRequest {
        GenerationRequest::new(json!({"type": "object"})).user_text("hi")
    }

    #[test]
    fn provider_kind_round_trips_through_config() {
        let handle: ModelHandle =
            serde_json::from_value(json!({"provider": "anthropic", "model": "claude"})).unwrap();
        assert_eq!(handle.provider, ProviderKind::Anthropic);
        assert_eq!(handle.label(), "anthropic/claude");

        let custom: ModelHandle =
            serde_json::from_value(json!({"provider": {"custom": "local"}, "model": "llama"}))
                .unwrap();
        assert_eq!(custom.label(), "custom:local/llama");
    }

    #[tokio::test]
    async fn registry_dispatches_by_provider() {
        let registry = ProviderRegistry::new()
            .register(
                ProviderKind::OpenAi,
                MockModelCaller::new(|_| Ok(r#"{"from":"openai"}"#.to_string())),
            )
            .register(
                ProviderKind::Gemini,
                MockModelCaller::new(|req| Ok(format!(r#"{{"from":"{}"}}"#, req.model))),
            );

        let openai = ModelHandle::new(ProviderKind::OpenAi, "gpt");
        let gemini = ModelHandle::new(ProviderKind::Gemini, "flash");

        assert_eq!(
            registry.generate(&openai, &request()).await.unwrap(),
            json!({"from": "openai"})
        );
        assert_eq!(
            registry.generate(&gemini, &request()).await.unwrap(),
            json!({"from": "gemini/flash"})
        );
    }

    #[tokio::test]
    async fn unregistered_provider_is_a_config_error() {
        let registry = ProviderRegistry::new();
        let handle = ModelHandle::new(ProviderKind::Anthropic, "claude");
        let err = registry.generate(&handle, &request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn default_stream_yields_single_snapshot() {
        let caller = MockModelCaller::new(|_| Ok("```json\n{\"items\":[1]}\n```".to_string()));
        let handle = ModelHandle::new(ProviderKind::OpenAi, "gpt");
        let snapshots: Vec<_> = caller
            .stream(&handle, &request())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].as_ref().unwrap(), &json!({"items": [1]}));
    }
}
