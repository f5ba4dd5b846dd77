use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{error::Result, schema::schema_for};

/// Speaker of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-attempt provider settings. Unset fields fall back to the provider's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Provider-specific settings passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Immutable description of a single generation.
///
/// Build it once with the fluent setters, then share it by reference with the
/// invoker; nothing downstream mutates it.
///
/// ```rust
/// use structured_delivery::GenerationRequest;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct Lesson {
///     title: String,
///     activities: Vec<String>,
/// }
///
/// let request = GenerationRequest::for_type::<Lesson>()
///     .unwrap()
///     .system("You design short lessons.")
///     .user_text("Plan a lesson about fractions.")
///     .temperature(0.2);
/// assert_eq!(request.messages.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    pub messages: Vec<Message>,
    /// JSON Schema every accepted response must satisfy.
    pub schema: Value,
    #[serde(default)]
    pub options: ProviderOptions,
}

impl GenerationRequest {
    /// Create a request validated against an explicit JSON Schema.
    pub fn new(schema: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            system_instruction: None,
            messages: Vec::new(),
            schema,
            options: ProviderOptions::default(),
        }
    }

    /// Create a request whose schema is derived from `T`.
    pub fn for_type<T: JsonSchema>() -> Result<Self> {
        Ok(Self::new(schema_for::<T>()?))
    }

    pub fn system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn user_text(mut self, text: impl Into<String>) -> Self {
        self.messages.push(Message::user(text));
        self
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.options.temperature = Some(temp);
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.options.max_tokens = Some(tokens);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.options.top_p = Some(top_p);
        self
    }

    pub fn with_options(mut self, options: ProviderOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the request sent to a critic model reviewing `candidate`.
    ///
    /// The critic sees the original conversation, the candidate as the assistant's
    /// answer, and must reply with a verdict matching `verdict_schema`.
    pub(crate) fn critique_request(&self, candidate: &Value, verdict_schema: &Value) -> Result<Self> {
        let mut system = String::from(
            "You review structured answers produced for the conversation below. \
             Approve the answer if it fully satisfies the request and the target schema. \
             Otherwise supply either a complete `revision` or an RFC 6902 JSON Patch in `patch`.",
        );
        if let Some(original) = &self.system_instruction {
            system.push_str("\n\nOriginal instructions:\n");
            system.push_str(original);
        }

        let mut messages = self.messages.clone();
        messages.push(Message::assistant(serde_json::to_string_pretty(candidate)?));
        messages.push(Message::user(format!(
            "Target schema:\n{}\n\nReview the answer above and return your verdict.",
            serde_json::to_string_pretty(&self.schema)?
        )));

        Ok(Self {
            id: Uuid::new_v4(),
            system_instruction: Some(system),
            messages,
            schema: verdict_schema.clone(),
            options: self.options.clone(),
        })
    }
}
