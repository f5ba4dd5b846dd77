//! JSON Schema generation, validation and response cleanup.

use jsonschema::Validator;
use schemars::JsonSchema;
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Derive the JSON Schema for `T`.
pub fn schema_for<T: JsonSchema>() -> Result<Value> {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).map_err(|e| PipelineError::Schema(e.to_string()))
}

/// Compile a schema once so it can be checked against many values.
pub fn compile_validator(schema: &Value) -> Result<Validator> {
    jsonschema::validator_for(schema).map_err(|e| PipelineError::Schema(e.to_string()))
}

/// Collect every validation error for `value`, or `None` when it conforms.
pub fn validation_errors(validator: &Validator, value: &Value) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|err| format!("{}: {}", err.instance_path(), err))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

/// Validate `value`, turning schema violations into [`PipelineError::Validation`].
pub fn validate(validator: &Validator, value: &Value) -> Result<()> {
    match validation_errors(validator, value) {
        Some(errors) => Err(PipelineError::Validation(errors)),
        None => Ok(()),
    }
}

/// Parse raw model text into JSON after stripping fences and surrounding prose.
pub fn parse_model_text(text: &str) -> Result<Value> {
    let cleaned = clean_json_text(text);
    serde_json::from_str(&cleaned).map_err(|e| PipelineError::parse_error(e, &cleaned))
}

/// Strip Markdown code blocks and leading/trailing prose from model text.
pub fn clean_json_text(text: &str) -> String {
    let text = text.trim();

    if let Some(start) = text.find("```") {
        if let Some(end) = text.rfind("```") {
            if start < end {
                // Skip the fence's language tag ("json", etc.)
                if let Some(newline) = text[start..end].find('\n') {
                    let content_start = start + newline + 1;
                    if content_start < end {
                        return text[content_start..end].trim().to_string();
                    }
                }
            }
        }
    }

    if let Some(start) = text.find(['{', '[']) {
        if let Some(end) = text.rfind(['}', ']']) {
            if start <= end {
                return text[start..=end].to_string();
            }
        }
    }
    text.to_string()
}
