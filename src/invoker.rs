//! Sequential multi-model fallback with optional critic feedback loops.

use std::sync::Arc;

use jsonschema::Validator;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    config::ModelChain,
    error::{PipelineError, Result},
    models::{AttemptPhase, GenerationOutcome, InvocationReport, ModelAttempt},
    provider::{ModelCaller, ModelHandle, SnapshotStream},
    request::GenerationRequest,
    schema::{compile_validator, schema_for, validate, validation_errors},
};

/// How the critic for each feedback loop is chosen.
///
/// Whichever critic goes first, the rest of the list is tried in order if it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticPolicy {
    /// Every loop starts with the first critic.
    #[default]
    FirstAvailable,
    /// Loop `n` starts with critic `n % critics.len()`.
    RoundRobin,
}

/// Structured reply expected from a critic model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CriticVerdict {
    /// True when the candidate needs no changes.
    pub approved: bool,
    /// Free-form explanation, logged only.
    #[serde(default)]
    pub feedback: Option<String>,
    /// Complete replacement for the candidate.
    #[serde(default)]
    pub revision: Option<Value>,
    /// RFC 6902 JSON Patch operations to apply to the candidate.
    #[serde(default)]
    pub patch: Option<Vec<Value>>,
}

/// A rejected model response, kept so the failure outcome can expose it.
struct Rejection {
    error: PipelineError,
    response: Option<Value>,
}

enum Review<T> {
    Approved,
    Revised(Value, T),
    Exhausted,
}

/// Tries an ordered list of models until one returns a schema-valid answer.
///
/// Models are called strictly one after another: a later model is only invoked
/// after every earlier one has failed.
#[derive(Clone)]
pub struct MultiModelInvoker {
    caller: Arc<dyn ModelCaller>,
    critic_policy: CriticPolicy,
}

impl MultiModelInvoker {
    pub fn new(caller: impl ModelCaller + 'static) -> Self {
        Self::from_shared(Arc::new(caller))
    }

    pub fn from_shared(caller: Arc<dyn ModelCaller>) -> Self {
        Self {
            caller,
            critic_policy: CriticPolicy::default(),
        }
    }

    pub fn with_critic_policy(mut self, policy: CriticPolicy) -> Self {
        self.critic_policy = policy;
        self
    }

    pub fn critic_policy(&self) -> CriticPolicy {
        self.critic_policy
    }

    /// Invoke a configured [`ModelChain`].
    pub async fn invoke_chain<T>(
        &self,
        request: &GenerationRequest,
        chain: &ModelChain,
    ) -> GenerationOutcome<T>
    where
        T: DeserializeOwned + Send,
    {
        self.invoke(
            request,
            &chain.primary,
            &chain.critics,
            chain.max_feedback_loops,
        )
        .await
    }

    /// Untyped variant of [`invoke`](Self::invoke); acceptance is schema validation only.
    pub async fn invoke_value(
        &self,
        request: &GenerationRequest,
        primary: &[ModelHandle],
        critics: &[ModelHandle],
        max_feedback_loops: usize,
    ) -> GenerationOutcome<Value> {
        self.invoke(request, primary, critics, max_feedback_loops)
            .await
    }

    /// Generate a value for `request`, falling back through `primary` and then
    /// running up to `max_feedback_loops` critique rounds against `critics`.
    ///
    /// Exactly one outcome is produced. It only fails when every primary model fails;
    /// critic failures end the feedback phase with the last accepted candidate.
    #[instrument(skip_all, fields(request_id = %request.id, target = std::any::type_name::<T>()))]
    pub async fn invoke<T>(
        &self,
        request: &GenerationRequest,
        primary: &[ModelHandle],
        critics: &[ModelHandle],
        max_feedback_loops: usize,
    ) -> GenerationOutcome<T>
    where
        T: DeserializeOwned + Send,
    {
        let mut report = InvocationReport::default();

        let validator = match compile_validator(&request.schema) {
            Ok(v) => v,
            Err(error) => {
                return GenerationOutcome::Failure {
                    error: error.info(),
                    data: None,
                    report,
                }
            }
        };

        let mut last_error: Option<PipelineError> = None;
        let mut last_rejected: Option<Value> = None;
        let mut candidate: Option<(Value, T)> = None;

        for model in primary {
            let label = model.label();
            debug!(model = %label, "Attempting primary model");
            match self.attempt::<T>(model, request, &validator).await {
                Ok(accepted) => {
                    info!(model = %label, "Primary model produced a valid response");
                    report
                        .attempts
                        .push(ModelAttempt::success(&label, AttemptPhase::Primary));
                    report.accepted_model = Some(label);
                    candidate = Some(accepted);
                    break;
                }
                Err(rejection) => {
                    warn!(model = %label, error = %rejection.error, "Model failed, falling back");
                    report.attempts.push(ModelAttempt::failure(
                        &label,
                        AttemptPhase::Primary,
                        rejection.error.to_string(),
                    ));
                    if rejection.response.is_some() {
                        last_rejected = rejection.response;
                    }
                    last_error = Some(rejection.error);
                }
            }
        }

        let Some((mut value, mut data)) = candidate else {
            let error = match last_error {
                Some(e) => PipelineError::ModelsExhausted {
                    attempted: primary.len(),
                    last_error: Box::new(e),
                },
                None => PipelineError::Config("no primary models supplied".to_string()),
            };
            return GenerationOutcome::Failure {
                error: error.info(),
                data: last_rejected,
                report,
            };
        };

        if critics.is_empty() || max_feedback_loops == 0 {
            return GenerationOutcome::Success { data, report };
        }

        let verdict_schema = match schema_for::<CriticVerdict>() {
            Ok(schema) => schema,
            Err(e) => {
                warn!(error = %e, "Skipping feedback loops: verdict schema unavailable");
                return GenerationOutcome::Success { data, report };
            }
        };
        let verdict_validator = match compile_validator(&verdict_schema) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Skipping feedback loops: verdict schema invalid");
                return GenerationOutcome::Success { data, report };
            }
        };

        for round in 0..max_feedback_loops {
            report.feedback_loops += 1;
            let start = match self.critic_policy {
                CriticPolicy::FirstAvailable => 0,
                CriticPolicy::RoundRobin => round % critics.len(),
            };

            let review = self
                .review_round::<T>(
                    request,
                    &value,
                    critics,
                    start,
                    (&validator, &verdict_schema, &verdict_validator),
                    &mut report,
                )
                .await;

            match review {
                Review::Approved => {
                    debug!(round, "Critic approved candidate");
                    break;
                }
                Review::Revised(revised_value, revised) => {
                    info!(round, "Critic revised candidate");
                    value = revised_value;
                    data = revised;
                    report.revisions += 1;
                }
                Review::Exhausted => {
                    warn!(round, "All critics failed; keeping last accepted candidate");
                    break;
                }
            }
        }

        GenerationOutcome::Success { data, report }
    }

    /// Open a snapshot stream from the first model that accepts the request.
    ///
    /// Fallback covers opening the stream only. Failures after the stream is open
    /// surface as items of the returned stream.
    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn stream(
        &self,
        request: &GenerationRequest,
        primary: &[ModelHandle],
    ) -> Result<(ModelHandle, SnapshotStream)> {
        let mut last_error = None;
        for model in primary {
            let label = model.label();
            debug!(model = %label, "Opening snapshot stream");
            match self.caller.stream(model, request).await {
                Ok(snapshots) => {
                    info!(model = %label, "Snapshot stream opened");
                    return Ok((model.clone(), snapshots));
                }
                Err(e) => {
                    warn!(model = %label, error = %e, "Stream open failed, falling back");
                    last_error = Some(attributed(&label, e));
                }
            }
        }

        Err(match last_error {
            Some(e) => PipelineError::ModelsExhausted {
                attempted: primary.len(),
                last_error: Box::new(e),
            },
            None => PipelineError::Config("no primary models supplied".to_string()),
        })
    }

    async fn attempt<T>(
        &self,
        model: &ModelHandle,
        request: &GenerationRequest,
        validator: &Validator,
    ) -> std::result::Result<(Value, T), Rejection>
    where
        T: DeserializeOwned,
    {
        let label = model.label();
        let response = self
            .caller
            .generate(model, request)
            .await
            .map_err(|e| Rejection {
                error: attributed(&label, e),
                response: None,
            })?;
        trace!(model = %label, response = %response, "Raw model response");
        accept::<T>(validator, response).map_err(|rejection| Rejection {
            error: attributed(&label, rejection.error),
            response: rejection.response,
        })
    }

    async fn review_round<T>(
        &self,
        request: &GenerationRequest,
        candidate: &Value,
        critics: &[ModelHandle],
        start: usize,
        (validator, verdict_schema, verdict_validator): (&Validator, &Value, &Validator),
        report: &mut InvocationReport,
    ) -> Review<T>
    where
        T: DeserializeOwned,
    {
        for offset in 0..critics.len() {
            let critic = &critics[(start + offset) % critics.len()];
            let label = critic.label();
            debug!(critic = %label, "Requesting critique");

            let result = self
                .critique::<T>(
                    critic,
                    request,
                    candidate,
                    validator,
                    verdict_schema,
                    verdict_validator,
                )
                .await;

            match result {
                Ok(review) => {
                    report
                        .attempts
                        .push(ModelAttempt::success(&label, AttemptPhase::Critic));
                    return review;
                }
                Err(e) => {
                    warn!(critic = %label, error = %e, "Critic failed, trying next");
                    report.attempts.push(ModelAttempt::failure(
                        &label,
                        AttemptPhase::Critic,
                        e.to_string(),
                    ));
                }
            }
        }
        Review::Exhausted
    }

    async fn critique<T>(
        &self,
        critic: &ModelHandle,
        request: &GenerationRequest,
        candidate: &Value,
        validator: &Validator,
        verdict_schema: &Value,
        verdict_validator: &Validator,
    ) -> Result<Review<T>>
    where
        T: DeserializeOwned,
    {
        let critique_request = request.critique_request(candidate, verdict_schema)?;
        let raw = self.caller.generate(critic, &critique_request).await?;
        validate(verdict_validator, &raw)?;
        let verdict: CriticVerdict = serde_json::from_value(raw)?;

        if let Some(feedback) = &verdict.feedback {
            debug!(feedback = %feedback, approved = verdict.approved, "Critic feedback");
        }
        if verdict.approved {
            return Ok(Review::Approved);
        }

        let revised = if let Some(revision) = verdict.revision {
            revision
        } else if let Some(ops) = verdict.patch {
            let patch: json_patch::Patch = serde_json::from_value(Value::Array(ops))?;
            let mut doc = candidate.clone();
            json_patch::patch(&mut doc, &patch)?;
            doc
        } else {
            return Err(PipelineError::Validation(
                "critic rejected the candidate without a revision or patch".to_string(),
            ));
        };

        if &revised == candidate {
            return Ok(Review::Approved);
        }

        let (value, data) = accept::<T>(validator, revised).map_err(|r| r.error)?;
        Ok(Review::Revised(value, data))
    }
}

/// Schema-validate and deserialize a response.
fn accept<T: DeserializeOwned>(
    validator: &Validator,
    response: Value,
) -> std::result::Result<(Value, T), Rejection> {
    if let Some(errors) = validation_errors(validator, &response) {
        return Err(Rejection {
            error: PipelineError::Validation(errors),
            response: Some(response),
        });
    }
    match serde_json::from_value::<T>(response.clone()) {
        Ok(data) => Ok((response, data)),
        Err(e) => Err(Rejection {
            error: PipelineError::Json(e),
            response: Some(response),
        }),
    }
}

fn attributed(label: &str, err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Provider { .. } => err,
        other => PipelineError::provider(label, other.to_string()),
    }
}
