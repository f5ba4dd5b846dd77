//! End-to-end delivery: stream a structured answer, hand each completed item to the
//! client and to a worker as soon as it is final, then validate the finished object.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryStreamExt,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    config::PipelineConfig,
    error::{ErrorInfo, PipelineError, Result},
    extractor::{extract_items, select_array},
    invoker::MultiModelInvoker,
    processor::{process, Worker},
    request::GenerationRequest,
    schema::{compile_validator, validation_errors},
};

/// Receives progress notifications from a delivery run.
///
/// Every method has a no-op default so sinks only implement what they forward.
/// Notifications are sent from the task driving the run and must not block.
pub trait DeliverySink<I>: Send + Sync {
    fn on_partial_object(&self, _snapshot: &Value) {}
    fn on_new_item(&self, _item: &I) {}
    fn on_finish(&self, _summary: &DeliverySummary) {}
    fn on_error(&self, _error: &PipelineError) {}
}

impl<I> DeliverySink<I> for () {}

/// Serializable form of the sink notifications, e.g. for server-sent events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    PartialObject { snapshot: Value },
    NewItem { item: Value },
    Finish { summary: DeliverySummary },
    Error { error: ErrorInfo },
}

/// Sink forwarding [`DeliveryEvent`]s over an unbounded channel.
///
/// A closed receiver is not an error; the run continues without a listener.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: UnboundedSender<DeliveryEvent>,
}

impl ChannelSink {
    pub fn new(sender: UnboundedSender<DeliveryEvent>) -> Self {
        Self { sender }
    }

    fn send(&self, event: DeliveryEvent) {
        if self.sender.send(event).is_err() {
            debug!("Delivery listener disconnected");
        }
    }
}

impl<I: Serialize> DeliverySink<I> for ChannelSink {
    fn on_partial_object(&self, snapshot: &Value) {
        self.send(DeliveryEvent::PartialObject {
            snapshot: snapshot.clone(),
        });
    }

    fn on_new_item(&self, item: &I) {
        match serde_json::to_value(item) {
            Ok(item) => self.send(DeliveryEvent::NewItem { item }),
            Err(e) => warn!(error = %e, "Item could not be serialized for the listener"),
        }
    }

    fn on_finish(&self, summary: &DeliverySummary) {
        self.send(DeliveryEvent::Finish {
            summary: summary.clone(),
        });
    }

    fn on_error(&self, error: &PipelineError) {
        self.send(DeliveryEvent::Error {
            error: error.info(),
        });
    }
}

/// A record after it has been written to a [`RecordStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: String,
    pub record: Value,
}

/// Destination for extracted items.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record, returning it with its assigned identifier.
    async fn upsert(&self, record: Value) -> Result<PersistedRecord>;
}

/// Worker that writes each item to a [`RecordStore`].
pub struct PersistWorker<S, I> {
    store: S,
    _item: PhantomData<fn(I)>,
}

impl<S: RecordStore, I> PersistWorker<S, I> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            _item: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S, I> Worker<I, PersistedRecord> for PersistWorker<S, I>
where
    S: RecordStore,
    I: Serialize + Send + 'static,
{
    async fn run(&self, input: I) -> Result<PersistedRecord> {
        let record = serde_json::to_value(&input)?;
        self.store.upsert(record).await
    }
}

/// Everything known about a finished run except the worker outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub run_id: Uuid,
    /// Label of the model that produced the stream.
    pub model: String,
    /// Last snapshot seen, `None` if the stream produced nothing.
    pub final_object: Option<Value>,
    /// Schema violations of the final object. Item delivery is not rolled back.
    pub validation_error: Option<String>,
    pub items: usize,
    pub snapshots: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Result of a successful delivery run.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport<R> {
    #[serde(flatten)]
    pub summary: DeliverySummary,
    /// Worker outputs in item order.
    pub results: Vec<R>,
}

impl<R> DeliveryReport<R> {
    pub fn is_valid(&self) -> bool {
        self.summary.validation_error.is_none()
    }
}

/// Wires the invoker, the item extractor and the stream processor together.
#[derive(Clone)]
pub struct DeliveryPipeline {
    invoker: MultiModelInvoker,
    config: PipelineConfig,
}

impl DeliveryPipeline {
    /// The invoker takes its critic policy from `config`.
    pub fn new(invoker: MultiModelInvoker, config: PipelineConfig) -> Self {
        let invoker = invoker.with_critic_policy(config.critic_policy);
        Self { invoker, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stream `request` from the configured primary models and deliver the items of
    /// the array at `items_pointer` (a JSON Pointer such as `/activities`).
    ///
    /// Each item reaches `sink.on_new_item` once it is final and is then handed to
    /// `worker` with the configured concurrency. The call fails on the first stream
    /// or worker error, after reporting it to `sink.on_error`.
    #[instrument(skip_all, fields(request_id = %request.id, items = %items_pointer))]
    pub async fn run<I, R, W>(
        &self,
        request: &GenerationRequest,
        items_pointer: &str,
        worker: &W,
        sink: &dyn DeliverySink<I>,
    ) -> Result<DeliveryReport<R>>
    where
        I: DeserializeOwned + Send + 'static,
        W: Worker<I, R> + ?Sized,
    {
        let started_at = Utc::now();
        let result = async {
            let (model, snapshots) = self
                .invoker
                .stream(request, &self.config.models.primary)
                .await?;
            self.deliver(request, model.label(), snapshots, items_pointer, worker, sink, started_at)
                .await
        }
        .await;
        report_failure(result, sink)
    }

    /// Generate the whole object first, with fallback and critic review, then
    /// deliver its items.
    ///
    /// Use this when review matters more than time to first item.
    #[instrument(skip_all, fields(request_id = %request.id, items = %items_pointer))]
    pub async fn run_reviewed<I, R, W>(
        &self,
        request: &GenerationRequest,
        items_pointer: &str,
        worker: &W,
        sink: &dyn DeliverySink<I>,
    ) -> Result<DeliveryReport<R>>
    where
        I: DeserializeOwned + Send + 'static,
        W: Worker<I, R> + ?Sized,
    {
        let started_at = Utc::now();
        let result = async {
            let outcome = self
                .invoker
                .invoke_chain::<Value>(request, &self.config.models)
                .await;
            let model = outcome
                .report()
                .accepted_model
                .clone()
                .unwrap_or_default();
            let object = outcome.into_result()?;
            let snapshots: BoxStream<'static, Result<Value>> =
                Box::pin(stream::once(async move { Ok(object) }));
            self.deliver(request, model, snapshots, items_pointer, worker, sink, started_at)
                .await
        }
        .await;
        report_failure(result, sink)
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver<I, R, W>(
        &self,
        request: &GenerationRequest,
        model: String,
        snapshots: BoxStream<'static, Result<Value>>,
        items_pointer: &str,
        worker: &W,
        sink: &dyn DeliverySink<I>,
        started_at: DateTime<Utc>,
    ) -> Result<DeliveryReport<R>>
    where
        I: DeserializeOwned + Send + 'static,
        W: Worker<I, R> + ?Sized,
    {
        let validator = compile_validator(&request.schema)?;
        let mut final_object: Option<Value> = None;
        let mut snapshot_count = 0usize;

        let results = {
            let observed = snapshots.inspect_ok(|snapshot| {
                snapshot_count += 1;
                sink.on_partial_object(snapshot);
                final_object = Some(snapshot.clone());
            });
            let items = extract_items(observed, select_array(items_pointer))
                .map(|item| item.and_then(|value| Ok(serde_json::from_value::<I>(value)?)))
                .inspect_ok(|item| sink.on_new_item(item));
            process(items, worker, self.config.concurrency).await?
        };

        let validation_error = match &final_object {
            Some(object) => validation_errors(&validator, object),
            None => Some("stream produced no snapshots".to_string()),
        };
        if let Some(reason) = &validation_error {
            warn!(model = %model, reason = %reason, "Final object failed validation");
        }

        let summary = DeliverySummary {
            run_id: request.id,
            model,
            final_object,
            validation_error,
            items: results.len(),
            snapshots: snapshot_count,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            model = %summary.model,
            items = summary.items,
            snapshots = summary.snapshots,
            "Delivery completed"
        );
        sink.on_finish(&summary);

        Ok(DeliveryReport { summary, results })
    }
}

fn report_failure<T, I>(result: Result<T>, sink: &dyn DeliverySink<I>) -> Result<T> {
    if let Err(e) = &result {
        error!(error = %e, "Delivery failed");
        sink.on_error(e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ModelChain,
        processor::LambdaWorker,
        provider::{ModelCaller, ModelHandle, ProviderKind, SnapshotStream},
    };
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Streams a fixed list of snapshots, optionally ending with an error.
    struct ScriptedCaller {
        snapshots: Vec<Value>,
        fail_after: bool,
    }

    #[async_trait]
    impl ModelCaller for ScriptedCaller {
        async fn generate(&self, _model: &ModelHandle, _request: &GenerationRequest) -> Result<Value> {
            self.snapshots
                .last()
                .cloned()
                .ok_or_else(|| PipelineError::provider("scripted", "empty script"))
        }

        async fn stream(&self, _model: &ModelHandle, _request: &GenerationRequest) -> Result<SnapshotStream> {
            let mut items: Vec<Result<Value>> = self.snapshots.iter().cloned().map(Ok).collect();
            if self.fail_after {
                items.push(Err(PipelineError::Stream("connection reset".into())));
            }
            Ok(Box::pin(stream::iter(items)))
        }
    }

    #[derive(Default)]
    struct Recorder {
        partials: Mutex<usize>,
        items: Mutex<Vec<String>>,
        finished: Mutex<Option<DeliverySummary>>,
        errors: Mutex<Vec<ErrorInfo>>,
    }

    impl DeliverySink<String> for Recorder {
        fn on_partial_object(&self, _snapshot: &Value) {
            *self.partials.lock().unwrap() += 1;
        }
        fn on_new_item(&self, item: &String) {
            self.items.lock().unwrap().push(item.clone());
        }
        fn on_finish(&self, summary: &DeliverySummary) {
            *self.finished.lock().unwrap() = Some(summary.clone());
        }
        fn on_error(&self, error: &PipelineError) {
            self.errors.lock().unwrap().push(error.info());
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new(json!({
            "type": "object",
            "properties": {"arr": {"type": "array", "items": {"type": "string"}}},
            "required": ["arr"]
        }))
        .user_text("List three things")
    }

    fn pipeline(caller: ScriptedCaller) -> DeliveryPipeline {
        let config = PipelineConfig::default()
            .with_models(ModelChain::new(vec![ModelHandle::new(ProviderKind::OpenAi, "mini")]))
            .with_concurrency(2);
        DeliveryPipeline::new(MultiModelInvoker::new(caller), config)
    }

    #[tokio::test]
    async fn streams_items_to_sink_and_worker() {
        let pipeline = pipeline(ScriptedCaller {
            snapshots: vec![
                json!({}),
                json!({"arr": ["a"]}),
                json!({"arr": ["a", "b"]}),
                json!({"arr": ["a", "b", "c"]}),
            ],
            fail_after: false,
        });
        let recorder = Recorder::default();
        let worker = LambdaWorker(|item: String| async move { Ok(item.to_uppercase()) });

        let report = pipeline.run(&request(), "/arr", &worker, &recorder).await.unwrap();

        assert_eq!(report.results, vec!["A", "B", "C"]);
        assert!(report.is_valid());
        assert_eq!(report.summary.model, "openai/mini");
        assert_eq!(report.summary.snapshots, 4);
        assert_eq!(*recorder.partials.lock().unwrap(), 4);
        assert_eq!(*recorder.items.lock().unwrap(), vec!["a", "b", "c"]);
        let finished = recorder.finished.lock().unwrap().clone().unwrap();
        assert_eq!(finished.items, 3);
        assert!(finished.finished_at >= finished.started_at);
    }

    #[tokio::test]
    async fn invalid_final_object_is_reported_not_rolled_back() {
        let pipeline = pipeline(ScriptedCaller {
            snapshots: vec![json!({"arr": ["a", 7]})],
            fail_after: false,
        });
        let worker = LambdaWorker(|item: Value| async move { Ok(item) });

        let report = pipeline.run(&request(), "/arr", &worker, &()).await.unwrap();
        assert_eq!(report.results, vec![json!("a"), json!(7)]);
        assert!(report.summary.validation_error.is_some());
    }

    #[tokio::test]
    async fn stream_failure_reaches_on_error() {
        let pipeline = pipeline(ScriptedCaller {
            snapshots: vec![json!({"arr": ["a"]}), json!({"arr": ["a", "b"]})],
            fail_after: true,
        });
        let recorder = Recorder::default();
        let worker = LambdaWorker(|item: String| async move { Ok(item) });

        let err = pipeline
            .run(&request(), "/arr", &worker, &recorder)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Stream(_)));
        assert_eq!(*recorder.items.lock().unwrap(), vec!["a"]);
        assert!(recorder.finished.lock().unwrap().is_none());
        assert_eq!(recorder.errors.lock().unwrap()[0].kind, crate::ErrorKind::Stream);
    }

    #[tokio::test]
    async fn channel_sink_emits_tagged_events() {
        let pipeline = pipeline(ScriptedCaller {
            snapshots: vec![json!({"arr": ["a"]})],
            fail_after: false,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        let worker = LambdaWorker(|item: String| async move { Ok(item) });

        pipeline.run(&request(), "/arr", &worker, &sink).await.unwrap();
        drop(sink);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            let encoded = serde_json::to_value(&event).unwrap();
            kinds.push(encoded["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["partial_object", "new_item", "finish"]);
    }

    #[tokio::test]
    async fn reviewed_run_delivers_accepted_object() {
        let pipeline = pipeline(ScriptedCaller {
            snapshots: vec![json!({"arr": ["x", "y"]})],
            fail_after: false,
        });
        let worker = LambdaWorker(|item: String| async move { Ok(item.len()) });

        let report = pipeline
            .run_reviewed(&request(), "/arr", &worker, &())
            .await
            .unwrap();
        assert_eq!(report.results, vec![1, 1]);
        assert_eq!(report.summary.snapshots, 1);
        assert_eq!(report.summary.model, "openai/mini");
    }

    struct MemoryStore {
        records: Mutex<Vec<PersistedRecord>>,
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn upsert(&self, record: Value) -> Result<PersistedRecord> {
            let mut records = self.records.lock().unwrap();
            let saved = PersistedRecord {
                id: format!("rec-{}", records.len() + 1),
                record,
            };
            records.push(saved.clone());
            Ok(saved)
        }
    }

    #[tokio::test]
    async fn persist_worker_upserts_each_item() {
        let worker: PersistWorker<_, String> = PersistWorker::new(MemoryStore {
            records: Mutex::new(Vec::new()),
        });
        let saved = worker.run("Fractions".to_string()).await.unwrap();
        assert_eq!(saved.id, "rec-1");
        assert_eq!(saved.record, json!("Fractions"));
        assert_eq!(worker.store().records.lock().unwrap().len(), 1);
    }
}
