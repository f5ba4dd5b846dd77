use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use structured_delivery::{
    queue::{queued_function, QueueOptions},
    snapshot_stream, ChannelSink, DeliveryEvent, DeliveryPipeline, GenerationRequest, ModelCaller,
    ModelChain, ModelHandle, MultiModelInvoker, PersistWorker, PersistedRecord, PipelineConfig,
    PipelineError, ProviderKind, RecordStore, Result, SnapshotStream,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
struct Activity {
    title: String,
    minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct LessonPlan {
    activities: Vec<Activity>,
}

const PLAN: &str = r#"{"activities": [
    {"title": "Fractions", "minutes": 20},
    {"title": "Decimals", "minutes": 15},
    {"title": "Percentages", "minutes": 10}
]}"#;

/// Streams `PLAN` in small text chunks. The model named `down` refuses to open.
struct ChunkedCaller {
    chunk: usize,
}

#[async_trait]
impl ModelCaller for ChunkedCaller {
    async fn generate(&self, _model: &ModelHandle, _request: &GenerationRequest) -> Result<Value> {
        Ok(serde_json::from_str(PLAN)?)
    }

    async fn stream(&self, model: &ModelHandle, _request: &GenerationRequest) -> Result<SnapshotStream> {
        if model.model == "down" {
            return Err(PipelineError::provider(model.label(), "503 service unavailable"));
        }
        let chars: Vec<char> = PLAN.chars().collect();
        let deltas: Vec<Result<String>> = chars
            .chunks(self.chunk)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Ok(snapshot_stream(stream::iter(deltas)))
    }
}

fn pipeline(config: PipelineConfig) -> DeliveryPipeline {
    let config = config.with_models(ModelChain::new(vec![
        ModelHandle::new(ProviderKind::OpenAi, "down"),
        ModelHandle::new(ProviderKind::Anthropic, "planner"),
    ]));
    DeliveryPipeline::new(MultiModelInvoker::new(ChunkedCaller { chunk: 7 }), config)
}

fn request() -> GenerationRequest {
    GenerationRequest::for_type::<LessonPlan>()
        .unwrap()
        .system("You plan primary school maths lessons.")
        .user_text("Plan a 45 minute lesson")
}

#[derive(Default)]
struct MemoryStore {
    rows: Mutex<Vec<Value>>,
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, record: Value) -> Result<PersistedRecord> {
        let mut rows = self.rows.lock().unwrap();
        rows.push(record.clone());
        Ok(PersistedRecord {
            id: format!("activity-{}", rows.len()),
            record,
        })
    }
}

#[tokio::test]
async fn streamed_plan_is_persisted_item_by_item() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("structured_delivery=debug")
        .with_test_writer()
        .try_init();

    let pipeline = pipeline(PipelineConfig::default().with_concurrency(2));
    let worker: PersistWorker<MemoryStore, Activity> = PersistWorker::new(MemoryStore::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = ChannelSink::new(tx);

    let report = pipeline
        .run(&request(), "/activities", &worker, &sink)
        .await
        .unwrap();
    drop(sink);

    let ids: Vec<&str> = report.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(report.results[0].record["title"], "Fractions");
    assert_eq!(report.results[2].record["title"], "Percentages");
    assert!(report.is_valid());
    assert_eq!(report.summary.model, "anthropic/planner");
    assert!(report.summary.snapshots > 3);
    assert_eq!(worker.store().rows.lock().unwrap().len(), 3);

    let mut new_items = Vec::new();
    let mut last = None;
    while let Some(event) = rx.recv().await {
        if let DeliveryEvent::NewItem { item } = &event {
            new_items.push(item["title"].as_str().unwrap().to_string());
        }
        last = Some(event);
    }
    assert_eq!(new_items, vec!["Fractions", "Decimals", "Percentages"]);
    assert!(matches!(last, Some(DeliveryEvent::Finish { .. })));
}

#[tokio::test(start_paused = true)]
async fn ready_queue_holds_items_until_downstream_is_ready() {
    let ready = Arc::new(AtomicBool::new(false));
    let flag = ready.clone();
    let saved = Arc::new(Mutex::new(Vec::new()));
    let log = saved.clone();
    let batches = Arc::new(Mutex::new(Vec::new()));
    let batch_log = batches.clone();

    let config = PipelineConfig::default().with_poll_ready_interval(Duration::from_millis(10));
    let queue = queued_function(
        move |activity: Activity| {
            log.lock().unwrap().push(activity.title.clone());
            Ok(activity.minutes)
        },
        move || flag.load(Ordering::SeqCst),
        QueueOptions::from_config(&config).before_drain(move |entries| {
            batch_log.lock().unwrap().push(entries.len());
        }),
    )
    .unwrap();

    let opener = ready.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        opener.store(true, Ordering::SeqCst);
    });

    let report = pipeline(config)
        .run(&request(), "/activities", &queue, &())
        .await
        .unwrap();

    assert_eq!(report.results, vec![20, 15, 10]);
    assert_eq!(*batches.lock().unwrap(), vec![3]);
    assert_eq!(
        *saved.lock().unwrap(),
        vec!["Fractions", "Decimals", "Percentages"]
    );
}
