//! Structured-generation delivery pipeline.
//!
//! A request carrying a JSON Schema is sent to an ordered chain of models until one
//! returns a schema-valid answer. Streamed answers are turned into completed array
//! items as soon as each one is final, and the items are fanned out to workers with
//! bounded concurrency. A ready queue buffers calls until a downstream system can
//! take them.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use structured_delivery::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
//! struct Activity {
//!     title: String,
//!     minutes: u32,
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
//! struct Plan {
//!     activities: Vec<Activity>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let caller = MockModelCaller::new(|_| {
//!         Ok(r#"{"activities": [{"title": "Fractions", "minutes": 20}]}"#.to_string())
//!     });
//!     let config = PipelineConfig::default().with_models(ModelChain::new(vec![
//!         ModelHandle::new(ProviderKind::OpenAi, "gpt-4o-mini"),
//!     ]));
//!     let pipeline = DeliveryPipeline::new(MultiModelInvoker::new(caller), config);
//!
//!     let request = GenerationRequest::for_type::<Plan>()?.user_text("Plan a lesson");
//!     let worker = LambdaWorker(|a: Activity| async move { Ok(a.title) });
//!     let report = pipeline.run(&request, "/activities", &worker, &()).await?;
//!
//!     println!("{:?}", report.results);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod extractor;
pub mod invoker;
pub mod models;
pub mod partial;
pub mod processor;
pub mod provider;
pub mod queue;
pub mod request;
pub mod schema;

pub use config::{ModelChain, PipelineConfig};
pub use delivery::{
    ChannelSink, DeliveryEvent, DeliveryPipeline, DeliveryReport, DeliverySink, DeliverySummary,
    PersistWorker, PersistedRecord, RecordStore,
};
pub use error::{ErrorInfo, ErrorKind, PipelineError, Result, ResultExt};
pub use extractor::{extract_items, select_array, ItemExtractor};
pub use invoker::{CriticPolicy, CriticVerdict, MultiModelInvoker};
pub use models::{AttemptPhase, GenerationOutcome, InvocationReport, ModelAttempt};
pub use partial::{parse_partial_json, snapshot_stream};
pub use processor::{process, LambdaWorker, ParallelStreamProcessor, Worker};
pub use provider::{
    MockHandler, MockModelCaller, MockRequest, ModelCaller, ModelHandle, ProviderKind,
    ProviderRegistry, SnapshotStream,
};
pub use queue::{queued_function, DrainResult, QueueEntry, QueueOptions, ReadyQueue};
pub use request::{GenerationRequest, Message, ProviderOptions, Role};

/// Prelude module for convenient imports.
///
/// ```rust
/// use structured_delivery::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ModelChain, PipelineConfig};
    pub use crate::delivery::{
        ChannelSink, DeliveryEvent, DeliveryPipeline, DeliveryReport, DeliverySink,
        PersistWorker, PersistedRecord, RecordStore,
    };
    pub use crate::error::{PipelineError, Result, ResultExt};
    pub use crate::extractor::{extract_items, select_array};
    pub use crate::invoker::{CriticPolicy, MultiModelInvoker};
    pub use crate::models::GenerationOutcome;
    pub use crate::processor::{LambdaWorker, ParallelStreamProcessor, Worker};
    pub use crate::provider::{
        MockModelCaller, MockRequest, ModelCaller, ModelHandle, ProviderKind, ProviderRegistry,
    };
    pub use crate::queue::{queued_function, QueueOptions, ReadyQueue};
    pub use crate::request::GenerationRequest;

    // Re-export commonly used external types
    pub use schemars::JsonSchema;
    pub use serde::{Deserialize, Serialize};
}
