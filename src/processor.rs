//! Bounded-concurrency fan-out over a stream of items.
//!
//! Workers may finish in any order; results come back in input order.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt, TryStreamExt};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// A unit of asynchronous work applied to each item.
///
/// Failures that should not abort the whole run must be caught inside the worker and
/// encoded in `Output`.
#[async_trait]
pub trait Worker<Input, Output>: Send + Sync {
    async fn run(&self, input: Input) -> Result<Output>;
}

/// Convenience wrapper to turn an async closure into a [`Worker`].
///
/// ```rust
/// use structured_delivery::{LambdaWorker, Worker};
///
/// # tokio_test_block_on(async {
/// let double = LambdaWorker(|x: i32| async move { Ok(x * 2) });
/// assert_eq!(double.run(5).await.unwrap(), 10);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct LambdaWorker<F>(pub F);

#[async_trait]
impl<F, Fut, Input, Output> Worker<Input, Output> for LambdaWorker<F>
where
    Input: Send + 'static,
    Output: Send + 'static,
    F: Fn(Input) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Output>> + Send,
{
    async fn run(&self, input: Input) -> Result<Output> {
        (self.0)(input).await
    }
}

#[async_trait]
impl<Input, Output, W> Worker<Input, Output> for Arc<W>
where
    Input: Send + 'static,
    Output: Send + 'static,
    W: Worker<Input, Output> + ?Sized,
{
    async fn run(&self, input: Input) -> Result<Output> {
        (**self).run(input).await
    }
}

/// Pull items from `items` and run `worker` on up to `concurrency` of them at once.
///
/// `None` means unbounded. A finished worker frees its slot immediately, even while
/// earlier items are still running; outputs are put back in input order at the end.
/// The first stream or worker error fails the call and cancels the workers still in
/// flight. Worker errors are wrapped with the index of the item that failed; stream
/// errors are returned unchanged.
pub async fn process<I, R, S, W>(items: S, worker: &W, concurrency: Option<usize>) -> Result<Vec<R>>
where
    S: Stream<Item = Result<I>> + Send,
    W: Worker<I, R> + ?Sized,
{
    let limit = concurrency.unwrap_or(usize::MAX).max(1);

    let mut indexed: Vec<(usize, R)> = items
        .enumerate()
        .map(|(index, item)| async move {
            let item = item?;
            worker
                .run(item)
                .await
                .map(|output| (index, output))
                .map_err(|e| PipelineError::worker(index, e))
        })
        .buffer_unordered(limit)
        .try_collect()
        .await?;

    indexed.sort_unstable_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, output)| output).collect())
}

/// Apply a worker to each item of a stream concurrently, returning collected outputs.
///
/// # Example
///
/// ```rust,ignore
/// let processor = ParallelStreamProcessor::new(persist_worker).with_concurrency(4);
/// let saved = processor.process(extract_items(snapshots, select_array("/activities"))).await?;
/// ```
pub struct ParallelStreamProcessor<Input, Output> {
    worker: Arc<dyn Worker<Input, Output>>,
    concurrency: Option<usize>,
}

impl<Input, Output> Clone for ParallelStreamProcessor<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            worker: self.worker.clone(),
            concurrency: self.concurrency,
        }
    }
}

impl<Input, Output> ParallelStreamProcessor<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create an unbounded processor around `worker`.
    pub fn new(worker: impl Worker<Input, Output> + 'static) -> Self {
        Self {
            worker: Arc::new(worker),
            concurrency: None,
        }
    }

    /// Limit the number of workers in flight (minimum 1).
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }

    /// Set the limit, or remove it with `None`.
    pub fn with_optional_concurrency(mut self, limit: Option<usize>) -> Self {
        self.concurrency = limit.map(|l| l.max(1));
        self
    }

    /// Get the configured concurrency limit, `None` when unbounded.
    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Run the worker over every item, returning results in input order.
    pub async fn process<S>(&self, items: S) -> Result<Vec<Output>>
    where
        S: Stream<Item = Result<Input>> + Send,
    {
        let results = process(items, self.worker.as_ref(), self.concurrency).await;
        if let Ok(outputs) = &results {
            debug!(processed = outputs.len(), "Stream processing completed");
        }
        results
    }
}
