//! Ready queue: buffer calls to a function until a readiness predicate holds, then
//! run the whole buffer in one pass.
//!
//! Typical use is throttling persistence writes while a downstream system is busy:
//!
//! ```rust
//! use std::sync::{atomic::{AtomicBool, Ordering}, Arc};
//! use structured_delivery::queue::{queued_function, QueueOptions};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let idle = Arc::new(AtomicBool::new(false));
//! let flag = idle.clone();
//! let save = queued_function(
//!     |title: String| Ok(title.len()),
//!     move || flag.load(Ordering::SeqCst),
//!     QueueOptions::default(),
//! )
//! .unwrap();
//!
//! let first = save.enqueue("Fractions".to_string());
//! assert_eq!(save.pending(), 1);
//!
//! idle.store(true, Ordering::SeqCst);
//! save.flush_check();
//! assert_eq!(first.await.unwrap(), 9);
//! # });
//! ```

use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};
use tracing::{debug, trace, warn};

use crate::{
    config::PipelineConfig,
    error::{PipelineError, Result},
    processor::Worker,
};

/// The wrapped function.
pub type QueuedFn<P, R> = Arc<dyn Fn(P) -> Result<R> + Send + Sync>;
/// Readiness predicate evaluated before each drain.
pub type ReadyPredicate = Arc<dyn Fn() -> bool + Send + Sync>;
/// Called with the full batch right before it runs.
pub type BeforeDrainCallback<P, R> = Arc<dyn Fn(&[QueueEntry<P, R>]) + Send + Sync>;
/// Called once per drain with one result per entry, in batch order.
pub type AfterDrainCallback<R> = Arc<dyn Fn(&[DrainResult<R>]) + Send + Sync>;

/// A buffered call waiting for the next drain.
pub struct QueueEntry<P, R> {
    params: P,
    responder: oneshot::Sender<Result<R>>,
}

impl<P, R> QueueEntry<P, R> {
    pub fn params(&self) -> &P {
        &self.params
    }
}

/// Outcome of one entry within a drain.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainResult<R> {
    Success(R),
    Failure(String),
}

impl<R> DrainResult<R> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Timing and observability options for a ready queue.
pub struct QueueOptions<P, R> {
    /// Window in which readiness checks are coalesced; 0 checks on every enqueue.
    pub ready_throttle_ms: u64,
    /// Re-check readiness on a timer even when nothing new is enqueued.
    pub poll_ready_interval_ms: Option<u64>,
    pub before_drain: Option<BeforeDrainCallback<P, R>>,
    pub after_drain: Option<AfterDrainCallback<R>>,
}

impl<P, R> Default for QueueOptions<P, R> {
    fn default() -> Self {
        Self {
            ready_throttle_ms: 0,
            poll_ready_interval_ms: None,
            before_drain: None,
            after_drain: None,
        }
    }
}

impl<P, R> QueueOptions<P, R> {
    /// Take the queue timings from the pipeline configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            ready_throttle_ms: config.ready_throttle_ms,
            poll_ready_interval_ms: config.poll_ready_interval_ms,
            ..Self::default()
        }
    }

    pub fn with_ready_throttle(mut self, window: Duration) -> Self {
        self.ready_throttle_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_poll_ready_interval(mut self, interval: Duration) -> Self {
        self.poll_ready_interval_ms = Some(u64::try_from(interval.as_millis().max(1)).unwrap_or(u64::MAX));
        self
    }

    pub fn before_drain(mut self, callback: impl Fn(&[QueueEntry<P, R>]) + Send + Sync + 'static) -> Self {
        self.before_drain = Some(Arc::new(callback));
        self
    }

    pub fn after_drain(mut self, callback: impl Fn(&[DrainResult<R>]) + Send + Sync + 'static) -> Self {
        self.after_drain = Some(Arc::new(callback));
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

struct Inner<P, R> {
    func: QueuedFn<P, R>,
    is_ready: ReadyPredicate,
    throttle: Duration,
    before_drain: Option<BeforeDrainCallback<P, R>>,
    after_drain: Option<AfterDrainCallback<R>>,
    buffer: Mutex<Vec<QueueEntry<P, R>>>,
    check_scheduled: AtomicBool,
    draining: AtomicBool,
    recheck: AtomicBool,
    runtime: Option<Handle>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl<P, R> Drop for Inner<P, R> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.poll_task).take() {
            task.abort();
        }
    }
}

impl<P, R> Inner<P, R>
where
    P: Send + 'static,
    R: Clone + Send + 'static,
{
    fn request_drain_check(self: &Arc<Self>) {
        if self.throttle.is_zero() {
            self.drain_if_ready();
            return;
        }
        if self.check_scheduled.swap(true, Ordering::AcqRel) {
            trace!("Readiness check already scheduled");
            return;
        }
        let Some(runtime) = &self.runtime else {
            self.check_scheduled.store(false, Ordering::Release);
            self.drain_if_ready();
            return;
        };

        let inner = Arc::clone(self);
        let delay = self.throttle;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.check_scheduled.store(false, Ordering::Release);
            inner.drain_if_ready();
        });
    }

    /// Drains never overlap; a check arriving mid-drain runs after it finishes.
    ///
    /// A caller first records its request in `recheck`, then tries to become the
    /// drainer. The drainer keeps going while requests are recorded and looks again
    /// after releasing `draining`, so a request is never left unserved.
    fn drain_if_ready(&self) {
        self.recheck.store(true, Ordering::SeqCst);
        loop {
            if self.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            {
                let _release = DrainingGuard(&self.draining);
                while self.recheck.swap(false, Ordering::SeqCst) {
                    self.drain_once();
                }
            }
            if !self.recheck.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn drain_once(&self) {
        let pending = lock(&self.buffer).len();
        if pending == 0 {
            return;
        }
        let ready = panic::catch_unwind(AssertUnwindSafe(|| (self.is_ready)())).unwrap_or_else(|payload| {
            warn!(error = %panic_message(payload), "Readiness check panicked; treating queue as not ready");
            false
        });
        if !ready {
            trace!(pending, "Queue not ready");
            return;
        }

        let batch = std::mem::take(&mut *lock(&self.buffer));
        debug!(batch = batch.len(), "Draining ready queue");

        if let Some(callback) = &self.before_drain {
            run_callback("before_drain", || callback(&batch));
        }

        let mut report = Vec::with_capacity(batch.len());
        for (index, entry) in batch.into_iter().enumerate() {
            let QueueEntry { params, responder } = entry;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.func)(params)))
                .unwrap_or_else(|payload| Err(PipelineError::Context(panic_message(payload))));

            match outcome {
                Ok(value) => {
                    report.push(DrainResult::Success(value.clone()));
                    let _ = responder.send(Ok(value));
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(index, error = %message, "Queued call failed");
                    report.push(DrainResult::Failure(message.clone()));
                    let _ = responder.send(Err(PipelineError::Drain { index, message }));
                }
            }
        }

        if let Some(callback) = &self.after_drain {
            run_callback("after_drain", || callback(&report));
        }
    }
}

/// Clears the draining flag however the drain ends.
struct DrainingGuard<'a>(&'a AtomicBool);

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Run a drain callback, logging a panic instead of unwinding through the drain.
fn run_callback(name: &str, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        warn!(callback = name, error = %panic_message(payload), "Drain callback panicked");
    }
}

/// Handle to a queued function. Clones share the same buffer.
pub struct ReadyQueue<P, R> {
    inner: Arc<Inner<P, R>>,
}

impl<P, R> Clone for ReadyQueue<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Wrap `f` so calls are buffered until `is_ready` returns true.
///
/// Throttled checks and polling run on the current tokio runtime, so creating a queue
/// with either enabled outside a runtime fails with [`PipelineError::Config`].
pub fn queued_function<P, R, F, G>(f: F, is_ready: G, options: QueueOptions<P, R>) -> Result<ReadyQueue<P, R>>
where
    P: Send + 'static,
    R: Clone + Send + 'static,
    F: Fn(P) -> Result<R> + Send + Sync + 'static,
    G: Fn() -> bool + Send + Sync + 'static,
{
    ReadyQueue::new(Arc::new(f), Arc::new(is_ready), options)
}

impl<P, R> ReadyQueue<P, R>
where
    P: Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new(func: QueuedFn<P, R>, is_ready: ReadyPredicate, options: QueueOptions<P, R>) -> Result<Self> {
        let throttle = Duration::from_millis(options.ready_throttle_ms);
        let poll = match options.poll_ready_interval_ms {
            Some(0) => {
                return Err(PipelineError::Config(
                    "poll_ready_interval_ms must be positive".to_string(),
                ))
            }
            other => other.map(Duration::from_millis),
        };

        let runtime = match Handle::try_current() {
            Ok(handle) => Some(handle),
            Err(_) if throttle.is_zero() && poll.is_none() => None,
            Err(e) => {
                return Err(PipelineError::Config(format!(
                    "ready queue timers need a tokio runtime: {e}"
                )))
            }
        };

        let inner = Arc::new(Inner {
            func,
            is_ready,
            throttle,
            before_drain: options.before_drain,
            after_drain: options.after_drain,
            buffer: Mutex::new(Vec::new()),
            check_scheduled: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            recheck: AtomicBool::new(false),
            runtime,
            poll_task: Mutex::new(None),
        });

        if let (Some(interval), Some(runtime)) = (poll, &inner.runtime) {
            let weak = Arc::downgrade(&inner);
            let task = runtime.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.request_drain_check();
                }
            });
            *lock(&inner.poll_task) = Some(task);
        }

        Ok(Self { inner })
    }

    /// Buffer a call and return a future for its result.
    ///
    /// The entry is buffered before this returns, so enqueue order is call order
    /// regardless of when the futures are polled. If every handle to the queue is
    /// dropped before the entry drains, the future resolves to
    /// [`PipelineError::QueueClosed`].
    pub fn enqueue(&self, params: P) -> impl Future<Output = Result<R>> + Send + 'static {
        let (responder, receiver) = oneshot::channel();
        lock(&self.inner.buffer).push(QueueEntry { params, responder });
        self.inner.request_drain_check();
        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(PipelineError::QueueClosed))
        }
    }

    /// Number of buffered entries.
    pub fn pending(&self) -> usize {
        lock(&self.inner.buffer).len()
    }

    /// Trigger a (throttled) readiness check without enqueuing anything.
    pub fn flush_check(&self) {
        self.inner.request_drain_check();
    }
}

/// A ready queue can gate the per-item work of a stream processor.
#[async_trait]
impl<P, R> Worker<P, R> for ReadyQueue<P, R>
where
    P: Send + 'static,
    R: Clone + Send + 'static,
{
    async fn run(&self, input: P) -> Result<R> {
        self.enqueue(input).await
    }
}
