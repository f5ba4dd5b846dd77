//! Turn growing partial objects into a sequence of completed array items.
//!
//! A streaming model rewrites the tail of its output as tokens arrive, so the last
//! element of an array may still change. Every element before it is final. The
//! extractor only releases an item once something has appeared after it, or once the
//! stream has ended.

use std::collections::{HashSet, VecDeque};

use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::error::Result;

type Identity = [u8; 32];

/// Incremental core of the extractor, independent of any stream.
///
/// Feed it the array from each snapshot with [`observe`](Self::observe) and call
/// [`finish`](Self::finish) once the source has ended.
#[derive(Debug)]
pub struct ItemExtractor<I> {
    seen: HashSet<Identity>,
    pending: Option<I>,
}

impl<I> Default for ItemExtractor<I> {
    fn default() -> Self {
        Self {
            seen: HashSet::new(),
            pending: None,
        }
    }
}

impl<I: Serialize + Clone> ItemExtractor<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the array as it appears in one snapshot.
    ///
    /// Returns the items that became final with this snapshot and have not been
    /// returned before, in array order.
    pub fn observe(&mut self, items: &[I]) -> Result<Vec<I>> {
        let Some((last, settled)) = items.split_last() else {
            return Ok(Vec::new());
        };

        let mut confirmed = Vec::new();
        for item in settled {
            if self.mark_seen(item)? {
                confirmed.push(item.clone());
            }
        }
        self.pending = Some(last.clone());
        Ok(confirmed)
    }

    /// Release the pending item after the source has completed.
    pub fn finish(&mut self) -> Result<Option<I>> {
        match self.pending.take() {
            Some(item) if self.mark_seen(&item)? => Ok(Some(item)),
            _ => Ok(None),
        }
    }

    /// Forget the unconfirmed pending item.
    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Number of distinct items released so far.
    pub fn released(&self) -> usize {
        self.seen.len()
    }

    fn mark_seen(&mut self, item: &I) -> Result<bool> {
        let bytes = serde_json::to_vec(&canonical(serde_json::to_value(item)?))?;
        let mut identity: Identity = [0; 32];
        identity.copy_from_slice(&Sha256::digest(&bytes));
        Ok(self.seen.insert(identity))
    }
}

/// Rebuild `value` with object keys sorted, so equal content serializes identically.
fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonical(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// Selector reading the array at a JSON Pointer (e.g. `/activities`) from a snapshot.
///
/// Snapshots where the pointer is missing or not an array yield `None`.
pub fn select_array(pointer: impl Into<String>) -> impl FnMut(&Value) -> Option<Vec<Value>> + Send + 'static {
    let pointer = pointer.into();
    move |snapshot: &Value| snapshot.pointer(&pointer)?.as_array().cloned()
}

/// Lazily extract completed items from a stream of partial snapshots.
///
/// The returned stream is pull-driven: the source only advances when the consumer
/// asks for the next item. An error from the source is forwarded once and ends the
/// stream; the pending item is dropped with it. Dropping the returned stream drops
/// the source, which releases the underlying provider connection.
pub fn extract_items<'a, P, I, S, F>(partials: S, select: F) -> BoxStream<'a, Result<I>>
where
    P: Send + 'a,
    I: Serialize + Clone + Send + 'a,
    S: Stream<Item = Result<P>> + Send + 'a,
    F: FnMut(&P) -> Option<Vec<I>> + Send + 'a,
{
    struct State<S, F, I> {
        source: std::pin::Pin<Box<S>>,
        select: F,
        extractor: ItemExtractor<I>,
        ready: VecDeque<I>,
        snapshots: usize,
        finished: bool,
    }

    let state = State {
        source: Box::pin(partials),
        select,
        extractor: ItemExtractor::new(),
        ready: VecDeque::new(),
        snapshots: 0,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((Ok(item), state));
            }
            if state.finished {
                return None;
            }

            match state.source.next().await {
                Some(Ok(snapshot)) => {
                    state.snapshots += 1;
                    let Some(items) = (state.select)(&snapshot) else {
                        continue;
                    };
                    match state.extractor.observe(&items) {
                        Ok(confirmed) => {
                            trace!(
                                snapshot = state.snapshots,
                                confirmed = confirmed.len(),
                                "Observed snapshot"
                            );
                            state.ready.extend(confirmed);
                        }
                        Err(e) => {
                            state.finished = true;
                            state.extractor.discard_pending();
                            return Some((Err(e), state));
                        }
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "Snapshot source failed; dropping pending item");
                    state.finished = true;
                    state.extractor.discard_pending();
                    return Some((Err(e), state));
                }
                None => {
                    state.finished = true;
                    match state.extractor.finish() {
                        Ok(Some(last)) => state.ready.push_back(last),
                        Ok(None) => {}
                        Err(e) => return Some((Err(e), state)),
                    }
                    debug!(
                        snapshots = state.snapshots,
                        items = state.extractor.released(),
                        "Snapshot source completed"
                    );
                }
            }
        }
    }))
}
