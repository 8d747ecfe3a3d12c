//! The stage contract and the basic stage variants.
//!
//! A stage consumes zero or more upstream stages and exposes exactly one
//! operation: [`Stage::iterate`], which returns a fresh cursor for one epoch.
//! Calling `iterate` on a downstream stage recursively iterates its
//! upstreams, so the whole graph restarts from the beginning without
//! reconstruction. No stage reads ahead of its caller except the explicit
//! buffering combinators.

use std::sync::Arc;

use crate::cursor::{Cursor, RecordCursor};
use crate::error::{PipelineError, Result};
use crate::sharding::{DeterministicRng, WorkerContext};

pub trait Stage<R>: Send + Sync {
    /// Stable label used for seed derivation and error reporting.
    fn label(&self) -> &str;

    /// Begin a new epoch over this stage's output.
    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<R>>;
}

pub type LoadFn<K, R> = Arc<dyn Fn(&K) -> Result<R> + Send + Sync>;
pub type MapFn<R> = Arc<dyn Fn(R) -> Result<R> + Send + Sync>;
pub type PredicateFn<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// Source stage over a deterministically ordered key set.
///
/// Keys are sorted at construction to fix the total ordering that the
/// sharding policy partitions. The loader runs lazily, one key per pull, so
/// a worker never touches keys outside its own shard.
pub struct KeyedSource<K, R> {
    label: String,
    keys: Vec<K>,
    load: LoadFn<K, R>,
}

impl<K, R> KeyedSource<K, R>
where
    K: Clone + Ord + Send + Sync + 'static,
{
    pub fn new(label: impl Into<String>, mut keys: Vec<K>, load: LoadFn<K, R>) -> Self {
        keys.sort();
        Self {
            label: label.into(),
            keys,
            load,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<K, R> Stage<R> for KeyedSource<K, R>
where
    K: Clone + Ord + Send + Sync + 'static,
    R: 'static,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<R>> {
        let shard: Vec<K> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(position, _)| ctx.owns_position(*position))
            .map(|(_, key)| key.clone())
            .collect();
        tracing::debug!(
            stage = %self.label,
            worker = ctx.worker_index,
            workers = ctx.num_workers,
            keys = shard.len(),
            "sharded source keys"
        );
        Ok(Box::new(SourceCursor {
            keys: shard.into_iter(),
            load: Arc::clone(&self.load),
        }))
    }
}

struct SourceCursor<K, R> {
    keys: std::vec::IntoIter<K>,
    load: LoadFn<K, R>,
}

impl<K, R> RecordCursor<R> for SourceCursor<K, R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        let key = self.keys.next()?;
        Some((self.load)(&key))
    }
}

/// Transform stage: one record in, one record out.
pub struct MapStage<R> {
    label: String,
    upstream: Arc<dyn Stage<R>>,
    op: MapFn<R>,
}

impl<R> MapStage<R> {
    pub fn new(label: impl Into<String>, upstream: Arc<dyn Stage<R>>, op: MapFn<R>) -> Self {
        Self {
            label: label.into(),
            upstream,
            op,
        }
    }
}

impl<R: 'static> Stage<R> for MapStage<R> {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<R>> {
        let inner = self.upstream.iterate(ctx)?;
        Ok(Box::new(MapCursor {
            inner,
            op: Arc::clone(&self.op),
        }))
    }
}

struct MapCursor<R> {
    inner: Cursor<R>,
    op: MapFn<R>,
}

impl<R> RecordCursor<R> for MapCursor<R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        match self.inner.next_record()? {
            Ok(record) => Some((self.op)(record)),
            Err(err) => Some(Err(err)),
        }
    }
}

/// Filter stage: zero or one record out per record in.
pub struct FilterStage<R> {
    label: String,
    upstream: Arc<dyn Stage<R>>,
    keep: PredicateFn<R>,
}

impl<R> FilterStage<R> {
    pub fn new(label: impl Into<String>, upstream: Arc<dyn Stage<R>>, keep: PredicateFn<R>) -> Self {
        Self {
            label: label.into(),
            upstream,
            keep,
        }
    }
}

impl<R: 'static> Stage<R> for FilterStage<R> {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<R>> {
        let inner = self.upstream.iterate(ctx)?;
        Ok(Box::new(FilterCursor {
            inner,
            keep: Arc::clone(&self.keep),
        }))
    }
}

struct FilterCursor<R> {
    inner: Cursor<R>,
    keep: PredicateFn<R>,
}

impl<R> RecordCursor<R> for FilterCursor<R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        loop {
            match self.inner.next_record()? {
                Ok(record) => {
                    if (self.keep)(&record) {
                        return Some(Ok(record));
                    }
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Windowed shuffle with a deterministic per-(epoch, worker) seed.
///
/// Keeps at most `buffer_size` records in memory: the buffer is topped up
/// from upstream and one random element is drawn per pull.
pub struct ShuffleStage<R> {
    label: String,
    upstream: Arc<dyn Stage<R>>,
    buffer_size: usize,
}

impl<R> ShuffleStage<R> {
    pub fn new(
        label: impl Into<String>,
        upstream: Arc<dyn Stage<R>>,
        buffer_size: usize,
    ) -> Result<Self> {
        if buffer_size == 0 {
            return Err(PipelineError::configuration(
                "shuffle buffer_size must be at least 1",
            ));
        }
        Ok(Self {
            label: label.into(),
            upstream,
            buffer_size,
        })
    }
}

impl<R: Send + 'static> Stage<R> for ShuffleStage<R> {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<R>> {
        let inner = self.upstream.iterate(ctx)?;
        let seed = ctx.stage_seed(&self.label);
        Ok(Box::new(ShuffleCursor {
            inner,
            rng: DeterministicRng::new(seed),
            buffer: Vec::with_capacity(self.buffer_size),
            buffer_size: self.buffer_size,
            upstream_done: false,
        }))
    }
}

struct ShuffleCursor<R> {
    inner: Cursor<R>,
    rng: DeterministicRng,
    buffer: Vec<R>,
    buffer_size: usize,
    upstream_done: bool,
}

impl<R> RecordCursor<R> for ShuffleCursor<R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        while !self.upstream_done && self.buffer.len() < self.buffer_size {
            match self.inner.next_record() {
                Some(Ok(record)) => self.buffer.push(record),
                Some(Err(err)) => return Some(Err(err)),
                None => self.upstream_done = true,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let index = self.rng.next_below(self.buffer.len());
        Some(Ok(self.buffer.swap_remove(index)))
    }
}
