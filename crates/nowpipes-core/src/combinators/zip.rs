use std::sync::Arc;

use crate::cursor::{Cursor, RecordCursor};
use crate::error::{PipelineError, Result};
use crate::sharding::WorkerContext;
use crate::stage::Stage;

/// Extracts the synchronization key of a record, typically an epoch
/// timestamp. Keys must be non-decreasing within each upstream.
pub type KeyFn<R> = Arc<dyn Fn(&R) -> Result<i64> + Send + Sync>;

/// Merges one aligned record from each upstream into a single output
/// record. Records stay opaque to the engine, so the application decides
/// what "merged" means.
pub type CombineFn<R> = Arc<dyn Fn(Vec<R>) -> Result<R> + Send + Sync>;

/// Default keyed-pairing lookahead window, in records per upstream.
pub const DEFAULT_LOOKAHEAD: usize = 64;

enum ZipMode<R> {
    /// Pair records by position; unequal lengths are an alignment failure.
    Positional,
    /// Pair records by key, discarding unmatched keys within the window.
    Keyed { key_fn: KeyFn<R>, lookahead: usize },
}

/// Synchronizes N upstream sequences into one.
pub struct Zip<R> {
    label: String,
    upstreams: Vec<Arc<dyn Stage<R>>>,
    mode: ZipMode<R>,
    combine: CombineFn<R>,
}

impl<R> Zip<R> {
    pub fn positional(
        label: impl Into<String>,
        upstreams: Vec<Arc<dyn Stage<R>>>,
        combine: CombineFn<R>,
    ) -> Result<Self> {
        check_arity(upstreams.len())?;
        Ok(Self {
            label: label.into(),
            upstreams,
            mode: ZipMode::Positional,
            combine,
        })
    }

    pub fn keyed(
        label: impl Into<String>,
        upstreams: Vec<Arc<dyn Stage<R>>>,
        key_fn: KeyFn<R>,
        lookahead: usize,
        combine: CombineFn<R>,
    ) -> Result<Self> {
        check_arity(upstreams.len())?;
        if lookahead == 0 {
            return Err(PipelineError::configuration(
                "zip lookahead window must be at least 1",
            ));
        }
        Ok(Self {
            label: label.into(),
            upstreams,
            mode: ZipMode::Keyed { key_fn, lookahead },
            combine,
        })
    }
}

fn check_arity(upstreams: usize) -> Result<()> {
    if upstreams < 2 {
        return Err(PipelineError::configuration(
            "zip requires at least two upstreams",
        ));
    }
    Ok(())
}

impl<R: Send + 'static> Stage<R> for Zip<R> {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<R>> {
        let mut cursors = Vec::with_capacity(self.upstreams.len());
        for upstream in &self.upstreams {
            cursors.push(upstream.iterate(ctx)?);
        }
        match &self.mode {
            ZipMode::Positional => Ok(Box::new(PositionalCursor {
                label: self.label.clone(),
                cursors,
                combine: Arc::clone(&self.combine),
                fused: false,
            })),
            ZipMode::Keyed { key_fn, lookahead } => {
                let count = cursors.len();
                Ok(Box::new(KeyedCursor {
                    label: self.label.clone(),
                    cursors,
                    key_fn: Arc::clone(key_fn),
                    combine: Arc::clone(&self.combine),
                    lookahead: *lookahead,
                    heads: (0..count).map(|_| None).collect(),
                    done: vec![false; count],
                    prev_keys: vec![None; count],
                    fused: false,
                }))
            }
        }
    }
}

struct PositionalCursor<R> {
    label: String,
    cursors: Vec<Cursor<R>>,
    combine: CombineFn<R>,
    fused: bool,
}

impl<R> RecordCursor<R> for PositionalCursor<R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        if self.fused {
            return None;
        }
        let mut row = Vec::with_capacity(self.cursors.len());
        let mut ended = Vec::new();
        for (index, cursor) in self.cursors.iter_mut().enumerate() {
            match cursor.next_record() {
                Some(Ok(record)) => row.push(record),
                Some(Err(err)) => {
                    self.fused = true;
                    return Some(Err(err));
                }
                None => ended.push(index),
            }
        }
        if ended.len() == self.cursors.len() {
            self.fused = true;
            return None;
        }
        if !ended.is_empty() {
            self.fused = true;
            return Some(Err(PipelineError::alignment(format!(
                "`{}`: upstream(s) {:?} exhausted while others still held records",
                self.label, ended
            ))));
        }
        let merged = (self.combine)(row);
        if merged.is_err() {
            self.fused = true;
        }
        Some(merged)
    }
}

struct Head<R> {
    key: i64,
    record: R,
}

struct KeyedCursor<R> {
    label: String,
    cursors: Vec<Cursor<R>>,
    key_fn: KeyFn<R>,
    combine: CombineFn<R>,
    lookahead: usize,
    heads: Vec<Option<Head<R>>>,
    done: Vec<bool>,
    prev_keys: Vec<Option<i64>>,
    fused: bool,
}

impl<R> KeyedCursor<R> {
    /// Pull the next head for upstream `index` if it has none.
    fn fill(&mut self, index: usize) -> Result<()> {
        if self.heads[index].is_some() || self.done[index] {
            return Ok(());
        }
        match self.cursors[index].next_record() {
            Some(Ok(record)) => {
                let key = (self.key_fn)(&record)?;
                if let Some(prev) = self.prev_keys[index] {
                    if key < prev {
                        return Err(PipelineError::alignment(format!(
                            "`{}`: upstream {} produced key {} after {}; keys must be non-decreasing",
                            self.label, index, key, prev
                        )));
                    }
                }
                self.prev_keys[index] = Some(key);
                self.heads[index] = Some(Head { key, record });
            }
            Some(Err(err)) => return Err(err),
            None => self.done[index] = true,
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<R>> {
        let count = self.cursors.len();
        let mut discards = vec![0usize; count];
        loop {
            for index in 0..count {
                self.fill(index)?;
            }
            if self.done.iter().all(|flag| *flag) {
                return Ok(None);
            }
            if let Some(empty) = (0..count).find(|i| self.done[*i]) {
                return Err(PipelineError::alignment(format!(
                    "`{}`: upstream {} exhausted while others still held records",
                    self.label, empty
                )));
            }

            // Chase the largest head key; anything smaller cannot match.
            let target = self
                .heads
                .iter()
                .flatten()
                .map(|head| head.key)
                .max()
                .unwrap_or(i64::MIN);
            let mut matched = true;
            for index in 0..count {
                while matches!(&self.heads[index], Some(head) if head.key < target) {
                    let dropped = self.heads[index].take();
                    if let Some(head) = dropped {
                        tracing::warn!(
                            stage = %self.label,
                            upstream = index,
                            key = head.key,
                            target,
                            "discarding unmatched key"
                        );
                    }
                    discards[index] += 1;
                    if discards[index] > self.lookahead {
                        return Err(PipelineError::alignment(format!(
                            "`{}`: no matching key for upstream {} within a window of {} records",
                            self.label, index, self.lookahead
                        )));
                    }
                    self.fill(index)?;
                    if self.done[index] {
                        break;
                    }
                }
                if !matches!(&self.heads[index], Some(head) if head.key == target) {
                    matched = false;
                }
            }
            if !matched {
                continue;
            }

            let mut row = Vec::with_capacity(count);
            for head in &mut self.heads {
                if let Some(head) = head.take() {
                    row.push(head.record);
                }
            }
            return Ok(Some((self.combine)(row)?));
        }
    }
}

impl<R> RecordCursor<R> for KeyedCursor<R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        if self.fused {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.fused = true;
                None
            }
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}
