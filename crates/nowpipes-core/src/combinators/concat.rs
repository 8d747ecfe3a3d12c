use std::sync::Arc;

use crate::cursor::{Cursor, RecordCursor};
use crate::error::{PipelineError, Result};
use crate::sharding::WorkerContext;
use crate::stage::Stage;

/// Yields every record of each upstream in turn, in declaration order.
///
/// Upstream cursors are acquired lazily: a source is not opened until the
/// previous one is exhausted, and each upstream keeps its own restart
/// contract across epochs.
pub struct Concatenate<R> {
    label: String,
    upstreams: Vec<Arc<dyn Stage<R>>>,
}

impl<R> Concatenate<R> {
    pub fn new(label: impl Into<String>, upstreams: Vec<Arc<dyn Stage<R>>>) -> Result<Self> {
        if upstreams.len() < 2 {
            return Err(PipelineError::configuration(
                "concatenate requires at least two upstreams",
            ));
        }
        Ok(Self {
            label: label.into(),
            upstreams,
        })
    }
}

impl<R: 'static> Stage<R> for Concatenate<R> {
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<R>> {
        Ok(Box::new(ConcatCursor {
            upstreams: self.upstreams.clone(),
            ctx: *ctx,
            current: None,
            next_index: 0,
        }))
    }
}

struct ConcatCursor<R> {
    upstreams: Vec<Arc<dyn Stage<R>>>,
    ctx: WorkerContext,
    current: Option<Cursor<R>>,
    next_index: usize,
}

impl<R: 'static> RecordCursor<R> for ConcatCursor<R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        loop {
            if self.current.is_none() {
                if self.next_index >= self.upstreams.len() {
                    return None;
                }
                match self.upstreams[self.next_index].iterate(&self.ctx) {
                    Ok(cursor) => self.current = Some(cursor),
                    Err(err) => {
                        self.next_index = self.upstreams.len();
                        return Some(Err(err));
                    }
                }
                self.next_index += 1;
            }
            match self.current.as_mut()?.next_record() {
                Some(item) => return Some(item),
                None => self.current = None,
            }
        }
    }
}
