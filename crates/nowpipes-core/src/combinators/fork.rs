use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cursor::{Cursor, RecordCursor};
use crate::error::{PipelineError, Result};
use crate::sharding::WorkerContext;
use crate::stage::Stage;

/// Splits one upstream into `branches` independent consumer views.
///
/// All branches of one epoch share a single upstream cursor: each upstream
/// record is pulled exactly once and fanned out, with records buffered for
/// slower (or not-yet-started) branches until they catch up. `max_lag`
/// bounds how far any branch may fall behind; `None` is unbounded, which is
/// a memory risk when consumption rates diverge widely.
pub fn fork<R>(
    label: impl Into<String>,
    upstream: Arc<dyn Stage<R>>,
    branches: usize,
    max_lag: Option<usize>,
) -> Result<Vec<Arc<dyn Stage<R>>>>
where
    R: Clone + Send + 'static,
{
    if branches == 0 {
        return Err(PipelineError::configuration(
            "fork requires at least one branch",
        ));
    }
    let label = label.into();
    let state = Arc::new(Mutex::new(ForkState {
        upstream,
        branches,
        max_lag,
        epoch: 0,
        cursor: None,
        buffers: (0..branches).map(|_| VecDeque::new()).collect(),
        started: vec![false; branches],
        finished: vec![false; branches],
        exhausted: false,
        failed: None,
    }));
    Ok((0..branches)
        .map(|index| {
            Arc::new(ForkBranch {
                label: format!("{label}.{index}"),
                index,
                state: Arc::clone(&state),
            }) as Arc<dyn Stage<R>>
        })
        .collect())
}

struct ForkState<R> {
    upstream: Arc<dyn Stage<R>>,
    branches: usize,
    max_lag: Option<usize>,
    epoch: u64,
    cursor: Option<Cursor<R>>,
    buffers: Vec<VecDeque<R>>,
    started: Vec<bool>,
    finished: Vec<bool>,
    exhausted: bool,
    failed: Option<String>,
}

impl<R> ForkState<R> {
    fn reset_for_new_epoch(&mut self) {
        self.epoch += 1;
        self.cursor = None;
        self.exhausted = false;
        self.failed = None;
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.started.fill(false);
        self.finished.fill(false);
    }

    /// Release the shared upstream cursor once no branch can pull again.
    fn release_if_abandoned(&mut self) {
        if self.finished.iter().all(|flag| *flag) {
            self.cursor = None;
            for buffer in &mut self.buffers {
                buffer.clear();
            }
        }
    }
}

pub struct ForkBranch<R> {
    label: String,
    index: usize,
    state: Arc<Mutex<ForkState<R>>>,
}

impl<R> ForkBranch<R> {
    fn lock(&self) -> Result<MutexGuard<'_, ForkState<R>>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::stage(&self.label, "fork state poisoned"))
    }
}

impl<R> Stage<R> for ForkBranch<R>
where
    R: Clone + Send + 'static,
{
    fn label(&self) -> &str {
        &self.label
    }

    fn iterate(&self, ctx: &WorkerContext) -> Result<Cursor<R>> {
        let mut state = self.lock()?;
        if state.started[self.index] {
            // Restarting a branch begins a new epoch; siblings must not be
            // mid-iteration or the shared cursor position would be lost.
            let sibling_active = (0..state.branches)
                .any(|other| other != self.index && state.started[other] && !state.finished[other]);
            if sibling_active {
                return Err(PipelineError::configuration(format!(
                    "fork branch `{}` restarted while sibling branches are mid-epoch",
                    self.label
                )));
            }
            tracing::debug!(branch = %self.label, epoch = state.epoch + 1, "fork epoch restart");
            state.reset_for_new_epoch();
        }
        state.started[self.index] = true;
        Ok(Box::new(ForkBranchCursor {
            label: self.label.clone(),
            index: self.index,
            epoch: state.epoch,
            ctx: *ctx,
            state: Arc::clone(&self.state),
            done: false,
        }))
    }
}

struct ForkBranchCursor<R> {
    label: String,
    index: usize,
    epoch: u64,
    ctx: WorkerContext,
    state: Arc<Mutex<ForkState<R>>>,
    done: bool,
}

impl<R> RecordCursor<R> for ForkBranchCursor<R>
where
    R: Clone + Send + 'static,
{
    fn next_record(&mut self) -> Option<Result<R>> {
        if self.done {
            return None;
        }
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                self.done = true;
                return Some(Err(PipelineError::stage(&self.label, "fork state poisoned")));
            }
        };
        if state.epoch != self.epoch {
            self.done = true;
            return Some(Err(PipelineError::stage(
                &self.label,
                "fork branch cursor outlived its epoch",
            )));
        }
        if let Some(record) = state.buffers[self.index].pop_front() {
            return Some(Ok(record));
        }
        if state.exhausted {
            state.finished[self.index] = true;
            self.done = true;
            return None;
        }
        if let Some(message) = state.failed.clone() {
            state.finished[self.index] = true;
            self.done = true;
            return Some(Err(PipelineError::stage(
                &self.label,
                format!("shared upstream already failed: {message}"),
            )));
        }
        if state.cursor.is_none() {
            match state.upstream.iterate(&self.ctx) {
                Ok(cursor) => state.cursor = Some(cursor),
                Err(err) => {
                    state.failed = Some(err.to_string());
                    state.finished[self.index] = true;
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        let pulled = match state.cursor.as_mut() {
            Some(cursor) => cursor.next_record(),
            None => {
                self.done = true;
                return Some(Err(PipelineError::stage(&self.label, "fork cursor missing")));
            }
        };
        match pulled {
            Some(Ok(record)) => {
                let index = self.index;
                // Finished branches can never pull again, so fanning out to
                // them would only pin memory (and trip the lag bound).
                for other in 0..state.branches {
                    if other != index && !state.finished[other] {
                        state.buffers[other].push_back(record.clone());
                    }
                }
                if let Some(limit) = state.max_lag {
                    let laggard = state
                        .buffers
                        .iter()
                        .enumerate()
                        .find(|(_, buffer)| buffer.len() > limit)
                        .map(|(branch, buffer)| (branch, buffer.len()));
                    if let Some((branch, lag)) = laggard {
                        state.failed = Some(format!(
                            "branch {branch} exceeded the fork lag bound of {limit}"
                        ));
                        state.cursor = None;
                        self.done = true;
                        return Some(Err(PipelineError::ResourceExhausted { branch, lag, limit }));
                    }
                }
                Some(Ok(record))
            }
            Some(Err(err)) => {
                state.failed = Some(err.to_string());
                state.cursor = None;
                state.finished[self.index] = true;
                self.done = true;
                Some(Err(err))
            }
            None => {
                state.exhausted = true;
                state.cursor = None;
                state.finished[self.index] = true;
                self.done = true;
                None
            }
        }
    }
}

impl<R> Drop for ForkBranchCursor<R> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if state.epoch == self.epoch {
                state.finished[self.index] = true;
                state.buffers[self.index].clear();
                state.release_if_abandoned();
            }
        }
    }
}
