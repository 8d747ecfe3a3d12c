//! Pipeline description, assembly, and the executed graph.
//!
//! A declarative description is an ordered list of stage entries. Inputs may
//! only reference entries defined earlier, which rules out cycles, and every
//! output may be consumed at most once; sharing an output requires an
//! explicit `fork` entry. All of this is validated before any iteration
//! begins so that a malformed description aborts before workers start
//! training.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::combinators::fork;
use crate::cursor::{Cursor, RecordCursor};
use crate::error::{PipelineError, Result};
use crate::registry::{StageParams, StageRegistry};
use crate::sharding::{ShardState, WorkerContext};
use crate::stage::Stage;

/// Reserved stage name handled by the assembler rather than the registry.
pub const FORK_STAGE: &str = "fork";

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDescription {
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(rename = "stage", default)]
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageSpec {
    pub id: String,
    pub stage: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub params: StageParams,
}

impl PipelineDescription {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| PipelineError::configuration(format!("description parse error: {err}")))
    }
}

/// Build a [`PipelineGraph`] from a validated description.
pub fn assemble<R>(
    registry: &StageRegistry<R>,
    description: &PipelineDescription,
) -> Result<PipelineGraph<R>>
where
    R: Clone + Send + 'static,
{
    if description.stages.is_empty() {
        return Err(PipelineError::configuration(
            "description declares no stages",
        ));
    }

    let mut outputs: HashMap<String, Arc<dyn Stage<R>>> = HashMap::new();
    let mut declared: HashSet<String> = HashSet::new();
    let mut consumed: HashSet<String> = HashSet::new();
    let mut order: Vec<String> = Vec::new();

    for spec in &description.stages {
        if spec.id.contains('.') {
            return Err(PipelineError::configuration(format!(
                "stage id `{}` may not contain `.` (reserved for fork branches)",
                spec.id
            )));
        }
        if !declared.insert(spec.id.clone()) {
            return Err(PipelineError::configuration(format!(
                "stage id `{}` declared twice",
                spec.id
            )));
        }

        let mut upstreams = Vec::with_capacity(spec.inputs.len());
        for input in &spec.inputs {
            let Some(stage) = outputs.get(input) else {
                return Err(PipelineError::configuration(format!(
                    "stage `{}` references `{}`, which is not defined earlier \
                     (unknown or cyclic reference)",
                    spec.id, input
                )));
            };
            if !consumed.insert(input.clone()) {
                return Err(PipelineError::configuration(format!(
                    "output `{input}` is bound twice; insert a fork to share it"
                )));
            }
            upstreams.push(Arc::clone(stage));
        }

        if spec.stage == FORK_STAGE {
            if upstreams.len() != 1 {
                return Err(PipelineError::configuration(format!(
                    "fork `{}` requires exactly one input",
                    spec.id
                )));
            }
            let branches = spec.params.require_u64("branches")? as usize;
            if branches < 2 {
                return Err(PipelineError::configuration(format!(
                    "fork `{}` requires at least two branches",
                    spec.id
                )));
            }
            let max_lag = spec.params.get_u64("max_lag")?.map(|value| value as usize);
            let upstream = upstreams
                .pop()
                .ok_or_else(|| PipelineError::configuration("fork input missing"))?;
            for (index, branch) in fork(&spec.id, upstream, branches, max_lag)?
                .into_iter()
                .enumerate()
            {
                let key = format!("{}.{}", spec.id, index);
                order.push(key.clone());
                outputs.insert(key, branch);
            }
        } else {
            let stage = registry.instantiate(&spec.stage, upstreams, &spec.params)?;
            order.push(spec.id.clone());
            outputs.insert(spec.id.clone(), stage);
        }
    }

    let unconsumed: Vec<&String> = order.iter().filter(|id| !consumed.contains(*id)).collect();
    match unconsumed.as_slice() {
        [terminal] => {
            let terminal = (*terminal).clone();
            tracing::info!(
                pipeline = description.pipeline.as_deref().unwrap_or("unnamed"),
                stages = description.stages.len(),
                %terminal,
                "assembled pipeline graph"
            );
            let stage = outputs
                .remove(&terminal)
                .ok_or_else(|| PipelineError::configuration("terminal stage missing"))?;
            Ok(PipelineGraph::with_name(
                description.pipeline.clone(),
                stage,
            ))
        }
        [] => Err(PipelineError::configuration(
            "description has no terminal stage (every output is consumed)",
        )),
        many => Err(PipelineError::configuration(format!(
            "description must have exactly one terminal stage, found {:?}",
            many
        ))),
    }
}

/// Immutable, fully assembled pipeline. Owns every reachable stage; the
/// terminal stage's `iterate` drives the whole chain for one epoch.
pub struct PipelineGraph<R> {
    name: Option<String>,
    terminal: Arc<dyn Stage<R>>,
    state: Mutex<ShardState>,
}

impl<R> std::fmt::Debug for PipelineGraph<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("name", &self.name)
            .field("terminal", &self.terminal.label())
            .finish_non_exhaustive()
    }
}

impl<R> PipelineGraph<R> {
    pub fn from_terminal(terminal: Arc<dyn Stage<R>>) -> Self {
        Self::with_name(None, terminal)
    }

    fn with_name(name: Option<String>, terminal: Arc<dyn Stage<R>>) -> Self {
        Self {
            name,
            terminal,
            state: Mutex::new(ShardState::Unconfigured),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn terminal(&self) -> &Arc<dyn Stage<R>> {
        &self.terminal
    }

    pub fn shard_state(&self) -> ShardState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ShardState::Unconfigured)
    }

    fn set_state(&self, next: ShardState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    /// Begin one epoch under the given worker context.
    pub fn iterate(&self, ctx: &WorkerContext) -> Result<EpochCursor<'_, R>> {
        let cursor = self.terminal.iterate(ctx)?;
        self.set_state(ShardState::Sharded);
        tracing::debug!(
            pipeline = self.name.as_deref().unwrap_or("unnamed"),
            worker = ctx.worker_index,
            workers = ctx.num_workers,
            epoch_seed = ctx.epoch_seed,
            "epoch started"
        );
        Ok(EpochCursor {
            graph: self,
            cursor,
            finished: false,
        })
    }
}

/// One epoch of the terminal sequence. Dropping it early releases every
/// resource held by the chain.
pub struct EpochCursor<'g, R> {
    graph: &'g PipelineGraph<R>,
    cursor: Cursor<R>,
    finished: bool,
}

impl<R> RecordCursor<R> for EpochCursor<'_, R> {
    fn next_record(&mut self) -> Option<Result<R>> {
        if self.finished {
            return None;
        }
        match self.cursor.next_record() {
            Some(item) => Some(item),
            None => {
                self.finished = true;
                self.graph.set_state(ShardState::Exhausted);
                tracing::debug!(
                    pipeline = self.graph.name.as_deref().unwrap_or("unnamed"),
                    "epoch exhausted"
                );
                None
            }
        }
    }
}

impl<R> Iterator for EpochCursor<'_, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}
