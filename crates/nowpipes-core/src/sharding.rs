//! Worker sharding and determinism.
//!
//! A pipeline replicated across N worker processes must partition its source
//! keys so that the union over all workers is exactly the full key set, with
//! no duplicates, and so that the assignment is stable across runs. The
//! policy is positional: worker `i` owns every key at position `p` of the
//! deterministic total ordering where `p % num_workers == i`.
//!
//! Randomized stages derive their per-epoch seed from
//! `(epoch_seed, worker_index, stage label)` so that re-running the same
//! epoch/worker combination reproduces the byte-identical sequence while
//! distinct workers and epochs diverge.

use crate::error::{PipelineError, Result};

const SEED_DERIVE_CONTEXT: &str = "nowpipes v1 stage seed";

pub const ENV_NUM_WORKERS: &str = "NOWPIPES_NUM_WORKERS";
pub const ENV_WORKER_INDEX: &str = "NOWPIPES_WORKER_INDEX";
pub const ENV_EPOCH_SEED: &str = "NOWPIPES_EPOCH_SEED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    pub worker_index: usize,
    pub num_workers: usize,
    pub epoch_seed: u64,
}

impl Default for WorkerContext {
    /// Unsharded context: a single worker owning the full key set.
    fn default() -> Self {
        Self {
            worker_index: 0,
            num_workers: 1,
            epoch_seed: 0,
        }
    }
}

impl WorkerContext {
    pub fn new(worker_index: usize, num_workers: usize, epoch_seed: u64) -> Result<Self> {
        if num_workers == 0 {
            return Err(PipelineError::configuration("num_workers must be at least 1"));
        }
        if worker_index >= num_workers {
            return Err(PipelineError::configuration(format!(
                "worker_index {} out of range for {} workers",
                worker_index, num_workers
            )));
        }
        Ok(Self {
            worker_index,
            num_workers,
            epoch_seed,
        })
    }

    /// Worker bootstrap from the environment supplied by the training
    /// harness. Missing variables fall back to the unsharded default.
    pub fn from_env() -> Result<Self> {
        let num_workers = read_env_usize(ENV_NUM_WORKERS)?.unwrap_or(1);
        let worker_index = read_env_usize(ENV_WORKER_INDEX)?.unwrap_or(0);
        let epoch_seed = read_env_usize(ENV_EPOCH_SEED)?.unwrap_or(0) as u64;
        Self::new(worker_index, num_workers, epoch_seed)
    }

    pub fn is_sharded(&self) -> bool {
        self.num_workers > 1
    }

    /// Whether position `p` in the total key ordering belongs to this worker.
    pub fn owns_position(&self, position: usize) -> bool {
        position % self.num_workers == self.worker_index
    }

    /// Number of keys out of `total` assigned to this worker.
    pub fn shard_len(&self, total: usize) -> usize {
        let full = total / self.num_workers;
        let remainder = total % self.num_workers;
        full + usize::from(self.worker_index < remainder)
    }

    /// Deterministic seed for a randomized stage in this worker and epoch.
    pub fn stage_seed(&self, label: &str) -> u64 {
        let mut hasher = blake3::Hasher::new_derive_key(SEED_DERIVE_CONTEXT);
        hasher.update(&self.epoch_seed.to_le_bytes());
        hasher.update(&(self.worker_index as u64).to_le_bytes());
        hasher.update(label.as_bytes());
        let mut bytes = [0u8; 8];
        hasher.finalize_xof().fill(&mut bytes);
        u64::from_le_bytes(bytes)
    }
}

fn read_env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| PipelineError::configuration(format!("{name} must be an integer, got `{raw}`"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(PipelineError::configuration(format!(
            "{name} contained invalid unicode"
        ))),
    }
}

/// Lifecycle of a replicated pipeline within one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Unconfigured,
    Sharded,
    Exhausted,
}

/// Deterministic random stream for shuffle-style stages, drawn from the
/// blake3 extendable output of the derived seed.
pub struct DeterministicRng {
    reader: blake3::OutputReader,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(SEED_DERIVE_CONTEXT);
        hasher.update(&seed.to_le_bytes());
        Self {
            reader: hasher.finalize_xof(),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.reader.fill(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    /// Uniform value in `[0, bound)` via the multiply-shift reduction.
    pub fn next_below(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        ((self.next_u64() as u128 * bound as u128) >> 64) as usize
    }
}

impl std::fmt::Debug for DeterministicRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicRng").finish_non_exhaustive()
    }
}
