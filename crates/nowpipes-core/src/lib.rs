//! Lazy, composable data-pipeline engine for time-series training data.
//!
//! Independently authored stages register by name in a [`StageRegistry`],
//! chain into an acyclic [`PipelineGraph`], and execute lazily: nothing runs
//! until the terminal stage's cursor is pulled. Replicating the graph across
//! worker processes with distinct [`WorkerContext`]s shards the source keys
//! deterministically, so the union over all workers is exactly one full
//! epoch with no duplicates.
//!
//! Concrete load/select/transform/convert stages live in `nowpipes-stages`;
//! this crate only sequences and routes opaque records.

pub mod combinators;
pub mod cursor;
pub mod error;
pub mod graph;
pub mod registry;
pub mod sharding;
pub mod stage;

pub use combinators::{fork, CombineFn, Concatenate, KeyFn, Zip, DEFAULT_LOOKAHEAD};
pub use cursor::{Cursor, RecordCursor, VecCursor};
pub use error::{PipelineError, Result};
pub use graph::{assemble, EpochCursor, PipelineDescription, PipelineGraph, StageSpec, FORK_STAGE};
pub use registry::{StageConstructor, StageParams, StageRegistry};
pub use sharding::{DeterministicRng, ShardState, WorkerContext};
pub use stage::{FilterStage, KeyedSource, LoadFn, MapFn, MapStage, PredicateFn, ShuffleStage, Stage};
