//! Structural stages: branching and merging.

mod concat;
mod fork;
mod zip;

pub use concat::Concatenate;
pub use fork::{fork, ForkBranch};
pub use zip::{CombineFn, KeyFn, Zip, DEFAULT_LOOKAHEAD};
