//! Reasoning graph engine: a fixed finite-state machine over three stages.
//!
//! `Classifying -> ParallelFetch -> Reasoning`, with bounded retry edges back
//! to the current or an earlier stage. Nodes propose `StateDelta`s; the
//! `GraphExecutor` owns the authoritative `RunState`, merges deltas with the
//! policy in [`merge`], and routes between stages with the table in
//! [`transition`].

pub mod context;
pub mod executor;
pub mod merge;
pub mod node;
pub mod transition;

pub use context::RunContext;
pub use executor::{ExecutorLimits, GraphExecutor, FETCH_STAGE_KEY};
pub use merge::{merge, MergeLimits};
pub use node::{Node, NodeResult, NodeSpec};
pub use transition::{Transition, Verdict};
