use std::fmt;

use atlas_core::types::Stage;

/// How a stage finished, as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Retriable failure asking for `target` to run again.
    Retriable { target: Stage },
    Fatal,
}

/// Next step of the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance(Stage),
    Retry(Stage),
    Complete,
    Fail,
}

/// Which retry budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    Node,
    CrossStage,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhausted::Node => write!(f, "retry budget exhausted"),
            Exhausted::CrossStage => write!(f, "cross-stage retry budget exhausted"),
        }
    }
}

/// Retry counters relevant to one proposed retry.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    /// Retries already taken by the target's node.
    pub attempts: u32,
    pub max_retries: u32,
    pub cross_stage_retries: u32,
    pub max_cross_stage_retries: u32,
}

/// The fixed topology. Retry edges may only point at the current stage or
/// an earlier one.
pub fn route(from: Stage, verdict: Verdict) -> Transition {
    match (from, verdict) {
        (Stage::Classifying, Verdict::Success) => Transition::Advance(Stage::ParallelFetch),
        (Stage::ParallelFetch, Verdict::Success) => Transition::Advance(Stage::Reasoning),
        (Stage::Reasoning, Verdict::Success) => Transition::Complete,
        (_, Verdict::Retriable { target }) if target <= from => Transition::Retry(target),
        (_, Verdict::Retriable { .. }) | (_, Verdict::Fatal) => Transition::Fail,
    }
}

/// Apply the retry budgets to a routed transition.
///
/// An exhausted fetch-stage self-retry degrades into `Advance(Reasoning)`;
/// any other exhausted retry fails the traversal.
pub fn gate(from: Stage, proposed: Transition, budget: &Budget) -> (Transition, Option<Exhausted>) {
    let Transition::Retry(target) = proposed else {
        return (proposed, None);
    };

    let exhausted = if budget.attempts >= budget.max_retries {
        Exhausted::Node
    } else if budget.cross_stage_retries >= budget.max_cross_stage_retries {
        Exhausted::CrossStage
    } else {
        return (proposed, None);
    };

    if from == Stage::ParallelFetch && target == Stage::ParallelFetch {
        (Transition::Advance(Stage::Reasoning), Some(exhausted))
    } else {
        (Transition::Fail, Some(exhausted))
    }
}

/// The stage whose completion a retry to `target` rolls back to.
pub fn completed_before(target: Stage) -> Option<Stage> {
    match target {
        Stage::Classifying => None,
        Stage::ParallelFetch => Some(Stage::Classifying),
        Stage::Reasoning => Some(Stage::ParallelFetch),
    }
}

/// Where a checkpointed traversal continues. `None` when nothing is left.
pub fn resume_point(last_completed: Option<Stage>) -> Option<Stage> {
    match last_completed {
        None => Some(Stage::Classifying),
        Some(Stage::Classifying) => Some(Stage::ParallelFetch),
        Some(Stage::ParallelFetch) => Some(Stage::Reasoning),
        Some(Stage::Reasoning) => None,
    }
}
