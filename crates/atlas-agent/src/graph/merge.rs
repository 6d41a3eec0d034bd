use std::collections::BTreeMap;

use chrono::Utc;

use atlas_core::types::{RunState, StateDelta, ToolRecord};

/// Bounds applied while merging.
#[derive(Debug, Clone, Copy)]
pub struct MergeLimits {
    /// Error notes kept in the decision facet; oldest are evicted first.
    pub max_error_notes: usize,
}

impl Default for MergeLimits {
    fn default() -> Self {
        Self { max_error_notes: 32 }
    }
}

/// Fold a node's delta into the authoritative state, returning the new
/// authoritative snapshot. Neither input is modified.
///
/// - identity is monotonic: an established `user_id` is never replaced or
///   cleared, and a blank proposal is ignored
/// - tool results merge per tool; a record only replaces one that is not
///   newer, and a degraded record never displaces a fresh real one
/// - error notes and the trace append; notes are capped
/// - scalar fields replace when present in the delta
pub fn merge(authoritative: &RunState, delta: &StateDelta, limits: &MergeLimits) -> RunState {
    let mut next = authoritative.clone();

    if !next.has_user() {
        if let Some(user) = delta.user_id.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            next.user_id = Some(user.to_string());
        }
    }

    if let Some(ref classification) = delta.classification {
        next.working.classification = Some(classification.clone());
    }

    for record in &delta.tool_results {
        merge_tool_record(&mut next.working.tool_results, record);
    }

    if let Some(ref plan) = delta.plan {
        next.output.plan = Some(plan.clone());
    }
    if let Some(outcome) = delta.last_outcome {
        next.decision.last_outcome = Some(outcome);
    }
    if let Some(stage) = delta.last_completed {
        next.decision.last_completed = Some(stage);
    }

    next.decision.trace.extend(delta.trace.iter().cloned());
    next.decision
        .error_notes
        .extend(delta.error_notes.iter().cloned());
    let overflow = next
        .decision
        .error_notes
        .len()
        .saturating_sub(limits.max_error_notes);
    if overflow > 0 {
        next.decision.error_notes.drain(..overflow);
        next.decision.notes_evicted += overflow as u32;
    }

    if !delta.is_empty() {
        next.updated_at = Utc::now().max(authoritative.updated_at);
    }
    next
}

fn merge_tool_record(results: &mut BTreeMap<String, ToolRecord>, incoming: &ToolRecord) {
    let replace = match results.get(&incoming.tool) {
        None => true,
        Some(existing) => {
            if incoming.degraded && !existing.degraded && existing.is_fresh(incoming.fetched_at) {
                false
            } else {
                // Ties go to the incoming record.
                incoming.fetched_at >= existing.fetched_at
            }
        }
    };
    if replace {
        results.insert(incoming.tool.clone(), incoming.clone());
    }
}
