use atlas_core::types::RunState;

/// Error notes surfaced to a retrying node.
const HINT_NOTES: usize = 3;
const NOTE_PREVIEW_CHARS: usize = 200;

/// Build the self-correction hints for a node's next attempt from the
/// most recent error notes. Empty when nothing has gone wrong yet.
pub fn corrections(state: &RunState, node: &str) -> Vec<String> {
    correction_hint(node, state.attempts(node), state.recent_notes(HINT_NOTES))
        .into_iter()
        .collect()
}

/// Format a correction hint. `notes` are oldest first.
pub fn correction_hint(node: &str, retries: u32, notes: &[String]) -> Option<String> {
    if notes.is_empty() {
        return None;
    }

    let mut text = if retries > 0 {
        format!("The `{}` step is being retried ({} so far).", node, retries)
    } else {
        format!("Earlier steps reported problems before `{}` ran.", node)
    };
    text.push_str("\n\nRecent errors:");
    for (i, note) in notes.iter().rev().enumerate() {
        text.push_str(&format!("\n  {}. {}", i + 1, truncate_str(note, NOTE_PREVIEW_CHARS)));
    }
    text.push_str("\n\nFix these problems and return a single valid JSON object.");
    Some(text)
}

fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
