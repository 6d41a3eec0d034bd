use serde::de::DeserializeOwned;
use tracing::debug;

use atlas_core::error::ParseFailure;

/// Keys a node expects in its structured output.
#[derive(Debug, Clone, Default)]
pub struct OutputSchema {
    pub required_keys: Vec<String>,
}

impl OutputSchema {
    /// A schema with no required keys.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    /// Check a parsed value and return the first problem found.
    pub fn check(&self, value: &serde_json::Value) -> Result<(), String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "Expected JSON object but got non-object".to_string())?;
        for key in &self.required_keys {
            if !obj.contains_key(key) {
                return Err(format!("Missing required key: '{}'", key));
            }
        }
        Ok(())
    }
}

/// Extract a typed record from raw backend output.
///
/// The segments are concatenated and the first balanced `{...}` span is
/// parsed. If that fails, the text is cleaned (code fences, `//`
/// annotations, trailing commas, unclosed braces) and every candidate span
/// is tried once more. Never panics; the error carries the raw text.
pub fn recover<T, S>(segments: &[S], schema: &OutputSchema) -> Result<T, ParseFailure>
where
    T: DeserializeOwned,
    S: AsRef<str>,
{
    let raw: String = segments.iter().map(AsRef::as_ref).collect();

    let first_error = match scan_objects(&raw).spans.first() {
        Some(span) => match parse_span(span, schema) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        },
        None => "no JSON object found in output".to_string(),
    };

    debug!(reason = %first_error, "Direct parse failed, cleaning output");

    let cleaned = strip_trailing_commas(&strip_line_comments(&strip_code_fences(&raw)));
    let scan = scan_objects(&cleaned);
    let mut candidates: Vec<String> = scan.spans.iter().map(|s| s.to_string()).collect();
    if let Some(tail) = scan.unclosed {
        candidates.push(strip_trailing_commas(&balance_braces(tail)));
    }

    let mut last_error = first_error;
    for candidate in &candidates {
        match parse_span(candidate, schema) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = e,
        }
    }

    Err(ParseFailure::new(raw, last_error))
}

fn parse_span<T: DeserializeOwned>(span: &str, schema: &OutputSchema) -> Result<T, String> {
    let value: serde_json::Value =
        serde_json::from_str(span).map_err(|e| format!("Output is not valid JSON: {}", e))?;
    schema.check(&value)?;
    serde_json::from_value(value).map_err(|e| format!("Output has the wrong shape: {}", e))
}

struct ObjectScan<'a> {
    /// Balanced top-level `{...}` spans in order of appearance.
    spans: Vec<&'a str>,
    /// A top-level object that was opened but never closed.
    unclosed: Option<&'a str>,
}

/// Find top-level object spans. Quotes only count inside an object, so
/// apostrophes and quotes in surrounding prose are ignored.
fn scan_objects(text: &str) -> ObjectScan<'_> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if depth == 0 {
            if ch == '{' {
                start = i;
                depth = 1;
                in_string = false;
            }
            continue;
        }
        if escape_next {
            escape_next = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }

    ObjectScan {
        spans,
        unclosed: (depth > 0).then(|| &text[start..]),
    }
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        return match after.find("```") {
            Some(end) => after[..end].trim().to_string(),
            // Truncated before the closing fence.
            None => after.trim().to_string(),
        };
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Drop `// ...` annotations that sit outside string literals.
fn strip_line_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;
    let mut in_comment = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
                out.push(ch);
            }
            continue;
        }
        if escape_next {
            escape_next = false;
            out.push(ch);
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(ch);
            continue;
        }
        match ch {
            '"' => in_string = true,
            '/' if chars.peek() == Some(&'/') => {
                in_comment = true;
                continue;
            }
            _ => {}
        }
        out.push(ch);
    }
    out
}

/// Remove commas directly followed (modulo whitespace) by `}` or `]`.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in chars.iter().enumerate() {
        if escape_next {
            escape_next = false;
        } else if in_string {
            match ch {
                '\\' => escape_next = true,
                '"' => in_string = false,
                _ => {}
            }
        } else if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

/// Balance JSON braces/brackets by appending missing closers.
fn balance_braces(text: &str) -> String {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }

    let mut result = text.trim_end().to_string();
    if in_string {
        result.push('"');
    }
    while let Some(closer) = closers.pop() {
        result.push(closer);
    }
    result
}
