use chrono::{DateTime, Utc};

use atlas_core::types::{
    FlightMetrics, QueryInput, RunState, TrafficMetrics, FLIGHT_TOOL, TRAFFIC_TOOL,
};

/// Minutes reserved for airport security when planning a departure.
pub const SECURITY_BUFFER_MINUTES: i64 = 45;
/// Below this many minutes of slack the user should leave immediately.
pub const LEAVE_NOW_THRESHOLD_MINUTES: i64 = 30;

/// Assemble a prompt from labelled sections.
pub struct PromptBuilder {
    parts: Vec<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn with_base_prompt(mut self, prompt: &str) -> Self {
        self.parts.push(prompt.trim().to_string());
        self
    }

    /// Add a `## label` section with `**key**: value` lines. Empty values
    /// are skipped; a section with no lines is omitted.
    pub fn with_data(mut self, label: &str, entries: &[(&str, Option<String>)]) -> Self {
        let lines: Vec<String> = entries
            .iter()
            .filter_map(|(key, value)| {
                value
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .map(|v| format!("**{}**: {}", key, v))
            })
            .collect();
        if !lines.is_empty() {
            self.parts.push(format!("## {}\n\n{}", label, lines.join("\n")));
        }
        self
    }

    /// Add operator instructions from config.
    pub fn with_instructions(mut self, instructions: Option<&str>) -> Self {
        if let Some(text) = instructions.map(str::trim).filter(|t| !t.is_empty()) {
            self.parts.push(text.to_string());
        }
        self
    }

    pub fn build(self) -> String {
        self.parts.join("\n\n---\n\n")
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

const CLASSIFIER_BASE: &str = r#"You are a precise data extraction engine.
Read the user's request and extract its entities into one JSON object.

Keys:
- "intent": one of "flight_departure_check", "commute", "airport_trip", "general"
- "user_id": the user's identifier if stated, else null
- "origin", "destination": place names, else null
- "flight_number": airline code plus digits (e.g. UA123, AA450), else null
- "target_arrival_time": RFC 3339 timestamp if it can be worked out, else null

If a flight is mentioned and no destination is given, the destination is the
departure airport of that flight. Reply with the JSON object only."#;

const REASONER_BASE: &str = r#"You are a strategic logistics coordinator.
Work out the latest safe departure time and decide whether the user needs a nudge.

Rules:
- Reserve the security buffer below before the flight departs.
- If the slack before the latest safe departure is under the leave-now
  threshold, the action is "nudge_leave_now".
- If traffic is "gridlock", the action is "nudge_book_uber".
- Otherwise the action is "wait".

Reply with one JSON object, either
{"plan": {"metrics_analyzed": true, "buffer_minutes_remaining": <number>,
  "recommended_action": "wait" | "nudge_leave_now" | "nudge_book_uber",
  "reasoning_trace": "<short explanation>", "notification_message": "<text or null>"}}
or, if the context is wrong and an earlier step must be redone,
{"revise": {"stage": "classifying" | "parallel_fetch", "reason": "<what is wrong>"}}"#;

/// Fallback used when the traffic tool produced nothing usable.
pub fn fallback_traffic() -> TrafficMetrics {
    TrafficMetrics {
        distance_meters: 0,
        duration_seconds: 3600,
        traffic_delay_seconds: 0,
        status: atlas_core::types::TrafficStatus::Moderate,
        route_summary: "unavailable".into(),
    }
}

/// System prompt for the classifier.
pub fn classifier_system(now: DateTime<Utc>, instructions: Option<&str>) -> String {
    PromptBuilder::new()
        .with_base_prompt(CLASSIFIER_BASE)
        .with_data("Clock", &[("Current time", Some(now.to_rfc3339()))])
        .with_instructions(instructions)
        .build()
}

/// User prompt for the classifier: the query plus any structured hints.
pub fn classifier_prompt(input: &QueryInput) -> String {
    PromptBuilder::new()
        .with_data(
            "Known Fields",
            &[
                ("origin", input.origin.clone()),
                ("destination", input.destination.clone()),
                ("flight_number", input.flight_number.clone()),
                (
                    "target_arrival_time",
                    input.target_arrival_time.map(|t| t.to_rfc3339()),
                ),
            ],
        )
        .with_base_prompt(&input.query)
        .build()
}

/// System prompt for the reasoner, with the fetched context filled in.
/// Missing or undecodable tool data falls back to conservative defaults.
pub fn reasoner_system(state: &RunState, now: DateTime<Utc>, instructions: Option<&str>) -> String {
    let traffic = state
        .tool_result(TRAFFIC_TOOL)
        .and_then(|r| r.decode::<TrafficMetrics>());
    let traffic_note = if traffic.is_some() { None } else { Some("unavailable, assume 60 minutes".to_string()) };
    let traffic = traffic.unwrap_or_else(fallback_traffic);

    let flight = state
        .tool_result(FLIGHT_TOOL)
        .and_then(|r| r.decode::<FlightMetrics>());
    let degraded: Vec<&str> = state
        .working
        .tool_results
        .values()
        .filter(|r| r.degraded || !r.is_fresh(now))
        .map(|r| r.tool.as_str())
        .collect();

    let classification = state.working.classification.as_ref();

    PromptBuilder::new()
        .with_base_prompt(REASONER_BASE)
        .with_data(
            "Request",
            &[
                ("Query", Some(state.input.query.clone())),
                ("Intent", classification.map(|c| format!("{:?}", c.intent))),
                ("Origin", classification.and_then(|c| c.origin.clone())),
                ("Destination", classification.and_then(|c| c.destination.clone())),
            ],
        )
        .with_data(
            "Context",
            &[
                ("Current time", Some(now.to_rfc3339())),
                (
                    "Traffic",
                    Some(format!(
                        "{:?} ({} sec travel time, {} sec delay)",
                        traffic.status, traffic.duration_seconds, traffic.traffic_delay_seconds
                    )),
                ),
                ("Traffic note", traffic_note),
                (
                    "Flight",
                    Some(match flight {
                        Some(f) => format!(
                            "{} {:?} (departs {})",
                            f.flight_number,
                            f.status,
                            f.estimated_departure.to_rfc3339()
                        ),
                        None => "no flight data".to_string(),
                    }),
                ),
                ("Security buffer", Some(format!("{} minutes (strict)", SECURITY_BUFFER_MINUTES))),
                (
                    "Leave-now threshold",
                    Some(format!("{} minutes", LEAVE_NOW_THRESHOLD_MINUTES)),
                ),
                (
                    "Stale or fallback data",
                    (!degraded.is_empty()).then(|| degraded.join(", ")),
                ),
            ],
        )
        .with_instructions(instructions)
        .build()
}

pub const REASONER_PROMPT: &str = "Analyze the context above and decide the action.";
