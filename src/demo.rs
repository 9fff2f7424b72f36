//! Demo event generator: synthesizes a realistic capture-agent session so a
//! freshly installed engine has something to show in local dashboards
//! before any real IDE hook has fired. Seeds the queue directly rather
//! than driving a terminal renderer.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::error::EngineError;
use crate::schema::{Event, Platform};
use crate::supervisor::Supervisor;

/// One synthetic event, paired with the `event_type`/`hook_type` it
/// simulates and the JSON payload a real capture agent would have sent.
fn sample_event(session_id: &str, hook_type: &str, event_type: &str, payload: serde_json::Value) -> Event {
    let now = Utc::now();
    Event {
        event_id: Uuid::new_v4().to_string(),
        enqueued_at: now,
        retry_count: 0,
        platform: Platform::Claude,
        external_session_id: session_id.to_string(),
        hook_type: hook_type.to_string(),
        event_type: event_type.to_string(),
        timestamp: now,
        payload,
        metadata: json!({ "workspace_hash": "demo-workspace" }),
    }
}

/// A plausible single-session interaction: a user prompt, an assistant
/// reply with token usage, a tool invocation, and a second assistant turn.
/// Mirrors the phases of a real interaction (topic framing, reasoning,
/// tool use, follow-up) without any streaming-thinking machinery, which
/// has no analogue in this engine.
fn demo_sequence(session_id: &str) -> Vec<Event> {
    vec![
        sample_event(
            session_id,
            "user_prompt_submit",
            "user_prompt_submit",
            json!({ "prompt_length": 128 }),
        ),
        sample_event(
            session_id,
            "api_usage",
            "assistant_message",
            json!({ "input_tokens": 4200, "output_tokens": 310 }),
        ),
        sample_event(
            session_id,
            "post_tool_use",
            "post_tool_use",
            json!({ "tool_name": "Read" }),
        ),
        sample_event(
            session_id,
            "post_tool_use",
            "post_tool_use",
            json!({ "tool_name": "Edit" }),
        ),
        sample_event(
            session_id,
            "api_usage",
            "assistant_message",
            json!({ "input_tokens": 5100, "output_tokens": 480 }),
        ),
    ]
}

/// Submits `session_count` synthetic sessions' worth of events onto the
/// supervisor's `events` stream, returning how many were appended. Each
/// session gets a fresh random id so repeated seeding never collides with
/// an existing conversation row.
pub fn seed(supervisor: &Supervisor, session_count: usize) -> Result<usize, EngineError> {
    let mut appended = 0;
    for _ in 0..session_count.max(1) {
        let session_id = format!("demo-{}", Uuid::new_v4());
        for event in demo_sequence(&session_id) {
            supervisor.submit_event(&event)?;
            appended += 1;
        }
    }
    Ok(appended)
}
