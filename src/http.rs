//! Read-only query surface and event intake. Binds to localhost only —
//! this is local-machine observability, never a public API. One handler
//! per resource, with a single `ApiError` converted to a status code via
//! `IntoResponse` and every handler taking `State<EngineState>`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::derived_store;
use crate::error::EngineError;
use crate::metrics_store;
use crate::schema::{Event, Platform};
use crate::supervisor::{DlqReplayFilter, Supervisor};

/// Shared application state handed to every axum handler. Thin on purpose —
/// almost everything lives behind the supervisor, an `Arc`-wrapped shared
/// resource rather than something duplicated per handler.
#[derive(Clone)]
pub struct EngineState {
    pub supervisor: Arc<Supervisor>,
}

pub fn router(state: EngineState) -> Router {
    Router::new()
        .route("/events", post(post_events))
        .route("/healthz", get(get_healthz))
        .route("/readyz", get(get_readyz))
        .route("/sessions", get(get_sessions_list))
        .route("/sessions/:session_id", get(get_session_detail))
        .route("/metrics/:category/:name", get(get_metrics_range))
        .route("/dlq/replay", post(post_dlq_replay))
        .with_state(state)
}

/// API error responses, converted to HTTP status codes by `IntoResponse`
/// below.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::SchemaInvalid(msg) => ApiError::BadRequest(msg),
            EngineError::PayloadTooLarge(bytes) => {
                ApiError::BadRequest(format!("payload too large: {bytes} bytes post-compression"))
            }
            EngineError::TransientIO(msg) => ApiError::ServiceUnavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        tracing::error!(%status, %message, "http: request failed");
        (status, message).into_response()
    }
}

/// Accepts either a single event object or a JSON array of events —
/// capture agents batch their own hook output, so both shapes are common.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventsPayload {
    One(Event),
    Many(Vec<Event>),
}

#[derive(Debug, Serialize)]
struct EventsAcceptedResponse {
    accepted: usize,
}

/// `POST /events` — enqueues one or more events onto the fast-path `events`
/// stream. The ingestor's own thread re-validates every entry before
/// persisting, since redelivery after a crash must be checked again
/// regardless of what happened at the edge — but callers also expect a
/// synchronous `400` here, so the same `Event::validate` runs once up front
/// to reject malformed bodies before they ever reach the queue, rather
/// than accepting them and only discovering the problem on the ingestor's
/// thread.
async fn post_events(
    State(state): State<EngineState>,
    Json(payload): Json<EventsPayload>,
) -> Result<(StatusCode, Json<EventsAcceptedResponse>), ApiError> {
    let events = match payload {
        EventsPayload::One(event) => vec![event],
        EventsPayload::Many(events) => events,
    };
    if events.is_empty() {
        return Err(ApiError::BadRequest("request body contained no events".to_string()));
    }
    for event in &events {
        event.validate().map_err(ApiError::from)?;
    }
    let mut accepted = 0;
    for event in &events {
        state.supervisor.submit_event(event)?;
        accepted += 1;
    }
    Ok((StatusCode::ACCEPTED, Json(EventsAcceptedResponse { accepted })))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    live: bool,
    ready: bool,
    queue_reachable: bool,
    raw_store_reachable: bool,
    events_pending_fastpath: usize,
    events_pending_slowpath: usize,
    dlq_depth: usize,
}

impl From<crate::supervisor::HealthReport> for HealthResponse {
    fn from(r: crate::supervisor::HealthReport) -> Self {
        HealthResponse {
            live: r.live,
            ready: r.ready,
            queue_reachable: r.queue_reachable,
            raw_store_reachable: r.raw_store_reachable,
            events_pending_fastpath: r.events_pending_fastpath,
            events_pending_slowpath: r.events_pending_slowpath,
            dlq_depth: r.dlq_depth,
        }
    }
}

/// `GET /healthz` — liveness only. Always 200 unless the ingest thread's
/// heartbeat has gone stale, in which case 503.
async fn get_healthz(State(state): State<EngineState>) -> impl IntoResponse {
    let report = state.supervisor.health();
    let status = if report.live { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(HealthResponse::from(report)))
}

/// `GET /readyz` — readiness: liveness plus both stores reachable.
async fn get_readyz(State(state): State<EngineState>) -> impl IntoResponse {
    let report = state.supervisor.health();
    let status = if report.ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(HealthResponse::from(report)))
}

#[derive(Debug, Deserialize)]
struct SessionsQuery {
    platform: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    session_id: String,
    platform: String,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    turn_count: i64,
    user_message_count: i64,
    assistant_message_count: i64,
    tool_invocations_count: i64,
}

impl From<derived_store::Conversation> for SessionSummary {
    fn from(c: derived_store::Conversation) -> Self {
        SessionSummary {
            session_id: c.session_id,
            platform: c.platform.table_fragment().to_string(),
            started_at: c.started_at,
            last_activity_at: c.last_activity_at,
            turn_count: c.turn_count,
            user_message_count: c.user_message_count,
            assistant_message_count: c.assistant_message_count,
            tool_invocations_count: c.tool_invocations_count,
        }
    }
}

/// `GET /sessions?platform=&limit=` — most-recently-active sessions first.
async fn get_sessions_list(
    State(state): State<EngineState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let platform = query
        .platform
        .as_deref()
        .map(parse_platform_query)
        .transpose()?;
    let limit = query.limit.unwrap_or(100).min(1000);

    let conn = state.supervisor.reads.get().map_err(ApiError::from)?;
    let sessions = derived_store::list_sessions(&conn, platform, limit).map_err(ApiError::from)?;
    Ok(Json(sessions.into_iter().map(SessionSummary::from).collect()))
}

const RECENT_TURNS_LIMIT: usize = 50;

#[derive(Debug, Serialize)]
struct SessionDetailResponse {
    #[serde(flatten)]
    summary: SessionSummary,
    input_tokens: i64,
    output_tokens: i64,
    aggregates: HashMap<String, f64>,
    recent_turns: Vec<derived_store::Turn>,
}

/// `GET /sessions/:session_id` — full conversation row, accumulated
/// per-session aggregates, and the most recent derived turns.
async fn get_session_detail(
    State(state): State<EngineState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let conn = state.supervisor.reads.get().map_err(ApiError::from)?;
    let conversation = derived_store::get_conversation(&conn, &session_id)
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("no session found for {session_id}")))?;
    let aggregates: HashMap<String, f64> = derived_store::get_session_aggregates(&conn, &session_id)
        .map_err(ApiError::from)?
        .into_iter()
        .collect();
    let recent_turns = derived_store::list_turns(&conn, &session_id, RECENT_TURNS_LIMIT).map_err(ApiError::from)?;

    Ok(Json(SessionDetailResponse {
        input_tokens: conversation.input_tokens,
        output_tokens: conversation.output_tokens,
        summary: SessionSummary::from(conversation),
        aggregates,
        recent_turns,
    }))
}

#[derive(Debug, Deserialize)]
struct MetricsRangeQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    max_points: Option<usize>,
}

#[derive(Debug, Serialize)]
struct MetricsRangeResponse {
    category: String,
    name: String,
    points: Vec<(DateTime<Utc>, f64)>,
}

/// `GET /metrics/:category/:name?from=&to=&max_points=` — a downsampled
/// time-series window, default the trailing 24h if `from`/`to` are absent.
async fn get_metrics_range(
    State(state): State<EngineState>,
    Path((category, name)): Path<(String, String)>,
    Query(query): Query<MetricsRangeQuery>,
) -> Result<Json<MetricsRangeResponse>, ApiError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or_else(|| to - chrono::Duration::hours(24));
    let max_points = query.max_points.unwrap_or(1000);

    let conn = state.supervisor.reads.get().map_err(ApiError::from)?;
    let points = metrics_store::range(&conn, &category, &name, from, to, max_points).map_err(ApiError::from)?;

    Ok(Json(MetricsRangeResponse { category, name, points }))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct DlqReplayRequest {
    reason_contains: Option<String>,
    platform: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct DlqReplayResponse {
    replayed: usize,
}

/// `POST /dlq/replay` — operator action, re-enqueues matching DLQ entries.
/// An empty body (`{}`) replays everything in the DLQ.
async fn post_dlq_replay(
    State(state): State<EngineState>,
    Json(request): Json<DlqReplayRequest>,
) -> Result<Json<DlqReplayResponse>, ApiError> {
    let filter = DlqReplayFilter {
        reason_contains: request.reason_contains,
        platform: request.platform.map(|ps| ps.into_iter().collect()),
    };
    let replayed = state.supervisor.replay_dlq(filter).map_err(ApiError::from)?;
    Ok(Json(DlqReplayResponse { replayed }))
}

fn parse_platform_query(s: &str) -> Result<Platform, ApiError> {
    match s {
        "claude" => Ok(Platform::Claude),
        "cursor" => Ok(Platform::Cursor),
        "windsurf" => Ok(Platform::Windsurf),
        "other" => Ok(Platform::Other),
        _ => Err(ApiError::BadRequest(format!("unknown platform: {s}"))),
    }
}
