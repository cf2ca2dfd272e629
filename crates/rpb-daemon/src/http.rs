//! HTTP surface of the daemon.
//!
//! JSON API over the button controller plus the embedded single-page UI.
//! State-machine refusals (press while pressed, release while released)
//! keep the original service's 418 status so existing clients' error
//! handling continues to work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use chrono::{DateTime, Utc};
use rpb_core::{ButtonController, ButtonError, NotificationHub, PressRecord, StoreError};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::{self, Origin};
use crate::db::{Page, SqliteStore, StateRow};

/// Per-route page-size cap for history queries.
const HISTORY_PAGE_LIMIT: u32 = 10;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The button state machine.
    pub controller: Arc<ButtonController>,
    /// Notification fan-out, shared with the controller and watcher.
    pub hub: Arc<NotificationHub>,
    /// Durable store.
    pub store: Arc<SqliteStore>,
    /// SHA-256 digest of the shared secret.
    pub secret_digest: [u8; 32],
    /// Configured maximum hold.
    pub max_hold: Duration,
    /// When the daemon came up.
    pub started_at: DateTime<Utc>,
}

/// Build the full application router: API routes, embedded static UI,
/// basic auth inside, CORS outside.
pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/index.js", get(index_js))
        .route("/status", get(status))
        .route("/state", get(state))
        .route("/state/history", get(state_history))
        .route("/press", post(press))
        .route("/press/history", get(press_history))
        .route("/release", post(release))
        .route("/turn/{state}", post(turn))
        .layer(middleware::from_fn_with_state(
            app.clone(),
            auth::require_basic_auth,
        ))
        .layer(middleware::from_fn(auth::allow_cors))
        .with_state(app)
}

/// Error envelope returned by every handler: `{"error": "..."}` with the
/// mapped status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, error = %self.message, "request failed");
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ButtonError> for ApiError {
    fn from(err: ButtonError) -> Self {
        let status = match &err {
            ButtonError::AlreadyPressed | ButtonError::AlreadyReleased => StatusCode::IM_A_TEAPOT,
            ButtonError::InvalidDuration { .. } => StatusCode::BAD_REQUEST,
            ButtonError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::internal(err.to_string())
    }
}

#[derive(Serialize)]
struct StatusResponse {
    on: bool,
    pressed: bool,
    running_since: DateTime<Utc>,
    last_press: Option<PressRecord>,
}

async fn status(State(app): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        on: app.controller.is_on(),
        pressed: app.controller.is_pressed(),
        running_since: app.started_at,
        last_press: app.controller.last_press(),
    })
}

async fn state(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "on": app.controller.is_on() }))
}

/// `POST /press?t=<seconds>&wait`
///
/// `t` bounds the hold (rejected when above the configured maximum) and
/// implies `wait`. With `wait` the response carries the finalized record;
/// without it the press is fire-and-forget and the response advertises the
/// automatic-release timeout.
async fn press(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Extension(Origin(source)): Extension<Origin>,
) -> Result<Response, ApiError> {
    let mut wait = params.contains_key("wait");
    let hold = match params.get("t") {
        Some(raw) => {
            wait = true;
            let seconds: f64 = raw
                .parse()
                .map_err(|_| ApiError::bad_request(format!("t ({raw}) is not a number")))?;
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(ApiError::bad_request(format!("t ({raw}) must be positive")));
            }
            Some(Duration::from_secs_f64(seconds))
        },
        None => None,
    };

    let handle = app.controller.press(&source, hold)?;
    if wait {
        match handle.finished().await {
            Some(record) => Ok((StatusCode::OK, Json(record)).into_response()),
            None => Err(ApiError::internal("press was never finalized")),
        }
    } else {
        Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "timeout": app.max_hold.as_secs_f64() })),
        )
            .into_response())
    }
}

async fn release(State(app): State<AppState>) -> Result<Json<PressRecord>, ApiError> {
    Ok(Json(app.controller.release()?))
}

/// `POST /turn/{state}`
///
/// Level-triggered wrapper around the edge-triggered press: presses only
/// when the sensed state differs from the target, then races the next
/// state-change notification against press completion. The subscription is
/// taken out before the press so a fast transition cannot be missed.
async fn turn(
    State(app): State<AppState>,
    Path(target): Path<String>,
    Extension(Origin(source)): Extension<Origin>,
) -> Result<Response, ApiError> {
    let should_be_on = match target.to_lowercase().as_str() {
        "on" => true,
        "off" => false,
        other => {
            return Err(ApiError::bad_request(format!(
                "{other} is not a valid state"
            )));
        },
    };

    if app.controller.is_on() == should_be_on {
        return Ok(Json(json!({ "is_on": should_be_on })).into_response());
    }

    let state_change = app.controller.subscribe_state_change();
    let handle = app.controller.press(&source, None)?;

    tokio::select! {
        changed = state_change => {
            let is_on = changed.map_err(|_| ApiError::internal("state watcher stopped"))?;
            if let Err(err) = app.controller.release() {
                // The deadline may have finalized the press already.
                debug!(%err, "release after state change skipped");
            }
            Ok(Json(json!({ "is_on": is_on })).into_response())
        }
        finished = handle.finished() => {
            let record = finished.ok_or_else(|| ApiError::internal("press was never finalized"))?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "is_on": app.controller.is_on(), "button_press": record })),
            )
                .into_response())
        }
    }
}

async fn press_history(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Page<PressRecord>>, ApiError> {
    let (limit, cursor) = pagination_params(&params)?;
    Ok(Json(app.store.press_history(limit, cursor)?))
}

async fn state_history(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Page<StateRow>>, ApiError> {
    let (limit, cursor) = pagination_params(&params)?;
    Ok(Json(app.store.state_history(limit, cursor)?))
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

async fn index_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        include_str!("../static/index.js"),
    )
}

fn pagination_params(params: &HashMap<String, String>) -> Result<(u32, i64), ApiError> {
    let limit = match params.get("limit") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ApiError::bad_request(format!("limit ({raw}) is not a number")))?
            .min(HISTORY_PAGE_LIMIT),
        None => HISTORY_PAGE_LIMIT,
    };
    let cursor = match params.get("cursor") {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| ApiError::bad_request(format!("cursor ({raw}) is not a number")))?,
        None => 0,
    };
    Ok((limit, cursor))
}
