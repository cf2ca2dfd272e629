//! Press and state-transition record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed press of the button.
///
/// Created when a press completes (explicit release or deadline expiry) and
/// immutable afterward. The database id is assigned by the persistence
/// layer; a record finalized while persistence was unavailable keeps
/// `id: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressRecord {
    /// Database id, assigned on insert.
    #[serde(rename = "number", skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    /// Who initiated the press; `"unknown"` when unauthenticated.
    pub source: String,
    /// When the press started (UTC, millisecond resolution).
    pub pressed_at: DateTime<Utc>,
    /// How long the button was held, in seconds, millisecond precision.
    pub elapsed: f64,
    /// Sense state read immediately before the output was driven high.
    pub start_state: bool,
    /// Sense state read at release.
    pub end_state: bool,
}

/// A sense-state flip observed by the state watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitionEvent {
    /// When the flip was observed (UTC, millisecond resolution).
    pub changed_at: DateTime<Utc>,
    /// The state after the flip.
    pub is_on: bool,
    /// Whether a press was in progress when the flip was observed.
    pub during_press: bool,
}

/// Current UTC time rounded to millisecond resolution.
///
/// All persisted and reported timestamps go through this so stored rows and
/// elapsed-time arithmetic agree on precision.
#[must_use]
pub fn now_utc_ms() -> DateTime<Utc> {
    round_to_ms(Utc::now())
}

/// Round a timestamp to the nearest millisecond.
#[must_use]
pub fn round_to_ms(t: DateTime<Utc>) -> DateTime<Utc> {
    let micros = t.timestamp_micros();
    let rounded = (micros + 500).div_euclid(1_000) * 1_000;
    DateTime::from_timestamp_micros(rounded).unwrap_or(t)
}

/// Elapsed whole-millisecond span between two timestamps, in seconds.
#[must_use]
#[allow(clippy::cast_precision_loss)] // hold durations are far below 2^52 ms
pub fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1_000.0
}
