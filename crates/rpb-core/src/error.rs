//! Error taxonomy for the button actuation core.
//!
//! State-machine violations ([`ButtonError::AlreadyPressed`],
//! [`ButtonError::AlreadyReleased`], [`ButtonError::InvalidDuration`]) are
//! returned synchronously to the caller and never retried — they represent
//! caller misuse, not transient faults. Persistence failures are carried by
//! [`StoreError`](crate::store::StoreError) and degrade the operation that
//! hit them; they are never fatal to the controller.

use thiserror::Error;

/// Errors surfaced by the button controller and its actuator backend.
#[derive(Debug, Error)]
pub enum ButtonError {
    /// A press was requested while one is already active.
    ///
    /// At most one press may be in flight at any time; callers must release
    /// (or wait for the deadline) before pressing again.
    #[error("button already pressed")]
    AlreadyPressed,

    /// A release was requested while no press is active.
    ///
    /// Also returned to the loser of a race between an explicit release and
    /// the deadline-driven automatic release: only the first of the two to
    /// observe the pressed state finalizes the press.
    #[error("button already released")]
    AlreadyReleased,

    /// The requested hold duration exceeds the configured maximum.
    #[error("requested hold of {requested_ms} ms exceeds the {max_ms} ms maximum")]
    InvalidDuration {
        /// Hold duration requested by the caller, in milliseconds.
        requested_ms: u64,
        /// Configured maximum hold, in milliseconds.
        max_ms: u64,
    },

    /// The actuator backend could not be initialized.
    ///
    /// Surfaced at startup, not per operation. The owner decides whether to
    /// fall back to the simulated backend or refuse to start.
    #[error("actuator backend unavailable: {reason}")]
    BackendUnavailable {
        /// Description of the initialization failure.
        reason: String,
    },
}

impl ButtonError {
    /// Create a backend-unavailable error.
    #[must_use]
    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the error is a state-machine violation caused by
    /// the caller (press while pressed, release while released, oversized
    /// hold) rather than an environmental failure.
    #[must_use]
    pub const fn is_state_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyPressed | Self::AlreadyReleased | Self::InvalidDuration { .. }
        )
    }
}

/// Result type for button controller operations.
pub type ButtonResult<T> = Result<T, ButtonError>;
