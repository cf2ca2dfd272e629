//! Persistence gateway consumed by the core.
//!
//! The controller and state watcher record presses and state transitions
//! through [`PersistenceGateway`]; full history storage and querying is the
//! implementor's responsibility. The core ships [`MemoryGateway`] for tests
//! and hardware-less hosts; the daemon provides the durable `SQLite`
//! implementation.

use std::sync::Mutex;

use thiserror::Error;

use crate::record::{PressRecord, StateTransitionEvent};

/// Errors from a persistence gateway implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A query or statement against the backing store failed.
    #[error("storage query failed: {reason}")]
    Query {
        /// Description of the failure.
        reason: String,
    },

    /// A stored row could not be decoded into its record type.
    #[error("stored record is malformed: {reason}")]
    Corrupt {
        /// Description of the malformed data.
        reason: String,
    },
}

impl StoreError {
    /// Create a query-failure error.
    #[must_use]
    pub fn query(reason: impl Into<String>) -> Self {
        Self::Query {
            reason: reason.into(),
        }
    }

    /// Create a malformed-record error.
    #[must_use]
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}

/// Result type for gateway operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Records presses and state transitions; consumed, not owned, by the core.
pub trait PersistenceGateway: Send + Sync {
    /// Persist a finalized press and return its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails. Callers treat this as a
    /// degraded-mode signal, never as fatal.
    fn record_press(&self, record: &PressRecord) -> StoreResult<i64>;

    /// Persist an observed sense-state transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn record_state_transition(&self, event: &StateTransitionEvent) -> StoreResult<()>;

    /// Load the most recently recorded press, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or the row is malformed.
    fn load_last_press(&self) -> StoreResult<Option<PressRecord>>;

    /// Load the most recently recorded sense state, if any.
    ///
    /// Used only for the crash-detection check at watcher startup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails.
    fn load_last_known_state(&self) -> StoreResult<Option<bool>>;
}

/// In-memory gateway: mutex-guarded vectors, ids assigned sequentially.
#[derive(Default)]
pub struct MemoryGateway {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    presses: Vec<PressRecord>,
    transitions: Vec<StateTransitionEvent>,
}

impl MemoryGateway {
    /// Create an empty gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded press, in insertion order.
    #[must_use]
    pub fn presses(&self) -> Vec<PressRecord> {
        self.lock().presses.clone()
    }

    /// Snapshot of every recorded transition, in insertion order.
    #[must_use]
    pub fn transitions(&self) -> Vec<StateTransitionEvent> {
        self.lock().transitions.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl PersistenceGateway for MemoryGateway {
    fn record_press(&self, record: &PressRecord) -> StoreResult<i64> {
        let mut inner = self.lock();
        #[allow(clippy::cast_possible_wrap)] // in-memory history never nears i64::MAX
        let id = inner.presses.len() as i64 + 1;
        let mut stored = record.clone();
        stored.id = Some(id);
        inner.presses.push(stored);
        Ok(id)
    }

    fn record_state_transition(&self, event: &StateTransitionEvent) -> StoreResult<()> {
        self.lock().transitions.push(event.clone());
        Ok(())
    }

    fn load_last_press(&self) -> StoreResult<Option<PressRecord>> {
        Ok(self.lock().presses.last().cloned())
    }

    fn load_last_known_state(&self) -> StoreResult<Option<bool>> {
        Ok(self.lock().transitions.last().map(|t| t.is_on))
    }
}
