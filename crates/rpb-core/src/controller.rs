//! Press/release state machine.
//!
//! The controller owns the actuator backend exclusively and alternates
//! strictly between `Released` and `Pressed`. A press arms a deadline task
//! that performs an automatic release when the caller never comes back;
//! an explicit release cancels it. Both writers converge on one guarded
//! transition: whichever observes the pressed state first finalizes the
//! press, the other gets [`ButtonError::AlreadyReleased`] and causes no
//! side effects.
//!
//! All mutable state sits behind a single mutex, so the pressed-flag check
//! and the subsequent mutation are one atomic unit even under concurrent
//! HTTP handlers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::backend::ActuatorBackend;
use crate::error::{ButtonError, ButtonResult};
use crate::hub::NotificationHub;
use crate::record::{PressRecord, elapsed_secs, now_utc_ms};
use crate::store::PersistenceGateway;

/// Why a release happened; timeout-induced releases are logged distinctly
/// for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseCause {
    Explicit,
    DeadlineExpired,
}

/// A press in flight. Valid only while the controller is pressed.
struct PendingPress {
    source: String,
    pressed_at: chrono::DateTime<chrono::Utc>,
    start_state: bool,
}

struct Inner {
    backend: Box<dyn ActuatorBackend>,
    /// Sense-derived flag maintained by the state watcher.
    on: bool,
    pressing: bool,
    pending: Option<PendingPress>,
    /// Completion side of the handle returned by the active `press`.
    done: Option<oneshot::Sender<PressRecord>>,
    /// Cancels the deadline task of the active press.
    cancel: Option<oneshot::Sender<()>>,
    last_press: Option<PressRecord>,
}

/// The button actuation state machine.
///
/// Shared across request handlers and background tasks via `Arc`; the
/// deadline task spawned by [`press`](Self::press) requires a running tokio
/// runtime.
pub struct ButtonController {
    inner: Mutex<Inner>,
    hub: Arc<NotificationHub>,
    store: Arc<dyn PersistenceGateway>,
    max_hold: Duration,
}

/// Awaitable side of a press: resolves exactly once with the finalized
/// record, whether the press ended by explicit release or by deadline
/// expiry.
#[derive(Debug)]
pub struct PressHandle {
    rx: oneshot::Receiver<PressRecord>,
}

impl PressHandle {
    /// Wait for the press to finalize.
    ///
    /// Returns `None` only when the controller was dropped mid-press.
    pub async fn finished(self) -> Option<PressRecord> {
        self.rx.await.ok()
    }
}

impl ButtonController {
    /// Create a controller around an actuator backend.
    ///
    /// `max_hold` bounds every press; a caller-supplied hold may only
    /// shorten it.
    #[must_use]
    pub fn new(
        backend: Box<dyn ActuatorBackend>,
        max_hold: Duration,
        store: Arc<dyn PersistenceGateway>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                backend,
                on: false,
                pressing: false,
                pending: None,
                done: None,
                cancel: None,
                last_press: None,
            }),
            hub,
            store,
            max_hold,
        }
    }

    /// One-time startup: initialize the backend, seed the cached sense flag,
    /// and restore the last recorded press from the gateway.
    ///
    /// # Errors
    ///
    /// Returns [`ButtonError::BackendUnavailable`] when backend setup fails.
    /// A gateway failure while restoring the last press is logged, not
    /// fatal.
    pub fn setup(&self) -> ButtonResult<()> {
        let mut inner = self.lock();
        inner.backend.setup()?;
        inner.on = inner.backend.sense_on();
        match self.store.load_last_press() {
            Ok(last) => {
                if let Some(press) = &last {
                    debug!(source = %press.source, pressed_at = %press.pressed_at, "restored last press");
                }
                inner.last_press = last;
            },
            Err(err) => warn!(%err, "could not restore the last recorded press"),
        }
        Ok(())
    }

    /// Start a press attributed to `source`.
    ///
    /// The sense state is read *before* the output is driven high, since
    /// driving the output may itself change the sensed level in loop-back
    /// wiring. A deadline task is armed for `hold` (the configured maximum
    /// when unspecified) and performs an automatic release if no explicit
    /// release cancels it first.
    ///
    /// # Errors
    ///
    /// - [`ButtonError::AlreadyPressed`] when a press is already active.
    /// - [`ButtonError::InvalidDuration`] when `hold` exceeds the maximum.
    pub fn press(
        self: &Arc<Self>,
        source: &str,
        hold: Option<Duration>,
    ) -> ButtonResult<PressHandle> {
        let hold = match hold {
            Some(requested) if requested > self.max_hold => {
                return Err(ButtonError::InvalidDuration {
                    requested_ms: duration_ms(requested),
                    max_ms: duration_ms(self.max_hold),
                });
            },
            Some(requested) => requested,
            None => self.max_hold,
        };

        let mut inner = self.lock();
        if inner.pressing {
            return Err(ButtonError::AlreadyPressed);
        }

        let start_state = inner.backend.sense_on();
        inner.backend.drive_high();
        inner.pending = Some(PendingPress {
            source: source.to_string(),
            pressed_at: now_utc_ms(),
            start_state,
        });
        inner.pressing = true;

        let (done_tx, done_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        inner.done = Some(done_tx);
        inner.cancel = Some(cancel_tx);
        drop(inner);

        info!(source, hold_ms = duration_ms(hold), "button pressed");

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(hold) => {
                    info!("press deadline expired, releasing automatically");
                    if let Err(err) = controller.finalize(ReleaseCause::DeadlineExpired) {
                        // An explicit release won the race.
                        debug!(%err, "automatic release skipped");
                    }
                }
                _ = cancel_rx => {}
            }
        });

        Ok(PressHandle { rx: done_rx })
    }

    /// Release the active press.
    ///
    /// # Errors
    ///
    /// Returns [`ButtonError::AlreadyReleased`] when no press is active.
    pub fn release(&self) -> ButtonResult<PressRecord> {
        self.finalize(ReleaseCause::Explicit)
    }

    fn finalize(&self, cause: ReleaseCause) -> ButtonResult<PressRecord> {
        let mut inner = self.lock();
        if !inner.pressing {
            return Err(ButtonError::AlreadyReleased);
        }
        let Some(pending) = inner.pending.take() else {
            return Err(ButtonError::AlreadyReleased);
        };

        // The actuator is always driven low first; nothing below may revert
        // the physical release.
        inner.backend.drive_low();
        let end_state = inner.backend.sense_on();
        let elapsed = elapsed_secs(pending.pressed_at, now_utc_ms());

        inner.pressing = false;
        if let Some(cancel) = inner.cancel.take() {
            let _ = cancel.send(());
        }
        let done = inner.done.take();

        let mut record = PressRecord {
            id: None,
            source: pending.source,
            pressed_at: pending.pressed_at,
            elapsed,
            start_state: pending.start_state,
            end_state,
        };
        match self.store.record_press(&record) {
            Ok(id) => record.id = Some(id),
            Err(err) => error!(%err, "failed to persist press record, keeping it in memory only"),
        }
        inner.last_press = Some(record.clone());
        drop(inner);

        match cause {
            ReleaseCause::Explicit => {
                info!(id = ?record.id, elapsed, "button released");
            },
            ReleaseCause::DeadlineExpired => {
                info!(id = ?record.id, elapsed, "button released by deadline, not by caller");
            },
        }

        if let Some(done) = done {
            let _ = done.send(record.clone());
        }
        self.hub.publish_press_complete(&record);

        Ok(record)
    }

    /// Register a waiter for the next sense-state change.
    ///
    /// Register-then-wait semantics: the waiter observes the next change
    /// only, never a replay. Callers needing the current state use
    /// [`is_on`](Self::is_on) before subscribing.
    pub fn subscribe_state_change(&self) -> oneshot::Receiver<bool> {
        self.hub.subscribe_state_change()
    }

    /// Register a waiter for the next press completion.
    pub fn subscribe_press_complete(&self) -> oneshot::Receiver<PressRecord> {
        self.hub.subscribe_press_complete()
    }

    /// Whether a press is currently active.
    #[must_use]
    pub fn is_pressed(&self) -> bool {
        self.lock().pressing
    }

    /// Cached sense state, maintained by the state watcher.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.lock().on
    }

    /// The most recently finalized press, if any.
    #[must_use]
    pub fn last_press(&self) -> Option<PressRecord> {
        self.lock().last_press.clone()
    }

    /// Configured maximum hold duration.
    #[must_use]
    pub const fn max_hold(&self) -> Duration {
        self.max_hold
    }

    /// Read the sense pin directly, bypassing the cached flag.
    #[must_use]
    pub fn sense_now(&self) -> bool {
        self.lock().backend.sense_on()
    }

    pub(crate) fn set_on(&self, on: bool) {
        self.lock().on = on;
    }

    // Critical sections never panic; recover the guard rather than wedging
    // the controller on a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[allow(clippy::cast_possible_truncation)] // hold durations are bounded by config
const fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
