//! Sense-state polling loop.
//!
//! Detects sense transitions not caused by a deliberate press — a manual
//! override at the wall switch, or state that changed while the daemon was
//! down — and fans them out: a [`StateTransitionEvent`] to the persistence
//! gateway, the new state to the notification hub, and the controller's
//! cached flag.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::controller::ButtonController;
use crate::hub::NotificationHub;
use crate::record::{StateTransitionEvent, now_utc_ms};
use crate::store::PersistenceGateway;

/// Default tick interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Polling loop watching the controller's sense pin for its lifetime.
pub struct StateWatcher {
    controller: Arc<ButtonController>,
    store: Arc<dyn PersistenceGateway>,
    hub: Arc<NotificationHub>,
    poll_interval: Duration,
}

impl StateWatcher {
    /// Create a watcher with the default 100 ms poll interval.
    #[must_use]
    pub fn new(
        controller: Arc<ButtonController>,
        store: Arc<dyn PersistenceGateway>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            controller,
            store,
            hub,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the poll interval. Tests shorten it; production keeps the
    /// default.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawn the polling loop. The task runs until aborted by its owner.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        self.detect_offline_change();

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            let current = self.controller.sense_now();
            if current == self.controller.is_on() {
                continue;
            }

            let event = StateTransitionEvent {
                changed_at: now_utc_ms(),
                is_on: current,
                during_press: self.controller.is_pressed(),
            };
            if let Err(err) = self.store.record_state_transition(&event) {
                error!(%err, "failed to persist state transition");
            }
            self.hub.publish_state_change(current);
            self.controller.set_on(current);
            info!(is_on = current, during_press = event.during_press, "sense state changed");
        }
    }

    /// Compare the freshly sensed state against the last persisted one to
    /// surface a flip that happened while the process was down. No
    /// reconciliation is attempted; the discrepancy is only logged.
    fn detect_offline_change(&self) {
        let sensed = self.controller.sense_now();
        match self.store.load_last_known_state() {
            Ok(Some(last)) if last != sensed => {
                warn!(
                    last_known = last,
                    sensed, "sense state changed while the daemon was offline"
                );
            },
            Ok(_) => {},
            Err(err) => warn!(%err, "could not load the last known state"),
        }
    }
}
