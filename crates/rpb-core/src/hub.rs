//! One-shot notification fan-out.
//!
//! Two independent broadcast registries — "state changed" and "press
//! completed" — with register-then-wait semantics: a subscriber receives at
//! most one value, publishing drains the registry, and a subscriber
//! registered after a publish only observes the next one. There is no
//! replay; callers needing "already happened" answers query current state
//! before subscribing.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::record::PressRecord;

/// Registry of single-fire waiters for button events.
#[derive(Default)]
pub struct NotificationHub {
    state_changed: Mutex<Vec<oneshot::Sender<bool>>>,
    press_complete: Mutex<Vec<oneshot::Sender<PressRecord>>>,
}

impl NotificationHub {
    /// Create a hub with empty registries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next sense-state change.
    pub fn subscribe_state_change(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        lock(&self.state_changed).push(tx);
        rx
    }

    /// Register a waiter for the next press completion.
    pub fn subscribe_press_complete(&self) -> oneshot::Receiver<PressRecord> {
        let (tx, rx) = oneshot::channel();
        lock(&self.press_complete).push(tx);
        rx
    }

    /// Deliver the new sense state to every registered waiter and clear the
    /// registry. Waiters that dropped their receiver are skipped.
    pub fn publish_state_change(&self, is_on: bool) {
        let waiters = std::mem::take(&mut *lock(&self.state_changed));
        for waiter in waiters {
            let _ = waiter.send(is_on);
        }
    }

    /// Deliver the finalized press to every registered waiter and clear the
    /// registry.
    pub fn publish_press_complete(&self, record: &PressRecord) {
        let waiters = std::mem::take(&mut *lock(&self.press_complete));
        for waiter in waiters {
            let _ = waiter.send(record.clone());
        }
    }
}

// Registry operations never panic while holding the lock; recover the guard
// instead of wedging every future subscriber on a poisoned mutex.
fn lock<T>(registry: &Mutex<Vec<T>>) -> MutexGuard<'_, Vec<T>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use crate::record::now_utc_ms;

    use super::*;

    fn record() -> PressRecord {
        PressRecord {
            id: Some(1),
            source: "test".to_string(),
            pressed_at: now_utc_ms(),
            elapsed: 0.5,
            start_state: false,
            end_state: true,
        }
    }

    #[tokio::test]
    async fn every_waiter_receives_the_publish_once() {
        let hub = NotificationHub::new();
        let first = hub.subscribe_state_change();
        let second = hub.subscribe_state_change();

        hub.publish_state_change(true);

        assert_eq!(first.await, Ok(true));
        assert_eq!(second.await, Ok(true));
    }

    #[tokio::test]
    async fn publish_clears_the_registry() {
        let hub = NotificationHub::new();
        let early = hub.subscribe_press_complete();
        hub.publish_press_complete(&record());
        assert_eq!(early.await.unwrap().id, Some(1));

        // A waiter registered after the publish must not see the stale
        // record; it waits for the next one.
        let mut late = hub.subscribe_press_complete();
        assert!(matches!(
            late.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));

        let mut next = record();
        next.id = Some(2);
        hub.publish_press_complete(&next);
        assert_eq!(late.await.unwrap().id, Some(2));
    }

    #[tokio::test]
    async fn dropped_receivers_do_not_block_publish() {
        let hub = NotificationHub::new();
        drop(hub.subscribe_state_change());
        let live = hub.subscribe_state_change();

        hub.publish_state_change(false);
        assert_eq!(live.await, Ok(false));
    }
}
