//! Press lifecycle integration tests over the simulated actuator and the
//! in-memory gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rpb_core::{
    ButtonController, ButtonError, MemoryGateway, NotificationHub, PersistenceGateway,
    SimulatedBackend, StateWatcher,
};
use tokio::sync::oneshot::error::TryRecvError;

struct Fixture {
    controller: Arc<ButtonController>,
    store: Arc<MemoryGateway>,
    hub: Arc<NotificationHub>,
    level: Arc<AtomicBool>,
}

fn fixture(max_hold: Duration) -> Fixture {
    let backend = SimulatedBackend::new();
    let level = backend.level();
    let store = Arc::new(MemoryGateway::new());
    let hub = Arc::new(NotificationHub::new());
    let gateway: Arc<dyn PersistenceGateway> = store.clone();
    let controller = Arc::new(ButtonController::new(
        Box::new(backend),
        max_hold,
        gateway,
        Arc::clone(&hub),
    ));
    controller.setup().expect("simulated backend setup");
    Fixture {
        controller,
        store,
        hub,
        level,
    }
}

#[tokio::test]
async fn press_then_release_finalizes_once() {
    let f = fixture(Duration::from_secs(20));

    let handle = f.controller.press("alice", None).expect("press");
    assert!(f.controller.is_pressed());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let record = f.controller.release().expect("release");
    assert!(!f.controller.is_pressed());

    assert_eq!(record.source, "alice");
    assert_eq!(record.id, Some(1));
    assert!(!record.start_state);
    // The simulator toggles its level when the press ends.
    assert!(record.end_state);
    assert!(record.elapsed >= 0.0);
    // Elapsed carries whole milliseconds only.
    assert!((record.elapsed * 1000.0).fract().abs() < 1e-9);

    let resolved = handle.finished().await.expect("handle resolves");
    assert_eq!(resolved, record);

    assert_eq!(f.store.presses().len(), 1);
    assert_eq!(f.controller.last_press(), Some(record));
}

#[tokio::test]
async fn second_press_is_rejected_without_side_effects() {
    let f = fixture(Duration::from_secs(20));

    let _handle = f.controller.press("a", None).expect("first press");
    let before = f.controller.last_press();

    let err = f.controller.press("b", None).expect_err("second press");
    assert!(matches!(err, ButtonError::AlreadyPressed));
    assert_eq!(f.controller.last_press(), before);
    assert!(f.store.presses().is_empty());
    assert!(f.controller.is_pressed());

    f.controller.release().expect("release");
}

#[tokio::test]
async fn release_without_press_is_rejected() {
    let f = fixture(Duration::from_secs(20));

    let err = f.controller.release().expect_err("release while released");
    assert!(matches!(err, ButtonError::AlreadyReleased));
    assert!(f.store.presses().is_empty());
    assert!(!f.level.load(Ordering::SeqCst), "no backend drive happened");
}

#[tokio::test]
async fn oversized_hold_is_rejected_before_any_mutation() {
    let f = fixture(Duration::from_secs(2));

    let err = f
        .controller
        .press("a", Some(Duration::from_secs(3)))
        .expect_err("hold above maximum");
    assert!(matches!(
        err,
        ButtonError::InvalidDuration {
            requested_ms: 3_000,
            max_ms: 2_000,
        }
    ));
    assert!(!f.controller.is_pressed());
    assert!(f.store.presses().is_empty());
}

#[tokio::test]
async fn deadline_expiry_releases_automatically() {
    let f = fixture(Duration::from_millis(100));

    let handle = f
        .controller
        .press("test", Some(Duration::from_millis(100)))
        .expect("press");

    let record = tokio::time::timeout(Duration::from_millis(600), handle.finished())
        .await
        .expect("resolves no later than the hold deadline")
        .expect("handle carries the record");

    assert!(!f.controller.is_pressed());
    assert!(!record.start_state);
    assert_eq!(record.end_state, f.controller.sense_now());
    assert!(record.elapsed >= 0.09, "held for {} s", record.elapsed);
    assert_eq!(f.store.presses().len(), 1);
}

#[tokio::test]
async fn explicit_release_cancels_the_deadline() {
    let f = fixture(Duration::from_millis(100));

    let handle = f.controller.press("test", None).expect("press");
    let record = f.controller.release().expect("release");
    assert_eq!(handle.finished().await, Some(record));

    // Were the deadline still armed it would fire within this window; a
    // second finalization would add a record and fulfill the new waiter.
    let mut late = f.hub.subscribe_press_complete();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(f.store.presses().len(), 1);
    assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(
        f.controller.release(),
        Err(ButtonError::AlreadyReleased)
    ));
}

#[tokio::test]
async fn completion_waiters_observe_only_their_press() {
    let f = fixture(Duration::from_secs(20));

    let first_sub = f.hub.subscribe_press_complete();
    f.controller.press("a", None).expect("press");
    let first = f.controller.release().expect("release");
    assert_eq!(first_sub.await.expect("first waiter fires"), first);

    // Registered after the first completion: must wait for the next one,
    // never receive the stale record.
    let second_sub = f.hub.subscribe_press_complete();
    f.controller.press("b", None).expect("press");
    let second = f.controller.release().expect("release");

    let got = second_sub.await.expect("second waiter fires");
    assert_eq!(got, second);
    assert_ne!(got.id, first.id);
}

#[tokio::test]
async fn elapsed_matches_the_hold_span() {
    let f = fixture(Duration::from_secs(20));

    let _handle = f.controller.press("t", None).expect("press");
    tokio::time::sleep(Duration::from_millis(120)).await;
    let record = f.controller.release().expect("release");

    assert!(record.elapsed >= 0.1, "elapsed {} too small", record.elapsed);
    assert!(record.elapsed < 2.0, "elapsed {} too large", record.elapsed);
}

#[tokio::test]
async fn watcher_reports_external_toggle() {
    let f = fixture(Duration::from_secs(20));
    let gateway: Arc<dyn PersistenceGateway> = f.store.clone();
    let watcher = StateWatcher::new(
        Arc::clone(&f.controller),
        gateway,
        Arc::clone(&f.hub),
    )
    .with_poll_interval(Duration::from_millis(20))
    .spawn();

    let sub = f.hub.subscribe_state_change();
    f.level.store(true, Ordering::SeqCst);

    let observed = tokio::time::timeout(Duration::from_millis(500), sub)
        .await
        .expect("notified within a poll interval")
        .expect("subscription fires");
    assert!(observed);
    assert!(f.controller.is_on());

    let transitions = f.store.transitions();
    assert_eq!(transitions.len(), 1);
    assert!(transitions[0].is_on);
    assert!(!transitions[0].during_press);

    watcher.abort();
}

#[tokio::test]
async fn watcher_tags_transitions_during_a_press() {
    let f = fixture(Duration::from_secs(20));
    let gateway: Arc<dyn PersistenceGateway> = f.store.clone();
    let watcher = StateWatcher::new(
        Arc::clone(&f.controller),
        gateway,
        Arc::clone(&f.hub),
    )
    .with_poll_interval(Duration::from_millis(20))
    .spawn();

    let _handle = f.controller.press("t", None).expect("press");
    let sub = f.hub.subscribe_state_change();
    f.level.store(true, Ordering::SeqCst);

    tokio::time::timeout(Duration::from_millis(500), sub)
        .await
        .expect("notified")
        .expect("subscription fires");

    let transitions = f.store.transitions();
    assert_eq!(transitions.len(), 1);
    assert!(transitions[0].during_press);

    f.controller.release().expect("release");
    watcher.abort();
}
