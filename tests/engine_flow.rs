//! End-to-end engine scenarios against a real session home on disk: the
//! notification file is written the way the supervised process writes it,
//! and the filesystem watcher picks it up.

use std::path::{Path, PathBuf};
use std::time::Duration;

use session_broker::engine::{EngineConfig, InteractionEngine};
use session_broker::errors::EngineError;
use session_broker::types::InteractionState;

fn no_launch_engine() -> (InteractionEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let engine = InteractionEngine::new(EngineConfig::no_launch(dir.path()));
    (engine, dir)
}

fn notify_path(dir: &Path) -> PathBuf {
    dir.join("notify.json")
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..500 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn interaction_resolves_with_the_exact_raw_notification() {
    let (engine, dir) = no_launch_engine();
    let id = engine.start("run tests").unwrap();

    let raw = r#"{"turn-id":"t1","result":"all green"}"#;
    tokio::fs::write(notify_path(dir.path()), raw).await.unwrap();

    assert_eq!(engine.await_result(id).await.unwrap(), raw);
    assert!(!notify_path(dir.path()).exists());
    engine.destroy().await;
}

#[tokio::test]
async fn second_interaction_is_delivered_only_after_the_first_settles() {
    let (engine, dir) = no_launch_engine();
    let first = engine.start("first").unwrap();
    let second = engine.start("second").unwrap();

    let probe = engine.clone();
    wait_until(move || probe.started(first).unwrap()).await;
    assert!(!engine.started(second).unwrap());

    tokio::fs::write(notify_path(dir.path()), r#"{"turn":1}"#)
        .await
        .unwrap();
    assert_eq!(engine.await_result(first).await.unwrap(), r#"{"turn":1}"#);

    let probe = engine.clone();
    wait_until(move || probe.started(second).unwrap()).await;

    tokio::fs::write(notify_path(dir.path()), r#"{"turn":2}"#)
        .await
        .unwrap();
    assert_eq!(engine.await_result(second).await.unwrap(), r#"{"turn":2}"#);
    engine.destroy().await;
}

#[tokio::test]
async fn cancel_of_a_queued_interaction_is_not_active() {
    let (engine, _dir) = no_launch_engine();
    let first = engine.start("first").unwrap();
    let second = engine.start("second").unwrap();

    let probe = engine.clone();
    wait_until(move || probe.started(first).unwrap()).await;

    // Still queued behind the active interaction.
    let outcome = engine.cancel(second);
    assert!(outcome.cancelled);
    assert!(!outcome.was_active);
    assert!(matches!(
        engine.await_result(second).await,
        Err(EngineError::Cancelled(_))
    ));
    assert_eq!(engine.status(second).unwrap(), InteractionState::Cancelled);
    engine.destroy().await;
}

#[tokio::test]
async fn cancel_of_the_active_interaction_rejects_its_future() {
    let (engine, _dir) = no_launch_engine();
    let id = engine.start("long running").unwrap();

    let probe = engine.clone();
    wait_until(move || probe.started(id).unwrap()).await;

    let outcome = engine.cancel(id);
    assert!(outcome.cancelled);
    assert!(outcome.was_active);
    assert!(matches!(
        engine.await_result(id).await,
        Err(EngineError::Cancelled(_))
    ));
    engine.destroy().await;
}

#[tokio::test]
async fn destroy_settles_pending_interactions_and_is_idempotent() {
    let (engine, dir) = no_launch_engine();
    let id = engine.start("never answered").unwrap();

    engine.destroy().await;
    assert_eq!(engine.await_result(id).await.unwrap_err(), EngineError::Closed);
    assert!(!dir.path().exists());

    // Second destroy is a no-op.
    engine.destroy().await;
    assert_eq!(engine.start("late").unwrap_err(), EngineError::Closed);

    let snap = engine.snapshot().await.unwrap();
    assert!(snap.closed);
    assert!(snap.views.is_empty());
}

#[tokio::test]
async fn concurrent_destroys_share_one_teardown() {
    let (engine, _dir) = no_launch_engine();
    engine.start("pending").unwrap();

    let a = engine.clone();
    let b = engine.clone();
    let (ra, rb) = tokio::join!(a.destroy(), b.destroy());
    let _ = (ra, rb);

    assert_eq!(engine.start("late").unwrap_err(), EngineError::Closed);
}

#[tokio::test]
async fn early_notification_is_backlogged_then_drained_in_order() {
    let (engine, dir) = no_launch_engine();

    let first = engine.start("first").unwrap();
    tokio::fs::write(notify_path(dir.path()), r#"{"turn":1}"#)
        .await
        .unwrap();
    engine.await_result(first).await.unwrap();

    // Nothing is waiting: the next notification lands in the backlog.
    tokio::fs::write(notify_path(dir.path()), r#"{"turn":2}"#)
        .await
        .unwrap();
    let mut seen = 0;
    for _ in 0..500 {
        seen = engine.snapshot().await.unwrap().notification_count;
        if seen >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen, 2, "watcher never consumed the backlogged notification");

    let second = engine.start("second").unwrap();
    assert_eq!(engine.await_result(second).await.unwrap(), r#"{"turn":2}"#);
    // Drained at start time, never handed to the session.
    assert!(!engine.started(second).unwrap());
    engine.destroy().await;
}

#[tokio::test]
async fn cancelled_turn_completion_goes_to_next_waiter() {
    // Known race, by design: notifications carry no interaction id, so a
    // cancelled-but-still-executing turn's eventual completion resolves
    // whichever interaction is next in line.
    let (engine, dir) = no_launch_engine();
    let first = engine.start("first").unwrap();

    let probe = engine.clone();
    wait_until(move || probe.started(first).unwrap()).await;
    assert!(engine.cancel(first).cancelled);

    let second = engine.start("second").unwrap();

    // The "cancelled" turn finishes anyway and writes its notification.
    tokio::fs::write(notify_path(dir.path()), r#"{"turn":"from-cancelled"}"#)
        .await
        .unwrap();

    assert_eq!(
        engine.await_result(second).await.unwrap(),
        r#"{"turn":"from-cancelled"}"#
    );
    engine.destroy().await;
}

#[tokio::test]
async fn partial_notification_writes_resolve_with_the_full_document() {
    let (engine, dir) = no_launch_engine();
    let id = engine.start("slow writer").unwrap();

    let path = notify_path(dir.path());
    tokio::fs::write(&path, r#"{"turn-id":"t1","resu"#)
        .await
        .unwrap();
    let finisher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        tokio::fs::write(&path, r#"{"turn-id":"t1","result":"done"}"#)
            .await
            .unwrap();
    });

    assert_eq!(
        engine.await_result(id).await.unwrap(),
        r#"{"turn-id":"t1","result":"done"}"#
    );
    finisher.await.unwrap();
    engine.destroy().await;
}
