//! The interaction engine: FIFO execution queue, notification routing,
//! cancellation, and teardown for one supervised session.
//!
//! Three independently-timed actors meet here: callers submitting
//! interactions in arbitrary order, the notification channel completing in
//! arbitrary order, and the supervised process itself. The engine serializes
//! all queue/backlog/active mutation behind one mutex and drives delivery
//! from a single pump task, so at most one interaction is ever in flight.
//!
//! Notifications carry no correlation id; matching is positional (oldest
//! pending record first). A cancelled-but-still-executing turn that finishes
//! anyway will therefore resolve whichever interaction is next in line.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, OnceCell};

use crate::errors::EngineError;
use crate::notification::NotificationChannel;
use crate::session::{LaunchConfig, LaunchState, SessionSupervisor};
use crate::types::{CancelOutcome, EngineSnapshot, InteractionId, InteractionState};

/// Well-known completion signal filename inside the session home.
pub const NOTIFY_FILENAME: &str = "notify.json";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Isolated session home; the notification file lives here and the
    /// directory is removed on destroy.
    pub home_dir: PathBuf,
    pub notify_filename: String,
    pub launch: LaunchConfig,
}

impl EngineConfig {
    pub fn new(home_dir: impl Into<PathBuf>, launch: LaunchConfig) -> Self {
        Self {
            home_dir: home_dir.into(),
            notify_filename: NOTIFY_FILENAME.to_string(),
            launch,
        }
    }

    /// Notification-only engine with no supervised process, for tests and
    /// non-interactive contexts.
    pub fn no_launch(home_dir: impl Into<PathBuf>) -> Self {
        let home_dir = home_dir.into();
        let launch = LaunchConfig::disabled(&home_dir);
        Self::new(home_dir, launch)
    }
}

/// Single-resolution outcome of one interaction.
#[derive(Debug, Clone)]
enum Outcome {
    Completed(String),
    Failed(EngineError),
}

struct Record {
    input: String,
    state: InteractionState,
    started: bool,
    outcome_tx: watch::Sender<Option<Outcome>>,
}

#[derive(Default)]
struct EngineState {
    closed: bool,
    next_id: InteractionId,
    last_id: Option<InteractionId>,
    records: HashMap<InteractionId, Record>,
    /// Pending records in strict arrival order. At most one entry is
    /// `started` and not yet settled (the active interaction).
    queue: VecDeque<InteractionId>,
    /// Raw notifications that arrived with no pending record. Never
    /// non-empty while a pending record exists.
    backlog: VecDeque<String>,
    active: Option<InteractionId>,
    notification_count: u64,
    last_notification: Option<String>,
}

struct Inner {
    started_at: DateTime<Utc>,
    home_dir: PathBuf,
    channel: NotificationChannel,
    supervisor: SessionSupervisor,
    state: Mutex<EngineState>,
    /// Single-flight launch + readiness; failure is cached and re-surfaced
    /// until the engine instance is replaced.
    launch: OnceCell<Result<LaunchState, EngineError>>,
    teardown: OnceCell<()>,
    pump_wake: Notify,
    pump_spawned: AtomicBool,
    watcher_spawned: AtomicBool,
    watch_cancel: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct InteractionEngine {
    inner: Arc<Inner>,
}

impl InteractionEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (watch_cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                started_at: Utc::now(),
                channel: NotificationChannel::new(&config.home_dir, &config.notify_filename),
                supervisor: SessionSupervisor::new(config.launch),
                home_dir: config.home_dir,
                state: Mutex::new(EngineState {
                    next_id: 1,
                    ..Default::default()
                }),
                launch: OnceCell::new(),
                teardown: OnceCell::new(),
                pump_wake: Notify::new(),
                pump_spawned: AtomicBool::new(false),
                watcher_spawned: AtomicBool::new(false),
                watch_cancel,
            }),
        }
    }

    /// Enqueue a new interaction. Returns without blocking on session
    /// readiness or delivery; a cached launch failure is re-thrown.
    pub fn start(&self, input: &str) -> Result<InteractionId, EngineError> {
        let id = {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(EngineError::Closed);
            }
            if let Some(Err(err)) = self.inner.launch.get() {
                return Err(err.clone());
            }
            let id = st.next_id;
            st.next_id += 1;
            st.last_id = Some(id);
            let (outcome_tx, _) = watch::channel(None);
            st.records.insert(
                id,
                Record {
                    input: input.to_string(),
                    state: InteractionState::Pending,
                    started: false,
                    outcome_tx,
                },
            );
            st.queue.push_back(id);

            // A held-back notification satisfies the new record immediately.
            if let Some(raw) = st.backlog.pop_front() {
                settle_locked(&mut st, id, Outcome::Completed(raw));
            }
            id
        };

        self.ensure_watcher();
        self.ensure_pump();

        // Lazy launch kick; the shared outcome is consumed by the pump (and
        // by snapshot), so this task only primes the cell.
        let engine = self.clone();
        tokio::spawn(async move {
            let _ = engine.launch_outcome().await;
        });

        self.inner.pump_wake.notify_one();
        Ok(id)
    }

    /// Suspend until the interaction settles. Raw notification text on
    /// completion, the terminal-state error otherwise.
    pub async fn await_result(&self, id: InteractionId) -> Result<String, EngineError> {
        let mut rx = {
            let st = self.inner.state.lock();
            let rec = st
                .records
                .get(&id)
                .ok_or(EngineError::UnknownInteraction(id))?;
            rec.outcome_tx.subscribe()
        };

        let outcome = {
            let guard = rx
                .wait_for(|outcome| outcome.is_some())
                .await
                .map_err(|_| EngineError::Closed)?;
            guard.clone()
        };

        match outcome {
            Some(Outcome::Completed(raw)) => Ok(raw),
            Some(Outcome::Failed(err)) => Err(err),
            None => Err(EngineError::Closed),
        }
    }

    /// Cancel an interaction. No-op on missing or already-terminal records.
    /// Cancelling the active interaction fires a best-effort interrupt; the
    /// record is settled as cancelled regardless of interrupt outcome.
    pub fn cancel(&self, id: InteractionId) -> CancelOutcome {
        let was_active = {
            let st = self.inner.state.lock();
            match st.records.get(&id) {
                None => {
                    return CancelOutcome {
                        cancelled: false,
                        was_active: false,
                    }
                }
                Some(rec) if rec.state.is_terminal() => {
                    return CancelOutcome {
                        cancelled: false,
                        was_active: false,
                    }
                }
                Some(_) => {}
            }
            st.active == Some(id)
        };

        if was_active {
            if let Some(session) = self.launched_session() {
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = engine.inner.supervisor.interrupt(&session).await {
                        tracing::debug!(target: "session_broker::engine", interaction = id, error = %err, "interrupt not delivered, cancelling anyway");
                    }
                });
            }
        }

        let cancelled = self.settle(
            id,
            Outcome::Failed(EngineError::Cancelled(
                "interaction cancelled by caller".to_string(),
            )),
        );

        CancelOutcome {
            cancelled,
            was_active: cancelled && was_active,
        }
    }

    pub fn status(&self, id: InteractionId) -> Result<InteractionState, EngineError> {
        let st = self.inner.state.lock();
        st.records
            .get(&id)
            .map(|rec| rec.state)
            .ok_or(EngineError::UnknownInteraction(id))
    }

    /// Whether the interaction has been handed to the session supervisor.
    pub fn started(&self, id: InteractionId) -> Result<bool, EngineError> {
        let st = self.inner.state.lock();
        st.records
            .get(&id)
            .map(|rec| rec.started)
            .ok_or(EngineError::UnknownInteraction(id))
    }

    /// Point-in-time status. Awaits launch completion first so a launch
    /// failure surfaces here as well.
    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let closed = self.inner.state.lock().closed;
        let (pid, views) = if closed {
            (self.launched_pid(), Vec::new())
        } else {
            let launch = self.launch_outcome().await?;
            (launch.pid, launch.views)
        };

        let st = self.inner.state.lock();
        Ok(EngineSnapshot {
            started_at: self.inner.started_at,
            closed: st.closed,
            interaction_count: st.next_id - 1,
            last_interaction_id: st.last_id,
            pid,
            notification_count: st.notification_count,
            last_notification: st.last_notification.clone(),
            views,
        })
    }

    /// Tear the engine down. Idempotent and single-flight; every sub-step
    /// error is swallowed so cleanup always completes, and every pending
    /// interaction is settled with a closed rejection.
    pub async fn destroy(&self) {
        let engine = self.clone();
        self.inner
            .teardown
            .get_or_init(|| async move {
                engine.inner.state.lock().closed = true;
                let _ = engine.inner.watch_cancel.send(true);
                engine.inner.pump_wake.notify_one();

                // Await the launch cell rather than peeking at it: an
                // in-flight launch must finish storing its child before
                // terminate runs, or the spawned process escapes the reap.
                // If no launch was ever triggered the cell settles as
                // closed, which start() can no longer observe.
                let launch = engine
                    .inner
                    .launch
                    .get_or_init(|| async { Err(EngineError::Closed) })
                    .await;
                match launch {
                    Ok(launch) => {
                        engine
                            .inner
                            .supervisor
                            .terminate(launch.session.as_deref(), launch.pid)
                            .await;
                    }
                    // Launch failed partway; reap any stray child.
                    Err(_) => engine.inner.supervisor.terminate(None, None).await,
                }

                match tokio::fs::remove_dir_all(&engine.inner.home_dir).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        tracing::warn!(target: "session_broker::engine", home = %engine.inner.home_dir.display(), error = %err, "failed to remove session home");
                    }
                }

                let pending: Vec<InteractionId> = {
                    let mut st = engine.inner.state.lock();
                    st.backlog.clear();
                    st.queue.clear();
                    st.active = None;
                    st.records
                        .iter()
                        .filter(|(_, rec)| !rec.state.is_terminal())
                        .map(|(id, _)| *id)
                        .collect()
                };
                for id in pending {
                    engine.settle(id, Outcome::Failed(EngineError::Closed));
                }

                tracing::info!(target: "session_broker::engine", "engine destroyed");
            })
            .await;
    }

    /// Route one raw notification: oldest pending record wins, otherwise the
    /// backlog holds it. Invoked by the watcher loop; public so embedders
    /// with their own signal transport can feed the engine directly.
    pub fn deliver_notification(&self, raw: String) {
        {
            let mut st = self.inner.state.lock();
            st.notification_count += 1;
            st.last_notification = Some(raw.clone());
            if st.closed {
                return;
            }
            let target = st.queue.iter().copied().find(|id| {
                st.records
                    .get(id)
                    .map(|rec| rec.state == InteractionState::Pending)
                    .unwrap_or(false)
            });
            match target {
                Some(id) => {
                    settle_locked(&mut st, id, Outcome::Completed(raw));
                }
                None => st.backlog.push_back(raw),
            }
        }
        self.inner.pump_wake.notify_one();
    }

    fn settle(&self, id: InteractionId, outcome: Outcome) -> bool {
        let settled = {
            let mut st = self.inner.state.lock();
            settle_locked(&mut st, id, outcome)
        };
        if settled {
            self.inner.pump_wake.notify_one();
        }
        settled
    }

    /// Shared launch + readiness outcome. First caller performs the work;
    /// everyone else (and every later caller) gets the cached result.
    async fn launch_outcome(&self) -> Result<LaunchState, EngineError> {
        self.inner
            .launch
            .get_or_init(|| async {
                let state = self.inner.supervisor.launch().await?;
                if let Some(session) = &state.session {
                    self.inner.supervisor.wait_ready(session).await?;
                }
                Ok(state)
            })
            .await
            .clone()
    }

    fn launched_session(&self) -> Option<String> {
        self.inner
            .launch
            .get()
            .and_then(|res| res.as_ref().ok())
            .and_then(|launch| launch.session.clone())
    }

    fn launched_pid(&self) -> Option<u32> {
        self.inner
            .launch
            .get()
            .and_then(|res| res.as_ref().ok())
            .and_then(|launch| launch.pid)
    }

    fn ensure_pump(&self) {
        if self.inner.pump_spawned.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.run_pump().await });
    }

    fn ensure_watcher(&self) {
        if self.inner.watcher_spawned.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move { engine.run_watcher().await });
    }

    /// Queue pump: an explicit loop (not settlement recursion) that delivers
    /// the head-of-queue interaction whenever no interaction is active.
    async fn run_pump(self) {
        loop {
            self.inner.pump_wake.notified().await;
            loop {
                let next = {
                    let mut st = self.inner.state.lock();
                    if st.closed {
                        return;
                    }
                    if st.active.is_some() {
                        break;
                    }
                    let id = st.queue.iter().copied().find(|id| {
                        st.records
                            .get(id)
                            .map(|rec| !rec.started && rec.state == InteractionState::Pending)
                            .unwrap_or(false)
                    });
                    let Some(id) = id else { break };
                    let input = match st.records.get_mut(&id) {
                        Some(rec) => {
                            rec.started = true;
                            rec.input.clone()
                        }
                        None => break,
                    };
                    st.active = Some(id);
                    (id, input)
                };
                let (id, input) = next;

                let launch = match self.launch_outcome().await {
                    Ok(launch) => launch,
                    Err(err) => {
                        tracing::warn!(target: "session_broker::engine", interaction = id, error = %err, "launch failed, rejecting interaction");
                        self.settle(id, Outcome::Failed(err));
                        continue;
                    }
                };

                let Some(session) = launch.session else {
                    // No-process mode: the record stays active-but-undelivered
                    // and settles through the notification path alone.
                    break;
                };

                match self.inner.supervisor.deliver(&session, &input).await {
                    Ok(()) => {
                        tracing::debug!(target: "session_broker::engine", interaction = id, "input delivered");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(target: "session_broker::engine", interaction = id, error = %err, "delivery failed, rejecting interaction");
                        self.settle(id, Outcome::Failed(err));
                    }
                }
            }
        }
    }

    /// Rearm loop for the notification channel; stops once closed.
    async fn run_watcher(self) {
        let mut cancel = self.inner.watch_cancel.subscribe();
        loop {
            if *cancel.borrow() || self.inner.state.lock().closed {
                return;
            }
            if let Some(raw) = self.inner.channel.watch_once(&mut cancel).await {
                self.deliver_notification(raw);
            }
        }
    }
}

/// Exactly-once settlement: terminal records are left untouched. Clears the
/// active pointer, dequeues the record, and fulfils its outcome channel.
fn settle_locked(st: &mut EngineState, id: InteractionId, outcome: Outcome) -> bool {
    let Some(rec) = st.records.get_mut(&id) else {
        return false;
    };
    if rec.state.is_terminal() {
        return false;
    }
    rec.state = match &outcome {
        Outcome::Completed(_) => InteractionState::Completed,
        Outcome::Failed(EngineError::Cancelled(_)) => InteractionState::Cancelled,
        Outcome::Failed(_) => InteractionState::Rejected,
    };
    rec.outcome_tx.send_replace(Some(outcome));
    if st.active == Some(id) {
        st.active = None;
    }
    st.queue.retain(|queued| *queued != id);
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::errors::EngineError;
    use crate::types::InteractionState;

    use super::{EngineConfig, InteractionEngine};

    fn engine(dir: &std::path::Path) -> InteractionEngine {
        InteractionEngine::new(EngineConfig::no_launch(dir))
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..200 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn ids_are_monotonic_per_engine() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let a = eng.start("one").unwrap();
        let b = eng.start("two").unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn only_the_head_of_queue_becomes_active() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let first = eng.start("first").unwrap();
        let second = eng.start("second").unwrap();

        let probe = eng.clone();
        wait_until(move || probe.started(first).unwrap()).await;
        assert!(!eng.started(second).unwrap());

        eng.deliver_notification(r#"{"n":1}"#.to_string());
        assert_eq!(eng.status(first).unwrap(), InteractionState::Completed);

        let probe = eng.clone();
        wait_until(move || probe.started(second).unwrap()).await;
        eng.destroy().await;
    }

    #[tokio::test]
    async fn notifications_route_to_oldest_pending_first() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let a = eng.start("a").unwrap();
        let b = eng.start("b").unwrap();

        eng.deliver_notification(r#"{"n":1}"#.to_string());
        eng.deliver_notification(r#"{"n":2}"#.to_string());

        assert_eq!(eng.await_result(a).await.unwrap(), r#"{"n":1}"#);
        assert_eq!(eng.await_result(b).await.unwrap(), r#"{"n":2}"#);
        eng.destroy().await;
    }

    #[tokio::test]
    async fn early_notification_is_held_for_the_next_record() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let first = eng.start("first").unwrap();
        eng.deliver_notification(r#"{"n":1}"#.to_string());
        eng.await_result(first).await.unwrap();

        // No pending record: held in the backlog.
        eng.deliver_notification(r#"{"n":2}"#.to_string());

        let second = eng.start("second").unwrap();
        assert_eq!(eng.await_result(second).await.unwrap(), r#"{"n":2}"#);
        // Drained immediately, never delivered into the session.
        assert!(!eng.started(second).unwrap());
        eng.destroy().await;
    }

    #[tokio::test]
    async fn settlement_is_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let id = eng.start("one").unwrap();

        eng.deliver_notification(r#"{"n":1}"#.to_string());
        assert_eq!(eng.status(id).unwrap(), InteractionState::Completed);

        // Completed records cannot be cancelled.
        let outcome = eng.cancel(id);
        assert!(!outcome.cancelled);
        assert_eq!(eng.status(id).unwrap(), InteractionState::Completed);

        // A second notification has no pending target and is held back.
        eng.deliver_notification(r#"{"n":2}"#.to_string());
        assert_eq!(eng.await_result(id).await.unwrap(), r#"{"n":1}"#);
        eng.destroy().await;
    }

    #[tokio::test]
    async fn cancel_of_unknown_id_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let outcome = eng.cancel(42);
        assert!(!outcome.cancelled);
        assert!(!outcome.was_active);
        eng.destroy().await;
    }

    #[tokio::test]
    async fn double_cancel_reports_noop_the_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let id = eng.start("one").unwrap();

        assert!(eng.cancel(id).cancelled);
        assert!(!eng.cancel(id).cancelled);
        assert!(matches!(
            eng.await_result(id).await,
            Err(EngineError::Cancelled(_))
        ));
        eng.destroy().await;
    }

    #[tokio::test]
    async fn status_and_await_reject_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        assert_eq!(
            eng.status(9).unwrap_err(),
            EngineError::UnknownInteraction(9)
        );
        assert_eq!(
            eng.await_result(9).await.unwrap_err(),
            EngineError::UnknownInteraction(9)
        );
        eng.destroy().await;
    }

    #[tokio::test]
    async fn start_after_destroy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        eng.destroy().await;
        assert_eq!(eng.start("late").unwrap_err(), EngineError::Closed);
    }

    #[tokio::test]
    async fn destroy_right_after_start_waits_for_the_launch() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());

        // start() kicks off the lazy launch; destroying immediately must
        // wait for that launch to settle before tearing down, so the
        // supervised process can never escape the reap.
        let id = eng.start("racing").unwrap();
        eng.destroy().await;

        assert_eq!(eng.await_result(id).await.unwrap_err(), EngineError::Closed);
        let snap = eng.snapshot().await.unwrap();
        assert!(snap.closed);
        assert!(snap.pid.is_none());
        assert!(snap.views.is_empty());
    }

    #[tokio::test]
    async fn snapshot_counts_interactions_and_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path());
        let id = eng.start("one").unwrap();
        eng.deliver_notification(r#"{"n":1}"#.to_string());

        let snap = eng.snapshot().await.unwrap();
        assert_eq!(snap.interaction_count, 1);
        assert_eq!(snap.last_interaction_id, Some(id));
        assert_eq!(snap.notification_count, 1);
        assert_eq!(snap.last_notification.as_deref(), Some(r#"{"n":1}"#));
        assert!(snap.pid.is_none());
        assert!(snap.views.is_empty());
        assert!(!snap.closed);
        eng.destroy().await;

        let snap = eng.snapshot().await.unwrap();
        assert!(snap.closed);
    }
}
