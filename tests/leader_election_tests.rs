//! Integration tests for lease-based leader election
//!
//! Timing properties run on a paused clock; the file backend test runs on
//! the real clock with shortened timings since its I/O goes through blocking
//! threads.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::*;
use fleet_descheduler::core::activation::Activation;
use fleet_descheduler::core::cluster::{
    new_resource_lock, BackendKind, ElectionOutcome, InMemoryLockStore, LeaderElector, LeaderState,
    LeaseTiming, ResourceLock, StopReason,
};
use fleet_descheduler::core::shutdown::Supervisor;
use fleet_descheduler::error::AppError;

fn spawn_run(
    elector: &Arc<LeaderElector>,
    cancel: &CancellationToken,
    handler: Arc<RecordingHandler>,
) -> tokio::task::JoinHandle<fleet_descheduler::Result<ElectionOutcome>> {
    let elector = elector.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { elector.run(cancel, handler).await })
}

async fn wait_for_state(elector: &LeaderElector, state: LeaderState) {
    let mut states = elector.subscribe();
    states.wait_for(|s| *s == state).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_standby_takes_over_only_after_leader_steps_down() {
    let store = InMemoryLockStore::new();
    let gauge = Arc::new(LeaderGauge::default());
    let timing = LeaseTiming::default();

    let flaky = Arc::new(FlakyLock::new(Arc::new(store.lock(NAMESPACE, LEASE_NAME))));
    let leader = elector("node-a", timing, flaky.clone());
    let standby = elector("node-b", timing, Arc::new(store.lock(NAMESPACE, LEASE_NAME)));

    let leader_handler = RecordingHandler::new(gauge.clone());
    let standby_handler = RecordingHandler::new(gauge.clone());
    let cancel = CancellationToken::new();

    let leader_run = spawn_run(&leader, &cancel, leader_handler.clone());
    wait_for_state(&leader, LeaderState::Leading).await;

    let standby_run = spawn_run(&standby, &cancel, standby_handler.clone());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(standby.state(), LeaderState::Acquiring);
    assert_eq!(standby.leader().await.as_deref(), Some(leader.identity().as_str()));
    assert_eq!(gauge.max_active(), 1);

    // Cut the leader off from the backend; it must stop before the standby starts.
    flaky.set_partitioned(true);
    let outcome = leader_run.await.unwrap().unwrap();
    assert_eq!(outcome, ElectionOutcome::Stopped(StopReason::Lost));
    assert_eq!(standby.state(), LeaderState::Acquiring);

    wait_for_state(&standby, LeaderState::Leading).await;
    assert_eq!(gauge.max_active(), 1);
    assert_eq!(leader_handler.stopped(), vec![StopReason::Lost]);
    assert_eq!(standby_handler.started(), 1);
    assert!(standby_handler
        .new_leaders()
        .contains(&standby.identity().to_string()));

    let record = store
        .lock(NAMESPACE, LEASE_NAME)
        .get()
        .await
        .unwrap()
        .unwrap();
    assert!(record.record.is_held_by(standby.identity()));
    assert_eq!(record.record.leader_transitions, 1);

    cancel.cancel();
    standby_run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_renewal_reply_does_not_extend_leadership() {
    let store = InMemoryLockStore::new();
    let gauge = Arc::new(LeaderGauge::default());
    let timing = LeaseTiming::default();

    let flaky = Arc::new(FlakyLock::new(Arc::new(store.lock(NAMESPACE, LEASE_NAME))));
    let leader = elector("node-a", timing, flaky.clone());
    let standby = elector("node-b", timing, Arc::new(store.lock(NAMESPACE, LEASE_NAME)));

    let leader_handler = RecordingHandler::new(gauge.clone());
    let standby_handler = RecordingHandler::new(gauge.clone());
    let cancel = CancellationToken::new();

    let leader_run = spawn_run(&leader, &cancel, leader_handler.clone());
    wait_for_state(&leader, LeaderState::Leading).await;
    let standby_run = spawn_run(&standby, &cancel, standby_handler.clone());

    // The renewal at ~2s lands in the store at once, the leader hears back ~8s later.
    flaky.delay_next_update_reply(Duration::from_millis(7900));
    tokio::time::sleep(Duration::from_secs(10)).await;
    flaky.set_partitioned(true);

    let outcome = leader_run.await.unwrap().unwrap();
    assert_eq!(outcome, ElectionOutcome::Stopped(StopReason::Lost));
    assert_eq!(leader_handler.stopped(), vec![StopReason::Lost]);
    assert_eq!(standby.state(), LeaderState::Acquiring);

    wait_for_state(&standby, LeaderState::Leading).await;
    assert_eq!(gauge.max_active(), 1);
    assert_eq!(standby_handler.started(), 1);

    cancel.cancel();
    standby_run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_renewal_failure_is_fatal_exactly_once() {
    let store = InMemoryLockStore::new();
    let flaky = Arc::new(FlakyLock::new(Arc::new(store.lock(NAMESPACE, LEASE_NAME))));
    let leader = elector("node-a", LeaseTiming::default(), flaky.clone());

    let mut supervisor = Supervisor::new(Duration::from_secs(5));
    let fatal = supervisor.handle();
    let main_loop = Arc::new(BlockingLoop::default());
    let activation = Arc::new(Activation::new(main_loop.clone(), fatal.clone()));
    let cancel = supervisor.shutdown_token();

    let run = tokio::spawn({
        let leader = leader.clone();
        let cancel = cancel.clone();
        async move { leader.run(cancel, activation).await }
    });
    wait_for_state(&leader, LeaderState::Leading).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(main_loop.runs.load(std::sync::atomic::Ordering::SeqCst), 1);

    flaky.set_partitioned(true);
    wait_for_state(&leader, LeaderState::Renewing).await;

    let outcome = supervisor.wait(std::future::pending()).await;
    assert!(matches!(outcome, Some(AppError::LeadershipLost)));
    assert_eq!(Supervisor::exit_code(outcome.as_ref()), 3);

    let result = run.await.unwrap().unwrap();
    assert_eq!(result, ElectionOutcome::Stopped(StopReason::Lost));
    assert_eq!(leader.state(), LeaderState::Released);

    // Give the cancelled main loop a chance to report anything it should not.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fatal.escalations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_recovers_within_deadline() {
    let store = InMemoryLockStore::new();
    let flaky = Arc::new(FlakyLock::new(Arc::new(store.lock(NAMESPACE, LEASE_NAME))));
    let leader = elector("node-a", LeaseTiming::default(), flaky.clone());
    let handler = RecordingHandler::new(Arc::new(LeaderGauge::default()));
    let cancel = CancellationToken::new();

    let run = spawn_run(&leader, &cancel, handler.clone());
    wait_for_state(&leader, LeaderState::Leading).await;

    flaky.set_partitioned(true);
    wait_for_state(&leader, LeaderState::Renewing).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    flaky.set_partitioned(false);

    wait_for_state(&leader, LeaderState::Leading).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(leader.is_leader());
    assert!(handler.stopped().is_empty());

    cancel.cancel();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, ElectionOutcome::Stopped(StopReason::Cancelled));
    assert_eq!(handler.stopped(), vec![StopReason::Cancelled]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_releases_lock_for_immediate_takeover() {
    let store = InMemoryLockStore::new();
    let gauge = Arc::new(LeaderGauge::default());
    let timing = LeaseTiming::default();
    let leader = elector("node-a", timing, Arc::new(store.lock(NAMESPACE, LEASE_NAME)));
    let standby = elector("node-b", timing, Arc::new(store.lock(NAMESPACE, LEASE_NAME)));

    let leader_cancel = CancellationToken::new();
    let standby_cancel = CancellationToken::new();
    let leader_handler = RecordingHandler::new(gauge.clone());
    let standby_handler = RecordingHandler::new(gauge.clone());

    let leader_run = spawn_run(&leader, &leader_cancel, leader_handler.clone());
    wait_for_state(&leader, LeaderState::Leading).await;
    let standby_run = spawn_run(&standby, &standby_cancel, standby_handler.clone());
    tokio::time::sleep(Duration::from_secs(5)).await;

    leader_cancel.cancel();
    let outcome = leader_run.await.unwrap().unwrap();
    assert_eq!(outcome, ElectionOutcome::Stopped(StopReason::Cancelled));
    let released_at = tokio::time::Instant::now();

    wait_for_state(&standby, LeaderState::Leading).await;
    assert!(released_at.elapsed() <= timing.retry_period);
    assert_eq!(gauge.max_active(), 1);
    assert_eq!(leader_handler.stopped(), vec![StopReason::Cancelled]);

    standby_cancel.cancel();
    standby_run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_acquisition_retries_through_backend_errors() {
    let store = InMemoryLockStore::new();
    let flaky = Arc::new(FlakyLock::new(Arc::new(store.lock(NAMESPACE, LEASE_NAME))));
    flaky.set_partitioned(true);

    let candidate = elector("node-a", LeaseTiming::default(), flaky.clone());
    let handler = RecordingHandler::new(Arc::new(LeaderGauge::default()));
    let cancel = CancellationToken::new();
    let run = spawn_run(&candidate, &cancel, handler.clone());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(candidate.state(), LeaderState::Acquiring);
    assert!(flaky.calls() >= 10);

    flaky.set_partitioned(false);
    wait_for_state(&candidate, LeaderState::Leading).await;
    assert_eq!(handler.started(), 1);

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_leading_does_not_report_stop() {
    let store = InMemoryLockStore::new();
    let flaky = Arc::new(FlakyLock::new(Arc::new(store.lock(NAMESPACE, LEASE_NAME))));
    flaky.set_partitioned(true);

    let candidate = elector("node-a", LeaseTiming::default(), flaky);
    let handler = RecordingHandler::new(Arc::new(LeaderGauge::default()));
    let cancel = CancellationToken::new();
    let run = spawn_run(&candidate, &cancel, handler.clone());

    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, ElectionOutcome::CancelledBeforeLeading);
    assert_eq!(handler.started(), 0);
    assert!(handler.stopped().is_empty());
}

#[tokio::test]
async fn test_file_backend_hands_over_between_electors() {
    let dir = tempfile::tempdir().unwrap();
    let timing = fast_timing();
    let gauge = Arc::new(LeaderGauge::default());

    let file_lock = |host: &str| -> Arc<dyn ResourceLock> {
        new_resource_lock(&lock_config(BackendKind::File, host), dir.path()).unwrap()
    };
    let leader = elector("node-a", timing, file_lock("node-a"));
    let standby = elector("node-b", timing, file_lock("node-b"));

    let leader_cancel = CancellationToken::new();
    let standby_cancel = CancellationToken::new();
    let leader_run = spawn_run(&leader, &leader_cancel, RecordingHandler::new(gauge.clone()));
    wait_for_state(&leader, LeaderState::Leading).await;

    let standby_run = spawn_run(&standby, &standby_cancel, RecordingHandler::new(gauge.clone()));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(standby.state(), LeaderState::Acquiring);
    assert!(leader.is_leader());

    leader_cancel.cancel();
    leader_run.await.unwrap().unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        wait_for_state(&standby, LeaderState::Leading),
    )
    .await
    .unwrap();
    assert_eq!(gauge.max_active(), 1);

    let record = file_lock("reader").get().await.unwrap().unwrap();
    assert!(record.record.is_held_by(standby.identity()));

    standby_cancel.cancel();
    standby_run.await.unwrap().unwrap();
}
