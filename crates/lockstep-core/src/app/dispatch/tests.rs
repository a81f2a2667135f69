use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::app::handler::JobHandler;
use crate::app::progress::JobContext;
use crate::config::PoolConfig;
use crate::domain::{JobEvent, JobKind, TenantId};
use crate::impls::{InMemoryJobQueue, RecordingEventSink};
use crate::pool::SessionState;
use crate::ports::{SystemClock, UlidGenerator};
use crate::tenant_lock::TenantLockRegistry;
use crate::testing::{FakeFactory, FakeSession};

struct Echo;

#[async_trait]
impl JobHandler<FakeSession> for Echo {
    async fn execute(
        &self,
        session: FakeSession,
        payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        ctx.report(50, "half way").await;
        Ok(json!({ "session": session.id, "payload": payload }))
    }
}

struct Fails;

#[async_trait]
impl JobHandler<FakeSession> for Fails {
    async fn execute(
        &self,
        _session: FakeSession,
        _payload: serde_json::Value,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::failed("remote said no"))
    }
}

struct Panics;

#[async_trait]
impl JobHandler<FakeSession> for Panics {
    async fn execute(
        &self,
        _session: FakeSession,
        _payload: serde_json::Value,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        panic!("handler bug");
    }
}

/// Runs until cancelled, then stops cooperatively.
struct WaitsForCancel;

#[async_trait]
impl JobHandler<FakeSession> for WaitsForCancel {
    async fn execute(
        &self,
        _session: FakeSession,
        _payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        tokio::select! {
            _ = ctx.cancellation().cancelled() => Err(HandlerError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(json!("finished")),
        }
    }
}

/// Ignores cancellation entirely.
struct Stubborn;

#[async_trait]
impl JobHandler<FakeSession> for Stubborn {
    async fn execute(
        &self,
        _session: FakeSession,
        _payload: serde_json::Value,
        _ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!("too late"))
    }
}

struct Fixture {
    factory: Arc<FakeFactory>,
    locks: Arc<TenantLockRegistry>,
    queue: Arc<InMemoryJobQueue>,
    sink: Arc<RecordingEventSink>,
    pool: Arc<SessionPool<FakeFactory>>,
    dispatcher: Arc<Dispatcher<FakeFactory>>,
}

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 2,
        job_timeout: Duration::from_secs(1),
        cancel_grace: Duration::from_secs(1),
        ..WorkerConfig::default()
    }
}

fn fixture(pool_capacity: usize) -> Fixture {
    fixture_with(FakeFactory::new(), pool_capacity)
}

fn fixture_with(factory: FakeFactory, pool_capacity: usize) -> Fixture {
    let factory = Arc::new(factory);
    let locks = Arc::new(TenantLockRegistry::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let sink = Arc::new(RecordingEventSink::new());
    let pool = Arc::new(SessionPool::new(
        Arc::clone(&factory),
        Arc::new(SystemClock),
        PoolConfig {
            capacity: pool_capacity,
            ..PoolConfig::default()
        },
    ));

    let mut handlers = HandlerRegistry::new();
    handlers.register(JobKind::new("echo"), Arc::new(Echo)).unwrap();
    handlers.register(JobKind::new("fails"), Arc::new(Fails)).unwrap();
    handlers.register(JobKind::new("panics"), Arc::new(Panics)).unwrap();
    handlers
        .register(JobKind::new("waits"), Arc::new(WaitsForCancel))
        .unwrap();
    handlers
        .register(JobKind::new("stubborn"), Arc::new(Stubborn))
        .unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherDeps {
            queue: queue.clone(),
            locks: locks.clone(),
            pool: Arc::clone(&pool),
            handlers: Arc::new(handlers),
            sink: sink.clone(),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        },
        worker_config(),
    ));

    Fixture {
        factory,
        locks,
        queue,
        sink,
        pool,
        dispatcher,
    }
}

fn job(tenant: &str, kind: &str, payload: serde_json::Value) -> Job {
    Job::new(TenantId::new(tenant), JobKind::new(kind), payload)
}

fn names(events: &[JobEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e.event {
            JobEventKind::Started => "started",
            JobEventKind::Progress { .. } => "progress",
            JobEventKind::Completed { .. } => "completed",
            JobEventKind::Failed { .. } => "failed",
        })
        .collect()
}

fn failure(events: &[JobEvent]) -> (String, bool) {
    match events.last().map(|e| &e.event) {
        Some(JobEventKind::Failed { error, retryable }) => (error.clone(), *retryable),
        other => panic!("expected a failed event, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn contended_job_is_requeued_with_backoff_and_no_side_effects() {
    let fx = fixture(2);
    let tenant = TenantId::new("A");
    let holder = JobId::generate();
    assert!(fx.locks.acquire(&tenant, holder));

    let j2 = job("A", "echo", json!({"x": 1}));
    let outcome = fx.dispatcher.dispatch(j2.clone()).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Requeued {
            attempt: 1,
            delay: Duration::from_secs(2)
        }
    );
    assert!(fx.sink.events().is_empty());
    assert!(fx.factory.created().is_empty());
    assert_eq!(fx.locks.owner(&tenant), Some(holder));
    assert_eq!(fx.queue.counts().await.scheduled, 1);

    let early = tokio::time::timeout(Duration::from_millis(1900), fx.queue.dequeue()).await;
    assert!(early.is_err());

    let redelivered = fx.queue.dequeue().await.unwrap();
    assert_ne!(redelivered.id, j2.id);
    assert_eq!(redelivered.attempt, 1);
    assert_eq!(redelivered.tenant_id, tenant);
    assert_eq!(redelivered.payload, json!({"x": 1}));
}

#[tokio::test]
async fn backoff_follows_the_attempt_counter() {
    let fx = fixture(2);
    assert!(fx.locks.acquire(&TenantId::new("A"), JobId::generate()));

    let mut j = job("A", "echo", json!({}));
    j.attempt = 3;
    let outcome = fx.dispatcher.dispatch(j).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Requeued {
            attempt: 4,
            delay: Duration::from_secs(16)
        }
    );
}

#[tokio::test(start_paused = true)]
async fn legacy_attempt_key_is_folded_and_stripped() {
    let fx = fixture(2);
    assert!(fx.locks.acquire(&TenantId::new("A"), JobId::generate()));

    let outcome = fx
        .dispatcher
        .dispatch(job("A", "echo", json!({"_attempt": 2, "x": 1})))
        .await;

    assert_eq!(
        outcome,
        DispatchOutcome::Requeued {
            attempt: 3,
            delay: Duration::from_secs(8)
        }
    );
    let redelivered = fx.queue.dequeue().await.unwrap();
    assert_eq!(redelivered.attempt, 3);
    assert_eq!(redelivered.payload, json!({"x": 1}));
}

#[tokio::test]
async fn successful_job_reports_in_order_and_releases_everything() {
    let fx = fixture(2);
    let tenant = TenantId::new("A");
    let j = job("A", "echo", json!({"x": 1}));

    let outcome = fx.dispatcher.dispatch(j.clone()).await;

    assert_eq!(outcome, DispatchOutcome::Completed);
    let events = fx.sink.events_for(j.id);
    assert_eq!(names(&events), vec!["started", "progress", "completed"]);
    assert_eq!(
        events[1].event,
        JobEventKind::Progress {
            percent: 50,
            label: "half way".into()
        }
    );
    assert_eq!(
        events[2].event,
        JobEventKind::Completed {
            result: json!({"session": 0, "payload": {"x": 1}})
        }
    );

    assert!(!fx.locks.is_locked(&tenant));
    assert_eq!(fx.pool.state_of(&tenant), Some(SessionState::Idle));
    assert!(fx.factory.destroyed().is_empty());
    assert_eq!(fx.dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn next_job_of_same_tenant_runs_after_release() {
    let fx = fixture(2);

    let first = fx.dispatcher.dispatch(job("A", "echo", json!({}))).await;
    let second = fx.dispatcher.dispatch(job("A", "echo", json!({}))).await;

    assert_eq!(first, DispatchOutcome::Completed);
    assert_eq!(second, DispatchOutcome::Completed);
    // same session reused, no re-authentication
    assert_eq!(fx.factory.created().len(), 1);
}

#[tokio::test]
async fn handler_failure_still_releases_lock_and_session() {
    let fx = fixture(2);
    let tenant = TenantId::new("A");
    let j = job("A", "fails", json!({}));

    let outcome = fx.dispatcher.dispatch(j.clone()).await;

    assert_eq!(outcome, DispatchOutcome::Failed);
    let events = fx.sink.events_for(j.id);
    assert_eq!(names(&events), vec!["started", "failed"]);
    assert_eq!(failure(&events), ("remote said no".to_string(), false));
    assert!(!fx.locks.is_locked(&tenant));
    assert_eq!(fx.pool.state_of(&tenant), Some(SessionState::Idle));
}

#[tokio::test]
async fn unknown_kind_fails_without_touching_the_pool() {
    let fx = fixture(2);
    let j = job("A", "nobody.handles.this", json!({}));

    let outcome = fx.dispatcher.dispatch(j.clone()).await;

    assert_eq!(outcome, DispatchOutcome::Failed);
    let events = fx.sink.events_for(j.id);
    assert_eq!(names(&events), vec!["started", "failed"]);
    assert_eq!(
        failure(&events).0,
        HandlerError::NotFound("nobody.handles.this".into()).to_string()
    );
    assert!(fx.factory.created().is_empty());
    assert!(!fx.locks.is_locked(&TenantId::new("A")));
}

#[tokio::test]
async fn panicking_handler_is_reported_as_failed() {
    let fx = fixture(2);
    let tenant = TenantId::new("A");
    let j = job("A", "panics", json!({}));

    let outcome = fx.dispatcher.dispatch(j.clone()).await;

    assert_eq!(outcome, DispatchOutcome::Failed);
    let events = fx.sink.events_for(j.id);
    assert_eq!(failure(&events).0, HandlerError::Panicked.to_string());
    assert!(!fx.locks.is_locked(&tenant));
    assert_eq!(fx.pool.state_of(&tenant), Some(SessionState::Idle));
}

#[tokio::test(start_paused = true)]
async fn cooperative_handler_times_out() {
    let fx = fixture(2);
    let j = job("A", "waits", json!({}));

    let outcome = fx.dispatcher.dispatch(j.clone()).await;

    assert_eq!(outcome, DispatchOutcome::Failed);
    let events = fx.sink.events_for(j.id);
    assert_eq!(
        failure(&events).0,
        HandlerError::TimedOut(Duration::from_secs(1)).to_string()
    );
    assert!(!fx.locks.is_locked(&TenantId::new("A")));
}

#[tokio::test(start_paused = true)]
async fn stubborn_handler_is_aborted_after_grace() {
    let fx = fixture(2);
    let j = job("A", "stubborn", json!({}));

    let started = tokio::time::Instant::now();
    let outcome = fx.dispatcher.dispatch(j.clone()).await;

    assert_eq!(outcome, DispatchOutcome::Failed);
    // timeout + grace
    assert!(started.elapsed() < Duration::from_secs(3));
    let events = fx.sink.events_for(j.id);
    assert_eq!(names(&events), vec!["started", "failed"]);
    assert_eq!(
        fx.pool.state_of(&TenantId::new("A")),
        Some(SessionState::Idle)
    );
}

#[tokio::test]
async fn external_cancel_stops_the_job_and_releases_everything() {
    let fx = fixture(2);
    let j = job("A", "waits", json!({}));
    let id = j.id;

    let running = tokio::spawn({
        let dispatcher = Arc::clone(&fx.dispatcher);
        async move { dispatcher.dispatch(j).await }
    });
    while fx.dispatcher.in_flight() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(fx.locks.is_locked(&TenantId::new("A")));

    assert!(fx.dispatcher.cancel(id));
    let outcome = running.await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Failed);
    assert_eq!(
        failure(&fx.sink.events_for(id)).0,
        HandlerError::Cancelled.to_string()
    );
    assert!(!fx.locks.is_locked(&TenantId::new("A")));
    assert!(!fx.dispatcher.cancel(id));
}

#[tokio::test(start_paused = true)]
async fn cancel_reaches_a_job_still_waiting_for_its_session() {
    let fx = fixture_with(FakeFactory::with_create_delay(Duration::from_secs(10)), 2);
    let j = job("A", "echo", json!({}));
    let id = j.id;

    let running = tokio::spawn({
        let dispatcher = Arc::clone(&fx.dispatcher);
        async move { dispatcher.dispatch(j).await }
    });
    while fx.dispatcher.in_flight() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(fx.pool.stats().creating, 1);

    assert!(fx.dispatcher.cancel(id));
    assert_eq!(running.await.unwrap(), DispatchOutcome::Failed);

    let events = fx.sink.events_for(id);
    assert_eq!(names(&events), vec!["started", "failed"]);
    assert_eq!(
        failure(&events),
        (HandlerError::Cancelled.to_string(), false)
    );
    // the half-made session is rolled back, nothing was logged in
    assert!(fx.factory.created().is_empty());
    assert_eq!(fx.pool.stats().occupied(), 0);
    assert!(!fx.locks.is_locked(&TenantId::new("A")));
}

#[tokio::test(start_paused = true)]
async fn abort_in_flight_counts_jobs_waiting_for_a_session() {
    let fx = fixture_with(FakeFactory::with_create_delay(Duration::from_secs(10)), 2);

    let run = tokio::spawn({
        let dispatcher = Arc::clone(&fx.dispatcher);
        async move { dispatcher.dispatch(job("A", "echo", json!({}))).await }
    });
    while fx.dispatcher.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    assert_eq!(fx.dispatcher.abort_in_flight(), 1);
    assert_eq!(run.await.unwrap(), DispatchOutcome::Failed);
    assert_eq!(fx.locks.locked_count(), 0);
}

#[tokio::test]
async fn lost_tenant_lock_does_not_break_the_dispatch() {
    let fx = fixture(2);
    let j = job("A", "waits", json!({}));
    let id = j.id;

    let running = tokio::spawn({
        let dispatcher = Arc::clone(&fx.dispatcher);
        async move { dispatcher.dispatch(j).await }
    });
    while fx.dispatcher.in_flight() == 0 {
        tokio::task::yield_now().await;
    }
    // someone else clears the lock behind the job's back
    assert!(fx.locks.release(&TenantId::new("A"), id));

    assert!(fx.dispatcher.cancel(id));
    assert_eq!(running.await.unwrap(), DispatchOutcome::Failed);
    assert_eq!(fx.locks.locked_count(), 0);
    assert_eq!(fx.sink.terminal_count(), 1);
}

#[tokio::test]
async fn abort_in_flight_cancels_every_running_job() {
    let fx = fixture(2);
    let a = job("A", "waits", json!({}));
    let b = job("B", "waits", json!({}));

    let runs: Vec<_> = [a, b]
        .into_iter()
        .map(|j| {
            let dispatcher = Arc::clone(&fx.dispatcher);
            tokio::spawn(async move { dispatcher.dispatch(j).await })
        })
        .collect();
    while fx.dispatcher.in_flight() < 2 {
        tokio::task::yield_now().await;
    }

    assert_eq!(fx.dispatcher.abort_in_flight(), 2);
    for run in runs {
        assert_eq!(run.await.unwrap(), DispatchOutcome::Failed);
    }
    assert_eq!(fx.locks.locked_count(), 0);

    // later jobs are not affected
    let after = fx.dispatcher.dispatch(job("A", "echo", json!({}))).await;
    assert_eq!(after, DispatchOutcome::Completed);
}

#[tokio::test]
async fn pool_exhaustion_reports_retryable_failure_and_requeues() {
    let fx = fixture(1);
    // tenant B holds the only session
    let _held = fx.pool.acquire(&TenantId::new("B")).await.unwrap();

    let j = job("A", "echo", json!({}));
    let outcome = fx.dispatcher.dispatch(j.clone()).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Requeued {
            attempt: 1,
            delay: Duration::from_secs(2)
        }
    );
    let events = fx.sink.events_for(j.id);
    assert_eq!(names(&events), vec!["started", "failed"]);
    assert!(failure(&events).1);
    assert!(!fx.locks.is_locked(&TenantId::new("A")));
    assert_eq!(fx.queue.counts().await.scheduled, 1);
}

#[tokio::test]
async fn closed_queue_drops_requeue() {
    let fx = fixture(2);
    assert!(fx.locks.acquire(&TenantId::new("A"), JobId::generate()));
    fx.queue.close().await;

    let outcome = fx.dispatcher.dispatch(job("A", "echo", json!({}))).await;
    assert_eq!(outcome, DispatchOutcome::Dropped);
}
