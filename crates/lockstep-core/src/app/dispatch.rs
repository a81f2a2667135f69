//! Per-job dispatch: tenant lock, session checkout, handler execution.
//!
//! 1 ジョブの流れ:
//! - lock 取得に失敗したら backoff 付きで再投入して終わり（イベントなし）
//! - 取れたら started → session checkout → handler → 終端イベント
//! - session と lock はどの経路でも必ず 1 回だけ返す（guard の drop に任せる）

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::handler::HandlerRegistry;
use super::progress::{JobContext, JobEmitter, ProgressReporter};
use crate::config::WorkerConfig;
use crate::domain::{HandlerError, Job, JobEventKind, JobId};
use crate::pool::SessionPool;
use crate::ports::{EventSink, IdGenerator, JobQueue, SessionFactory, TenantLock};
use crate::tenant_lock::TenantLockGuard;

/// How a single dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Failed,
    /// Put back on the queue under a new id.
    Requeued { attempt: u32, delay: Duration },
    /// The job had to be re-queued but the queue refused it.
    Dropped,
}

/// Collaborators of the dispatcher.
pub struct DispatcherDeps<F: SessionFactory> {
    pub queue: Arc<dyn JobQueue>,
    pub locks: Arc<dyn TenantLock>,
    pub pool: Arc<SessionPool<F>>,
    pub handlers: Arc<HandlerRegistry<F::Session>>,
    pub sink: Arc<dyn EventSink>,
    pub ids: Arc<dyn IdGenerator>,
}

enum Ran {
    Finished(DispatchOutcome),
    PoolExhausted,
}

pub struct Dispatcher<F: SessionFactory> {
    deps: DispatcherDeps<F>,
    config: WorkerConfig,
    running: Mutex<HashMap<JobId, CancellationToken>>,
}

impl<F: SessionFactory> Dispatcher<F> {
    pub fn new(deps: DispatcherDeps<F>, config: WorkerConfig) -> Self {
        Self {
            deps,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.deps.queue
    }

    /// Cancel one running job. Returns false if it is not running here.
    pub fn cancel(&self, job_id: JobId) -> bool {
        match self.running_jobs().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running job. Jobs dispatched afterwards are unaffected.
    pub fn abort_in_flight(&self) -> usize {
        let running = self.running_jobs();
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    pub fn in_flight(&self) -> usize {
        self.running_jobs().len()
    }

    /// Process one delivery to completion.
    pub async fn dispatch(&self, job: Job) -> DispatchOutcome {
        let job = job.normalized();

        let Some(guard) =
            TenantLockGuard::try_acquire(Arc::clone(&self.deps.locks), &job.tenant_id, job.id)
        else {
            debug!(job_id = %job.id, tenant = %job.tenant_id, "tenant busy");
            return self.requeue(&job).await;
        };

        let ran = self.run_locked(&job).await;
        if !guard.release() {
            error!(job_id = %job.id, tenant = %job.tenant_id, "tenant lock was no longer held by this job");
        }

        match ran {
            Ran::Finished(outcome) => outcome,
            Ran::PoolExhausted => self.requeue(&job).await,
        }
    }

    async fn requeue(&self, job: &Job) -> DispatchOutcome {
        let delay = self.config.backoff.delay_for(job.attempt);
        let next = job.requeued(self.deps.ids.generate_job_id());
        let attempt = next.attempt;
        let next_id = next.id;

        match self.deps.queue.enqueue(next, Some(delay)).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    next_job_id = %next_id,
                    tenant = %job.tenant_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "job re-queued"
                );
                DispatchOutcome::Requeued { attempt, delay }
            }
            Err(err) => {
                error!(job_id = %job.id, tenant = %job.tenant_id, error = %err, "re-queue failed; job dropped");
                DispatchOutcome::Dropped
            }
        }
    }

    async fn run_locked(&self, job: &Job) -> Ran {
        let emitter = JobEmitter::new(job, Arc::clone(&self.deps.sink));
        emitter.started().await;
        info!(job_id = %job.id, tenant = %job.tenant_id, kind = %job.kind, attempt = job.attempt, "job started");

        // started 以降は cancel / abort_in_flight の対象（session 待ちの間も含む）
        let token = CancellationToken::new();
        let _running = RunningEntry::register(self, job.id, token.clone());

        let Some(handler) = self.deps.handlers.get(&job.kind) else {
            let err = HandlerError::NotFound(job.kind.to_string());
            warn!(job_id = %job.id, kind = %job.kind, "no handler registered");
            emitter.finish(failed_event(&err)).await;
            return Ran::Finished(DispatchOutcome::Failed);
        };

        let checkout = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            checkout = self.deps.pool.checkout(&job.tenant_id) => Some(checkout),
        };
        let lease = match checkout {
            Some(Ok(lease)) => lease,
            None => {
                let err = HandlerError::Cancelled;
                warn!(job_id = %job.id, tenant = %job.tenant_id, "job cancelled while waiting for a session");
                emitter.finish(failed_event(&err)).await;
                return Ran::Finished(DispatchOutcome::Failed);
            }
            Some(Err(err)) => {
                let retryable = err.is_transient();
                warn!(job_id = %job.id, tenant = %job.tenant_id, error = %err, retryable, "session unavailable");
                emitter
                    .finish(JobEventKind::Failed {
                        error: err.to_string(),
                        retryable,
                    })
                    .await;
                return if retryable {
                    Ran::PoolExhausted
                } else {
                    Ran::Finished(DispatchOutcome::Failed)
                };
            }
        };

        let ctx = JobContext::new(
            job,
            ProgressReporter::new(Arc::clone(&emitter)),
            token.clone(),
        );
        let session = lease.session().clone();
        let payload = job.payload.clone();
        // dispatch ごと drop されても handler を置き去りにしない
        let task = AbortOnDropHandle::new(tokio::spawn(async move {
            handler.execute(session, payload, ctx).await
        }));

        let result = self.await_handler(task, &token).await;

        let outcome = match result {
            Ok(value) => {
                info!(job_id = %job.id, tenant = %job.tenant_id, "job completed");
                emitter
                    .finish(JobEventKind::Completed { result: value })
                    .await;
                DispatchOutcome::Completed
            }
            Err(err) => {
                warn!(job_id = %job.id, tenant = %job.tenant_id, error = %err, "job failed");
                emitter.finish(failed_event(&err)).await;
                DispatchOutcome::Failed
            }
        };

        // 終端イベントの後で session を idle に戻す
        drop(lease);
        Ran::Finished(outcome)
    }

    /// Wait for the handler, racing the job timeout and cancellation.
    ///
    /// Once interrupted, the handler gets `cancel_grace` to return on its own
    /// before its task is aborted.
    async fn await_handler(
        &self,
        mut task: AbortOnDropHandle<Result<serde_json::Value, HandlerError>>,
        token: &CancellationToken,
    ) -> Result<serde_json::Value, HandlerError> {
        let interrupted = tokio::select! {
            biased;
            joined = &mut task => return flatten(joined),
            _ = token.cancelled() => HandlerError::Cancelled,
            _ = tokio::time::sleep(self.config.job_timeout) => {
                HandlerError::TimedOut(self.config.job_timeout)
            }
        };
        token.cancel();

        match tokio::time::timeout(self.config.cancel_grace, &mut task).await {
            Ok(joined) => match flatten(joined) {
                Ok(value) => Ok(value),
                Err(HandlerError::Cancelled) => Err(interrupted),
                Err(err) => Err(err),
            },
            Err(_) => {
                warn!(error = %interrupted, "handler ignored cancellation; aborting");
                task.abort();
                Err(interrupted)
            }
        }
    }

    fn running_jobs(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn flatten(
    joined: Result<Result<serde_json::Value, HandlerError>, JoinError>,
) -> Result<serde_json::Value, HandlerError> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(HandlerError::Panicked),
        Err(_) => Err(HandlerError::Cancelled),
    }
}

fn failed_event(err: &HandlerError) -> JobEventKind {
    JobEventKind::Failed {
        error: err.to_string(),
        retryable: false,
    }
}

/// Keeps a job in the running table for as long as it executes.
struct RunningEntry<'a, F: SessionFactory> {
    dispatcher: &'a Dispatcher<F>,
    job_id: JobId,
}

impl<'a, F: SessionFactory> RunningEntry<'a, F> {
    fn register(dispatcher: &'a Dispatcher<F>, job_id: JobId, token: CancellationToken) -> Self {
        dispatcher.running_jobs().insert(job_id, token);
        Self { dispatcher, job_id }
    }
}

impl<F: SessionFactory> Drop for RunningEntry<'_, F> {
    fn drop(&mut self) {
        self.dispatcher.running_jobs().remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests;
