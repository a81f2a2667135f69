//! Per-job event emission: lifecycle notifications and progress reports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::domain::{Job, JobEvent, JobEventKind, JobId, JobKind, TenantId};
use crate::ports::EventSink;

/// Emits the events of one job, in order.
///
/// 終端イベントを出した後は何も出さない（タイムアウト後に handler が
/// 進捗を報告しても捨てる）。
pub(crate) struct JobEmitter {
    job_id: JobId,
    tenant_id: TenantId,
    kind: JobKind,
    sink: Arc<dyn EventSink>,
    closed: AtomicBool,
}

impl JobEmitter {
    pub(crate) fn new(job: &Job, sink: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            kind: job.kind.clone(),
            sink,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) async fn started(&self) {
        self.emit(JobEventKind::Started).await;
    }

    /// Emit the terminal event. Only the first call has an effect.
    pub(crate) async fn finish(&self, event: JobEventKind) {
        debug_assert!(event.is_terminal());
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(event).await;
    }

    async fn progress(&self, percent: u8, label: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.emit(JobEventKind::Progress {
            percent: percent.min(100),
            label,
        })
        .await;
    }

    async fn emit(&self, event: JobEventKind) {
        self.sink
            .emit(JobEvent {
                job_id: self.job_id,
                tenant_id: self.tenant_id.clone(),
                kind: self.kind.clone(),
                at: Utc::now(),
                event,
            })
            .await;
    }
}

/// Progress callback handed to a handler.
#[derive(Clone)]
pub struct ProgressReporter {
    emitter: Arc<JobEmitter>,
}

impl ProgressReporter {
    pub(crate) fn new(emitter: Arc<JobEmitter>) -> Self {
        Self { emitter }
    }

    /// `percent` is clamped to 100.
    pub async fn report(&self, percent: u8, label: impl Into<String>) {
        self.emitter.progress(percent, label.into()).await;
    }
}

/// What a handler gets besides its session and payload.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    tenant_id: TenantId,
    progress: ProgressReporter,
    cancellation: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        job: &Job,
        progress: ProgressReporter,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            progress,
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn report(&self, percent: u8, label: impl Into<String>) {
        self.progress.report(percent, label).await;
    }
}
