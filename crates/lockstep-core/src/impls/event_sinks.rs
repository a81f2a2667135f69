//! EventSink implementations.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::domain::{JobEvent, JobEventKind, JobId};
use crate::ports::EventSink;

/// Writes job lifecycle events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: JobEvent) {
        let job_id = event.job_id;
        let tenant = event.tenant_id.as_str();
        let kind = event.kind.as_str();
        match &event.event {
            JobEventKind::Started => info!(%job_id, tenant, kind, "job event: started"),
            JobEventKind::Progress { percent, label } => {
                info!(%job_id, tenant, kind, percent, label = %label, "job event: progress")
            }
            JobEventKind::Completed { result } => {
                info!(%job_id, tenant, kind, result = %result, "job event: completed")
            }
            JobEventKind::Failed { error, retryable } => {
                warn!(%job_id, tenant, kind, error = %error, retryable, "job event: failed")
            }
        }
    }
}

/// Keeps every event in memory.
///
/// テストや CLI で「終端イベントが N 件揃うまで待つ」用途に使う。
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<JobEvent>>,
    changed: Notify,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.lock().clone()
    }

    pub fn events_for(&self, job_id: JobId) -> Vec<JobEvent> {
        self.lock()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        self.lock().iter().filter(|e| e.event.is_terminal()).count()
    }

    /// Wait until at least `n` terminal events have been recorded.
    pub async fn wait_for_terminal(&self, n: usize) {
        self.wait_until(|events| events.iter().filter(|e| e.event.is_terminal()).count() >= n)
            .await;
    }

    /// Wait until `done` holds for the recorded events.
    pub async fn wait_until<P>(&self, done: P)
    where
        P: Fn(&[JobEvent]) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let ready = {
                let events = self.lock();
                done(events.as_slice())
            };
            if ready {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JobEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, event: JobEvent) {
        self.lock().push(event);
        self.changed.notify_waiters();
    }
}

/// Sends every event to each inner sink, in order.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: JobEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }
}
