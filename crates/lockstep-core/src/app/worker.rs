//! WorkerGroup - 固定数のスロットでジョブを処理する
//!
//! 各スロットは「dequeue → dispatch」を 1 件ずつ完了まで回す。
//! テナント間の順序は保証しない（同一テナントは lock で直列化される）。

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::dispatch::Dispatcher;
use crate::domain::JobId;
use crate::ports::{JobQueue, SessionFactory};

/// Worker group handle.
/// - `request_shutdown()` 以降、スロットは新しいジョブを取らない
/// - 実行中のジョブは止めない（止めたいなら `abort_in_flight()`）
pub struct WorkerGroup<F: SessionFactory> {
    dispatcher: Arc<Dispatcher<F>>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl<F: SessionFactory> WorkerGroup<F> {
    /// Spawn one loop per configured slot.
    pub fn spawn(dispatcher: Arc<Dispatcher<F>>) -> Self {
        let slots = dispatcher.config().concurrency;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(slots);
        for slot in 0..slots {
            let queue = Arc::clone(dispatcher.queue());
            let d = Arc::clone(&dispatcher);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                slot_loop(slot, queue, d, &mut rx).await;
            }));
        }
        info!(slots, "worker group started");

        Self {
            dispatcher,
            shutdown_tx,
            joins,
        }
    }

    pub fn slots(&self) -> usize {
        self.joins.len()
    }

    /// Cancel one running job. Its lock and session are still released.
    pub fn cancel(&self, job_id: JobId) -> bool {
        self.dispatcher.cancel(job_id)
    }

    /// Cancel every job currently running. Returns how many were signalled.
    pub fn abort_in_flight(&self) -> usize {
        self.dispatcher.abort_in_flight()
    }

    /// Stop pulling new jobs. In-flight jobs run to completion.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for every slot.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
        info!("worker group stopped");
    }
}

async fn slot_loop<F: SessionFactory>(
    slot: usize,
    queue: Arc<dyn JobQueue>,
    dispatcher: Arc<Dispatcher<F>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // dequeue は待つので shutdown と競合させる（dequeue 側は途中で drop されても取りこぼさない）
        let job = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            job = queue.dequeue() => job,
        };

        let Some(job) = job else {
            debug!(slot, "queue closed");
            break;
        };

        let outcome = dispatcher.dispatch(job).await;
        debug!(slot, ?outcome, "slot free");
    }
}
