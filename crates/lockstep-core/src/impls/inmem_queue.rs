//! In-memory JobQueue implementation.
//!
//! - ready: すぐ取り出せるジョブ（FIFO）
//! - scheduled: delay 付きで投入されたジョブ（visible_at の早い順）
//! - 取り出し時に期限の来た scheduled を ready に昇格する

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{Job, QueueError};
use crate::ports::JobQueue;

/// Delayed job entry for the min-heap.
struct ScheduledJob {
    visible_at: Instant,
    /// Insertion order; keeps equal deadlines FIFO.
    seq: u64,
    job: Job,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.visible_at == other.visible_at && self.seq == other.seq
    }
}

impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering: earliest deadline on top
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub ready: usize,
    pub scheduled: usize,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    scheduled: BinaryHeap<ScheduledJob>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while self
            .scheduled
            .peek()
            .is_some_and(|entry| entry.visible_at <= now)
        {
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.job);
            }
        }
    }
}

/// In-memory queue. Uses tokio's clock, so paused-time tests control delays.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting jobs and wake every waiting consumer.
    ///
    /// Jobs already ready are still handed out; delayed ones are abandoned.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn counts(&self) -> QueueCounts {
        let mut state = self.state.lock().await;
        state.promote_due(Instant::now());
        QueueCounts {
            ready: state.ready.len(),
            scheduled: state.scheduled.len(),
        }
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.scheduled.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// ~30 years; the same horizon tokio uses for an unbounded sleep.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

// 設定ミスで巨大な delay が来ても Instant の加算で panic させない
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: Job, delay: Option<Duration>) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            match delay.filter(|d| !d.is_zero()) {
                None => state.ready.push_back(job),
                Some(delay) => {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.scheduled.push(ScheduledJob {
                        visible_at: deadline_after(delay),
                        seq,
                        job,
                    });
                }
            }
        }
        // 待っている consumer に次の起床時刻を計算し直させる
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Option<Job> {
        loop {
            // close() の notify_waiters を取りこぼさないよう、状態を見る前に登録しておく
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());

                if let Some(job) = state.ready.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
                state.scheduled.peek().map(|entry| entry.visible_at)
            };

            match next_wake {
                Some(wake_at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(wake_at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
