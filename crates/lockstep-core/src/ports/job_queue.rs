//! JobQueue port - ジョブの配送キュー
//!
//! 本物のバックエンド（Redis など）は at-least-once 配送と
//! visibility timeout を提供する前提。ここではその最小限の表面だけを定義する。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Job, QueueError};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. With `delay`, the job must not become visible again
    /// before the delay has elapsed.
    async fn enqueue(&self, job: Job, delay: Option<Duration>) -> Result<(), QueueError>;

    /// Wait for the next visible job. `None` once the queue is closed and drained.
    async fn dequeue(&self) -> Option<Job>;
}
