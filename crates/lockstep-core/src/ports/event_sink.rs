//! EventSink port - ライフサイクル通知の送り先
//!
//! クライアント端末へのリアルタイム配信などは sink の実装側の責務。

use async_trait::async_trait;

use crate::domain::JobEvent;

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivery is best effort; a sink must not fail the job.
    async fn emit(&self, event: JobEvent);
}
