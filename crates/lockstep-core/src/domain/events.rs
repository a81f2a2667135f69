//! Events - ジョブのライフサイクル通知
//!
//! 1 ジョブにつき `Started` → `Progress`* → `Completed` | `Failed` の順で発行する。
//! ロック競合による再投入は外部から見えないので、イベントは出さない。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, TenantId};
use super::job::JobKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Started,
    Progress {
        percent: u8,
        label: String,
    },
    Completed {
        result: serde_json::Value,
    },
    Failed {
        error: String,
        /// The engine has already re-queued the work (pool exhaustion).
        retryable: bool,
    },
}

impl JobEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: JobEventKind,
}
