//! Job: the unit of work pulled from the queue.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{JobId, TenantId};

/// Legacy payload key some producers use to carry the retry counter.
pub const LEGACY_ATTEMPT_KEY: &str = "_attempt";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKind(String);

impl JobKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A job as it travels through the queue.
///
/// `attempt` はワーカー内部の再試行カウンタで、handler には見せない。
/// 運搬時に欠けていれば 0 とみなす。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub attempt: u32,
}

impl Job {
    pub fn new(tenant_id: TenantId, kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::generate(),
            tenant_id,
            kind,
            payload,
            attempt: 0,
        }
    }

    /// Fold a legacy `_attempt` payload key into `attempt` and strip it, so the
    /// payload handed to a handler never carries retry bookkeeping.
    ///
    /// The larger of the two counters wins.
    pub fn normalized(mut self) -> Self {
        if let Some(obj) = self.payload.as_object_mut()
            && let Some(raw) = obj.remove(LEGACY_ATTEMPT_KEY)
        {
            let legacy = raw
                .as_u64()
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or(0);
            self.attempt = self.attempt.max(legacy);
        }
        self
    }

    /// The job to enqueue after lock contention: same tenant/kind/payload,
    /// next attempt, new delivery id.
    pub fn requeued(&self, id: JobId) -> Self {
        Self {
            id,
            tenant_id: self.tenant_id.clone(),
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            attempt: self.attempt.saturating_add(1),
        }
    }
}
