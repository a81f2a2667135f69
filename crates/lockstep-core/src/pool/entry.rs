//! Pooled session entry and its state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// State transitions:
/// - (created) -> InUse -> Idle -> InUse -> ...
/// - Idle -> (destroyed) on eviction, expiry or failed validation
///
/// InUse の間は破棄の候補にならない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    InUse,
}

#[derive(Debug, Clone)]
pub struct PooledSession<S> {
    pub handle: S,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl<S> PooledSession<S> {
    /// A freshly authenticated session, handed straight to its first job.
    pub fn checked_out(handle: S, now: DateTime<Utc>) -> Self {
        Self {
            handle,
            state: SessionState::InUse,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// Too old in absolute terms, or idle for too long.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration, idle_timeout: Duration) -> bool {
        now - self.created_at > ttl || now - self.last_used_at > idle_timeout
    }

    pub fn mark_in_use(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::InUse;
        self.last_used_at = now;
    }

    pub fn mark_idle(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Idle;
        self.last_used_at = now;
    }
}
