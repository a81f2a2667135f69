//! SessionFactory port - リモート自動化セッションの生成・検証・破棄
//!
//! `create` は認証を伴うので遅い（数秒）。`validate` は軽い生存確認。

use async_trait::async_trait;

use crate::domain::{SessionError, TenantId};

#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// Handle given to job handlers. Cloning must not open a new session.
    type Session: Clone + Send + Sync + 'static;

    /// Open and authenticate a new session for `tenant`.
    async fn create(&self, tenant: &TenantId) -> Result<Self::Session, SessionError>;

    /// Cheap liveness check: is the remote system still accepting this session?
    async fn validate(&self, session: &Self::Session) -> bool;

    async fn destroy(&self, session: Self::Session);
}
