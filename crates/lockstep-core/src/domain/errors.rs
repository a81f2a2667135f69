//! Errors - エラー型と分類
//!
//! ロック競合はエラーではない（再投入で吸収する）ので、ここには現れない。

use thiserror::Error;

use super::ids::TenantId;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（キュー・リモートシステムの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure reported by a session factory.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SessionError {
    message: String,
}

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Every slot holds an in-use session, nothing can be evicted.
    #[error("session pool exhausted: all {capacity} sessions are in use")]
    Exhausted { capacity: usize },

    /// The tenant's session is already handed out.
    #[error("session for tenant={0} is already in use")]
    SessionBusy(TenantId),

    #[error("creating session for tenant={tenant} failed: {source}")]
    Create {
        tenant: TenantId,
        #[source]
        source: SessionError,
    },

    #[error("creating session for tenant={0} timed out")]
    CreateTimeout(TenantId),

    #[error("session pool is shut down")]
    ShutDown,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Exhausted { .. } | PoolError::CreateTimeout(_) => ErrorKind::Transient,
            PoolError::SessionBusy(_) => ErrorKind::Permanent,
            PoolError::Create { .. } | PoolError::ShutDown => ErrorKind::Infrastructure,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Failure of a job handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("job timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("handler panicked")]
    Panicked,

    #[error("no handler registered for kind={0}")]
    NotFound(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Closed => ErrorKind::Permanent,
            QueueError::Backend(_) => ErrorKind::Infrastructure,
        }
    }
}
