//! Job handlers and the registry that maps a job kind to its handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::progress::JobContext;
use crate::domain::{HandlerError, JobKind};

/// A handler for one job kind.
///
/// `session` is the tenant's pooled session handle. The handler must not
/// close it; the pool owns its lifetime.
///
/// # Cancellation
/// `ctx.cancellation()` fires on external cancel, job timeout or worker
/// abort. Stop promptly; the worker aborts the handler after a grace period.
/// A remote side effect already dispatched cannot be undone here, so handlers
/// with irreversible actions should check whether the action already happened
/// before retrying it.
#[async_trait]
pub trait JobHandler<S>: Send + Sync {
    async fn execute(
        &self,
        session: S,
        payload: serde_json::Value,
        ctx: JobContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler for job kind '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Registry of handlers (kind -> handler).
///
/// Built during initialization (mutable), read-only while workers run.
pub struct HandlerRegistry<S> {
    handlers: HashMap<JobKind, Arc<dyn JobHandler<S>>>,
}

impl<S> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        kind: JobKind,
        handler: Arc<dyn JobHandler<S>>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind.to_string()));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler<S>>> {
        self.handlers.get(kind).cloned()
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        self.handlers.keys().map(|k| k.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<S> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OkHandler;

    #[async_trait]
    impl JobHandler<()> for OkHandler {
        async fn execute(
            &self,
            _session: (),
            payload: serde_json::Value,
            _ctx: JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(payload)
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = HandlerRegistry::new();
        reg.register(JobKind::new("orders.sync"), Arc::new(OkHandler))
            .unwrap();

        assert!(reg.get(&JobKind::new("orders.sync")).is_some());
        assert!(reg.get(&JobKind::new("missing")).is_none());
        assert_eq!(reg.registered_kinds(), vec!["orders.sync".to_string()]);
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut reg = HandlerRegistry::new();
        reg.register(JobKind::new("k"), Arc::new(OkHandler)).unwrap();
        let err = reg.register(JobKind::new("k"), Arc::new(OkHandler)).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("k".to_string()));
        assert_eq!(reg.len(), 1);
    }
}
