//! Test doubles shared by the pool and worker tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{SessionError, TenantId};
use crate::ports::SessionFactory;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FakeSession {
    pub id: u64,
    pub tenant: TenantId,
}

/// Session factory that records every call and lets tests reject sessions.
#[derive(Default)]
pub struct FakeFactory {
    next_id: AtomicU64,
    created: Mutex<Vec<FakeSession>>,
    destroyed: Mutex<Vec<FakeSession>>,
    rejected: Mutex<HashSet<u64>>,
    fail_create: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    destroy_delay: Mutex<Option<Duration>>,
    peak_live: AtomicUsize,
    validations: AtomicUsize,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_delay(delay: Duration) -> Self {
        let factory = Self::default();
        *factory.create_delay.lock().unwrap() = Some(delay);
        factory
    }

    /// Logging out takes `delay`; the session counts as live until it is done.
    pub fn with_destroy_delay(delay: Duration) -> Self {
        let factory = Self::default();
        *factory.destroy_delay.lock().unwrap() = Some(delay);
        factory
    }

    /// Make the remote system stop accepting this session.
    pub fn reject(&self, session: &FakeSession) {
        self.rejected.lock().unwrap().insert(session.id);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<FakeSession> {
        self.created.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<FakeSession> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    /// Sessions created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.created().len() - self.destroyed().len()
    }

    /// Highest number of simultaneously live sessions seen so far.
    pub fn peak_live(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    async fn create(&self, tenant: &TenantId) -> Result<FakeSession, SessionError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SessionError::new("login rejected"));
        }
        let session = FakeSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            tenant: tenant.clone(),
        };
        self.created.lock().unwrap().push(session.clone());
        self.peak_live.fetch_max(self.live(), Ordering::SeqCst);
        Ok(session)
    }

    async fn validate(&self, session: &FakeSession) -> bool {
        self.validations.fetch_add(1, Ordering::SeqCst);
        !self.rejected.lock().unwrap().contains(&session.id)
    }

    async fn destroy(&self, session: FakeSession) {
        let delay = *self.destroy_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.destroyed.lock().unwrap().push(session);
    }
}
