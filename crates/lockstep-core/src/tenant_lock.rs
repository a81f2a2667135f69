//! In-process tenant lock registry.
//!
//! Design:
//! - `tenant -> owner job id` in a single map behind a std `Mutex`.
//! - The mutex is never held across an `.await`, so acquire is a plain
//!   check-and-set that no other registry operation can interleave with.
//! - No auto-release: a stuck lock is cleared by restarting the process.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::domain::{JobId, TenantId};
use crate::ports::TenantLock;

#[derive(Debug, Default)]
pub struct TenantLockRegistry {
    owners: Mutex<HashMap<TenantId, JobId>>,
}

impl TenantLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current owner of `tenant`, if locked.
    pub fn owner(&self, tenant: &TenantId) -> Option<JobId> {
        self.owners().get(tenant).copied()
    }

    pub fn locked_count(&self) -> usize {
        self.owners().len()
    }

    // 他の操作はパニックしない（await もない）ので、poison は無視して中身を使う
    fn owners(&self) -> MutexGuard<'_, HashMap<TenantId, JobId>> {
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TenantLock for TenantLockRegistry {
    fn acquire(&self, tenant: &TenantId, job: JobId) -> bool {
        match self.owners().entry(tenant.clone()) {
            Entry::Occupied(held) => {
                debug!(%tenant, job_id = %job, owner = %held.get(), "tenant lock contended");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(job);
                debug!(%tenant, job_id = %job, "tenant lock acquired");
                true
            }
        }
    }

    fn release(&self, tenant: &TenantId, job: JobId) -> bool {
        let mut owners = self.owners();
        match owners.get(tenant) {
            Some(owner) if *owner == job => {
                owners.remove(tenant);
                debug!(%tenant, job_id = %job, "tenant lock released");
                true
            }
            Some(owner) => {
                warn!(%tenant, job_id = %job, owner = %owner, "refusing release by non-owner");
                false
            }
            None => false,
        }
    }

    fn is_locked(&self, tenant: &TenantId) -> bool {
        self.owners().contains_key(tenant)
    }
}

/// Scoped ownership of a tenant lock: released exactly once, on `release()`
/// or on drop (error, cancellation and panic paths included).
pub struct TenantLockGuard {
    lock: Arc<dyn TenantLock>,
    tenant: TenantId,
    job: JobId,
    released: bool,
}

impl TenantLockGuard {
    /// `None` when the tenant is already locked.
    pub fn try_acquire(lock: Arc<dyn TenantLock>, tenant: &TenantId, job: JobId) -> Option<Self> {
        if !lock.acquire(tenant, job) {
            return None;
        }
        Some(Self {
            lock,
            tenant: tenant.clone(),
            job,
            released: false,
        })
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn release(mut self) -> bool {
        self.released = true;
        self.lock.release(&self.tenant, self.job)
    }
}

impl Drop for TenantLockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.lock.release(&self.tenant, self.job);
        }
    }
}
