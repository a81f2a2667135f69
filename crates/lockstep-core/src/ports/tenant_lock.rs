//! TenantLock port - テナント単位の排他
//!
//! 複数プロセス化するときは、この trait をそのまま保ったまま
//! 共有ストアへの条件付き書き込みで実装し直す。

use crate::domain::{JobId, TenantId};

pub trait TenantLock: Send + Sync {
    /// Atomically take the lock for `tenant` on behalf of `job`.
    /// Returns false, with no side effect, if the tenant is already locked.
    fn acquire(&self, tenant: &TenantId, job: JobId) -> bool;

    /// Release only if `job` is the current owner.
    fn release(&self, tenant: &TenantId, job: JobId) -> bool;

    fn is_locked(&self, tenant: &TenantId) -> bool;
}
