//! Session pool: bounded, per-tenant reusable automation sessions.
//!
//! Design:
//! - At most one pooled session per tenant, at most `capacity` in total.
//!   Cold creates in flight and sessions still being destroyed both count
//!   against the capacity, so the number of live remote sessions never
//!   exceeds it.
//! - Only idle sessions are ever destroyed; `InUse` is never an eviction candidate.
//! - Expiry is checked lazily in `acquire`; `expire_idle` is an optional sweep.
//! - The state mutex is never held across an `.await`. Factory calls
//!   (create/validate/destroy) always run outside it.
//! - Destroys run on their own task and free their slot when done, even if
//!   the caller that started them is dropped.

mod entry;
mod stats;

pub use entry::{PooledSession, SessionState};
pub use stats::PoolStats;

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration as ChronoDuration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::domain::{PoolError, TenantId};
use crate::ports::{Clock, SessionFactory};

struct PoolState<S> {
    entries: HashMap<TenantId, PooledSession<S>>,
    /// Tenants whose cold create is in flight (reserved slots).
    creating: HashSet<TenantId>,
    /// Tenants whose stale session is being destroyed before a recreate.
    /// The slot passes straight to `creating` once the destroy is done.
    retiring: HashSet<TenantId>,
    /// Sessions being destroyed with nothing queued behind them.
    destroying: usize,
    shut_down: bool,
    stats: PoolStats,
}

impl<S> PoolState<S> {
    fn occupied(&self) -> usize {
        self.entries.len() + self.creating.len() + self.retiring.len() + self.destroying
    }

    fn is_busy(&self, tenant: &TenantId) -> bool {
        self.creating.contains(tenant) || self.retiring.contains(tenant)
    }

    /// Least-recently-used idle entry. In-use entries are never candidates.
    fn lru_idle(&self) -> Option<TenantId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_idle())
            .min_by_key(|(_, e)| e.last_used_at)
            .map(|(tenant, _)| tenant.clone())
    }

    /// Take an idle entry out of the pool, keeping its slot counted until
    /// the destroy finishes.
    fn take_for_destroy(&mut self, tenant: &TenantId) -> Option<S> {
        let entry = self.entries.remove(tenant)?;
        self.destroying += 1;
        Some(entry.handle)
    }
}

type SharedState<S> = Arc<Mutex<PoolState<S>>>;

/// Outcome of the locked lookup at the start of `acquire`.
enum Lookup<S> {
    /// Idle and fresh; already marked in-use, still to be validated.
    Candidate(S),
    /// Past its TTL; moved to `retiring`, still to be destroyed.
    Expired(S),
    Missing,
}

pub struct SessionPool<F: SessionFactory> {
    factory: Arc<F>,
    clock: Arc<dyn Clock>,
    config: PoolConfig,
    ttl: ChronoDuration,
    idle_timeout: ChronoDuration,
    state: SharedState<F::Session>,
}

impl<F: SessionFactory> SessionPool<F> {
    pub fn new(factory: Arc<F>, clock: Arc<dyn Clock>, config: PoolConfig) -> Self {
        let ttl = ChronoDuration::from_std(config.session_ttl).unwrap_or(ChronoDuration::MAX);
        let idle_timeout =
            ChronoDuration::from_std(config.idle_timeout).unwrap_or(ChronoDuration::MAX);
        let stats = PoolStats {
            capacity: config.capacity,
            ..PoolStats::default()
        };
        Self {
            factory,
            clock,
            config,
            ttl,
            idle_timeout,
            state: Arc::new(Mutex::new(PoolState {
                entries: HashMap::new(),
                creating: HashSet::new(),
                retiring: HashSet::new(),
                destroying: 0,
                shut_down: false,
                stats,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Hand out the tenant's session, reusing it when it is still valid.
    ///
    /// Fails fast with `PoolError::Exhausted` when the pool is full and every
    /// session is in use.
    pub async fn acquire(&self, tenant: &TenantId) -> Result<F::Session, PoolError> {
        match self.lookup(tenant)? {
            Lookup::Candidate(handle) => {
                let mut pending = Pending::validating(&self.state, tenant);
                let valid = tokio::time::timeout(
                    self.config.acquire_timeout,
                    self.factory.validate(&handle),
                )
                .await
                .unwrap_or(false);

                if valid {
                    let mut state = self.lock_state();
                    if state.shut_down {
                        return Err(PoolError::ShutDown);
                    }
                    if let Some(entry) = state.entries.get_mut(tenant) {
                        entry.mark_in_use(self.clock.now());
                    }
                    state.stats.reused += 1;
                    pending.disarm();
                    debug!(%tenant, "reusing pooled session");
                    return Ok(handle);
                }

                pending.disarm();
                {
                    let mut state = self.lock_state();
                    // shutdown が先に drain していたら、破棄はそちらに任せる
                    if state.shut_down || state.entries.remove(tenant).is_none() {
                        return Err(PoolError::ShutDown);
                    }
                    state.retiring.insert(tenant.clone());
                    state.stats.invalidated += 1;
                }
                warn!(%tenant, "pooled session failed validation, recreating");
                self.recreate(tenant, handle).await
            }
            Lookup::Expired(handle) => {
                info!(%tenant, "pooled session expired, recreating");
                self.recreate(tenant, handle).await
            }
            Lookup::Missing => self.create(tenant).await,
        }
    }

    /// Give the tenant's session back. The session stays open for reuse.
    pub fn release(&self, tenant: &TenantId) -> bool {
        let now = self.clock.now();
        let mut state = self.lock_state();
        match state.entries.get_mut(tenant) {
            Some(entry) if !entry.is_idle() => {
                entry.mark_idle(now);
                debug!(%tenant, "session released to pool");
                true
            }
            _ => false,
        }
    }

    /// Acquire wrapped in a guard that releases on drop.
    pub async fn checkout(
        self: &Arc<Self>,
        tenant: &TenantId,
    ) -> Result<SessionLease<F>, PoolError> {
        let session = self.acquire(tenant).await?;
        Ok(SessionLease {
            pool: Arc::clone(self),
            tenant: tenant.clone(),
            session,
        })
    }

    /// Destroy the tenant's session if it is idle. In-use sessions are left alone.
    pub async fn evict(&self, tenant: &TenantId) -> bool {
        let removed = {
            let mut state = self.lock_state();
            let idle = state.entries.get(tenant).is_some_and(|e| e.is_idle());
            if idle {
                state.stats.evicted += 1;
                state.take_for_destroy(tenant)
            } else {
                None
            }
        };
        match removed {
            Some(handle) => {
                info!(%tenant, "evicted idle session");
                self.destroy_and_free(handle).await;
                true
            }
            None => false,
        }
    }

    /// Destroy the least-recently-used idle session, if any.
    pub async fn evict_lru(&self) -> Option<TenantId> {
        let (tenant, handle) = {
            let mut state = self.lock_state();
            let tenant = state.lru_idle()?;
            state.stats.evicted += 1;
            let handle = state.take_for_destroy(&tenant)?;
            (tenant, handle)
        };
        info!(%tenant, "evicted least-recently-used idle session");
        self.destroy_and_free(handle).await;
        Some(tenant)
    }

    /// Sweep idle sessions past their TTL or idle timeout. Returns how many were destroyed.
    pub async fn expire_idle(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<(TenantId, F::Session)> = {
            let mut state = self.lock_state();
            let tenants: Vec<TenantId> = state
                .entries
                .iter()
                .filter(|(_, e)| e.is_idle() && e.is_expired(now, self.ttl, self.idle_timeout))
                .map(|(t, _)| t.clone())
                .collect();
            state.stats.expired += tenants.len() as u64;
            tenants
                .into_iter()
                .filter_map(|t| state.take_for_destroy(&t).map(|h| (t, h)))
                .collect()
        };
        let count = expired.len();
        let tasks: Vec<_> = expired
            .into_iter()
            .map(|(tenant, handle)| {
                info!(%tenant, "expired idle session");
                self.retire(handle, None)
            })
            .collect();
        for task in tasks {
            log_join(task.await);
        }
        count
    }

    /// Destroy every session regardless of state. Safe to call more than once.
    pub async fn shutdown(&self) {
        let drained: Vec<(TenantId, F::Session)> = {
            let mut state = self.lock_state();
            state.shut_down = true;
            let drained: Vec<_> = state.entries.drain().map(|(t, e)| (t, e.handle)).collect();
            state.destroying += drained.len();
            drained
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "shutting down session pool");
        }
        let tasks: Vec<_> = drained
            .into_iter()
            .map(|(tenant, handle)| {
                debug!(%tenant, "destroying session");
                self.retire(handle, None)
            })
            .collect();
        for task in tasks {
            log_join(task.await);
        }
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_of(&self, tenant: &TenantId) -> Option<SessionState> {
        self.lock_state().entries.get(tenant).map(|e| e.state)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let mut stats = state.stats.clone();
        stats.idle = state.entries.values().filter(|e| e.is_idle()).count();
        stats.in_use = state.entries.len() - stats.idle;
        stats.creating = state.creating.len();
        stats.destroying = state.retiring.len() + state.destroying;
        stats
    }

    fn lookup(&self, tenant: &TenantId) -> Result<Lookup<F::Session>, PoolError> {
        let now = self.clock.now();
        let mut state = self.lock_state();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }
        if state.is_busy(tenant) {
            return Err(PoolError::SessionBusy(tenant.clone()));
        }
        let (idle, expired) = match state.entries.get(tenant) {
            None => return Ok(Lookup::Missing),
            Some(e) => (e.is_idle(), e.is_expired(now, self.ttl, self.idle_timeout)),
        };
        if !idle {
            return Err(PoolError::SessionBusy(tenant.clone()));
        }
        if expired {
            // 枠はそのまま retiring に移す。破棄中に他テナントへ取られないように
            let Some(entry) = state.entries.remove(tenant) else {
                return Ok(Lookup::Missing);
            };
            state.retiring.insert(tenant.clone());
            state.stats.expired += 1;
            return Ok(Lookup::Expired(entry.handle));
        }
        // 検証中に evict されないよう、先に InUse にしておく
        match state.entries.get_mut(tenant) {
            Some(entry) => {
                entry.state = SessionState::InUse;
                Ok(Lookup::Candidate(entry.handle.clone()))
            }
            None => Ok(Lookup::Missing),
        }
    }

    /// Replace a stale session: destroy it, then open a new one in the same slot.
    ///
    /// The tenant is already in `retiring`.
    async fn recreate(
        &self,
        tenant: &TenantId,
        stale: F::Session,
    ) -> Result<F::Session, PoolError> {
        let mut pending = Pending::creating(&self.state, tenant);
        let (handoff, taken) = oneshot::channel();
        let task = self.retire(stale, Some((tenant.clone(), handoff)));
        if !pending.wait_for_handoff(taken).await {
            // 破棄の間に shutdown された
            log_join(task.await);
            return Err(PoolError::ShutDown);
        }
        self.open(tenant, pending).await
    }

    /// Slow path: make room if needed, then open a new session.
    async fn create(&self, tenant: &TenantId) -> Result<F::Session, PoolError> {
        let victim = {
            let mut state = self.lock_state();
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            if state.is_busy(tenant) || state.entries.contains_key(tenant) {
                return Err(PoolError::SessionBusy(tenant.clone()));
            }
            let victim = if state.occupied() >= self.config.capacity {
                let Some(lru) = state.lru_idle() else {
                    warn!(%tenant, capacity = self.config.capacity, "session pool exhausted");
                    return Err(PoolError::Exhausted {
                        capacity: self.config.capacity,
                    });
                };
                state.stats.evicted += 1;
                state.take_for_destroy(&lru).map(|handle| (lru, handle))
            } else {
                None
            };
            state.creating.insert(tenant.clone());
            victim
        };
        let pending = Pending::creating(&self.state, tenant);

        if let Some((evicted, handle)) = victim {
            info!(%evicted, for_tenant = %tenant, "evicting least-recently-used idle session");
            self.destroy_and_free(handle).await;
        }

        self.open(tenant, pending).await
    }

    /// Open a session for a tenant already holding a `creating` reservation.
    async fn open(
        &self,
        tenant: &TenantId,
        mut pending: Pending<'_, F::Session>,
    ) -> Result<F::Session, PoolError> {
        info!(%tenant, "creating new session");
        let created =
            tokio::time::timeout(self.config.acquire_timeout, self.factory.create(tenant)).await;

        pending.disarm();
        let shut_down = {
            let mut state = self.lock_state();
            state.creating.remove(tenant);
            match &created {
                Ok(Ok(handle)) if !state.shut_down => {
                    let entry = PooledSession::checked_out(handle.clone(), self.clock.now());
                    state.entries.insert(tenant.clone(), entry);
                    state.stats.created += 1;
                }
                Ok(Ok(_)) => state.destroying += 1,
                _ => {}
            }
            state.shut_down
        };
        let handle = match created {
            Ok(Ok(handle)) => handle,
            Ok(Err(source)) => {
                return Err(PoolError::Create {
                    tenant: tenant.clone(),
                    source,
                });
            }
            Err(_) => return Err(PoolError::CreateTimeout(tenant.clone())),
        };
        if shut_down {
            self.destroy_and_free(handle).await;
            return Err(PoolError::ShutDown);
        }
        Ok(handle)
    }

    /// Destroy a session whose slot the caller counted in `destroying`.
    async fn destroy_and_free(&self, handle: F::Session) {
        log_join(self.retire(handle, None).await);
    }

    /// Destroy `handle` on its own task and settle its slot afterwards.
    ///
    /// Without a handoff the slot is freed. With one, it goes to the waiting
    /// recreate as a `creating` reservation, if that caller is still there.
    fn retire(
        &self,
        handle: F::Session,
        handoff: Option<(TenantId, oneshot::Sender<()>)>,
    ) -> JoinHandle<()> {
        let factory = Arc::clone(&self.factory);
        let settle = Retired {
            state: Arc::clone(&self.state),
            handoff,
        };
        tokio::spawn(async move {
            factory.destroy(handle).await;
            drop(settle);
        })
    }

    // 状態の更新はすべて await なしで完結するので、poison は中身をそのまま使う
    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Session>> {
        lock(&self.state)
    }
}

fn lock<S>(state: &Mutex<PoolState<S>>) -> MutexGuard<'_, PoolState<S>> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        warn!(%error, "session destroy task failed");
    }
}

/// Settles the slot of a destroyed session, on success or panic alike.
struct Retired<S> {
    state: SharedState<S>,
    handoff: Option<(TenantId, oneshot::Sender<()>)>,
}

impl<S> Drop for Retired<S> {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        let Some((tenant, waiter)) = self.handoff.take() else {
            state.destroying = state.destroying.saturating_sub(1);
            return;
        };
        state.retiring.remove(&tenant);
        if state.shut_down || waiter.is_closed() {
            return;
        }
        state.creating.insert(tenant);
        // 受け手が直後に drop されても、その Pending が creating を片付ける
        let _ = waiter.send(());
    }
}

/// Rolls back a reservation if the acquiring future is dropped mid-way
/// (e.g. the job was cancelled during a slow create).
struct Pending<'a, S> {
    state: &'a Mutex<PoolState<S>>,
    tenant: &'a TenantId,
    creating: bool,
    armed: bool,
    handoff: Option<oneshot::Receiver<()>>,
}

impl<'a, S> Pending<'a, S> {
    fn validating(state: &'a Mutex<PoolState<S>>, tenant: &'a TenantId) -> Self {
        Self {
            state,
            tenant,
            creating: false,
            armed: true,
            handoff: None,
        }
    }

    fn creating(state: &'a Mutex<PoolState<S>>, tenant: &'a TenantId) -> Self {
        Self {
            state,
            tenant,
            creating: true,
            armed: true,
            handoff: None,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Wait until a retiring session hands its slot over. False if it never will.
    ///
    /// 受信側をここに持たせておき、drop 時は lock を取る前に close する。
    /// こうすると引き継ぎと巻き戻しがどの順で起きても creating が残らない。
    async fn wait_for_handoff(&mut self, taken: oneshot::Receiver<()>) -> bool {
        self.handoff.insert(taken).await.is_ok()
    }
}

impl<S> Drop for Pending<'_, S> {
    fn drop(&mut self) {
        if let Some(taken) = self.handoff.as_mut() {
            taken.close();
        }
        if !self.armed {
            return;
        }
        let mut state = lock(self.state);
        if self.creating {
            state.creating.remove(self.tenant);
        } else if let Some(entry) = state.entries.get_mut(self.tenant) {
            entry.state = SessionState::Idle;
        }
    }
}

/// A checked-out session; goes back to the pool (idle) when dropped.
pub struct SessionLease<F: SessionFactory> {
    pool: Arc<SessionPool<F>>,
    tenant: TenantId,
    session: F::Session,
}

impl<F: SessionFactory> SessionLease<F> {
    pub fn session(&self) -> &F::Session {
        &self.session
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl<F: SessionFactory> Deref for SessionLease<F> {
    type Target = F::Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<F: SessionFactory> Drop for SessionLease<F> {
    fn drop(&mut self) {
        self.pool.release(&self.tenant);
    }
}
