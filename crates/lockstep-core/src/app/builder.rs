//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! lock registry / session pool / handler registry はここで 1 つずつ作って
//! `Arc` で共有する（グローバル変数にはしない）。

use std::sync::Arc;

use tracing::info;

use super::dispatch::{Dispatcher, DispatcherDeps};
use super::handler::{HandlerRegistry, JobHandler, RegistryError};
use super::worker::WorkerGroup;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{Job, JobId, JobKind, QueueError};
use crate::impls::{InMemoryJobQueue, TracingEventSink};
use crate::pool::SessionPool;
use crate::ports::{
    Clock, EventSink, IdGenerator, JobQueue, SessionFactory, SystemClock, TenantLock,
    UlidGenerator,
};
use crate::tenant_lock::TenantLockRegistry;

/// Builds an [`Engine`].
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(MyFactory::default())
///     .config(EngineConfig::from_env()?)
///     .register("orders.sync", SyncOrders)?
///     .expect_kinds(&["orders.sync"])
///     .build()?;
/// let workers = engine.start();
/// ```
///
/// # Fail-fast 設計
/// - expect_kinds() で期待される kind を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
pub struct EngineBuilder<F: SessionFactory> {
    factory: Arc<F>,
    config: EngineConfig,
    handlers: HandlerRegistry<F::Session>,
    expected_kinds: Option<Vec<String>>,
    queue: Option<Arc<dyn JobQueue>>,
    sink: Option<Arc<dyn EventSink>>,
    locks: Option<Arc<dyn TenantLock>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing job kinds: {0:?}. These kinds were expected but not registered.")]
    MissingKinds(Vec<String>),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl<F: SessionFactory> EngineBuilder<F> {
    pub fn new(factory: F) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    pub fn with_factory(factory: Arc<F>) -> Self {
        Self {
            factory,
            config: EngineConfig::default(),
            handlers: HandlerRegistry::new(),
            expected_kinds: None,
            queue: None,
            sink: None,
            locks: None,
            clock: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to [`InMemoryJobQueue`].
    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Defaults to [`TracingEventSink`].
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Defaults to an in-process [`TenantLockRegistry`].
    pub fn tenant_lock(mut self, locks: Arc<dyn TenantLock>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Clock used for session expiry.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Handler を登録
    pub fn register<H>(mut self, kind: impl Into<String>, handler: H) -> Result<Self, RegistryError>
    where
        H: JobHandler<F::Session> + 'static,
    {
        self.handlers
            .register(JobKind::new(kind), Arc::new(handler))?;
        Ok(self)
    }

    /// 期待される kind のリストを設定
    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Engine<F>, BuildError> {
        if let Some(expected) = &self.expected_kinds {
            let registered = self.handlers.registered_kinds();
            let missing: Vec<String> = expected
                .iter()
                .filter(|k| !registered.contains(k))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing));
            }
        }
        self.config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let queue: Arc<dyn JobQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(InMemoryJobQueue::new()),
        };
        let locks: Arc<dyn TenantLock> = match self.locks {
            Some(locks) => locks,
            None => Arc::new(TenantLockRegistry::new()),
        };
        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(TracingEventSink),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(SystemClock)),
        };
        let pool = Arc::new(SessionPool::new(
            self.factory,
            clock,
            self.config.pool.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherDeps {
                queue: Arc::clone(&queue),
                locks: Arc::clone(&locks),
                pool: Arc::clone(&pool),
                handlers: Arc::new(self.handlers),
                sink,
                ids,
            },
            self.config.worker.clone(),
        ));

        Ok(Engine {
            dispatcher,
            pool,
            queue,
            locks,
        })
    }
}

/// A wired engine. Call [`Engine::start`] to spawn its worker slots.
pub struct Engine<F: SessionFactory> {
    dispatcher: Arc<Dispatcher<F>>,
    pool: Arc<SessionPool<F>>,
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn TenantLock>,
}

impl<F: SessionFactory> Engine<F> {
    /// Enqueue a job for immediate delivery.
    pub async fn submit(&self, job: Job) -> Result<JobId, QueueError> {
        let id = job.id;
        self.queue.enqueue(job, None).await?;
        Ok(id)
    }

    pub fn start(&self) -> WorkerGroup<F> {
        WorkerGroup::spawn(Arc::clone(&self.dispatcher))
    }

    /// Stop the workers, wait for in-flight jobs, then destroy every session.
    pub async fn shutdown(&self, workers: WorkerGroup<F>) {
        workers.shutdown_and_join().await;
        self.pool.shutdown().await;
        info!("engine stopped");
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<F>> {
        &self.dispatcher
    }

    pub fn pool(&self) -> &Arc<SessionPool<F>> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn tenant_lock(&self) -> &Arc<dyn TenantLock> {
        &self.locks
    }
}
