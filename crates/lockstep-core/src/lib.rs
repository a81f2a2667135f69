//! lockstep-core
//!
//! Per-tenant serialized job execution over a bounded pool of long-lived sessions.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, events, errors）
//! - **ports**: 抽象化レイヤー（JobQueue, EventSink, SessionFactory, TenantLock, Clock, IdGenerator）
//! - **tenant_lock**: テナント単位の排他ロック（プロセス内）
//! - **pool**: テナントごとのセッションを上限 N で使い回すプール
//! - **app**: dispatcher / worker group / builder
//! - **impls**: ports の実装（InMemoryJobQueue, EventSink 各種）
//! - **config**: 環境変数からの設定読み込み
//! - **observability**: tracing subscriber の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod pool;
pub mod ports;
pub mod tenant_lock;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{Engine, EngineBuilder, JobContext, JobHandler, WorkerGroup};
pub use config::EngineConfig;
pub use domain::{HandlerError, Job, JobEvent, JobEventKind, JobId, JobKind, TenantId};
