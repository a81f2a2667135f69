//! App - アプリケーション層
//!
//! ports と tenant_lock / pool を組み合わせてジョブ実行を組み立てる。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 構築とワイヤリング（起動時検証つき）
//! - **Dispatcher**: 1 ジョブの処理（lock → session → handler → 通知）
//! - **WorkerGroup**: 固定数のスロットで Dispatcher を回す
//! - **BackoffPolicy**: ロック競合時の再投入遅延

pub mod backoff;
pub mod builder;
pub mod dispatch;
pub mod handler;
pub mod progress;
pub mod worker;

// 主要な型を再エクスポート
pub use self::backoff::BackoffPolicy;
pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::dispatch::{DispatchOutcome, Dispatcher, DispatcherDeps};
pub use self::handler::{HandlerRegistry, JobHandler, RegistryError};
pub use self::progress::{JobContext, ProgressReporter};
pub use self::worker::WorkerGroup;
