//! Ports - 抽象化レイヤー
//!
//! 外部コラボレータ（キュー、イベント配信、リモートセッション、時刻）への
//! インターフェースを定義し、実装の詳細を隠蔽します。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod job_queue;
pub mod session_factory;
pub mod tenant_lock;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_queue::JobQueue;
pub use self::session_factory::SessionFactory;
pub use self::tenant_lock::TenantLock;
