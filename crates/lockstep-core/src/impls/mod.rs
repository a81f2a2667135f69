//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryJobQueue**: プロセス内の配送キュー（delay 対応）
//! - **TracingEventSink** / **RecordingEventSink** / **FanoutEventSink**
//!
//! 本番のキュー（Redis など）やセッション実装は別クレートに置く想定。

pub mod event_sinks;
pub mod inmem_queue;

pub use self::event_sinks::{FanoutEventSink, RecordingEventSink, TracingEventSink};
pub use self::inmem_queue::{InMemoryJobQueue, QueueCounts};
