//! Impls - ポートのアダプタ
//!
//! # 含まれるもの
//! - **InMemoryTaskStore**: テストと単一プロセス用の task store
//! - **SqliteTaskStore**: 永続 task store（feature `sqlite`）
//! - **InMemoryDeliveryQueue**: visibility timeout 付きの broker
//! - **OtelMetrics** / **RecordingMetrics**: MetricsSink

pub mod inmem_delivery;
pub mod inmem_store;
pub mod metrics;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use self::inmem_delivery::InMemoryDeliveryQueue;
pub use self::inmem_store::InMemoryTaskStore;
pub use self::metrics::{FanoutMetrics, OtelMetrics, RecordedMetrics, RecordingMetrics};
#[cfg(feature = "sqlite")]
pub use self::sqlite_store::SqliteTaskStore;
