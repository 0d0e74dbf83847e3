//! Ports - タスクのライフサイクルと外部システムの境界
//!
//! trait ごとに外部システムを 1 つ隠す（永続ストレージ、message broker、
//! メトリクス、時計、ID 生成）。実装は [`crate::impls`] にある。
//!
//! # 設計原則
//! - task store が正本（source of truth）
//! - delivery queue は task id だけを運ぶ
//! - すべて composition root（[`crate::app::AppBuilder`]）から明示的に注入する

pub mod clock;
pub mod delivery_queue;
pub mod id_generator;
pub mod metrics;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery_queue::{Delivery, DeliveryQueue, QueueDepth};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::metrics::MetricsSink;
pub use self::task_store::TaskStore;
