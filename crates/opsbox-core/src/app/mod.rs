//! App - ports の上に組むアプリケーションロジック
//!
//! # コンポーネント
//! - **EnqueueGateway**: 実行可能かを検証して実行要求を publish
//! - **WorkerLoop / WorkerGroup**: claim → 実行 → 記録 → ack
//! - **RetentionReaper**: 古い終了済みタスクの削除
//! - **ReaperLoop**: 一定間隔で reaper を動かす beat
//! - **AppBuilder**: ワイヤリング

pub mod builder;
pub mod gateway;
pub mod handler;
pub mod reaper;
pub mod reaper_loop;
pub mod status;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError, MEMORY_STORE_URL, RunningApp, open_store};
pub use self::gateway::{EnqueueGateway, EnqueueReceipt};
pub use self::handler::{SimulatedWork, TaskHandler};
pub use self::reaper::RetentionReaper;
pub use self::reaper_loop::{ReaperHandle, ReaperLoop};
pub use self::status::TaskCounts;
pub use self::worker_loop::{ClaimMode, ExecutionReport, WorkerGroup, WorkerLoop, WorkerSettings};
