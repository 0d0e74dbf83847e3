//! Domain - ドメインモデル
//!
//! ID、タスク行、状態遷移、実行結果、エラー。

pub mod errors;
pub mod ids;
pub mod outcome;
pub mod task;

pub use errors::{GatewayError, QueueError, StoreError, WorkerError};
pub use ids::{Id, IdMarker, JobId, ParseIdError, TaskId};
pub use outcome::WorkOutcome;
pub use task::{ParseStatusError, PatchError, Task, TaskPatch, TaskStatus};
