//! Errors - エラー型と分類
//!
//! # 分類
//! - `NotFound` / `Conflict`: gateway の呼び出し側に返す。リトライしない
//! - 実行失敗: 仕事が失敗した。`FAILED` として記録し、worker の外には出さない
//! - store / transport のエラー: インフラ障害。途中までの状態更新を残さずに
//!   その操作を中断する
//!
//! 再配送はエラーではない（worker の冪等性ガードが吸収する）。

use thiserror::Error;

use super::{PatchError, TaskId, TaskStatus};

/// Errors raised by a [`crate::ports::TaskStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// A compare-and-swap saw a status outside the expected set.
    #[error("task {id} is {actual}, expected one of {expected:?}")]
    StatusMismatch {
        id: TaskId,
        actual: TaskStatus,
        expected: Vec<TaskStatus>,
    },

    #[error("invalid update for {id}: {source}")]
    InvalidPatch {
        id: TaskId,
        #[source]
        source: PatchError,
    },

    /// Commit failure, connection loss, corrupt row, ...
    #[error("task store backend error: {0}")]
    Backend(String),
}

/// Errors raised by a [`crate::ports::DeliveryQueue`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The tag was already acked, or its visibility timeout expired and the
    /// message went back to the ready queue.
    #[error("unknown or expired delivery tag: {0}")]
    UnknownDelivery(u64),

    #[error("queue operation failed: {0}")]
    OperationFailed(String),
}

/// Errors visible at the enqueue boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} already {status}")]
    Conflict { id: TaskId, status: TaskStatus },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => GatewayError::NotFound(id),
            other => GatewayError::Store(other),
        }
    }
}

/// worker 内で実行 1 回を中断させるエラー
///
/// 仕事そのものの失敗はここに含まない（`FAILED` の行になる）。
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
