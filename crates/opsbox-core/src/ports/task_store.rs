//! TaskStore port - タスク行の正本（source of truth）
//!
//! delivery queue は task id しか運ばない。状態と結果はすべてここにあり、
//! consumer が毎回読み直す。
//!
//! # 契約
//! - 変更はすべて atomic。失敗した書き込みの後も前の行が見える
//! - `list()` は挿入順
//! - `SUCCEEDED` / `FAILED` から出る遷移は無い

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{StoreError, Task, TaskId, TaskPatch, TaskStatus, WorkOutcome};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new row in `NEW`.
    async fn create(&self, title: Option<String>) -> Result<Task, StoreError>;

    /// `Ok(None)` when the id is unknown.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Apply the `Some` fields of `patch`; `StoreError::NotFound` for unknown ids.
    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StoreError>;

    /// `true` when a row was removed.
    async fn delete(&self, id: TaskId) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<Task>, StoreError>;

    /// 状態の compare-and-swap: 現在の状態が `expected` のどれかなら `next` へ、
    /// そうでなければ `StoreError::StatusMismatch`
    async fn transition(
        &self,
        id: TaskId,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<Task, StoreError>;

    /// 終端でなければ無条件に `next` へ
    ///
    /// `ClaimMode::FirstCompletionWins` の claim で使う。
    async fn set_status(&self, id: TaskId, next: TaskStatus) -> Result<Task, StoreError>;

    /// 終端の結果を記録する（`status` と `result` を同時に書く）
    async fn complete(&self, id: TaskId, outcome: WorkOutcome) -> Result<Task, StoreError>;

    /// `cutoff` より前に作られた終端行をまとめて削除し、件数を返す
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
