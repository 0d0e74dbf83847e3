//! Task - タスク行と状態のライフサイクル

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::TaskId;

/// タスクの状態
///
/// 状態遷移:
/// - New -> Pending -> Running -> Succeeded
/// - New -> Running -> Failed（Pending は省略可）
/// - Succeeded / Failed は終端。そこから出る遷移は無い
///
/// シリアライズは SCREAMING_SNAKE_CASE（`NEW`, `RUNNING`, ...）で、保存形式も同じ。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::New,
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
    ];

    /// Statuses a worker may claim from, and the gateway may enqueue from.
    pub const CLAIMABLE: [TaskStatus; 2] = [TaskStatus::New, TaskStatus::Pending];

    pub const TERMINAL: [TaskStatus; 2] = [TaskStatus::Succeeded, TaskStatus::Failed];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }

    /// Can a run request be published for a task in this state?
    pub fn is_enqueueable(self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::Pending)
    }

    /// Position along `NEW -> PENDING -> RUNNING -> terminal`.
    fn rank(self) -> u8 {
        match self {
            TaskStatus::New => 0,
            TaskStatus::Pending => 1,
            TaskStatus::Running => 2,
            TaskStatus::Succeeded | TaskStatus::Failed => 3,
        }
    }

    /// Is `self -> next` a forward move?
    ///
    /// 非終端なら同じ状態への遷移も許す（PENDING からの再 enqueue、RUNNING を
    /// 見た再配送）。終端状態は何も受け付けない。
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// task store の 1 行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: Option<String>,
    pub status: TaskStatus,
    /// 終端への遷移でだけ埋まる
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A fresh task in `NEW`.
    pub fn new(id: TaskId, title: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title,
            status: TaskStatus::New,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 部分更新。`Some` のフィールドだけ適用する
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl TaskPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.status.is_none() && self.result.is_none()
    }

    /// Apply this patch to a copy of `task`, checking the lifecycle rules.
    ///
    /// エラー時は入力の行に触らないので、clone に適用して成功したときだけ
    /// 差し替えればよい。
    pub fn apply(&self, task: &Task, now: DateTime<Utc>) -> Result<Task, PatchError> {
        if self.is_empty() {
            return Ok(task.clone());
        }
        if task.is_terminal() {
            return Err(PatchError::Terminal(task.status));
        }

        let mut next = task.clone();
        if let Some(title) = &self.title {
            next.title = Some(title.clone());
        }
        if let Some(status) = self.status {
            if !task.status.can_transition_to(status) {
                return Err(PatchError::Backwards {
                    from: task.status,
                    to: status,
                });
            }
            next.status = status;
        }
        if let Some(result) = &self.result {
            next.result = Some(result.clone());
        }

        match (next.status.is_terminal(), next.result.is_some()) {
            (true, false) => return Err(PatchError::MissingResult(next.status)),
            (false, true) => return Err(PatchError::UnexpectedResult(next.status)),
            _ => {}
        }

        next.updated_at = now;
        Ok(next)
    }
}

/// Why a [`TaskPatch`] was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("task is terminal ({0}) and can no longer be modified")]
    Terminal(TaskStatus),

    #[error("status cannot move backwards from {from} to {to}")]
    Backwards { from: TaskStatus, to: TaskStatus },

    #[error("status {0} requires a result")]
    MissingResult(TaskStatus),

    #[error("status {0} cannot carry a result")]
    UnexpectedResult(TaskStatus),
}
