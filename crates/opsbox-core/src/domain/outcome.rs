//! Outcome - 仕事 1 回分の実行結果
//!
//! handler はタグ付きの variant を返す。store は `status` + `result` の
//! フラットな組で持つので、worker が書き戻すところで平らにする。

use serde::{Deserialize, Serialize};

use super::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOutcome {
    Success(String),
    Failure(String),
}

impl WorkOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        WorkOutcome::Success(detail.into())
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        WorkOutcome::Failure(detail.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Success(_))
    }

    /// Terminal status this outcome maps to.
    pub fn status(&self) -> TaskStatus {
        match self {
            WorkOutcome::Success(_) => TaskStatus::Succeeded,
            WorkOutcome::Failure(_) => TaskStatus::Failed,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            WorkOutcome::Success(detail) | WorkOutcome::Failure(detail) => detail,
        }
    }

    /// Stored representation: `(status, result)`.
    pub fn into_parts(self) -> (TaskStatus, String) {
        let status = self.status();
        match self {
            WorkOutcome::Success(detail) | WorkOutcome::Failure(detail) => (status, detail),
        }
    }
}
