//! Status - 状態ごとのタスク件数

use serde::{Deserialize, Serialize};

use crate::domain::{StoreError, Task, TaskStatus};
use crate::ports::TaskStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub new: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            *counts.slot(task.status) += 1;
        }
        counts
    }

    pub async fn load(store: &dyn TaskStore) -> Result<Self, StoreError> {
        Ok(Self::from_tasks(&store.list().await?))
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::New => self.new,
            TaskStatus::Pending => self.pending,
            TaskStatus::Running => self.running,
            TaskStatus::Succeeded => self.succeeded,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.new + self.pending + self.running + self.succeeded + self.failed
    }

    pub fn finished(&self) -> usize {
        self.succeeded + self.failed
    }

    /// worker が拾うもの・終わらせるものが残っていない
    pub fn is_settled(&self) -> bool {
        self.finished() == self.total()
    }

    fn slot(&mut self, status: TaskStatus) -> &mut usize {
        match status {
            TaskStatus::New => &mut self.new,
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Succeeded => &mut self.succeeded,
            TaskStatus::Failed => &mut self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskPatch;
    use crate::impls::InMemoryTaskStore;

    #[tokio::test]
    async fn counts_rows_by_status() {
        let store = InMemoryTaskStore::new();
        store.create(None).await.unwrap();
        let running = store.create(None).await.unwrap();
        store.set_status(running.id, TaskStatus::Running).await.unwrap();
        let failed = store.create(None).await.unwrap();
        store
            .update(failed.id, TaskPatch::status(TaskStatus::Failed).with_result("x"))
            .await
            .unwrap();

        let counts = TaskCounts::load(&store).await.unwrap();
        assert_eq!(counts.get(TaskStatus::New), 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.finished(), 1);
        assert!(!counts.is_settled());
    }

    #[test]
    fn empty_store_is_settled() {
        assert!(TaskCounts::default().is_settled());
    }
}
