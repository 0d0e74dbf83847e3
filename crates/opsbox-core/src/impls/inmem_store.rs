//! InMemoryTaskStore - テストと単一プロセス用の task store
//!
//! # 実装
//! - 行は `HashMap<TaskId, Task>`、挿入順は `Vec<TaskId>`
//! - 両方を 1 つの tokio `Mutex` で包む。各操作は read-modify-write の間ずっと
//!   保持し、保持中に他のものを await しない
//! - 変更は clone に対して計算し、成功したら差し替える（拒否された書き込みは
//!   前の行を残す）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{StoreError, Task, TaskId, TaskPatch, TaskStatus, WorkOutcome};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

#[derive(Default)]
struct InMemoryTaskStoreState {
    rows: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
}

impl InMemoryTaskStoreState {
    fn row(&self, id: TaskId) -> Result<&Task, StoreError> {
        self.rows.get(&id).ok_or(StoreError::NotFound(id))
    }

    fn replace(&mut self, task: Task) -> Task {
        self.rows.insert(task.id, task.clone());
        task
    }
}

pub struct InMemoryTaskStore {
    state: Mutex<InMemoryTaskStoreState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// タイムスタンプも ID の時刻部分も `clock` から取る
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self {
            state: Mutex::new(InMemoryTaskStoreState::default()),
            clock,
            ids,
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, title: Option<String>) -> Result<Task, StoreError> {
        let task = Task::new(self.ids.generate_task_id(), title, self.clock.now());
        let mut state = self.state.lock().await;
        state.order.push(task.id);
        Ok(state.replace(task))
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(&id).cloned())
    }

    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let next = patch
            .apply(state.row(id)?, self.clock.now())
            .map_err(|source| StoreError::InvalidPatch { id, source })?;
        Ok(state.replace(next))
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.rows.remove(&id).is_none() {
            return Ok(false);
        }
        state.order.retain(|existing| *existing != id);
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.rows.get(id).cloned())
            .collect())
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let current = state.row(id)?;
        if !expected.contains(&current.status) {
            return Err(StoreError::StatusMismatch {
                id,
                actual: current.status,
                expected: expected.to_vec(),
            });
        }
        let next = TaskPatch::status(next)
            .apply(current, self.clock.now())
            .map_err(|source| StoreError::InvalidPatch { id, source })?;
        Ok(state.replace(next))
    }

    async fn set_status(&self, id: TaskId, next: TaskStatus) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let next = TaskPatch::status(next)
            .apply(state.row(id)?, self.clock.now())
            .map_err(|source| StoreError::InvalidPatch { id, source })?;
        Ok(state.replace(next))
    }

    async fn complete(&self, id: TaskId, outcome: WorkOutcome) -> Result<Task, StoreError> {
        let mut state = self.state.lock().await;
        let current = state.row(id)?;
        if current.status != TaskStatus::Running {
            return Err(StoreError::StatusMismatch {
                id,
                actual: current.status,
                expected: vec![TaskStatus::Running],
            });
        }
        let (status, result) = outcome.into_parts();
        let next = TaskPatch::status(status)
            .with_result(result)
            .apply(current, self.clock.now())
            .map_err(|source| StoreError::InvalidPatch { id, source })?;
        Ok(state.replace(next))
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let doomed: Vec<TaskId> = state
            .rows
            .values()
            .filter(|task| task.is_terminal() && task.created_at < cutoff)
            .map(|task| task.id)
            .collect();

        for id in &doomed {
            state.rows.remove(id);
        }
        state.order.retain(|id| !doomed.contains(id));

        debug!(deleted = doomed.len(), %cutoff, "deleted terminal tasks");
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone};

    fn fixed_store() -> (Arc<FixedClock>, InMemoryTaskStore) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let store = InMemoryTaskStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn create_starts_in_new_without_result() {
        let store = InMemoryTaskStore::new();
        let task = store.create(Some("first".into())).await.unwrap();

        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.result, None);
        assert_eq!(task.title.as_deref(), Some("first"));
        assert_eq!(store.get(task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn list_keeps_insertion_order() {
        let store = InMemoryTaskStore::new();
        let a = store.create(Some("a".into())).await.unwrap();
        let b = store.create(Some("b".into())).await.unwrap();
        let c = store.create(Some("c".into())).await.unwrap();
        store.delete(b.id).await.unwrap();

        let ids: Vec<TaskId> = store.list().await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = InMemoryTaskStore::new();
        let ghost = TaskId::from_ulid(ulid::Ulid::new());
        let err = store.update(ghost, TaskPatch::title("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == ghost));
        assert!(!store.delete(ghost).await.unwrap());
    }

    #[tokio::test]
    async fn rejected_update_leaves_row_untouched() {
        let store = InMemoryTaskStore::new();
        let task = store.create(Some("keep".into())).await.unwrap();

        let err = store
            .update(task.id, TaskPatch::status(TaskStatus::Succeeded))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPatch { .. }));
        assert_eq!(store.get(task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn update_refreshes_updated_at_only() {
        let (clock, store) = fixed_store();
        let task = store.create(None).await.unwrap();
        clock.advance(Duration::seconds(30));

        let updated = store.update(task.id, TaskPatch::title("renamed")).await.unwrap();
        assert_eq!(updated.created_at, task.created_at);
        assert_eq!(updated.updated_at, task.created_at + Duration::seconds(30));
    }

    #[tokio::test]
    async fn transition_is_compare_and_swap() {
        let store = InMemoryTaskStore::new();
        let task = store.create(None).await.unwrap();

        let running = store
            .transition(task.id, &TaskStatus::CLAIMABLE, TaskStatus::Running)
            .await
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);

        let err = store
            .transition(task.id, &TaskStatus::CLAIMABLE, TaskStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatusMismatch { actual: TaskStatus::Running, .. }
        ));
    }

    #[tokio::test]
    async fn complete_requires_running_and_is_final() {
        let store = InMemoryTaskStore::new();
        let task = store.create(None).await.unwrap();

        let err = store
            .complete(task.id, WorkOutcome::success("early"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusMismatch { .. }));

        store.set_status(task.id, TaskStatus::Running).await.unwrap();
        let done = store
            .complete(task.id, WorkOutcome::failure("boom"))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.result.as_deref(), Some("boom"));

        let err = store
            .complete(task.id, WorkOutcome::success("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusMismatch { .. }));
        assert!(store.set_status(task.id, TaskStatus::Running).await.is_err());
    }

    #[tokio::test]
    async fn delete_terminal_before_spares_live_and_young_rows() {
        let (clock, store) = fixed_store();
        let start = clock.now();

        let old_done = store.create(Some("old done".into())).await.unwrap();
        store
            .update(
                old_done.id,
                TaskPatch::status(TaskStatus::Succeeded).with_result("ok"),
            )
            .await
            .unwrap();
        let old_running = store.create(Some("old running".into())).await.unwrap();
        store.set_status(old_running.id, TaskStatus::Running).await.unwrap();

        clock.advance(Duration::minutes(9));
        let young_done = store.create(Some("young".into())).await.unwrap();
        store
            .update(
                young_done.id,
                TaskPatch::status(TaskStatus::Failed).with_result("no"),
            )
            .await
            .unwrap();

        let deleted = store
            .delete_terminal_before(start + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.get(old_done.id).await.unwrap(), None);
        assert!(store.get(old_running.id).await.unwrap().is_some());
        assert!(store.get(young_done.id).await.unwrap().is_some());
        assert_eq!(store.len().await, 2);
    }
}
