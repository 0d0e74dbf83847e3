//! RetentionReaper - 保持期間を過ぎた終了済みタスクの削除
//!
//! 対象は `SUCCEEDED` / `FAILED` の行だけ。`RUNNING` のまま止まったタスクは
//! どれだけ古くてもここでは消さない。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

use crate::domain::StoreError;
use crate::ports::{Clock, MetricsSink, TaskStore};

#[derive(Clone)]
pub struct RetentionReaper {
    store: Arc<dyn TaskStore>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl RetentionReaper {
    pub fn new(store: Arc<dyn TaskStore>, metrics: Arc<dyn MetricsSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            metrics,
            clock,
        }
    }

    /// この時刻より前に作られた行が削除対象
    ///
    /// 表現できないほど長い保持期間は最古の時刻に張り付く（何も消えない）。
    pub fn cutoff(&self, retention: Duration) -> DateTime<Utc> {
        self.clock
            .now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `now - retention` より前に作られた終端タスクを削除し、件数を返す
    pub async fn cleanup(&self, retention: Duration) -> Result<u64, StoreError> {
        let cutoff = self.cutoff(retention);
        let deleted = self.store.delete_terminal_before(cutoff).await?;
        self.metrics.record_cleanup(deleted);
        info!(deleted, %cutoff, "retention cleanup finished");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskPatch, TaskStatus};
    use crate::impls::{InMemoryTaskStore, RecordingMetrics};
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryTaskStore>,
        metrics: Arc<RecordingMetrics>,
        reaper: RetentionReaper,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let metrics = Arc::new(RecordingMetrics::new());
        let reaper = RetentionReaper::new(store.clone(), metrics.clone(), clock.clone());
        Fixture {
            clock,
            store,
            metrics,
            reaper,
        }
    }

    #[tokio::test]
    async fn deletes_old_terminal_rows_only() {
        let f = fixture();
        let done = f.store.create(Some("done".into())).await.unwrap();
        f.store
            .update(done.id, TaskPatch::status(TaskStatus::Succeeded).with_result("ok"))
            .await
            .unwrap();
        let stuck = f.store.create(Some("stuck".into())).await.unwrap();
        f.store.set_status(stuck.id, TaskStatus::Running).await.unwrap();
        let idle = f.store.create(None).await.unwrap();

        f.clock.advance(Duration::minutes(10));
        let deleted = f.reaper.cleanup(Duration::minutes(5)).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(f.store.get(done.id).await.unwrap().is_none());
        assert!(f.store.get(stuck.id).await.unwrap().is_some());
        assert!(f.store.get(idle.id).await.unwrap().is_some());
        assert_eq!(f.metrics.snapshot().cleanups_total, 1);
    }

    #[tokio::test]
    async fn young_terminal_rows_survive() {
        let f = fixture();
        let task = f.store.create(None).await.unwrap();
        f.store
            .update(task.id, TaskPatch::status(TaskStatus::Failed).with_result("boom"))
            .await
            .unwrap();

        f.clock.advance(Duration::minutes(1));
        assert_eq!(f.reaper.cleanup(Duration::minutes(5)).await.unwrap(), 0);
        assert!(f.store.get(task.id).await.unwrap().is_some());
        assert_eq!(f.metrics.snapshot().cleanups_total, 0);
    }

    #[tokio::test]
    async fn cutoff_is_exclusive() {
        let f = fixture();
        let task = f.store.create(None).await.unwrap();
        f.store
            .update(task.id, TaskPatch::status(TaskStatus::Failed).with_result("boom"))
            .await
            .unwrap();

        // exactly retention old: created_at == cutoff, not strictly before it
        f.clock.advance(Duration::minutes(5));
        assert_eq!(f.reaper.cleanup(Duration::minutes(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_retention_deletes_nothing() {
        let f = fixture();
        let task = f.store.create(None).await.unwrap();
        f.store
            .update(task.id, TaskPatch::status(TaskStatus::Succeeded).with_result("ok"))
            .await
            .unwrap();

        assert_eq!(f.reaper.cutoff(Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(f.reaper.cleanup(Duration::MAX).await.unwrap(), 0);
        assert!(f.store.get(task.id).await.unwrap().is_some());
    }
}
