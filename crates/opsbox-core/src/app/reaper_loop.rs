//! ReaperLoop - 保持期間クリーンアップの定期実行
//!
//! # フロー
//! 1. `cadence` ごとに tick（最初の tick は即時）
//! 2. `RetentionReaper::cleanup(retention)`
//! 3. 失敗はログに残して続ける。取りこぼした tick は削除が遅れるだけ
//!
//! shutdown フラグが `true` になるか sender が drop されると止まる。

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::reaper::RetentionReaper;

pub const DEFAULT_CADENCE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RETENTION: chrono::Duration = chrono::Duration::minutes(5);

pub struct ReaperLoop {
    reaper: RetentionReaper,
    cadence: Duration,
    retention: chrono::Duration,
}

impl ReaperLoop {
    pub fn new(reaper: RetentionReaper, cadence: Duration, retention: chrono::Duration) -> Self {
        Self {
            reaper,
            cadence,
            retention,
        }
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    /// 1 回分の beat。エラーはログに残すだけで返さない
    pub async fn tick(&self) -> Option<u64> {
        match self.reaper.cleanup(self.retention).await {
            Ok(deleted) => Some(deleted),
            Err(err) => {
                warn!(error = %err, "retention cleanup failed, retrying next tick");
                None
            }
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            cadence_secs = self.cadence.as_secs(),
            retention_minutes = self.retention.num_minutes(),
            "reaper beat started"
        );
        let mut interval = tokio::time::interval(self.cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("reaper beat stopped");
    }

    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        ReaperHandle { shutdown_tx, join }
    }
}

pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.join.await {
            error!(error = %err, "reaper beat ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StoreError, Task, TaskId, TaskPatch, TaskStatus, WorkOutcome};
    use crate::impls::{InMemoryTaskStore, RecordingMetrics};
    use crate::ports::{FixedClock, SystemClock, TaskStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn beat_cleans_up_on_each_tick() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = Arc::new(InMemoryTaskStore::with_clock(clock.clone()));
        let metrics = Arc::new(RecordingMetrics::new());
        let task = store.create(None).await.unwrap();
        store
            .update(task.id, TaskPatch::status(TaskStatus::Succeeded).with_result("ok"))
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(10));

        let beat = ReaperLoop::new(
            RetentionReaper::new(store.clone(), metrics.clone(), clock.clone()),
            Duration::from_millis(20),
            DEFAULT_RETENTION,
        );
        let handle = beat.spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !store.is_empty().await {
            assert!(tokio::time::Instant::now() < deadline, "beat never cleaned up");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown_and_join().await;
        assert_eq!(metrics.snapshot().cleanups_total, 1);
    }

    struct FlakyStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskStore for FlakyStore {
        async fn create(&self, _title: Option<String>) -> Result<Task, StoreError> {
            unimplemented!()
        }
        async fn get(&self, _id: TaskId) -> Result<Option<Task>, StoreError> {
            Ok(None)
        }
        async fn update(&self, id: TaskId, _patch: TaskPatch) -> Result<Task, StoreError> {
            Err(StoreError::NotFound(id))
        }
        async fn delete(&self, _id: TaskId) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn list(&self) -> Result<Vec<Task>, StoreError> {
            Ok(Vec::new())
        }
        async fn transition(
            &self,
            id: TaskId,
            _expected: &[TaskStatus],
            _next: TaskStatus,
        ) -> Result<Task, StoreError> {
            Err(StoreError::NotFound(id))
        }
        async fn set_status(&self, id: TaskId, _next: TaskStatus) -> Result<Task, StoreError> {
            Err(StoreError::NotFound(id))
        }
        async fn complete(&self, id: TaskId, _outcome: WorkOutcome) -> Result<Task, StoreError> {
            Err(StoreError::NotFound(id))
        }
        async fn delete_terminal_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Backend("database is locked".into()))
            } else {
                Ok(2)
            }
        }
    }

    #[tokio::test]
    async fn failed_tick_does_not_stop_the_beat() {
        let store = Arc::new(FlakyStore {
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(RecordingMetrics::new());
        let beat = ReaperLoop::new(
            RetentionReaper::new(store.clone(), metrics.clone(), Arc::new(SystemClock)),
            DEFAULT_CADENCE,
            DEFAULT_RETENTION,
        );

        assert_eq!(beat.tick().await, None);
        assert_eq!(beat.tick().await, Some(2));
        assert_eq!(metrics.snapshot().cleanups_total, 2);
    }
}
