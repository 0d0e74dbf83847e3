//! TaskHandler - worker がタスクごとに行う仕事
//!
//! ドメインロジックを差し込む拡張点。claim、記録、メトリクス、ack は worker が
//! 受け持ち、handler はタスクを [`WorkOutcome`] に変えるだけ。

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

use crate::domain::{Task, WorkOutcome};

/// タスク 1 件の仕事をする
///
/// 失敗は `WorkOutcome::Failure` を返して伝える。panic も worker が拾って
/// 失敗として記録する。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> WorkOutcome;
}

/// 参照用の仕事: `[min, max]` のランダムな時間 sleep し、確率 `success_rate` で成功する
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    min: Duration,
    max: Duration,
    success_rate: f64,
}

impl SimulatedWork {
    pub fn new(min: Duration, max: Duration, success_rate: f64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            min,
            max,
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }

    /// Always succeeds, without sleeping.
    pub fn always_succeed() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Always fails, without sleeping.
    pub fn always_fail() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0.0)
    }

    fn roll(&self) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let secs = rng.gen_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        (Duration::from_secs_f64(secs), rng.gen_bool(self.success_rate))
    }
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_millis(1500), 0.5)
    }
}

#[async_trait]
impl TaskHandler for SimulatedWork {
    async fn handle(&self, task: Task) -> WorkOutcome {
        let (duration, succeed) = self.roll();
        debug!(task_id = %task.id, ?duration, succeed, "simulating work");
        tokio::time::sleep(duration).await;

        if succeed {
            WorkOutcome::success(format!("Processed at {}", Utc::now().to_rfc3339()))
        } else {
            WorkOutcome::failure("simulated failure")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskId;
    use ulid::Ulid;

    fn task() -> Task {
        Task::new(TaskId::from_ulid(Ulid::new()), None, Utc::now())
    }

    #[tokio::test]
    async fn deterministic_variants() {
        let ok = SimulatedWork::always_succeed().handle(task()).await;
        assert!(ok.is_success());
        assert!(ok.detail().starts_with("Processed at "));

        let failed = SimulatedWork::always_fail().handle(task()).await;
        assert_eq!(failed, WorkOutcome::failure("simulated failure"));
    }

    #[tokio::test]
    async fn duration_stays_within_bounds() {
        let work = SimulatedWork::new(Duration::from_millis(40), Duration::from_millis(20), 1.0);
        let start = tokio::time::Instant::now();
        work.handle(task()).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn success_rate_is_clamped() {
        let work = SimulatedWork::new(Duration::ZERO, Duration::ZERO, 7.0);
        assert_eq!(work.success_rate, 1.0);
        let (_, succeed) = work.roll();
        assert!(succeed);
    }
}
