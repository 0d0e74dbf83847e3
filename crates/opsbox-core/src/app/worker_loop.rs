//! WorkerLoop - 実行要求を受け取り、タスクを終端状態まで進める
//!
//! # フロー（配送 1 件ごと）
//! 1. タスクを読む。行が無ければ何もしない
//! 2. 終端状態なら何もしない（完了後の再配送）
//! 3. claim: 仕事の前に `RUNNING` を書き込んで確定させる
//! 4. [`TaskHandler`] を別の tokio task で実行（panic と deadline は失敗扱い）
//! 5. `SUCCEEDED` / `FAILED` と結果テキストを書き込む
//! 6. claim 以降はどの経路でも latency と結果を記録する
//! 7. ack。store / transport のエラー時は nack して再配送させる
//!
//! 3 と 5 の間でクラッシュすると行は `RUNNING` のまま残る。`AtMostOnce` では
//! その行の再配送も何もしないので、運用者が直すまでそのまま。

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::domain::{StoreError, Task, TaskId, TaskStatus, WorkOutcome, WorkerError};
use crate::ports::{Delivery, DeliveryQueue, MetricsSink, TaskStore};

use super::handler::TaskHandler;

/// `NEW/PENDING -> RUNNING` の claim の書き方
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimMode {
    /// compare-and-swap: 1 つのタスクを実行できる配送は 1 件だけ
    #[default]
    AtMostOnce,
    /// 無条件に `RUNNING` を書く。同時の配送はどちらも実行しうるが、
    /// 記録されるのは最初に完了した結果だけで、後の結果は捨てる
    FirstCompletionWins,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub claim_mode: ClaimMode,
    /// handler 1 回の実行時間の上限。`None` は無制限
    pub execution_timeout: Option<Duration>,
    /// `consume` 1 回の待ち時間（shutdown の確認間隔）
    pub poll_interval: Duration,
    /// store / transport エラーの後、次の consume までの待ち
    pub error_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            claim_mode: ClaimMode::AtMostOnce,
            execution_timeout: None,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// 実行 1 回の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionReport {
    /// その id の行が無い
    Missing,
    /// すでに終端状態。実行していない
    AlreadyFinished(TaskStatus),
    /// 別の配送が claim 済み。実行していない
    AlreadyClaimed,
    /// handler を実行し、結果を記録した
    Completed(Task),
    /// handler は実行したが、書き込み時に行が `RUNNING` でなかった
    /// （同時の配送が先に完了した、または手で編集された）。結果は捨てた
    Superseded(TaskStatus),
}

impl ExecutionReport {
    pub fn ran(&self) -> bool {
        matches!(
            self,
            ExecutionReport::Completed(_) | ExecutionReport::Superseded(_)
        )
    }
}

/// drop 時に実行メトリクスをちょうど 1 回記録する
struct ExecutionTimer<'a> {
    metrics: &'a dyn MetricsSink,
    started: Instant,
    outcome: TaskStatus,
}

impl<'a> ExecutionTimer<'a> {
    fn start(metrics: &'a dyn MetricsSink) -> Self {
        Self {
            metrics,
            started: Instant::now(),
            // 結果が決まる前に抜けたら失敗扱い
            outcome: TaskStatus::Failed,
        }
    }

    fn set_outcome(&mut self, outcome: TaskStatus) {
        self.outcome = outcome;
    }
}

impl Drop for ExecutionTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .record_execution(self.outcome, self.started.elapsed());
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct WorkerLoop {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DeliveryQueue>,
    handler: Arc<dyn TaskHandler>,
    metrics: Arc<dyn MetricsSink>,
    settings: WorkerSettings,
}

impl WorkerLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn DeliveryQueue>,
        handler: Arc<dyn TaskHandler>,
        metrics: Arc<dyn MetricsSink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            handler,
            metrics,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// キューに触らずにタスクを 1 件最後まで実行する
    pub async fn execute(&self, task_id: TaskId) -> Result<ExecutionReport, WorkerError> {
        let Some(task) = self.store.get(task_id).await? else {
            info!(%task_id, "task not found, nothing to do");
            return Ok(ExecutionReport::Missing);
        };
        if task.is_terminal() {
            debug!(%task_id, status = %task.status, "task already finished, skipping");
            return Ok(ExecutionReport::AlreadyFinished(task.status));
        }

        let task = match self.claim(task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => return Ok(ExecutionReport::Missing),
            Err(StoreError::StatusMismatch { actual, .. }) if actual.is_terminal() => {
                return Ok(ExecutionReport::AlreadyFinished(actual));
            }
            Err(StoreError::StatusMismatch { actual, .. }) => {
                debug!(%task_id, status = %actual, "task claimed by another delivery, skipping");
                return Ok(ExecutionReport::AlreadyClaimed);
            }
            Err(StoreError::InvalidPatch { source, .. }) => {
                // 読んでから claim するまでの間に終端になった
                warn!(%task_id, error = %source, "claim rejected");
                let status = self
                    .store
                    .get(task_id)
                    .await?
                    .map(|task| task.status)
                    .unwrap_or(TaskStatus::Failed);
                return Ok(ExecutionReport::AlreadyFinished(status));
            }
            Err(err) => return Err(err.into()),
        };

        let mut timer = ExecutionTimer::start(self.metrics.as_ref());
        let outcome = self.perform(task).await;
        let status = outcome.status();
        timer.set_outcome(status);

        match self.store.complete(task_id, outcome).await {
            Ok(task) => {
                info!(%task_id, status = %task.status, result = ?task.result, "task finished");
                Ok(ExecutionReport::Completed(task))
            }
            Err(StoreError::StatusMismatch { actual, .. }) => {
                warn!(%task_id, status = %actual, dropped = %status, "task no longer running, outcome dropped");
                Ok(ExecutionReport::Superseded(actual))
            }
            Err(StoreError::NotFound(_)) => {
                warn!(%task_id, "task deleted while running, outcome dropped");
                Ok(ExecutionReport::Missing)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 配送 1 件を実行し、transport 側を ack / nack で片付ける
    ///
    /// `Err` のとき配送は nack 済み（再試行に回る）。実行が済んだ後の ack
    /// 失敗はログに残すだけで `Ok` を返す（再配送は終端状態で吸収される）。
    pub async fn process(&self, delivery: &Delivery) -> Result<ExecutionReport, WorkerError> {
        let span = info_span!(
            "execute",
            job_id = %delivery.job_id,
            task_id = %delivery.task_id,
            delivery = delivery.delivery_count
        );

        async {
            if delivery.is_redelivery() {
                info!("redelivered run request");
            }
            match self.execute(delivery.task_id).await {
                Ok(report) => {
                    if let Err(ack_err) = self.queue.ack(delivery.tag).await {
                        warn!(error = %ack_err, "ack failed; message may be redelivered");
                    }
                    Ok(report)
                }
                Err(err) => {
                    error!(error = %err, "execution aborted, returning message to queue");
                    if let Err(nack_err) = self.queue.nack(delivery.tag).await {
                        warn!(error = %nack_err, "nack failed; waiting for visibility timeout");
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// `shutdown` が `true` になる（または sender が drop される）まで配送を処理する
    ///
    /// 実行中のタスクは中断せず最後まで終える。
    pub async fn run(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let consumed = tokio::select! {
                biased;
                consumed = self.queue.consume(self.settings.poll_interval) => consumed,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match consumed {
                Ok(Some(delivery)) => {
                    if self.process(&delivery).await.is_err() {
                        tokio::time::sleep(self.settings.error_backoff).await;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(worker_id, error = %err, "consume failed");
                    tokio::time::sleep(self.settings.error_backoff).await;
                }
            }
        }
        info!(worker_id, "worker stopped");
    }

    async fn claim(&self, task_id: TaskId) -> Result<Task, StoreError> {
        match self.settings.claim_mode {
            ClaimMode::AtMostOnce => {
                self.store
                    .transition(task_id, &TaskStatus::CLAIMABLE, TaskStatus::Running)
                    .await
            }
            ClaimMode::FirstCompletionWins => {
                self.store.set_status(task_id, TaskStatus::Running).await
            }
        }
    }

    /// handler を別 task で動かし、panic と deadline を `Failure` に変える
    async fn perform(&self, task: Task) -> WorkOutcome {
        let handler = Arc::clone(&self.handler);
        let mut join: JoinHandle<WorkOutcome> = tokio::spawn(async move { handler.handle(task).await });

        let joined = match self.settings.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut join).await {
                Ok(joined) => joined,
                Err(_) => {
                    join.abort();
                    return WorkOutcome::failure(format!("execution timed out after {limit:?}"));
                }
            },
            None => join.await,
        };

        match joined {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => {
                WorkOutcome::failure(format!("handler panicked: {}", panic_message(err.into_panic())))
            }
            Err(err) => WorkOutcome::failure(format!("handler aborted: {err}")),
        }
    }
}

/// 1 つの transport を共有する固定数の worker loop
///
/// 各 loop は同時に 1 タスクだけ実行する。`n` が並行数の上限で、遅いタスクは
/// 1 枠しか占有しない。
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn(n: usize, worker: Arc<WorkerLoop>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let joins = (0..n)
            .map(|worker_id| {
                let worker = Arc::clone(&worker);
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { worker.run(worker_id, rx).await })
            })
            .collect();

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// 新しい配送の受け取りを止める。実行中のものは終わらせる
    pub fn request_shutdown(&self) {
        // receiver はもう無いかもしれない
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
    }
}
