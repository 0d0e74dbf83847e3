//! EnqueueGateway - 実行可能かを確かめて実行要求を publish する
//!
//! # フロー
//! 1. タスクを読む（無ければ `NotFound`）
//! 2. `RUNNING` / `SUCCEEDED` / `FAILED` は `Conflict` で拒否
//! 3. task id を publish し、transport の job id を返す
//!
//! ここでは状態を変えない。`RUNNING` にするのは worker。それまでの
//! `NEW` / `PENDING` は「まだ始まっていない」と読む。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::domain::{GatewayError, JobId, TaskId};
use crate::ports::{DeliveryQueue, TaskStore};

/// `run` 成功時の戻り値
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub job_id: JobId,
    pub task_id: TaskId,
}

#[derive(Clone)]
pub struct EnqueueGateway {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DeliveryQueue>,
}

impl EnqueueGateway {
    pub fn new(store: Arc<dyn TaskStore>, queue: Arc<dyn DeliveryQueue>) -> Self {
        Self { store, queue }
    }

    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn run(&self, task_id: TaskId) -> Result<EnqueueReceipt, GatewayError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or(GatewayError::NotFound(task_id))?;

        if !task.status.is_enqueueable() {
            return Err(GatewayError::Conflict {
                id: task_id,
                status: task.status,
            });
        }

        let job_id = self.queue.publish(task_id).await?;
        info!(%job_id, status = %task.status, "run request published");
        Ok(EnqueueReceipt { job_id, task_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{QueueError, TaskPatch, TaskStatus};
    use crate::impls::{InMemoryDeliveryQueue, InMemoryTaskStore};
    use crate::ports::{Delivery, QueueDepth};
    use async_trait::async_trait;
    use rstest::rstest;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryTaskStore>, Arc<InMemoryDeliveryQueue>, EnqueueGateway) {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryDeliveryQueue::new(Duration::from_secs(30)));
        let gateway = EnqueueGateway::new(store.clone(), queue.clone());
        (store, queue, gateway)
    }

    #[tokio::test]
    async fn publishes_and_leaves_status_alone() {
        let (store, queue, gateway) = setup();
        let task = store.create(Some("first".into())).await.unwrap();

        let receipt = gateway.run(task.id).await.unwrap();
        assert_eq!(receipt.task_id, task.id);

        let delivery = queue.consume(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(delivery.job_id, receipt.job_id);
        assert_eq!(
            store.get(task.id).await.unwrap().unwrap().status,
            TaskStatus::New
        );
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (_, queue, gateway) = setup();
        let ghost = TaskId::from_ulid(ulid::Ulid::new());

        let err = gateway.run(ghost).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(id) if id == ghost));
        assert_eq!(queue.depth().await.unwrap().ready, 0);
    }

    #[rstest]
    #[case(TaskStatus::Running, None)]
    #[case(TaskStatus::Succeeded, Some("ok"))]
    #[case(TaskStatus::Failed, Some("boom"))]
    #[tokio::test]
    async fn ineligible_status_is_conflict_and_publishes_nothing(
        #[case] status: TaskStatus,
        #[case] result: Option<&str>,
    ) {
        let (store, queue, gateway) = setup();
        let task = store.create(None).await.unwrap();
        let mut patch = TaskPatch::status(status);
        if let Some(result) = result {
            patch = patch.with_result(result);
        }
        store.update(task.id, patch).await.unwrap();

        let err = gateway.run(task.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Conflict { status: s, .. } if s == status));
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn pending_task_can_be_enqueued_again() {
        let (store, queue, gateway) = setup();
        let task = store.create(None).await.unwrap();
        store
            .update(task.id, TaskPatch::status(TaskStatus::Pending))
            .await
            .unwrap();

        let first = gateway.run(task.id).await.unwrap();
        let second = gateway.run(task.id).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert_eq!(queue.depth().await.unwrap().ready, 2);
    }

    struct BrokerDown;

    #[async_trait]
    impl DeliveryQueue for BrokerDown {
        async fn publish(&self, _task_id: TaskId) -> Result<JobId, QueueError> {
            Err(QueueError::OperationFailed("connection refused".into()))
        }
        async fn consume(&self, _wait: Duration) -> Result<Option<Delivery>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, tag: u64) -> Result<(), QueueError> {
            Err(QueueError::UnknownDelivery(tag))
        }
        async fn nack(&self, tag: u64) -> Result<(), QueueError> {
            Err(QueueError::UnknownDelivery(tag))
        }
        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            Ok(QueueDepth::default())
        }
    }

    #[tokio::test]
    async fn broker_failure_escapes_and_leaves_task_untouched() {
        let store = Arc::new(InMemoryTaskStore::new());
        let gateway = EnqueueGateway::new(store.clone(), Arc::new(BrokerDown));
        let task = store.create(None).await.unwrap();

        let err = gateway.run(task.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Queue(QueueError::OperationFailed(_))));
        assert_eq!(store.get(task.id).await.unwrap(), Some(task));
    }
}
