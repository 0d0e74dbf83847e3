//! DeliveryQueue port - gateway から worker へ実行要求を運ぶ
//!
//! 運ぶのは task id（と publish 時に transport が振る job id）だけ。状態と
//! 結果は task store にある。
//!
//! # 配送の意味論
//! - at-least-once: `ack` されるまでメッセージは貸出中。先に visibility
//!   timeout が過ぎたら再配送される
//! - タスク間の順序保証なし、重複排除なし

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{JobId, QueueError, TaskId};

/// 受け取った実行要求 1 件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub job_id: JobId,
    pub task_id: TaskId,
    /// Identifies this particular delivery for `ack` / `nack`.
    pub tag: u64,
    /// 初回は 1、再配送のたびに +1
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Publish a run request for `task_id`; returns the correlation id.
    async fn publish(&self, task_id: TaskId) -> Result<JobId, QueueError>;

    /// 最大 `wait` だけメッセージを待つ。タイムアウトなら `Ok(None)`
    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Settle a delivery; the message will not be seen again.
    async fn ack(&self, tag: u64) -> Result<(), QueueError>;

    /// visibility timeout を待たずに、すぐ ready に戻す
    async fn nack(&self, tag: u64) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
