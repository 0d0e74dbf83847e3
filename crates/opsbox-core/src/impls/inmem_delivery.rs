//! InMemoryDeliveryQueue - visibility timeout 付きの単一プロセス broker
//!
//! # 実装
//! - ready なメッセージは `VecDeque`、貸出中は `HashMap<tag, InFlight>`
//! - tokio `Mutex` + `Notify`: publish は待っている consumer を 1 つ起こす
//! - 期限切れの lease は次の `consume` / `depth` で遅延的に ready に戻し、
//!   `delivery_count + 1` する
//!
//! # Usage
//! ```ignore
//! let queue = InMemoryDeliveryQueue::new(Duration::from_secs(30));
//! let job_id = queue.publish(task_id).await?;
//! if let Some(delivery) = queue.consume(Duration::from_secs(1)).await? {
//!     // ... run the task ...
//!     queue.ack(delivery.tag).await?;
//! }
//! ```

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{JobId, QueueError, TaskId};
use crate::ports::{Delivery, DeliveryQueue, IdGenerator, QueueDepth, SystemClock, UlidGenerator};

#[derive(Debug, Clone)]
struct Message {
    job_id: JobId,
    task_id: TaskId,
    delivery_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    visible_at: Instant,
}

#[derive(Default)]
struct InMemoryDeliveryState {
    ready: VecDeque<Message>,
    in_flight: HashMap<u64, InFlight>,
    next_tag: u64,
}

impl InMemoryDeliveryState {
    /// visibility timeout を過ぎた lease を `ready` に戻す
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.visible_at <= now)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in &expired {
            if let Some(lease) = self.in_flight.remove(tag) {
                warn!(
                    tag,
                    job_id = %lease.message.job_id,
                    task_id = %lease.message.task_id,
                    "visibility timeout expired, redelivering"
                );
                self.ready.push_back(lease.message);
            }
        }
        expired.len()
    }

    fn lease_next(&mut self, now: Instant, visibility_timeout: Duration) -> Option<Delivery> {
        let mut message = self.ready.pop_front()?;
        message.delivery_count += 1;

        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            job_id: message.job_id,
            task_id: message.task_id,
            tag,
            delivery_count: message.delivery_count,
        };
        self.in_flight.insert(
            tag,
            InFlight {
                message,
                visible_at: now + visibility_timeout,
            },
        );
        Some(delivery)
    }

    fn earliest_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|lease| lease.visible_at).min()
    }
}

pub struct InMemoryDeliveryQueue {
    state: Mutex<InMemoryDeliveryState>,
    notify: Notify,
    visibility_timeout: Duration,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryDeliveryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self::with_id_generator(visibility_timeout, Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(visibility_timeout: Duration, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Mutex::new(InMemoryDeliveryState::default()),
            notify: Notify::new(),
            visibility_timeout,
            ids,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    async fn publish(&self, task_id: TaskId) -> Result<JobId, QueueError> {
        let job_id = self.ids.generate_job_id();
        {
            let mut state = self.state.lock().await;
            state.ready.push_back(Message {
                job_id,
                task_id,
                delivery_count: 0,
            });
        }
        self.notify.notify_one();
        debug!(%job_id, %task_id, "published run request");
        Ok(job_id)
    }

    async fn consume(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up_at = Instant::now() + wait;
        loop {
            let next_expiry = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now);
                if let Some(delivery) = state.lease_next(now, self.visibility_timeout) {
                    return Ok(Some(delivery));
                }
                state.earliest_expiry()
            };

            if Instant::now() >= give_up_at {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(give_up_at, |expiry| expiry.min(give_up_at));
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDelivery(tag))
    }

    async fn nack(&self, tag: u64) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let lease = state
                .in_flight
                .remove(&tag)
                .ok_or(QueueError::UnknownDelivery(tag))?;
            state.ready.push_back(lease.message);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut state = self.state.lock().await;
        state.reclaim_expired(Instant::now());
        Ok(QueueDepth {
            ready: state.ready.len(),
            in_flight: state.in_flight.len(),
        })
    }
}
