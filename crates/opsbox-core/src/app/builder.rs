//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! store、transport、handler、metrics、clock を gateway、worker pool、
//! reaper beat に配線する。すべて明示的に渡し、グローバルからは引かない
//! （metrics の既定値だけは global MeterProvider の meter）。
//!
//! # 使用例
//! ```ignore
//! let app = AppBuilder::new()
//!     .config(OpsboxConfig::from_env()?)
//!     .store(Arc::new(InMemoryTaskStore::new()))
//!     .build()?;
//! let receipt = app.gateway().run(task_id).await?;
//! let running = app.start();
//! // ...
//! running.shutdown().await;
//! ```
//!
//! # Fail-fast 設計
//! `build()` は設定を検証し、task store を必須とする。transport、handler、
//! metrics、clock にはプロセス内の既定値がある。

use std::sync::Arc;
use tracing::info;

use crate::config::{ConfigError, OpsboxConfig};
use crate::domain::StoreError;
use crate::impls::{InMemoryDeliveryQueue, InMemoryTaskStore, OtelMetrics};
use crate::ports::{Clock, DeliveryQueue, MetricsSink, SystemClock, TaskStore};

use super::gateway::EnqueueGateway;
use super::handler::{SimulatedWork, TaskHandler};
use super::reaper::RetentionReaper;
use super::reaper_loop::{ReaperHandle, ReaperLoop};
use super::status::TaskCounts;
use super::worker_loop::{WorkerGroup, WorkerLoop};

/// DB ではなく InMemoryTaskStore を選ぶ URL
pub const MEMORY_STORE_URL: &str = "memory://";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no task store configured")]
    MissingStore,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// `database_url` の task store を開く
///
/// `memory://` なら [`InMemoryTaskStore`]、それ以外は SQLite に渡す。
pub async fn open_store(database_url: &str) -> Result<Arc<dyn TaskStore>, StoreError> {
    if database_url == MEMORY_STORE_URL {
        return Ok(Arc::new(InMemoryTaskStore::new()));
    }
    open_sqlite(database_url).await
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(database_url: &str) -> Result<Arc<dyn TaskStore>, StoreError> {
    let store = crate::impls::SqliteTaskStore::connect(database_url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(database_url: &str) -> Result<Arc<dyn TaskStore>, StoreError> {
    Err(StoreError::Backend(format!(
        "{database_url}: built without the sqlite feature"
    )))
}

pub struct AppBuilder {
    config: OpsboxConfig,
    store: Option<Arc<dyn TaskStore>>,
    queue: Option<Arc<dyn DeliveryQueue>>,
    handler: Option<Arc<dyn TaskHandler>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: OpsboxConfig::default(),
            store: None,
            queue: None,
            handler: None,
            metrics: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: OpsboxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn DeliveryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let config = self.config;

        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryDeliveryQueue::new(config.visibility_timeout())));
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(SimulatedWork::default()));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(OtelMetrics::global()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(App {
            config,
            store,
            queue,
            handler,
            metrics,
            clock,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 配線済み、未起動のアプリケーション
pub struct App {
    config: OpsboxConfig,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DeliveryQueue>,
    handler: Arc<dyn TaskHandler>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl App {
    pub fn config(&self) -> &OpsboxConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn queue(&self) -> Arc<dyn DeliveryQueue> {
        Arc::clone(&self.queue)
    }

    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        Arc::clone(&self.metrics)
    }

    pub fn gateway(&self) -> EnqueueGateway {
        EnqueueGateway::new(self.store(), self.queue())
    }

    pub fn worker(&self) -> WorkerLoop {
        WorkerLoop::new(
            self.store(),
            self.queue(),
            Arc::clone(&self.handler),
            self.metrics.clone(),
            self.config.worker_settings(),
        )
    }

    pub fn reaper(&self) -> RetentionReaper {
        RetentionReaper::new(self.store(), self.metrics.clone(), Arc::clone(&self.clock))
    }

    pub async fn counts(&self) -> Result<TaskCounts, StoreError> {
        TaskCounts::load(self.store.as_ref()).await
    }

    /// worker pool と reaper beat を起動する
    pub fn start(&self) -> RunningApp {
        info!(
            queue = %self.config.queue_name,
            workers = self.config.worker_concurrency,
            claim_mode = ?self.config.claim_mode,
            "starting workers"
        );
        let workers = WorkerGroup::spawn(self.config.worker_concurrency, Arc::new(self.worker()));
        let reaper = ReaperLoop::new(
            self.reaper(),
            self.config.cleanup_interval(),
            self.config.retention(),
        )
        .spawn();
        RunningApp { workers, reaper }
    }
}

pub struct RunningApp {
    workers: WorkerGroup,
    reaper: ReaperHandle,
}

impl RunningApp {
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// beat を止め、実行中のタスクは終わるまで待つ
    pub async fn shutdown(self) {
        self.workers.request_shutdown();
        self.reaper.shutdown_and_join().await;
        self.workers.shutdown_and_join().await;
        info!("shutdown complete");
    }
}
