//! Metrics - MetricsSink の実装
//!
//! # 含まれるもの
//! - **OtelMetrics**: OpenTelemetry の `Counter` / `Histogram` に記録する本番用 sink
//! - **RecordingMetrics**: 記録をそのまま保持する sink（テストと demo の集計用）
//!
//! # 系列
//! - `worker_jobs_total{result}`: 実行回数（`result` = `SUCCEEDED` / `FAILED`）
//! - `worker_job_latency_seconds`: 実行時間（秒）
//! - `worker_cleanups_total`: reaper が削除した行数
//!
//! MeterProvider は埋め込み側が `opentelemetry::global::set_meter_provider`
//! で設定する。未設定なら global meter は何もしない。

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::TaskStatus;
use crate::ports::MetricsSink;

pub const METER_NAME: &str = "opsbox-worker";

pub const JOBS_TOTAL: &str = "worker_jobs_total";
pub const JOB_LATENCY_SECONDS: &str = "worker_job_latency_seconds";
pub const CLEANUPS_TOTAL: &str = "worker_cleanups_total";

/// OpenTelemetry の instrument に記録する sink。
#[derive(Clone)]
pub struct OtelMetrics {
    jobs_total: Counter<u64>,
    job_latency: Histogram<f64>,
    cleanups_total: Counter<u64>,
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            jobs_total: meter
                .u64_counter(JOBS_TOTAL)
                .with_description("Task executions by terminal result")
                .build(),
            job_latency: meter
                .f64_histogram(JOB_LATENCY_SECONDS)
                .with_description("Task execution latency")
                .with_unit("s")
                .build(),
            cleanups_total: meter
                .u64_counter(CLEANUPS_TOTAL)
                .with_description("Finished tasks deleted by retention cleanup")
                .build(),
        }
    }

    /// global MeterProvider から meter を取る。
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }
}

impl MetricsSink for OtelMetrics {
    fn record_execution(&self, outcome: TaskStatus, latency: Duration) {
        let labels = [KeyValue::new("result", outcome.as_str())];
        self.jobs_total.add(1, &labels);
        self.job_latency.record(latency.as_secs_f64(), &labels);
        debug!(result = %outcome, latency_ms = latency.as_millis() as u64, "{JOBS_TOTAL}");
    }

    fn record_cleanup(&self, deleted: u64) {
        self.cleanups_total.add(deleted, &[]);
        debug!(deleted, "{CLEANUPS_TOTAL}");
    }
}

/// `RecordingMetrics` が保持している内容。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecordedMetrics {
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    /// 記録順の実行時間
    pub latencies: Vec<Duration>,
    pub cleanups_total: u64,
}

impl RecordedMetrics {
    pub fn jobs_total(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed
    }
}

/// 記録をメモリに残すだけの sink。
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    recorded: Mutex<RecordedMetrics>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RecordedMetrics {
        match self.recorded.lock() {
            Ok(recorded) => recorded.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with<F: FnOnce(&mut RecordedMetrics)>(&self, f: F) {
        match self.recorded.lock() {
            Ok(mut recorded) => f(&mut recorded),
            Err(poisoned) => {
                warn!("metrics lock poisoned, recording anyway");
                f(&mut poisoned.into_inner())
            }
        }
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_execution(&self, outcome: TaskStatus, latency: Duration) {
        self.with(|recorded| {
            match outcome {
                TaskStatus::Succeeded => recorded.jobs_succeeded += 1,
                _ => recorded.jobs_failed += 1,
            }
            recorded.latencies.push(latency);
        });
    }

    fn record_cleanup(&self, deleted: u64) {
        self.with(|recorded| recorded.cleanups_total += deleted);
    }
}

/// 複数の sink に同じ記録を流す。
pub struct FanoutMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutMetrics {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }
}

impl MetricsSink for FanoutMetrics {
    fn record_execution(&self, outcome: TaskStatus, latency: Duration) {
        for sink in &self.sinks {
            sink.record_execution(outcome, latency);
        }
    }

    fn record_cleanup(&self, deleted: u64) {
        for sink in &self.sinks {
            sink.record_cleanup(deleted);
        }
    }
}
