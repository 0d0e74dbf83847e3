//! MetricsSink port - 実行とクリーンアップの計測
//!
//! 実装は [`crate::impls::metrics`] にある。

use std::time::Duration;

use crate::domain::TaskStatus;

/// 実行 1 回ごとに `record_execution`、reaper 1 回ごとに `record_cleanup` を受け取る。
pub trait MetricsSink: Send + Sync {
    /// `outcome` は到達した終端状態（`SUCCEEDED` / `FAILED`）
    fn record_execution(&self, outcome: TaskStatus, latency: Duration);

    fn record_cleanup(&self, deleted: u64);
}
