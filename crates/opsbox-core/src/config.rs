//! Config - 実行時設定（`OPSBOX_*` 環境変数で上書き）
//!
//! | variable                         | default              |
//! |----------------------------------|----------------------|
//! | `OPSBOX_DATABASE_URL`            | `sqlite://opsbox.db` |
//! | `OPSBOX_QUEUE_NAME`              | `default`            |
//! | `OPSBOX_WORKER_CONCURRENCY`      | `4`                  |
//! | `OPSBOX_RETENTION_MINUTES`       | `5`                  |
//! | `OPSBOX_CLEANUP_INTERVAL_SECS`   | `300`                |
//! | `OPSBOX_VISIBILITY_TIMEOUT_SECS` | `30`                 |
//! | `OPSBOX_EXECUTION_TIMEOUT_SECS`  | unset (unbounded)    |
//! | `OPSBOX_CLAIM_MODE`              | `at_most_once`       |
//! | `OPSBOX_LOG_FORMAT`              | `plain`              |
//!
//! # 検証
//! - 個数と期間は 0 を許さない
//! - 秒指定の期間は [`MAX_PERIOD_SECS`]（1 年）まで
//! - `RETENTION_MINUTES` は `chrono::Duration` で表せる範囲まで

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::app::{ClaimMode, WorkerSettings};

pub const ENV_PREFIX: &str = "OPSBOX_";

/// 秒指定の期間の上限（1 年）
pub const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{key} must be greater than zero")]
    Zero { key: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected plain or json, got {other}")),
        }
    }
}

impl FromStr for ClaimMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "at_most_once" => Ok(ClaimMode::AtMostOnce),
            "first_completion_wins" => Ok(ClaimMode::FirstCompletionWins),
            other => Err(format!(
                "expected at_most_once or first_completion_wins, got {other}"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsboxConfig {
    pub database_url: String,
    pub queue_name: String,
    pub worker_concurrency: usize,
    pub retention_minutes: i64,
    pub cleanup_interval_secs: u64,
    pub visibility_timeout_secs: u64,
    pub execution_timeout_secs: Option<u64>,
    pub claim_mode: ClaimMode,
    pub log_format: LogFormat,
}

impl Default for OpsboxConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://opsbox.db".to_string(),
            queue_name: "default".to_string(),
            worker_concurrency: 4,
            retention_minutes: 5,
            cleanup_interval_secs: 300,
            visibility_timeout_secs: 30,
            execution_timeout_secs: None,
            claim_mode: ClaimMode::AtMostOnce,
            log_format: LogFormat::Plain,
        }
    }
}

fn parse<T>(key: &str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value,
        reason: err.to_string(),
    })
}

impl OpsboxConfig {
    /// 既定値をプロセスの環境変数で上書きする
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 既定値を `lookup` が返す `OPSBOX_*` の値で上書きする
    ///
    /// 空文字は未設定扱い。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Option<(String, String)> {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .filter(|value| !value.trim().is_empty())
                .map(|value| (key, value))
        };

        let mut config = Self::default();
        if let Some((_, v)) = get("DATABASE_URL") {
            config.database_url = v;
        }
        if let Some((_, v)) = get("QUEUE_NAME") {
            config.queue_name = v;
        }
        if let Some((k, v)) = get("WORKER_CONCURRENCY") {
            config.worker_concurrency = parse(&k, v)?;
        }
        if let Some((k, v)) = get("RETENTION_MINUTES") {
            config.retention_minutes = parse(&k, v)?;
        }
        if let Some((k, v)) = get("CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval_secs = parse(&k, v)?;
        }
        if let Some((k, v)) = get("VISIBILITY_TIMEOUT_SECS") {
            config.visibility_timeout_secs = parse(&k, v)?;
        }
        if let Some((k, v)) = get("EXECUTION_TIMEOUT_SECS") {
            config.execution_timeout_secs = Some(parse(&k, v)?);
        }
        if let Some((k, v)) = get("CLAIM_MODE") {
            config.claim_mode = parse(&k, v)?;
        }
        if let Some((k, v)) = get("LOG_FORMAT") {
            config.log_format = parse(&k, v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |name: &str| ConfigError::Zero {
            key: format!("{ENV_PREFIX}{name}"),
        };
        let too_large = |name: &str, value: String, reason: String| ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{name}"),
            value,
            reason,
        };
        if self.worker_concurrency == 0 {
            return Err(zero("WORKER_CONCURRENCY"));
        }
        if self.retention_minutes <= 0 {
            return Err(zero("RETENTION_MINUTES"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(zero("CLEANUP_INTERVAL_SECS"));
        }
        if self.visibility_timeout_secs == 0 {
            return Err(zero("VISIBILITY_TIMEOUT_SECS"));
        }
        if self.execution_timeout_secs == Some(0) {
            return Err(zero("EXECUTION_TIMEOUT_SECS"));
        }

        if chrono::Duration::try_minutes(self.retention_minutes).is_none() {
            return Err(too_large(
                "RETENTION_MINUTES",
                self.retention_minutes.to_string(),
                "out of range for a duration".to_string(),
            ));
        }
        let periods = [
            ("CLEANUP_INTERVAL_SECS", Some(self.cleanup_interval_secs)),
            ("VISIBILITY_TIMEOUT_SECS", Some(self.visibility_timeout_secs)),
            ("EXECUTION_TIMEOUT_SECS", self.execution_timeout_secs),
        ];
        for (name, secs) in periods {
            if let Some(secs) = secs.filter(|secs| *secs > MAX_PERIOD_SECS) {
                return Err(too_large(
                    name,
                    secs.to_string(),
                    format!("must be at most {MAX_PERIOD_SECS} seconds"),
                ));
            }
        }
        Ok(())
    }

    /// 範囲外の値は `validate()` が弾く。未検証の値は最大値に張り付く。
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.retention_minutes).unwrap_or(chrono::Duration::MAX)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            claim_mode: self.claim_mode,
            execution_timeout: self.execution_timeout_secs.map(Duration::from_secs),
            ..WorkerSettings::default()
        }
    }
}
