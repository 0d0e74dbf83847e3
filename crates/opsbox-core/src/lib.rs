//! opsbox-core
//!
//! Task lifecycle and queueing.
//!
//! タスクを store に作り、実行要求を at-least-once のキューに流し、worker が
//! 冪等に実行し、beat が古い終了済みタスクを消す。
//!
//! # モジュール構成
//! - **domain**: タスク行、状態遷移、ID、実行結果、エラー
//! - **ports**: 抽象化レイヤー（`TaskStore`, `DeliveryQueue`, `MetricsSink`, `Clock`, `IdGenerator`）
//! - **impls**: 実装（in-memory、SQLite、OpenTelemetry metrics）
//! - **app**: gateway、worker、reaper、beat、ワイヤリング
//! - **config** / **logging**: 環境変数の設定と tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod logging;
pub mod ports;
