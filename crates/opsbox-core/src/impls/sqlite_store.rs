//! SqliteTaskStore - SQLite の task store
//!
//! # スキーマ
//! - task id を主キーにした `tasks` テーブル 1 つ
//! - タイムスタンプは unix マイクロ秒（reaper の `created_at < cutoff` を数値比較にする）
//! - `seq` が `list()` の挿入順
//!
//! # 実装
//! read-modify-write はすべて 1 トランザクション。pool の接続は 1 本
//! （SQLite は書き込みを直列化するので、deferred トランザクションの書き込み
//! ロック昇格で `SQLITE_BUSY` になるのを避ける）。

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::{StoreError, Task, TaskId, TaskPatch, TaskStatus, WorkOutcome};
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

const SELECT_COLUMNS: &str = "SELECT id, title, status, result, created_at, updated_at FROM tasks";

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn micros_to_datetime(column: &str, micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Backend(format!("corrupt {column}: {micros}")))
}

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SqliteTaskStore {
    /// `url` の DB を開く（無ければ作る）。例: `sqlite://opsbox.db`、`sqlite::memory:`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_clock(url, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(url: &str, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(backend)?
            .create_if_missing(true);
        // `sqlite::memory:` は接続が閉じると消えるので、1 本を使い回し続ける
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
            .connect_with(options)
            .await
            .map_err(backend)?;

        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let store = Self { pool, clock, ids };
        store.init_schema().await?;
        info!(url, "sqlite task store ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// 列は unix マイクロ秒なので、返す値もそこで切り捨てる。
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(6)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                title TEXT,
                status TEXT NOT NULL,
                result TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    fn decode(row: &SqliteRow) -> Result<Task, StoreError> {
        let id: String = row.try_get("id").map_err(backend)?;
        let status: String = row.try_get("status").map_err(backend)?;
        let created_at: i64 = row.try_get("created_at").map_err(backend)?;
        let updated_at: i64 = row.try_get("updated_at").map_err(backend)?;

        Ok(Task {
            id: id
                .parse()
                .map_err(|e| StoreError::Backend(format!("corrupt id: {e}")))?,
            title: row.try_get("title").map_err(backend)?,
            status: status
                .parse()
                .map_err(|e| StoreError::Backend(format!("corrupt status: {e}")))?,
            result: row.try_get("result").map_err(backend)?,
            created_at: micros_to_datetime("created_at", created_at)?,
            updated_at: micros_to_datetime("updated_at", updated_at)?,
        })
    }

    async fn fetch<'e, E>(executor: E, id: TaskId) -> Result<Option<Task>, StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.as_ulid().to_string())
            .fetch_optional(executor)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn write<'e, E>(executor: E, task: &Task) -> Result<(), StoreError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "UPDATE tasks SET title = ?, status = ?, result = ?, updated_at = ? WHERE id = ?",
        )
        .bind(task.title.clone())
        .bind(task.status.as_str())
        .bind(task.result.clone())
        .bind(task.updated_at.timestamp_micros())
        .bind(task.id.as_ulid().to_string())
        .execute(executor)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// 1 トランザクション内で 1 行を読み、検査し、変更して書き戻す
    ///
    /// `mutate` はトランザクション中に走るので外部 I/O をしてはいけない。
    async fn read_modify_write<F>(&self, id: TaskId, mutate: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&Task, DateTime<Utc>) -> Result<Task, StoreError> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let current = Self::fetch(&mut *tx, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        // エラー経路で `tx` を drop すると rollback
        let next = mutate(&current, self.now())?;
        Self::write(&mut *tx, &next).await?;
        tx.commit().await.map_err(backend)?;
        Ok(next)
    }
}

fn apply(id: TaskId, patch: TaskPatch, task: &Task, now: DateTime<Utc>) -> Result<Task, StoreError> {
    patch
        .apply(task, now)
        .map_err(|source| StoreError::InvalidPatch { id, source })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, title: Option<String>) -> Result<Task, StoreError> {
        let task = Task::new(self.ids.generate_task_id(), title, self.now());
        sqlx::query(
            "INSERT INTO tasks (id, title, status, result, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(task.id.as_ulid().to_string())
        .bind(task.title.clone())
        .bind(task.status.as_str())
        .bind(task.created_at.timestamp_micros())
        .bind(task.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Self::fetch(&self.pool, id).await
    }

    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        self.read_modify_write(id, move |task, now| apply(id, patch, task, now))
            .await
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        let done = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.as_ulid().to_string())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(done.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY seq"))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::decode).collect()
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<Task, StoreError> {
        let expected = expected.to_vec();
        self.read_modify_write(id, move |task, now| {
            if !expected.contains(&task.status) {
                return Err(StoreError::StatusMismatch {
                    id,
                    actual: task.status,
                    expected,
                });
            }
            apply(id, TaskPatch::status(next), task, now)
        })
        .await
    }

    async fn set_status(&self, id: TaskId, next: TaskStatus) -> Result<Task, StoreError> {
        self.read_modify_write(id, move |task, now| {
            apply(id, TaskPatch::status(next), task, now)
        })
        .await
    }

    async fn complete(&self, id: TaskId, outcome: WorkOutcome) -> Result<Task, StoreError> {
        self.read_modify_write(id, move |task, now| {
            if task.status != TaskStatus::Running {
                return Err(StoreError::StatusMismatch {
                    id,
                    actual: task.status,
                    expected: vec![TaskStatus::Running],
                });
            }
            let (status, result) = outcome.into_parts();
            apply(id, TaskPatch::status(status).with_result(result), task, now)
        })
        .await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "DELETE FROM tasks WHERE status IN (?, ?) AND created_at < ?",
        )
        .bind(TaskStatus::Succeeded.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(cutoff.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        debug!(deleted = done.rows_affected(), %cutoff, "deleted terminal tasks");
        Ok(done.rows_affected())
    }
}
