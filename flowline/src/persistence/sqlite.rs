//! Durable stores backed by SQLite through sqlx.

use super::{FlowContextRepo, RetryRecord, RetryRepo};
use crate::core::{BatchKey, FlowContext, FlowData, FlowStatus};
use crate::errors::{FlowError, FlowResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteQueryResult, SqliteRow,
};
use sqlx::Row;
use std::marker::PhantomData;
use uuid::Uuid;

const CONTEXT_COLUMNS: &str = "id, stream_id, trace_id, position, status, data, \
     to_batch, previous, error, created_at, updated_at";

fn affected_rows(result: &SqliteQueryResult) -> FlowResult<usize> {
    usize::try_from(result.rows_affected())
        .map_err(|e| FlowError::Storage(format!("row count out of range: {e}")))
}

fn storage(operation: &str) -> impl Fn(sqlx::Error) -> FlowError + '_ {
    move |e| FlowError::Storage(format!("{operation} failed: {e}"))
}

/// Opens a pool. In-memory databases are pinned to a single connection so
/// that every query sees the same database.
///
/// # Errors
///
/// Returns [`FlowError::Storage`] if the connection fails.
pub async fn connect_pool(database_url: &str) -> FlowResult<SqlitePool> {
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(database_url)
        .await
        .map_err(storage("connect"))
}

/// Context store persisting one row per context with JSON data.
#[derive(Debug, Clone)]
pub struct SqliteContextRepo<T> {
    pool: SqlitePool,
    _data: PhantomData<fn() -> T>,
}

impl<T: FlowData> SqliteContextRepo<T> {
    /// Connects and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Storage`] on connection or schema failure.
    pub async fn connect(database_url: &str) -> FlowResult<Self> {
        Self::from_pool(connect_pool(database_url).await?).await
    }

    /// Wraps an existing pool and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Storage`] on schema failure.
    pub async fn from_pool(pool: SqlitePool) -> FlowResult<Self> {
        let repo = Self {
            pool,
            _data: PhantomData,
        };
        repo.init_schema().await?;
        Ok(repo)
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> FlowResult<()> {
        let ddl = [
            r"
            CREATE TABLE IF NOT EXISTS flow_contexts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                stream_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                position TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                to_batch TEXT,
                previous TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            ",
            "CREATE INDEX IF NOT EXISTS idx_flow_contexts_position \
             ON flow_contexts (stream_id, position, status)",
            "CREATE INDEX IF NOT EXISTS idx_flow_contexts_trace ON flow_contexts (trace_id)",
        ];
        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(storage("schema init"))?;
        }
        Ok(())
    }

    async fn select(
        &self,
        clause: &str,
        binds: Vec<Option<String>>,
    ) -> FlowResult<Vec<FlowContext<T>>> {
        let sql =
            format!("SELECT {CONTEXT_COLUMNS} FROM flow_contexts WHERE {clause} ORDER BY seq");
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(storage("select"))?;
        rows.iter().map(context_from_row).collect()
    }
}

async fn insert_context<T: FlowData>(
    conn: &mut SqliteConnection,
    ctx: &FlowContext<T>,
) -> FlowResult<usize> {
    let result = sqlx::query(
        r"
        INSERT OR IGNORE INTO flow_contexts (
            id, stream_id, trace_id, position, status, data,
            to_batch, previous, error, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(ctx.id.to_string())
    .bind(&ctx.stream_id)
    .bind(ctx.trace_id.to_string())
    .bind(&ctx.position)
    .bind(ctx.status.as_str())
    .bind(serde_json::to_string(&ctx.data)?)
    .bind(ctx.to_batch.map(|b| b.to_string()))
    .bind(ctx.previous.map(|p| p.to_string()))
    .bind(ctx.error.as_deref())
    .bind(ctx.created_at.to_rfc3339())
    .bind(ctx.updated_at.to_rfc3339())
    .execute(conn)
    .await
    .map_err(storage("insert"))?;
    affected_rows(&result)
}

async fn update_context<T: FlowData>(
    conn: &mut SqliteConnection,
    ctx: &FlowContext<T>,
    now: &str,
) -> FlowResult<usize> {
    let result = sqlx::query(
        r"
        UPDATE flow_contexts
           SET status = ?, data = ?, to_batch = ?, error = ?, updated_at = ?
         WHERE id = ?
        ",
    )
    .bind(ctx.status.as_str())
    .bind(serde_json::to_string(&ctx.data)?)
    .bind(ctx.to_batch.map(|b| b.to_string()))
    .bind(ctx.error.as_deref())
    .bind(now)
    .bind(ctx.id.to_string())
    .execute(conn)
    .await
    .map_err(storage("update"))?;
    affected_rows(&result)
}

#[async_trait]
impl<T: FlowData> FlowContextRepo<T> for SqliteContextRepo<T> {
    async fn save(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize> {
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;
        let mut affected = 0;
        for ctx in contexts {
            affected += insert_context(&mut tx, ctx).await?;
        }
        tx.commit().await.map_err(storage("commit"))?;
        Ok(affected)
    }

    async fn update(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;
        let mut affected = 0;
        for ctx in contexts {
            affected += update_context(&mut tx, ctx, &now).await?;
        }
        tx.commit().await.map_err(storage("commit"))?;
        Ok(affected)
    }

    async fn advance(
        &self,
        successors: &[FlowContext<T>],
        origins: &[FlowContext<T>],
        fence: &(dyn Fn() -> FlowResult<()> + Send + Sync),
    ) -> FlowResult<(usize, usize)> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;
        let mut saved = 0;
        for ctx in successors {
            saved += insert_context(&mut tx, ctx).await?;
        }
        let mut updated = 0;
        for ctx in origins {
            updated += update_context(&mut tx, ctx, &now).await?;
        }
        // Dropping an uncommitted transaction rolls it back.
        fence()?;
        tx.commit().await.map_err(storage("commit"))?;
        Ok((saved, updated))
    }

    async fn update_data_and_batch(&self, contexts: &[FlowContext<T>]) -> FlowResult<usize> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(storage("begin"))?;
        let mut affected = 0;
        for ctx in contexts {
            let result = sqlx::query(
                "UPDATE flow_contexts SET data = ?, to_batch = ?, updated_at = ? WHERE id = ?",
            )
            .bind(serde_json::to_string(&ctx.data)?)
            .bind(ctx.to_batch.map(|b| b.to_string()))
            .bind(&now)
            .bind(ctx.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage("update data"))?;
            affected += affected_rows(&result)?;
        }
        tx.commit().await.map_err(storage("commit"))?;
        Ok(affected)
    }

    async fn find(
        &self,
        stream_id: &str,
        trace_id: Option<Uuid>,
        position: &str,
        status: FlowStatus,
    ) -> FlowResult<Vec<FlowContext<T>>> {
        let mut binds = vec![
            Some(stream_id.to_string()),
            Some(position.to_string()),
            Some(status.as_str().to_string()),
        ];
        let clause = match trace_id {
            Some(trace) => {
                binds.push(Some(trace.to_string()));
                "stream_id = ? AND position = ? AND status = ? AND trace_id = ?"
            }
            None => "stream_id = ? AND position = ? AND status = ?",
        };
        self.select(clause, binds).await
    }

    async fn find_batch(
        &self,
        key: &BatchKey,
        status: FlowStatus,
    ) -> FlowResult<Vec<FlowContext<T>>> {
        self.select(
            "stream_id = ? AND position = ? AND to_batch IS ? AND status = ?",
            vec![
                Some(key.stream_id.clone()),
                Some(key.position.clone()),
                key.to_batch.map(|b| b.to_string()),
                Some(status.as_str().to_string()),
            ],
        )
        .await
    }

    async fn find_all_by_trace(&self, trace_id: Uuid) -> FlowResult<Vec<FlowContext<T>>> {
        self.select("trace_id = ?", vec![Some(trace_id.to_string())]).await
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> FlowResult<Vec<FlowContext<T>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let clause = format!("id IN ({placeholders})");
        self.select(&clause, ids.iter().map(|id| Some(id.to_string())).collect())
            .await
    }
}

fn column<T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>>(
    row: &SqliteRow,
    name: &str,
) -> FlowResult<T> {
    row.try_get(name)
        .map_err(|e| FlowError::Storage(format!("column {name}: {e}")))
}

fn parse_uuid(value: &str) -> FlowResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| FlowError::Storage(format!("invalid uuid '{value}': {e}")))
}

fn parse_time(value: &str) -> FlowResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FlowError::Storage(format!("invalid timestamp '{value}': {e}")))
}

fn context_from_row<T: FlowData>(row: &SqliteRow) -> FlowResult<FlowContext<T>> {
    let status: String = column(row, "status")?;
    let data: String = column(row, "data")?;
    let to_batch: Option<String> = column(row, "to_batch")?;
    let previous: Option<String> = column(row, "previous")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(FlowContext {
        id: parse_uuid(&column::<String>(row, "id")?)?,
        stream_id: column(row, "stream_id")?,
        trace_id: parse_uuid(&column::<String>(row, "trace_id")?)?,
        position: column(row, "position")?,
        status: status.parse().map_err(FlowError::Storage)?,
        data: serde_json::from_str(&data)?,
        to_batch: to_batch.as_deref().map(parse_uuid).transpose()?,
        previous: previous.as_deref().map(parse_uuid).transpose()?,
        error: column(row, "error")?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

/// Retry record store; due times are kept as epoch milliseconds.
#[derive(Debug, Clone)]
pub struct SqliteRetryRepo {
    pool: SqlitePool,
}

impl SqliteRetryRepo {
    /// Connects and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Storage`] on connection or schema failure.
    pub async fn connect(database_url: &str) -> FlowResult<Self> {
        Self::from_pool(connect_pool(database_url).await?).await
    }

    /// Wraps an existing pool and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Storage`] on schema failure.
    pub async fn from_pool(pool: SqlitePool) -> FlowResult<Self> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS flow_retries (
                batch_id TEXT PRIMARY KEY,
                stream_id TEXT NOT NULL,
                position TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                next_retry_at INTEGER NOT NULL,
                last_error TEXT
            )
            ",
        )
        .execute(&pool)
        .await
        .map_err(storage("schema init"))?;
        Ok(Self { pool })
    }
}

fn retry_from_row(row: &SqliteRow) -> FlowResult<RetryRecord> {
    let next_retry_at: i64 = column(row, "next_retry_at")?;
    let retry_count: i64 = column(row, "retry_count")?;
    Ok(RetryRecord {
        batch_id: parse_uuid(&column::<String>(row, "batch_id")?)?,
        stream_id: column(row, "stream_id")?,
        position: column(row, "position")?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| FlowError::Storage(format!("invalid retry count {retry_count}")))?,
        next_retry_at: DateTime::from_timestamp_millis(next_retry_at)
            .ok_or_else(|| FlowError::Storage(format!("invalid retry time {next_retry_at}")))?,
        last_error: column(row, "last_error")?,
    })
}

#[async_trait]
impl RetryRepo for SqliteRetryRepo {
    async fn get_by_id(&self, batch_id: Uuid) -> FlowResult<Option<RetryRecord>> {
        let row = sqlx::query("SELECT * FROM flow_retries WHERE batch_id = ?")
            .bind(batch_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("select retry"))?;
        row.as_ref().map(retry_from_row).transpose()
    }

    async fn increment(&self, record: RetryRecord) -> FlowResult<u32> {
        let row = sqlx::query(
            r"
            INSERT INTO flow_retries
                (batch_id, stream_id, position, retry_count, next_retry_at, last_error)
            VALUES (?, ?, ?, 1, ?, ?)
            ON CONFLICT (batch_id) DO UPDATE
               SET retry_count = retry_count + 1,
                   next_retry_at = excluded.next_retry_at,
                   last_error = excluded.last_error
            RETURNING retry_count
            ",
        )
        .bind(record.batch_id.to_string())
        .bind(&record.stream_id)
        .bind(&record.position)
        .bind(record.next_retry_at.timestamp_millis())
        .bind(record.last_error.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(storage("increment retry"))?;
        let count: i64 = column(&row, "retry_count")?;
        u32::try_from(count).map_err(|_| FlowError::Storage(format!("invalid retry count {count}")))
    }

    async fn delete(&self, batch_id: Uuid) -> FlowResult<usize> {
        let result = sqlx::query("DELETE FROM flow_retries WHERE batch_id = ?")
            .bind(batch_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage("delete retry"))?;
        affected_rows(&result)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> FlowResult<Vec<RetryRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM flow_retries WHERE next_retry_at <= ? ORDER BY next_retry_at LIMIT ?",
        )
        .bind(now.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("select due retries"))?;
        rows.iter().map(retry_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance_tests;
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_context_repo_conformance() {
        let repo: SqliteContextRepo<Value> =
            SqliteContextRepo::connect("sqlite::memory:").await.unwrap();
        conformance_tests::context_repo_suite(&repo).await;
    }

    #[tokio::test]
    async fn test_retry_repo_conformance() {
        let repo = SqliteRetryRepo::connect("sqlite::memory:").await.unwrap();
        conformance_tests::retry_repo_suite(&repo).await;
    }

    #[tokio::test]
    async fn test_repos_share_a_pool() {
        let pool = connect_pool("sqlite::memory:").await.unwrap();
        let contexts: SqliteContextRepo<Value> =
            SqliteContextRepo::from_pool(pool.clone()).await.unwrap();
        let retries = SqliteRetryRepo::from_pool(pool).await.unwrap();

        let ctx = FlowContext::new("s:1", Uuid::new_v4(), "a", json!({"k": [1, 2]}));
        contexts.save(&[ctx.clone()]).await.unwrap();
        retries
            .increment(RetryRecord::new(Uuid::new_v4(), "s:1", "a"))
            .await
            .unwrap();

        let loaded = contexts.find_by_ids(&[ctx.id]).await.unwrap();
        assert_eq!(loaded[0].data, json!({"k": [1, 2]}));
        assert_eq!(loaded[0].created_at.timestamp_micros(), ctx.created_at.timestamp_micros());
    }
}
