//! DuckDB backend implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::config::DuckDbConfig;
use crate::dialect::{Dialect, DuckDbDialect};
use crate::error::{Result, TallyError};
use crate::executor::{ColumnMeta, QueryResult};
use crate::schema_cache::{ColumnSchema, TableSchema};

use super::Warehouse;

/// DuckDB connection implementing the warehouse trait.
#[derive(Clone)]
pub struct DuckDbConnection {
    database_path: PathBuf,
    dialect: DuckDbDialect,
    limiter: Arc<Semaphore>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbConnection {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_config(path, &DuckDbConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(path: P, config: &DuckDbConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        tracing::info!(
            path = %path.display(),
            max_concurrency = config.max_concurrency,
            "creating DuckDB connection"
        );
        Self {
            database_path: path,
            dialect: DuckDbDialect,
            limiter: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        self.limiter
            .acquire()
            .await
            .map_err(|e| TallyError::WarehouseExecution(format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            let pool_size = guard.len();
            drop(guard);
            tracing::trace!(pool_remaining = pool_size, "reusing pooled DuckDB connection");
            return Ok(conn);
        }
        drop(guard);
        tracing::debug!(path = %self.database_path.display(), "opening new DuckDB connection");
        duckdb::Connection::open(self.database_path.clone())
            .map_err(|e| TallyError::WarehouseExecution(format!("open duckdb: {e}")))
    }

    /// Run `work` on a pooled connection off the async runtime.
    ///
    /// The connection goes back to the pool only when `work` succeeds.
    async fn with_connection<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&duckdb::Connection) -> Result<T> + Send + 'static,
    {
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let (value, conn) = tokio::task::spawn_blocking(move || -> Result<(T, duckdb::Connection)> {
            let value = work(&conn)?;
            Ok((value, conn))
        })
        .await
        .map_err(|e| TallyError::WarehouseExecution(format!("task join error: {e}")))?
        .map_err(TallyError::into_warehouse)?;

        self.pool.lock().await.push(conn);
        Ok(value)
    }
}

fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_uppercase();
    ["SELECT", "WITH", "PRAGMA", "DESCRIBE", "SHOW", "EXPLAIN"]
        .iter()
        .any(|kw| head.starts_with(kw))
}

#[async_trait]
impl Warehouse for DuckDbConnection {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            let start = Instant::now();
            if !returns_rows(&sql) {
                conn.execute_batch(&sql)?;
                tracing::debug!(ms = start.elapsed().as_millis(), "duckdb execute statement");
                return Ok(QueryResult::default());
            }

            let mut stmt = conn.prepare(&sql)?;
            let mut rows_iter = stmt.query([])?;
            let stmt_ref = rows_iter
                .as_ref()
                .ok_or_else(|| TallyError::WarehouseExecution("statement missing".to_string()))?;
            let mut column_names = Vec::new();
            for idx in 0..stmt_ref.column_count() {
                let name = stmt_ref
                    .column_name(idx)
                    .map_err(|e| TallyError::WarehouseExecution(e.to_string()))?;
                column_names.push(name.to_string());
            }
            let mut rows = Vec::new();
            while let Some(row) = rows_iter.next()? {
                let mut map = serde_json::Map::new();
                for (idx, name) in column_names.iter().enumerate() {
                    let value = crate::executor::duck_value_to_json(row.get_ref(idx)?.to_owned());
                    map.insert(name.clone(), value);
                }
                rows.push(map);
            }

            let columns: Vec<_> = column_names
                .into_iter()
                .map(|name| ColumnMeta { name })
                .collect();
            tracing::debug!(
                rows = rows.len(),
                columns = columns.len(),
                ms = start.elapsed().as_millis(),
                "duckdb execute query"
            );
            Ok(QueryResult { columns, rows })
        })
        .await
    }

    async fn dry_run(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        // Preparing binds names and types without running anything
        self.with_connection(move |conn| {
            conn.prepare(&sql)?;
            Ok(())
        })
        .await
    }

    async fn fetch_schema(&self, table: &str) -> Result<TableSchema> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            let start = Instant::now();
            let pragma_sql = format!("PRAGMA table_info('{}')", table.replace('\'', "''"));
            let mut stmt = conn.prepare(&pragma_sql)?;
            let mut rows = stmt.query([])?;
            let mut columns = Vec::new();
            while let Some(row) = rows.next()? {
                let name: String = row.get("name")?;
                let data_type: String = row.get("type")?;
                let not_null: bool = row.get("notnull")?;
                columns.push(ColumnSchema {
                    name,
                    data_type,
                    nullable: !not_null,
                });
            }
            tracing::debug!(
                table = table.as_str(),
                columns = columns.len(),
                ms = start.elapsed().as_millis(),
                "duckdb fetch_schema"
            );
            Ok(TableSchema { columns })
        })
        .await
    }
}
