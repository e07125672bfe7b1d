//! Warehouse backends.
//!
//! Each backend is implemented in its own file and gated behind a feature flag.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::executor::QueryResult;
use crate::schema_cache::TableSchema;

/// Size of a materialized table as reported by the warehouse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub row_count: u64,
    /// Not every backend reports storage size.
    pub size_bytes: Option<u64>,
}

/// The execution collaborator: everything the core needs from a warehouse.
///
/// Tally only ever hands SQL text to a warehouse and reads back scalar counts
/// or short lists; result sets are never interpreted beyond that.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync);

    async fn execute(&self, sql: &str) -> Result<QueryResult>;

    /// Compile `sql` on the engine without running it.
    async fn dry_run(&self, sql: &str) -> Result<()>;

    async fn fetch_schema(&self, table: &str) -> Result<TableSchema>;

    async fn get_columns(&self, table: &str) -> Result<HashSet<String>> {
        Ok(self.fetch_schema(table).await?.column_names())
    }

    async fn approx_cardinality(&self, table: &str, column: &str) -> Result<u64> {
        let dialect = self.dialect();
        let sql = format!(
            "SELECT APPROX_COUNT_DISTINCT({}) AS cardinality FROM {}",
            dialect.quote_ident(column),
            dialect.qualify_table(table)
        );
        self.execute(&sql).await?.scalar_u64().ok_or_else(|| {
            TallyError::WarehouseExecution(format!("no cardinality returned for {table}.{column}"))
        })
    }

    async fn table_stats(&self, table: &str) -> Result<TableStats> {
        let sql = format!(
            "SELECT COUNT(*) AS row_count FROM {}",
            self.dialect().qualify_table(table)
        );
        let row_count = self.execute(&sql).await?.scalar_u64().unwrap_or(0);
        Ok(TableStats {
            row_count,
            size_bytes: None,
        })
    }
}

#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbConnection;

#[cfg(feature = "bigquery")]
mod bigquery;
#[cfg(feature = "bigquery")]
pub use bigquery::BigQueryConnection;
