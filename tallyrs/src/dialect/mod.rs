//! SQL dialect abstractions for different warehouse backends.
//!
//! Each dialect is implemented in its own file. Both ship unconditionally:
//! SQL previews do not need a live connection.

use crate::schema::Aggregation;
use crate::sql_ast::{Function, TimeGrain};

/// Dialects render identifiers and primitive expression pieces.
/// Expression tree walking lives in the renderer; the dialect
/// only maps logical constructs to SQL fragments.
pub trait Dialect {
    fn name(&self) -> &'static str;
    fn quote_ident(&self, ident: &str) -> String;
    /// Quote a possibly dotted table path part by part.
    fn qualify_table(&self, table: &str) -> String {
        table
            .split('.')
            .map(|part| self.quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }
    fn string_type(&self) -> &'static str {
        "STRING"
    }
    fn render_function(&self, func: &Function, args: Vec<String>) -> String;
    fn render_aggregation(&self, agg: &Aggregation, expr: &str) -> String {
        match agg {
            Aggregation::Sum => format!("SUM({expr})"),
            Aggregation::Count => format!("COUNT({expr})"),
            Aggregation::Avg => format!("AVG({expr})"),
            Aggregation::Min => format!("MIN({expr})"),
            Aggregation::Max => format!("MAX({expr})"),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {expr})"),
            Aggregation::ApproxCountDistinct => format!("APPROX_COUNT_DISTINCT({expr})"),
        }
    }
    fn render_count_if(&self, condition: &str) -> String {
        format!("COUNT(CASE WHEN {condition} THEN 1 END)")
    }
    fn render_literal(&self, value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            serde_json::Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            serde_json::Value::Object(_) => {
                format!("'{}'", value.to_string().replace('\'', "''"))
            }
        }
    }
    /// Full-replace materialization of `select_sql` into `target`.
    fn render_create_table_as(
        &self,
        target: &str,
        select_sql: &str,
        _partition_by: Option<&str>,
        _cluster_by: &[String],
    ) -> String {
        format!(
            "CREATE OR REPLACE TABLE {} AS {select_sql}",
            self.qualify_table(target)
        )
    }
}

/// Convert TimeGrain to SQL interval string.
pub(crate) fn grain_to_str(grain: &TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Day => "day",
    }
}

mod bigquery;
mod duckdb;

pub use bigquery::BigQueryDialect;
pub use duckdb::DuckDbDialect;
