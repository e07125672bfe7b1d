//! BigQuery dialect implementation.

use crate::sql_ast::Function;

use super::{grain_to_str, Dialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct BigQueryDialect;

impl Dialect for BigQueryDialect {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn quote_ident(&self, ident: &str) -> String {
        // BigQuery uses backticks for identifiers
        format!("`{}`", ident.replace('`', "\\`"))
    }

    fn qualify_table(&self, table: &str) -> String {
        // `project.dataset.table` is a single quoted path in BigQuery
        self.quote_ident(table)
    }

    fn render_count_if(&self, condition: &str) -> String {
        format!("COUNTIF({condition})")
    }

    fn render_literal(&self, value: &serde_json::Value) -> String {
        // BigQuery escapes quotes with a backslash rather than doubling them
        match value {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => format!("'{}'", bq_escape(s)),
            serde_json::Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            serde_json::Value::Object(_) => format!("'{}'", bq_escape(&value.to_string())),
        }
    }

    fn render_create_table_as(
        &self,
        target: &str,
        select_sql: &str,
        partition_by: Option<&str>,
        cluster_by: &[String],
    ) -> String {
        let mut sql = format!("CREATE OR REPLACE TABLE {}", self.qualify_table(target));
        if let Some(col) = partition_by {
            sql.push_str(&format!(" PARTITION BY {}", self.quote_ident(col)));
        }
        if !cluster_by.is_empty() {
            // BigQuery allows at most four clustering columns
            let cols: Vec<String> = cluster_by
                .iter()
                .take(4)
                .map(|c| self.quote_ident(c))
                .collect();
            sql.push_str(&format!(" CLUSTER BY {}", cols.join(", ")));
        }
        sql.push_str(&format!(" AS {select_sql}"));
        sql
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String {
        match func {
            Function::DateDiff { unit } => {
                let unit_str = grain_to_str(unit).to_uppercase();
                match args.as_slice() {
                    // BigQuery: DATE_DIFF(end, start, DAY)
                    [start, end] => format!("DATE_DIFF({end}, {start}, {unit_str})"),
                    _ => "NULL".to_string(),
                }
            }
            Function::Concat => format!("CONCAT({})", args.join(", ")),
            Function::CastToString => match args.as_slice() {
                [expr] => format!("CAST({expr} AS STRING)"),
                _ => "NULL".to_string(),
            },
            Function::Replace => format!("REPLACE({})", args.join(", ")),

            // === Null Handling ===
            Function::Coalesce => format!("COALESCE({})", args.join(", ")),
            Function::IfNull => format!("IFNULL({})", args.join(", ")),
            Function::NullIf => match args.as_slice() {
                [expr1, expr2] => format!("NULLIF({expr1}, {expr2})"),
                _ => "NULL".to_string(),
            },

            // === Math Functions ===
            Function::SafeDivide => match args.as_slice() {
                // BigQuery has native SAFE_DIVIDE
                [left, right] => format!("SAFE_DIVIDE({left}, {right})"),
                _ => "NULL".to_string(),
            },
            Function::Greatest => format!("GREATEST({})", args.join(", ")),
            Function::Least => format!("LEAST({})", args.join(", ")),
            Function::Abs => format!("ABS({})", args.join(", ")),
            Function::Ceil => format!("CEIL({})", args.join(", ")),
            Function::Floor => format!("FLOOR({})", args.join(", ")),
            Function::Round => match args.as_slice() {
                [expr, decimals] => format!("ROUND({expr}, {decimals})"),
                [expr] => format!("ROUND({expr})"),
                _ => "NULL".to_string(),
            },
            Function::Power => match args.as_slice() {
                [base, exp] => format!("POWER({base}, {exp})"),
                _ => "NULL".to_string(),
            },
            Function::Sqrt => format!("SQRT({})", args.join(", ")),
            Function::Ln => format!("LN({})", args.join(", ")),
            Function::Log10 => format!("LOG10({})", args.join(", ")),
            Function::Exp => format!("EXP({})", args.join(", ")),
            Function::Sign => format!("SIGN({})", args.join(", ")),
        }
    }
}

fn bq_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
