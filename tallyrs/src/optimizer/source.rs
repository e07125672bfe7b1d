//! The optimized source: a copy of the raw table with surrogate key columns,
//! partitioned by date and clustered for the common group-bys.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::backends::Warehouse;
use crate::config::OptimizerConfig;
use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::jobs::BuildState;
use crate::sql_ast::{SelectItem, SelectQuery, SqlExpr, SqlRenderer, TableRef};

use super::pattern::composite_key_expr;
use super::CompositeKeyMapping;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedSourceConfig {
    pub source_table: String,
    pub optimized_table: String,
    pub partition_column: String,
    #[serde(default)]
    pub cluster_columns: Vec<String>,
    #[serde(default)]
    pub key_mappings: Vec<CompositeKeyMapping>,
    #[serde(flatten)]
    pub build: BuildState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// Rebuild the whole table.
    Full,
    /// Append partitions present in the source but missing from the copy.
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    /// What actually ran; an incremental request on a source that is not ready runs full.
    pub mode: RefreshMode,
    pub partitions_added: Vec<NaiveDate>,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StalenessReport {
    pub is_stale: bool,
    pub reasons: Vec<String>,
    pub source_max_date: Option<NaiveDate>,
    pub optimized_max_date: Option<NaiveDate>,
}

impl OptimizedSourceConfig {
    pub fn new(
        source_table: impl Into<String>,
        partition_column: impl Into<String>,
        config: &OptimizerConfig,
    ) -> Self {
        let source_table = source_table.into();
        Self {
            optimized_table: format!("{source_table}{}", config.table_suffix),
            source_table,
            partition_column: partition_column.into(),
            cluster_columns: Vec::new(),
            key_mappings: Vec::new(),
            build: BuildState::default(),
        }
    }

    /// Whether a table built from `other` matches this plan.
    pub fn same_plan(&self, other: &OptimizedSourceConfig) -> bool {
        self.optimized_table == other.optimized_table
            && self.partition_column == other.partition_column
            && self.cluster_columns == other.cluster_columns
            && self.key_mappings == other.key_mappings
    }

    fn select(&self) -> SelectQuery {
        let mut select = vec![SelectItem {
            expr: SqlExpr::Wildcard,
            alias: None,
        }];
        for mapping in &self.key_mappings {
            select.push(SelectItem {
                expr: composite_key_expr(&mapping.source_columns),
                alias: Some(mapping.key_column_name.clone()),
            });
        }
        SelectQuery {
            select,
            from: TableRef {
                name: self.source_table.clone(),
            },
            ..Default::default()
        }
    }

    /// `CREATE OR REPLACE TABLE` copy of the source plus one column per key mapping.
    pub fn full_refresh_sql(&self, dialect: &dyn Dialect) -> String {
        let select_sql = SqlRenderer::new(dialect).render_select(&self.select());
        dialect.render_create_table_as(
            &self.optimized_table,
            &select_sql,
            Some(self.partition_column.as_str()),
            &self.cluster_columns,
        )
    }

    /// `INSERT` of the given partitions only; `None` when there is nothing to add.
    pub fn incremental_sql(&self, dialect: &dyn Dialect, missing: &[NaiveDate]) -> Option<String> {
        if missing.is_empty() {
            return None;
        }
        let mut query = self.select();
        query.filters.push(SqlExpr::InList {
            expr: Box::new(SqlExpr::column(self.partition_column.clone())),
            list: missing.iter().copied().map(SqlExpr::Date).collect(),
            negated: false,
        });
        let select_sql = SqlRenderer::new(dialect).render_select(&query);
        Some(format!(
            "INSERT INTO {} {select_sql}",
            dialect.qualify_table(&self.optimized_table)
        ))
    }

    /// Compare against the mappings the registry implies today and the source's freshness.
    pub async fn check_staleness(
        &self,
        current_mappings: &[CompositeKeyMapping],
        warehouse: &dyn Warehouse,
    ) -> Result<StalenessReport> {
        let mut report = StalenessReport::default();
        if !self.build.is_ready() {
            report
                .reasons
                .push(format!("optimized source is {:?}", self.build.status).to_lowercase());
        }

        let materialized: BTreeSet<(&str, &[String])> = self
            .key_mappings
            .iter()
            .map(|m| (m.key_column_name.as_str(), m.source_columns.as_slice()))
            .collect();
        let wanted: BTreeSet<(&str, &[String])> = current_mappings
            .iter()
            .map(|m| (m.key_column_name.as_str(), m.source_columns.as_slice()))
            .collect();
        for (key, _) in wanted.difference(&materialized) {
            report.reasons.push(format!("key column {key} is not materialized"));
        }
        for (key, _) in materialized.difference(&wanted) {
            report.reasons.push(format!("key column {key} is no longer used"));
        }

        let dialect = warehouse.dialect();
        report.source_max_date =
            max_partition(warehouse, dialect, &self.source_table, &self.partition_column).await?;
        if self.build.is_ready() {
            report.optimized_max_date =
                max_partition(warehouse, dialect, &self.optimized_table, &self.partition_column)
                    .await?;
            if report.source_max_date > report.optimized_max_date {
                report.reasons.push(format!(
                    "source has data through {} but optimized source only through {}",
                    fmt_date(report.source_max_date),
                    fmt_date(report.optimized_max_date)
                ));
            }
        }

        report.is_stale = !report.reasons.is_empty();
        Ok(report)
    }

    /// Materialize the optimized source and record the outcome on `self.build`.
    ///
    /// On failure the previous table is left in place, the error is recorded and
    /// returned as a warehouse error.
    pub async fn refresh(
        &mut self,
        warehouse: &dyn Warehouse,
        mode: RefreshMode,
    ) -> Result<RefreshSummary> {
        // Appending needs a table built from the current plan
        let mode = match mode {
            RefreshMode::Incremental if !self.build.is_ready() => RefreshMode::Full,
            other => other,
        };
        self.build.mark_building();
        match self.run_refresh(warehouse, mode).await {
            Ok((summary, stats)) => {
                self.build.mark_ready(stats);
                info!(
                    table = %self.optimized_table,
                    mode = ?summary.mode,
                    partitions = summary.partitions_added.len(),
                    rows = summary.row_count,
                    "optimized source refreshed"
                );
                Ok(summary)
            }
            Err(err) => {
                let err = err.into_warehouse();
                error!(table = %self.optimized_table, error = %err, "optimized source refresh failed");
                self.build.mark_failed(err.to_string());
                Err(err)
            }
        }
    }

    async fn run_refresh(
        &self,
        warehouse: &dyn Warehouse,
        mode: RefreshMode,
    ) -> Result<(RefreshSummary, crate::backends::TableStats)> {
        let dialect = warehouse.dialect();
        let (mode, partitions_added) = match mode {
            RefreshMode::Incremental => {
                let missing = find_missing_partitions(
                    warehouse,
                    &self.source_table,
                    &self.optimized_table,
                    &self.partition_column,
                )
                .await?;
                if let Some(sql) = self.incremental_sql(dialect, &missing) {
                    debug!(sql = %sql, "incremental optimized source refresh");
                    warehouse.execute(&sql).await?;
                }
                (RefreshMode::Incremental, missing)
            }
            RefreshMode::Full => {
                let sql = self.full_refresh_sql(dialect);
                debug!(sql = %sql, "full optimized source refresh");
                warehouse.execute(&sql).await?;
                (RefreshMode::Full, Vec::new())
            }
        };
        let stats = warehouse.table_stats(&self.optimized_table).await?;
        Ok((
            RefreshSummary {
                mode,
                partitions_added,
                row_count: stats.row_count,
            },
            stats,
        ))
    }
}

/// Dates present in `source` but absent from `target`, ascending.
pub async fn find_missing_partitions(
    warehouse: &dyn Warehouse,
    source: &str,
    target: &str,
    partition_column: &str,
) -> Result<Vec<NaiveDate>> {
    let dialect = warehouse.dialect();
    let col = dialect.quote_ident(partition_column);
    let sql = format!(
        "SELECT DISTINCT CAST({col} AS {ty}) AS partition_date FROM {src} \
         WHERE {col} IS NOT NULL AND {col} NOT IN (SELECT DISTINCT {col} FROM {dst} WHERE {col} IS NOT NULL) \
         ORDER BY partition_date",
        ty = dialect.string_type(),
        src = dialect.qualify_table(source),
        dst = dialect.qualify_table(target),
    );
    let result = warehouse.execute(&sql).await?;
    let mut dates = result
        .column_strings("partition_date")
        .iter()
        .map(|s| parse_date(s))
        .collect::<Result<Vec<_>>>()?;
    dates.sort();
    dates.dedup();
    Ok(dates)
}

async fn max_partition(
    warehouse: &dyn Warehouse,
    dialect: &(dyn Dialect + Send + Sync),
    table: &str,
    partition_column: &str,
) -> Result<Option<NaiveDate>> {
    let sql = format!(
        "SELECT CAST(MAX({}) AS {}) AS max_date FROM {}",
        dialect.quote_ident(partition_column),
        dialect.string_type(),
        dialect.qualify_table(table)
    );
    let result = warehouse.execute(&sql).await?;
    match result.column_strings("max_date").first() {
        Some(s) => parse_date(s).map(Some),
        None => Ok(None),
    }
}

/// Accepts `YYYY-MM-DD` with an optional time part.
fn parse_date(raw: &str) -> Result<NaiveDate> {
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").map_err(|e| {
        TallyError::WarehouseExecution(format!("unexpected partition value '{raw}': {e}"))
    })
}

fn fmt_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.to_string())
        .unwrap_or_else(|| "(empty)".to_string())
}
