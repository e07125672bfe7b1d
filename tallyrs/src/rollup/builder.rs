//! Rollup SQL generation and refresh.

use serde_json::Value;
use tracing::{debug, error, info};

use crate::backends::{TableStats, Warehouse};
use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::expression::ExpressionCompiler;
use crate::formula::{base_metric_expr, base_metric_input};
use crate::optimizer::{mapping_for, OptimizedSourceConfig};
use crate::registry::SchemaRegistry;
use crate::schema::{Aggregation, BaseMetric, DimensionKind};
use crate::sql_ast::{SelectItem, SelectQuery, SqlBinaryOperator, SqlExpr, SqlRenderer, TableRef};

use super::{flagged_column, RollupDefinition, RollupMetric};

/// Builds the materialization statement for a rollup.
///
/// Reads from the optimized source when one is given and ready, so that
/// multi-column distinct metrics can count its surrogate key column.
pub struct RollupBuilder<'a> {
    registry: &'a SchemaRegistry,
    dialect: &'a dyn Dialect,
    optimized: Option<&'a OptimizedSourceConfig>,
}

impl<'a> RollupBuilder<'a> {
    pub fn new(registry: &'a SchemaRegistry, dialect: &'a dyn Dialect) -> Self {
        Self {
            registry,
            dialect,
            optimized: None,
        }
    }

    pub fn with_optimized_source(mut self, optimized: Option<&'a OptimizedSourceConfig>) -> Self {
        self.optimized = optimized.filter(|o| o.build.is_ready());
        self
    }

    pub fn source_table(&self) -> &str {
        match self.optimized {
            Some(opt) => &opt.optimized_table,
            None => self.registry.source_table(),
        }
    }

    pub fn select_query(&self, definition: &RollupDefinition) -> Result<SelectQuery> {
        let mut query = SelectQuery {
            from: TableRef {
                name: self.source_table().to_string(),
            },
            ..Default::default()
        };

        for dim_id in &definition.dimensions {
            let expr = match self.registry.dimension(dim_id) {
                Some(DimensionKind::Column(dim)) => SqlExpr::column(dim.column_name.clone()),
                Some(DimensionKind::Calculated(dim)) => {
                    let compiled = ExpressionCompiler::new(self.dialect).compile(&dim.sql_expression)?;
                    SqlExpr::nested(SqlExpr::Raw(compiled.sql))
                }
                None => {
                    return Err(TallyError::SchemaValidation(format!(
                        "rollup {} references unknown dimension {dim_id}",
                        definition.id
                    )))
                }
            };
            query.select.push(SelectItem {
                expr: expr.clone(),
                alias: Some(dim_id.clone()),
            });
            query.group_by.push(expr);
        }

        for rollup_metric in &definition.metrics {
            let Some(metric) = self.registry.base_metric(&rollup_metric.metric_id) else {
                return Err(TallyError::SchemaValidation(format!(
                    "rollup {} references {}, which is not a base metric",
                    definition.id, rollup_metric.metric_id
                )));
            };
            let input = self.metric_input(metric);
            query.select.push(SelectItem {
                expr: match &input {
                    Some(key) => SqlExpr::aggregate(metric.aggregation, key.clone()),
                    None => base_metric_expr(metric),
                },
                alias: Some(metric.id.clone()),
            });
            if rollup_metric.include_conditional {
                let input = input.unwrap_or_else(|| base_metric_input(metric));
                query.select.push(SelectItem {
                    expr: flagged_aggregate(metric.aggregation, input, rollup_metric)?,
                    alias: Some(flagged_column(&metric.id)),
                });
            }
        }
        Ok(query)
    }

    /// `CREATE OR REPLACE TABLE <target> AS SELECT ...`.
    pub fn build_sql(&self, definition: &RollupDefinition) -> Result<String> {
        let select_sql = SqlRenderer::new(self.dialect).render_select(&self.select_query(definition)?);
        Ok(self
            .dialect
            .render_create_table_as(&definition.target_table_name, &select_sql, None, &[]))
    }

    /// Surrogate key column replacing a composite identity, when one is materialized.
    fn metric_input(&self, metric: &BaseMetric) -> Option<SqlExpr> {
        if !metric.is_composite() {
            return None;
        }
        let optimized = self.optimized?;
        mapping_for(&optimized.key_mappings, &metric.source_columns)
            .map(|m| SqlExpr::column(m.key_column_name.clone()))
    }
}

fn flagged_aggregate(
    aggregation: Aggregation,
    input: SqlExpr,
    metric: &RollupMetric,
) -> Result<SqlExpr> {
    let flag = metric
        .flag_column
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            TallyError::SchemaValidation(format!(
                "metric {} includes a conditional variant but names no flag column",
                metric.metric_id
            ))
        })?;
    let condition = SqlExpr::binary(SqlBinaryOperator::Eq, SqlExpr::column(flag), SqlExpr::int(1));
    let when = |otherwise: SqlExpr| SqlExpr::Case {
        branches: vec![(condition.clone(), input.clone())],
        else_expr: Box::new(otherwise),
    };
    Ok(match aggregation {
        Aggregation::Sum => SqlExpr::aggregate(aggregation, when(SqlExpr::int(0))),
        Aggregation::Count => SqlExpr::CountIf(Box::new(condition.clone())),
        Aggregation::Avg
        | Aggregation::Min
        | Aggregation::Max
        | Aggregation::CountDistinct
        | Aggregation::ApproxCountDistinct => {
            SqlExpr::aggregate(aggregation, when(SqlExpr::Literal(Value::Null)))
        }
    })
}

/// Rebuild `definition`'s table and record the outcome on it.
///
/// SQL generation errors are returned before anything is executed and leave the
/// status alone; execution failures mark the rollup `error` and come back as
/// [`TallyError::WarehouseExecution`].
pub async fn refresh_rollup(
    definition: &mut RollupDefinition,
    registry: &SchemaRegistry,
    warehouse: &dyn Warehouse,
    optimized: Option<&OptimizedSourceConfig>,
) -> Result<TableStats> {
    let sql = RollupBuilder::new(registry, warehouse.dialect())
        .with_optimized_source(optimized)
        .build_sql(definition)?;

    definition.build.mark_building();
    info!(rollup = %definition.id, target = %definition.target_table_name, "refreshing rollup");
    debug!(rollup = %definition.id, sql = %sql, "rollup statement");

    let result = async {
        warehouse.execute(&sql).await?;
        warehouse.table_stats(&definition.target_table_name).await
    }
    .await;

    match result {
        Ok(stats) => {
            definition.build.mark_ready(stats);
            info!(
                rollup = %definition.id,
                rows = stats.row_count,
                bytes = ?stats.size_bytes,
                "rollup ready"
            );
            Ok(stats)
        }
        Err(err) => {
            let err = err.into_warehouse();
            error!(rollup = %definition.id, error = %err, "rollup refresh failed");
            definition.build.mark_failed(err.to_string());
            Err(err)
        }
    }
}
