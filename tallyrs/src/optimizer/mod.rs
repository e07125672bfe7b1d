//! Composite-key optimizer.
//!
//! Finds multi-column distinct identities in compiled metrics and materializes
//! each as a single surrogate column in an "optimized source" copy of the table.

mod cluster;
pub mod pattern;
mod source;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dialect::Dialect;
use crate::formula::{base_metric_expr, FormulaCompiler};
use crate::registry::SchemaRegistry;
use crate::sql_ast::SqlExpr;

pub use cluster::detect_cluster_columns;
pub use source::{
    find_missing_partitions, OptimizedSourceConfig, RefreshMode, RefreshSummary, StalenessReport,
};

pub const DEFAULT_KEY_PREFIX: &str = "_key_";

/// A surrogate key column standing in for one multi-column identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeKeyMapping {
    pub key_column_name: String,
    /// Sorted, lower-cased, without duplicates.
    pub source_columns: Vec<String>,
    /// Metrics whose SQL contains this identity, sorted.
    pub metric_ids: Vec<String>,
}

/// Sorted, lower-cased, de-duplicated column set.
pub fn normalize_columns<S: AsRef<str>>(columns: &[S]) -> Vec<String> {
    let mut cols: Vec<String> = columns
        .iter()
        .map(|c| c.as_ref().trim().to_lowercase())
        .collect();
    cols.sort();
    cols.dedup();
    cols
}

/// `_key_` followed by the normalized columns joined with `_`.
///
/// Depends only on the set of columns, so declaration order and case never matter.
pub fn generate_key_column_name<S: AsRef<str>>(columns: &[S]) -> String {
    generate_key_column_name_with_prefix(columns, DEFAULT_KEY_PREFIX)
}

pub fn generate_key_column_name_with_prefix<S: AsRef<str>>(columns: &[S], prefix: &str) -> String {
    format!("{prefix}{}", normalize_columns(columns).join("_"))
}

/// Scan every metric for composite identities and collapse equal column sets.
///
/// Calculated metrics are compiled against the snapshot and their expression
/// trees walked; metrics that no longer compile are skipped.
pub fn analyze_composite_keys(
    registry: &SchemaRegistry,
    dialect: &dyn Dialect,
    key_prefix: &str,
) -> Vec<CompositeKeyMapping> {
    let mut found: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();

    for metric in registry.base_metrics() {
        collect(&base_metric_expr(metric), &metric.id, &mut found);
    }

    let compiler = FormulaCompiler::new(registry, dialect);
    for metric in registry.calculated_metrics() {
        match compiler.compile(&metric.formula, Some(&metric.id)) {
            Ok(compiled) => collect(&compiled.expr, &metric.id, &mut found),
            Err(err) => {
                warn!(metric = %metric.id, error = %err, "skipping metric in composite-key scan")
            }
        }
    }

    let mappings: Vec<CompositeKeyMapping> = found
        .into_iter()
        .map(|(columns, mut metric_ids)| {
            metric_ids.sort();
            metric_ids.dedup();
            CompositeKeyMapping {
                key_column_name: generate_key_column_name_with_prefix(&columns, key_prefix),
                source_columns: columns,
                metric_ids,
            }
        })
        .collect();
    debug!(table = registry.table(), mappings = mappings.len(), "analyzed composite keys");
    mappings
}

fn collect(expr: &SqlExpr, metric_id: &str, found: &mut BTreeMap<Vec<String>, Vec<String>>) {
    expr.walk(&mut |node| {
        if let Some(columns) = pattern::match_composite_key(node) {
            let columns = normalize_columns(&columns);
            if columns.len() >= 2 {
                found
                    .entry(columns)
                    .or_default()
                    .push(metric_id.to_string());
            }
        }
    });
}

/// Mapping whose column set equals `columns`, if one exists.
pub fn mapping_for<'m, S: AsRef<str>>(
    mappings: &'m [CompositeKeyMapping],
    columns: &[S],
) -> Option<&'m CompositeKeyMapping> {
    let wanted = normalize_columns(columns);
    mappings.iter().find(|m| m.source_columns == wanted)
}
