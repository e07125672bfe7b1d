//! Rollups: pre-aggregated tables grouped by a fixed set of dimensions.

mod builder;
mod catalog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::BuildState;

pub use builder::{refresh_rollup, RollupBuilder};
pub use catalog::{RollupCatalog, RollupUpdate};

/// Suffix of the extra column holding the flag-filtered variant of a metric.
pub const FLAGGED_SUFFIX: &str = "_flagged";

pub fn flagged_column(metric_id: &str) -> String {
    format!("{metric_id}{FLAGGED_SUFFIX}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupMetric {
    pub metric_id: String,
    /// Also store `<metric_id>_flagged`, restricted to rows where `flag_column = 1`.
    #[serde(default)]
    pub include_conditional: bool,
    #[serde(default)]
    pub flag_column: Option<String>,
}

impl RollupMetric {
    pub fn new(metric_id: impl Into<String>) -> Self {
        Self {
            metric_id: metric_id.into(),
            include_conditional: false,
            flag_column: None,
        }
    }

    pub fn with_flag(metric_id: impl Into<String>, flag_column: impl Into<String>) -> Self {
        Self {
            metric_id: metric_id.into(),
            include_conditional: true,
            flag_column: Some(flag_column.into()),
        }
    }

    /// Output columns this metric contributes to the rollup table.
    pub fn output_columns(&self) -> Vec<String> {
        let mut cols = vec![self.metric_id.clone()];
        if self.include_conditional {
            cols.push(flagged_column(&self.metric_id));
        }
        cols
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupDefinition {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Dimension ids; the GROUP BY of the rollup table.
    pub dimensions: Vec<String>,
    pub metrics: Vec<RollupMetric>,
    /// Filled in from the source table when left empty.
    #[serde(default)]
    pub target_table_name: String,
    #[serde(flatten)]
    pub build: BuildState,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RollupDefinition {
    pub fn new(
        id: impl Into<String>,
        dimensions: &[&str],
        metrics: Vec<RollupMetric>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            description: None,
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            metrics,
            target_table_name: String::new(),
            build: BuildState::default(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Metric columns queries can read from this rollup, flagged variants included.
    pub fn available_metrics(&self) -> Vec<String> {
        self.metrics.iter().flat_map(|m| m.output_columns()).collect()
    }

    pub fn metric(&self, metric_id: &str) -> Option<&RollupMetric> {
        self.metrics.iter().find(|m| m.metric_id == metric_id)
    }

    /// Whether a table built from `other` is the table this definition describes.
    pub fn same_layout(&self, other: &RollupDefinition) -> bool {
        self.dimensions == other.dimensions
            && self.metrics == other.metrics
            && self.target_table_name == other.target_table_name
    }
}

pub(crate) fn default_target_table(source_table: &str, rollup_id: &str) -> String {
    format!("{source_table}_rollup_{rollup_id}")
}
