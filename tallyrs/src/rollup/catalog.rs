use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Result, TallyError};
use crate::formula::DependencyGraph;
use crate::registry::SchemaRegistry;
use crate::schema::check_id;

use super::{default_target_table, RollupDefinition, RollupMetric};

/// Partial update of a rollup; `None` leaves the field as it is.
#[derive(Debug, Clone, Default)]
pub struct RollupUpdate {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub dimensions: Option<Vec<String>>,
    pub metrics: Option<Vec<RollupMetric>>,
    pub target_table_name: Option<String>,
}

/// Rollup definitions of one table, validated against its registry.
#[derive(Debug, Clone, Default)]
pub struct RollupCatalog {
    rollups: Vec<RollupDefinition>,
}

impl RollupCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap definitions loaded from storage without re-validating them.
    pub fn from_definitions(rollups: Vec<RollupDefinition>) -> Self {
        Self { rollups }
    }

    pub fn into_definitions(self) -> Vec<RollupDefinition> {
        self.rollups
    }

    pub fn list(&self) -> &[RollupDefinition] {
        &self.rollups
    }

    pub fn get(&self, id: &str) -> Option<&RollupDefinition> {
        self.rollups.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RollupDefinition> {
        self.rollups.iter_mut().find(|r| r.id == id)
    }

    pub fn create(
        &mut self,
        registry: &SchemaRegistry,
        mut definition: RollupDefinition,
    ) -> Result<&RollupDefinition> {
        check_id(&definition.id)?;
        if self.get(&definition.id).is_some() {
            return Err(TallyError::SchemaValidation(format!(
                "rollup {} already exists",
                definition.id
            )));
        }
        validate_shape(registry, &definition.dimensions, &definition.metrics)?;

        if definition.target_table_name.trim().is_empty() {
            definition.target_table_name =
                default_target_table(registry.source_table(), &definition.id);
        }
        let now = Utc::now();
        definition.created_at = Some(now);
        definition.updated_at = Some(now);
        info!(
            rollup = %definition.id,
            target = %definition.target_table_name,
            dimensions = ?definition.dimensions,
            "created rollup"
        );
        self.rollups.push(definition);
        Ok(&self.rollups[self.rollups.len() - 1])
    }

    /// Apply `update`; changing dimensions or metrics marks a built rollup stale.
    pub fn update(
        &mut self,
        registry: &SchemaRegistry,
        id: &str,
        update: RollupUpdate,
    ) -> Result<&RollupDefinition> {
        let Some(index) = self.rollups.iter().position(|r| r.id == id) else {
            return Err(TallyError::unknown(id));
        };
        let current = &self.rollups[index];
        let dimensions = update
            .dimensions
            .unwrap_or_else(|| current.dimensions.clone());
        let metrics = update.metrics.unwrap_or_else(|| current.metrics.clone());
        validate_shape(registry, &dimensions, &metrics)?;

        let shape_changed = dimensions != current.dimensions || metrics != current.metrics;
        let rollup = &mut self.rollups[index];
        if let Some(name) = update.display_name {
            rollup.display_name = Some(name);
        }
        if let Some(description) = update.description {
            rollup.description = Some(description);
        }
        if let Some(target) = update.target_table_name.filter(|t| !t.trim().is_empty()) {
            rollup.target_table_name = target;
        }
        rollup.dimensions = dimensions;
        rollup.metrics = metrics;
        if shape_changed {
            rollup.build.mark_stale();
            debug!(rollup = %id, status = ?rollup.build.status, "rollup shape changed");
        }
        rollup.updated_at = Some(Utc::now());
        Ok(rollup)
    }

    pub fn delete(&mut self, id: &str) -> Result<RollupDefinition> {
        let Some(index) = self.rollups.iter().position(|r| r.id == id) else {
            return Err(TallyError::unknown(id));
        };
        info!(rollup = %id, "deleted rollup");
        Ok(self.rollups.remove(index))
    }

    /// Mark every rollup storing one of `metric_ids` stale, returning their ids.
    pub fn mark_stale_for_metrics(&mut self, metric_ids: &[&str]) -> Vec<String> {
        let mut marked = Vec::new();
        for rollup in &mut self.rollups {
            if rollup
                .metrics
                .iter()
                .any(|m| metric_ids.contains(&m.metric_id.as_str()))
            {
                rollup.build.mark_stale();
                marked.push(rollup.id.clone());
            }
        }
        marked
    }
}

fn validate_shape(
    registry: &SchemaRegistry,
    dimensions: &[String],
    metrics: &[RollupMetric],
) -> Result<()> {
    if dimensions.is_empty() {
        return Err(TallyError::SchemaValidation(
            "a rollup needs at least one dimension".to_string(),
        ));
    }
    if metrics.is_empty() {
        return Err(TallyError::SchemaValidation(
            "a rollup needs at least one metric".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for dim in dimensions {
        if !seen.insert(dim.as_str()) {
            return Err(TallyError::SchemaValidation(format!(
                "dimension {dim} is listed twice"
            )));
        }
        if registry.dimension(dim).is_none() {
            return Err(TallyError::SchemaValidation(format!(
                "unknown dimension {dim}"
            )));
        }
    }

    let mut seen = HashSet::new();
    for metric in metrics {
        let id = metric.metric_id.as_str();
        if !seen.insert(id) {
            return Err(TallyError::SchemaValidation(format!(
                "metric {id} is listed twice"
            )));
        }
        if registry.base_metric(id).is_none() {
            if registry.calculated_metric(id).is_some() {
                let bases: Vec<String> = DependencyGraph::build(registry)
                    .transitive_base_dependencies(id)
                    .into_iter()
                    .collect();
                return Err(TallyError::SchemaValidation(format!(
                    "{id} is a calculated metric; rollups store base metrics, add {} instead",
                    bases.join(", ")
                )));
            }
            return Err(TallyError::SchemaValidation(format!("unknown metric {id}")));
        }
        if metric.include_conditional
            && metric
                .flag_column
                .as_deref()
                .is_none_or(|c| c.trim().is_empty())
        {
            return Err(TallyError::SchemaValidation(format!(
                "metric {id} includes a conditional variant but names no flag column"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::TableStats;
    use crate::jobs::BuildStatus;
    use crate::schema::{Aggregation, BaseMetric, CalculatedMetric, DataType, Dimension, SchemaDocument};

    fn registry() -> SchemaRegistry {
        let mut doc = SchemaDocument::new("search", "proj.ds.search");
        doc.base_metrics = vec![
            BaseMetric::new("clicks", "clicks", Aggregation::Sum),
            BaseMetric::new("impressions", "impressions", Aggregation::Sum),
        ];
        doc.calculated_metrics = vec![CalculatedMetric::new("ctr", "{clicks} / {impressions}")];
        doc.dimensions = vec![
            Dimension::new("date", "date", DataType::Date),
            Dimension::new("country", "country", DataType::String),
        ];
        SchemaRegistry::from_document(doc).unwrap()
    }

    #[test]
    fn create_fills_in_target_table() {
        let reg = registry();
        let mut catalog = RollupCatalog::new();
        let created = catalog
            .create(
                &reg,
                RollupDefinition::new("daily", &["date"], vec![RollupMetric::new("clicks")]),
            )
            .unwrap();
        assert_eq!(created.target_table_name, "proj.ds.search_rollup_daily");
        assert_eq!(created.build.status, BuildStatus::Pending);
        assert!(created.created_at.is_some());
    }

    #[test]
    fn calculated_metrics_are_rejected_with_their_bases() {
        let reg = registry();
        let mut catalog = RollupCatalog::new();
        let err = catalog
            .create(
                &reg,
                RollupDefinition::new("daily", &["date"], vec![RollupMetric::new("ctr")]),
            )
            .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, TallyError::SchemaValidation(_)));
        assert!(msg.contains("clicks, impressions"), "{msg}");
    }

    #[test]
    fn rejects_unknown_ids_duplicates_and_missing_flags() {
        let reg = registry();
        let mut catalog = RollupCatalog::new();
        for def in [
            RollupDefinition::new("a", &["region"], vec![RollupMetric::new("clicks")]),
            RollupDefinition::new("b", &["date"], vec![RollupMetric::new("revenue")]),
            RollupDefinition::new("c", &["date", "date"], vec![RollupMetric::new("clicks")]),
            RollupDefinition::new(
                "d",
                &["date"],
                vec![RollupMetric {
                    metric_id: "clicks".to_string(),
                    include_conditional: true,
                    flag_column: None,
                }],
            ),
        ] {
            assert!(matches!(
                catalog.create(&reg, def),
                Err(TallyError::SchemaValidation(_))
            ));
        }
        catalog
            .create(
                &reg,
                RollupDefinition::new("daily", &["date"], vec![RollupMetric::new("clicks")]),
            )
            .unwrap();
        assert!(catalog
            .create(
                &reg,
                RollupDefinition::new("daily", &["date"], vec![RollupMetric::new("clicks")]),
            )
            .is_err());
    }

    #[test]
    fn changing_dimensions_marks_ready_rollup_stale() {
        let reg = registry();
        let mut catalog = RollupCatalog::new();
        catalog
            .create(
                &reg,
                RollupDefinition::new("daily", &["date"], vec![RollupMetric::new("clicks")]),
            )
            .unwrap();
        catalog.get_mut("daily").unwrap().build.mark_ready(TableStats {
            row_count: 3,
            size_bytes: None,
        });

        let renamed = catalog
            .update(
                &reg,
                "daily",
                RollupUpdate {
                    display_name: Some("Daily".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.build.status, BuildStatus::Ready);

        let widened = catalog
            .update(
                &reg,
                "daily",
                RollupUpdate {
                    dimensions: Some(vec!["date".to_string(), "country".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(widened.build.status, BuildStatus::Stale);
    }

    #[test]
    fn delete_unknown_is_an_error() {
        let mut catalog = RollupCatalog::new();
        assert!(matches!(
            catalog.delete("missing"),
            Err(TallyError::UnknownReference { .. })
        ));
    }
}
