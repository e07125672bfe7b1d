//! Decide which table answers an aggregate query.
//!
//! A rollup can answer a query when it is built, groups by every requested
//! dimension and stores every requested metric. Distinct counts are the
//! exception: they cannot be re-aggregated, so they only come from a rollup
//! grouped by exactly the requested dimensions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::RouterConfig;
use crate::error::{Result, TallyError};
use crate::formula::DependencyGraph;
use crate::optimizer::OptimizedSourceConfig;
use crate::registry::SchemaRegistry;
use crate::rollup::{RollupDefinition, FLAGGED_SUFFIX};
use crate::schema::MetricKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(default)]
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    /// Dimension id to the values it is restricted to.
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub require_rollup: bool,
}

impl RouteRequest {
    pub fn new(dimensions: &[&str], metrics: &[&str]) -> Self {
        Self {
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, dimension: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.insert(dimension.into(), values);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSource {
    Raw,
    Optimized,
    Rollup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub use_rollup: bool,
    pub rollup_id: Option<String>,
    /// The rollup is finer than the request and its rows must be grouped again.
    pub needs_reaggregation: bool,
    pub reason: String,
    pub score: Option<i64>,
    pub source: RouteSource,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupCandidate {
    pub rollup_id: String,
    pub score: i64,
    pub needs_reaggregation: bool,
}

/// The metric ids a request needs from storage, with distinctness resolved.
struct Resolved {
    dimensions: BTreeSet<String>,
    /// Requested metric ids; calculated metrics replaced by their base metrics.
    metrics: BTreeSet<String>,
    has_distinct: bool,
    /// First requested metric that no rollup can serve.
    unroutable: Option<String>,
}

pub struct QueryRouter<'a> {
    registry: &'a SchemaRegistry,
    rollups: &'a [RollupDefinition],
    optimized: Option<&'a OptimizedSourceConfig>,
    config: RouterConfig,
}

impl<'a> QueryRouter<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        rollups: &'a [RollupDefinition],
        optimized: Option<&'a OptimizedSourceConfig>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            rollups,
            optimized,
            config,
        }
    }

    /// Score of `rollup` for `request`, or -1 when it cannot answer it.
    pub fn score(&self, rollup: &RollupDefinition, request: &RouteRequest) -> Result<i64> {
        let resolved = self.resolve(request)?;
        Ok(self.score_resolved(rollup, &resolved).unwrap_or(-1))
    }

    /// Every rollup able to answer `request`, best first.
    pub fn find_suitable_rollups(&self, request: &RouteRequest) -> Result<Vec<RollupCandidate>> {
        let resolved = self.resolve(request)?;
        Ok(self.candidates(&resolved))
    }

    pub fn route(&self, request: &RouteRequest) -> Result<RouteDecision> {
        let resolved = self.resolve(request)?;
        let candidates = self.candidates(&resolved);

        if let Some(best) = candidates.first() {
            let table = self
                .rollups
                .iter()
                .find(|r| r.id == best.rollup_id)
                .map(|r| r.target_table_name.clone())
                .unwrap_or_default();
            let reason = if best.needs_reaggregation {
                format!(
                    "rollup {} covers the request and is re-aggregated to the requested dimensions",
                    best.rollup_id
                )
            } else {
                format!("rollup {} matches the requested dimensions exactly", best.rollup_id)
            };
            debug!(
                table = self.registry.table(),
                rollup = %best.rollup_id,
                score = best.score,
                candidates = candidates.len(),
                "routed to rollup"
            );
            return Ok(RouteDecision {
                use_rollup: true,
                rollup_id: Some(best.rollup_id.clone()),
                needs_reaggregation: best.needs_reaggregation,
                reason,
                score: Some(best.score),
                source: RouteSource::Rollup,
                table,
            });
        }

        if request.require_rollup && resolved.has_distinct {
            let dims: Vec<&str> = resolved.dimensions.iter().map(String::as_str).collect();
            return Err(TallyError::RoutingInfeasible(format!(
                "distinct-count metrics need a rollup grouped by exactly [{}]; create one with those dimensions",
                dims.join(", ")
            )));
        }

        let reason = match (&resolved.unroutable, resolved.has_distinct) {
            (Some(metric), _) => format!("{metric} cannot be served from a rollup"),
            (None, true) => {
                "no ready rollup matches the requested dimensions exactly, as distinct counts require"
                    .to_string()
            }
            (None, false) => "no ready rollup covers the requested dimensions and metrics".to_string(),
        };
        let (source, table) = match self.optimized.filter(|o| o.build.is_ready()) {
            Some(opt) => (RouteSource::Optimized, opt.optimized_table.clone()),
            None => (RouteSource::Raw, self.registry.source_table().to_string()),
        };
        debug!(table = self.registry.table(), source = ?source, reason = %reason, "no rollup used");
        Ok(RouteDecision {
            use_rollup: false,
            rollup_id: None,
            needs_reaggregation: false,
            reason,
            score: None,
            source,
            table,
        })
    }

    fn candidates(&self, resolved: &Resolved) -> Vec<RollupCandidate> {
        let mut candidates: Vec<RollupCandidate> = self
            .rollups
            .iter()
            .filter_map(|rollup| {
                self.score_resolved(rollup, resolved)
                    .map(|score| RollupCandidate {
                        rollup_id: rollup.id.clone(),
                        score,
                        needs_reaggregation: rollup.dimensions.len() > resolved.dimensions.len(),
                    })
            })
            .collect();
        // stable: equal scores keep catalog order
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates
    }

    fn score_resolved(&self, rollup: &RollupDefinition, resolved: &Resolved) -> Option<i64> {
        if resolved.unroutable.is_some() || !rollup.build.is_ready() {
            return None;
        }
        let rollup_dims: BTreeSet<&str> = rollup.dimensions.iter().map(String::as_str).collect();
        if !resolved
            .dimensions
            .iter()
            .all(|d| rollup_dims.contains(d.as_str()))
        {
            return None;
        }
        let available: BTreeSet<String> = rollup.available_metrics().into_iter().collect();
        if !resolved.metrics.iter().all(|m| available.contains(m)) {
            return None;
        }
        let exact = rollup_dims.len() == resolved.dimensions.len();
        if resolved.has_distinct && !exact {
            return None;
        }

        let extra = (rollup_dims.len() - resolved.dimensions.len()) as i64;
        let mut score = self.config.base_score - extra * self.config.extra_dimension_penalty;
        if exact {
            score += self.config.exact_match_bonus;
        }
        Some(score)
    }

    fn resolve(&self, request: &RouteRequest) -> Result<Resolved> {
        let mut unknown = Vec::new();
        let mut dimensions = BTreeSet::new();
        for dim in request.dimensions.iter().chain(request.filters.keys()) {
            if self.registry.dimension(dim).is_none() {
                if !unknown.contains(dim) {
                    unknown.push(dim.clone());
                }
            } else {
                dimensions.insert(dim.clone());
            }
        }

        let mut graph: Option<DependencyGraph> = None;
        let mut metrics = BTreeSet::new();
        let mut has_distinct = false;
        let mut unroutable = None;
        for requested in &request.metrics {
            let (id, flagged) = match self.registry.metric(requested) {
                Some(_) => (requested.as_str(), false),
                None => split_flagged(requested),
            };
            match self.registry.metric(id) {
                Some(MetricKind::Base(metric)) => {
                    has_distinct |= metric.aggregation.is_distinct();
                    metrics.insert(requested.clone());
                }
                Some(MetricKind::Calculated(metric)) if !flagged => {
                    let graph = graph.get_or_insert_with(|| DependencyGraph::build(self.registry));
                    for base_id in graph.transitive_base_dependencies(&metric.id) {
                        if let Some(base) = self.registry.base_metric(&base_id) {
                            has_distinct |= base.aggregation.is_distinct();
                        }
                        metrics.insert(base_id);
                    }
                    if self.uses_system_metric(graph, &metric.id) {
                        unroutable.get_or_insert_with(|| requested.clone());
                    }
                }
                Some(MetricKind::System(_)) if !flagged => {
                    unroutable.get_or_insert_with(|| requested.clone());
                }
                _ => unknown.push(requested.clone()),
            }
        }

        if !unknown.is_empty() {
            return Err(TallyError::UnknownReference { references: unknown });
        }
        Ok(Resolved {
            dimensions,
            metrics,
            has_distinct,
            unroutable,
        })
    }
}

impl QueryRouter<'_> {
    /// Whether `id` or any calculated metric beneath it reads a system metric.
    fn uses_system_metric(&self, graph: &DependencyGraph, id: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(metric) = self.registry.calculated_metric(&current) {
                if formula_uses_system_metric(&metric.formula) {
                    return true;
                }
            }
            stack.extend(graph.calculated_dependencies(&current).cloned());
        }
        false
    }
}

/// `clicks_flagged` -> (`clicks`, true). Only base metrics have flagged variants.
fn split_flagged(id: &str) -> (&str, bool) {
    match id.strip_suffix(FLAGGED_SUFFIX) {
        Some(base) if !base.is_empty() => (base, true),
        _ => (id, false),
    }
}

fn formula_uses_system_metric(formula: &str) -> bool {
    crate::reference::extract_references(formula)
        .map(|refs| {
            refs.iter()
                .any(|r| crate::schema::SystemMetric::from_id(&r.name).is_some())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::TableStats;
    use crate::rollup::RollupMetric;
    use crate::schema::{Aggregation, BaseMetric, CalculatedMetric, DataType, Dimension, SchemaDocument};

    fn registry() -> SchemaRegistry {
        let mut doc = SchemaDocument::new("search", "proj.ds.search");
        doc.base_metrics = vec![
            BaseMetric::new("clicks", "clicks", Aggregation::Sum),
            BaseMetric::new("visits", "visit_id", Aggregation::CountDistinct),
        ];
        doc.calculated_metrics = vec![
            CalculatedMetric::new("clicks_per_visit", "{clicks} / {visits}"),
            CalculatedMetric::new("clicks_per_day", "{clicks} / {days_in_range}"),
        ];
        doc.dimensions = vec![
            Dimension::new("date", "date", DataType::Date),
            Dimension::new("country", "country", DataType::String),
            Dimension::new("device", "device", DataType::String),
        ];
        SchemaRegistry::from_document(doc).unwrap()
    }

    fn ready(id: &str, dims: &[&str], metrics: &[&str]) -> RollupDefinition {
        let mut def = RollupDefinition::new(
            id,
            dims,
            metrics.iter().map(|m| RollupMetric::new(*m)).collect(),
        );
        def.target_table_name = format!("proj.ds.search_rollup_{id}");
        def.build.mark_ready(TableStats::default());
        def
    }

    #[test]
    fn scores_favor_exact_matches() {
        let reg = registry();
        let rollups = vec![
            ready("by_date_country", &["date", "country"], &["clicks"]),
            ready("by_date", &["date"], &["clicks"]),
        ];
        let router = QueryRouter::new(&reg, &rollups, None, RouterConfig::default());
        let request = RouteRequest::new(&["date"], &["clicks"]);
        assert_eq!(router.score(&rollups[0], &request).unwrap(), 95);
        assert_eq!(router.score(&rollups[1], &request).unwrap(), 150);

        let found = router.find_suitable_rollups(&request).unwrap();
        let ids: Vec<&str> = found.iter().map(|c| c.rollup_id.as_str()).collect();
        assert_eq!(ids, vec!["by_date", "by_date_country"]);
    }

    #[test]
    fn ties_keep_catalog_order() {
        let reg = registry();
        let rollups = vec![
            ready("first", &["date", "country"], &["clicks"]),
            ready("second", &["date", "device"], &["clicks"]),
        ];
        let router = QueryRouter::new(&reg, &rollups, None, RouterConfig::default());
        let decision = router.route(&RouteRequest::new(&["date"], &["clicks"])).unwrap();
        assert_eq!(decision.rollup_id.as_deref(), Some("first"));
        assert!(decision.needs_reaggregation);
    }

    #[test]
    fn calculated_metric_inherits_distinctness() {
        let reg = registry();
        let rollups = vec![ready("wide", &["date", "country"], &["clicks", "visits"])];
        let router = QueryRouter::new(&reg, &rollups, None, RouterConfig::default());

        let coarse = router
            .route(&RouteRequest::new(&["date"], &["clicks_per_visit"]))
            .unwrap();
        assert!(!coarse.use_rollup);

        let exact = router
            .route(&RouteRequest::new(&["date", "country"], &["clicks_per_visit"]))
            .unwrap();
        assert!(exact.use_rollup);
        assert!(!exact.needs_reaggregation);
    }

    #[test]
    fn filter_dimensions_count_as_requested() {
        let reg = registry();
        let rollups = vec![ready("by_date", &["date"], &["clicks"])];
        let router = QueryRouter::new(&reg, &rollups, None, RouterConfig::default());
        let request = RouteRequest::new(&["date"], &["clicks"])
            .with_filter("country", vec![Value::from("US")]);
        assert!(!router.route(&request).unwrap().use_rollup);
    }

    #[test]
    fn flagged_variants_route_when_stored() {
        let reg = registry();
        let mut rollup = ready("by_date", &["date"], &[]);
        rollup.metrics = vec![RollupMetric::with_flag("clicks", "is_paid")];
        let rollups = vec![rollup];
        let router = QueryRouter::new(&reg, &rollups, None, RouterConfig::default());
        let decision = router
            .route(&RouteRequest::new(&["date"], &["clicks_flagged"]))
            .unwrap();
        assert!(decision.use_rollup);
    }

    #[test]
    fn system_metrics_fall_back_to_the_source() {
        let reg = registry();
        let rollups = vec![ready("by_date", &["date"], &["clicks"])];
        let mut optimized =
            OptimizedSourceConfig::new("proj.ds.search", "date", &Default::default());
        optimized.build.mark_ready(TableStats::default());
        let router = QueryRouter::new(&reg, &rollups, Some(&optimized), RouterConfig::default());
        let decision = router
            .route(&RouteRequest::new(&["date"], &["clicks_per_day"]))
            .unwrap();
        assert!(!decision.use_rollup);
        assert_eq!(decision.source, RouteSource::Optimized);
        assert_eq!(decision.table, "proj.ds.search_optimized");
    }

    #[test]
    fn unknown_ids_are_reported_together() {
        let reg = registry();
        let router = QueryRouter::new(&reg, &[], None, RouterConfig::default());
        let err = router
            .route(&RouteRequest::new(&["region"], &["clicks", "revenue"]))
            .unwrap_err();
        match err {
            TallyError::UnknownReference { references } => {
                assert_eq!(references, vec!["region", "revenue"])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn require_rollup_with_distinct_metric_is_infeasible() {
        let reg = registry();
        let rollups = vec![ready("wide", &["date", "country"], &["visits"])];
        let router = QueryRouter::new(&reg, &rollups, None, RouterConfig::default());
        let mut request = RouteRequest::new(&["date"], &["visits"]);
        request.require_rollup = true;
        assert!(matches!(
            router.route(&request),
            Err(TallyError::RoutingInfeasible(_))
        ));
    }
}
