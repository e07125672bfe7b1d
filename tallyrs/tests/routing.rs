//! Rollup selection against the search fixture.

mod common;

use tally::config::RouterConfig;
use tally::{
    QueryRouter, RollupDefinition, RollupMetric, RouteRequest, RouteSource, TableStats,
    TallyError,
};

use common::search_registry;

fn built(id: &str, dimensions: &[&str], metrics: &[&str]) -> RollupDefinition {
    let mut rollup = RollupDefinition::new(
        id,
        dimensions,
        metrics.iter().map(|m| RollupMetric::new(*m)).collect(),
    );
    rollup.target_table_name = format!("proj.analytics.search_events_rollup_{id}");
    rollup.build.mark_ready(TableStats {
        row_count: 100,
        size_bytes: Some(4096),
    });
    rollup
}

#[test]
fn distinct_metric_with_extra_rollup_dimension_uses_raw_table() {
    let registry = search_registry();
    let rollups = vec![built("by_date_country", &["date", "country"], &["visits"])];
    let router = QueryRouter::new(&registry, &rollups, None, RouterConfig::default());

    let decision = router.route(&RouteRequest::new(&["date"], &["visits"])).unwrap();
    assert!(!decision.use_rollup);
    assert_eq!(decision.rollup_id, None);
    assert_eq!(decision.source, RouteSource::Raw);
    assert_eq!(decision.table, "proj.analytics.search_events");
}

#[test]
fn distinct_metric_with_exact_dimensions_uses_rollup() {
    let registry = search_registry();
    let rollups = vec![built("by_date_country", &["date", "country"], &["visits"])];
    let router = QueryRouter::new(&registry, &rollups, None, RouterConfig::default());

    let decision = router
        .route(&RouteRequest::new(&["country", "date"], &["visits"]))
        .unwrap();
    assert!(decision.use_rollup);
    assert!(!decision.needs_reaggregation);
    assert_eq!(decision.rollup_id.as_deref(), Some("by_date_country"));
    assert_eq!(decision.score, Some(150));
    assert_eq!(decision.table, "proj.analytics.search_events_rollup_by_date_country");
}

#[test]
fn additive_metric_with_extra_rollup_dimension_is_reaggregated() {
    let registry = search_registry();
    let rollups = vec![built("by_date_country", &["date", "country"], &["clicks"])];
    let router = QueryRouter::new(&registry, &rollups, None, RouterConfig::default());

    let decision = router.route(&RouteRequest::new(&["date"], &["clicks"])).unwrap();
    assert!(decision.use_rollup);
    assert!(decision.needs_reaggregation);
    assert_eq!(decision.score, Some(95));
}

#[test]
fn calculated_metric_routes_through_its_base_metrics() {
    let registry = search_registry();
    let rollups = vec![
        built("clicks_only", &["date"], &["clicks"]),
        built("ctr_inputs", &["date", "device"], &["clicks", "impressions"]),
    ];
    let router = QueryRouter::new(&registry, &rollups, None, RouterConfig::default());

    let decision = router.route(&RouteRequest::new(&["date"], &["ctr"])).unwrap();
    assert_eq!(decision.rollup_id.as_deref(), Some("ctr_inputs"));
    assert!(decision.needs_reaggregation);
}

#[test]
fn unbuilt_rollups_are_never_chosen() {
    let registry = search_registry();
    let mut stale = built("by_date", &["date"], &["clicks"]);
    stale.build.mark_stale();
    let rollups = vec![stale];
    let router = QueryRouter::new(&registry, &rollups, None, RouterConfig::default());

    assert!(router
        .find_suitable_rollups(&RouteRequest::new(&["date"], &["clicks"]))
        .unwrap()
        .is_empty());
}

#[test]
fn weights_come_from_config() {
    let registry = search_registry();
    let rollups = vec![built("wide", &["date", "country", "device"], &["clicks"])];
    let config = RouterConfig {
        base_score: 10,
        exact_match_bonus: 0,
        extra_dimension_penalty: 3,
    };
    let router = QueryRouter::new(&registry, &rollups, None, config);
    let found = router
        .find_suitable_rollups(&RouteRequest::new(&["date"], &["clicks"]))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].score, 4);
}

#[test]
fn required_rollup_for_distinct_metric_must_exist() {
    let registry = search_registry();
    let rollups = vec![built("by_date_country", &["date", "country"], &["unique_searches"])];
    let router = QueryRouter::new(&registry, &rollups, None, RouterConfig::default());

    let mut request = RouteRequest::new(&["date"], &["searches_per_visit"]);
    request.require_rollup = true;
    let err = router.route(&request).unwrap_err();
    assert!(matches!(err, TallyError::RoutingInfeasible(_)));
    assert!(err.to_string().contains("[date]"));
}
