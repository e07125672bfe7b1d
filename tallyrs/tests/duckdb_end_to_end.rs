//! Rollups and the optimized source materialized on a real DuckDB file.
#![cfg(feature = "duckdb")]

mod common;

use std::sync::Arc;

use chrono::NaiveDate;
use tally::backends::DuckDbConnection;
use tally::config::DuckDbConfig;
use tally::dialect::DuckDbDialect;
use tally::{
    BuildStatus, FileStore, RefreshMode, RollupDefinition, RollupMetric, RouteRequest,
    SchemaRegistry, TableService, TallyConfig, TallyError, Warehouse,
};
use tempfile::TempDir;

use common::search_document;

const SEED: &str = "
CREATE TABLE search_events (
    date DATE, country VARCHAR, device VARCHAR, clicks INTEGER, impressions INTEGER,
    visit_id VARCHAR, query VARCHAR, hostname VARCHAR, is_paid INTEGER
);
INSERT INTO search_events VALUES
    ('2024-03-01', 'US', 'mobile', 3, 10, 'v1', 'shoes', 'Shop.example.com', 1),
    ('2024-03-01', 'US', 'desktop', 1, 8, 'v1', 'boots', 'shop.example.com', 0),
    ('2024-03-01', 'DE', 'mobile', 2, 5, 'v2', 'shoes', 'example.de', 0),
    ('2024-03-02', 'US', 'mobile', 4, 12, 'v3', 'shoes', 'shop.example.com', 1),
    ('2024-03-02', 'DE', 'tablet', 0, 7, 'v4', 'hats', 'example.de', 1);
";

async fn setup() -> (TempDir, Arc<DuckDbConnection>, TableService<FileStore>) {
    let dir = TempDir::new().unwrap();
    // one file handle: every statement shares the pooled connection
    let warehouse = Arc::new(DuckDbConnection::with_config(
        dir.path().join("search.duckdb"),
        &DuckDbConfig { max_concurrency: 1 },
    ));
    warehouse.execute(SEED).await.unwrap();

    let mut document = search_document();
    document.source_table = "search_events".to_string();
    let mut registry = SchemaRegistry::from_document(document).unwrap();
    assert!(registry.validate_all(&DuckDbDialect).is_empty());

    let service = TableService::new(
        Arc::new(FileStore::new(dir.path().join("store"))),
        warehouse.clone(),
        TallyConfig::default(),
    );
    service.save(registry).unwrap();
    (dir, warehouse, service)
}

async fn scalar(warehouse: &DuckDbConnection, sql: &str) -> u64 {
    warehouse.execute(sql).await.unwrap().scalar_u64().unwrap()
}

#[tokio::test]
async fn rollup_with_flagged_variant_matches_the_source() {
    let (_dir, warehouse, service) = setup().await;
    service.validate_columns("search").await.unwrap();

    service
        .create_rollup(
            "search",
            RollupDefinition::new(
                "daily",
                &["date", "country"],
                vec![
                    RollupMetric::with_flag("clicks", "is_paid"),
                    RollupMetric::new("impressions"),
                    RollupMetric::new("visits"),
                ],
            ),
        )
        .unwrap();
    let rollup = service.refresh_rollup("search", "daily").await.unwrap();
    assert_eq!(rollup.build.status, BuildStatus::Ready);
    assert_eq!(rollup.build.row_count, Some(4));

    let table = "\"search_events_rollup_daily\"";
    assert_eq!(scalar(&warehouse, &format!("SELECT SUM(clicks) FROM {table}")).await, 10);
    assert_eq!(
        scalar(&warehouse, &format!("SELECT SUM(clicks_flagged) FROM {table}")).await,
        7
    );
    assert_eq!(
        scalar(
            &warehouse,
            &format!("SELECT visits FROM {table} WHERE country = 'US' AND date = DATE '2024-03-01'")
        )
        .await,
        1
    );

    let decision = service
        .route_query("search", &RouteRequest::new(&["date", "country"], &["ctr", "visits"]))
        .unwrap();
    assert_eq!(decision.rollup_id.as_deref(), Some("daily"));
    assert!(!decision.needs_reaggregation);
}

#[tokio::test]
async fn optimized_source_appends_new_days_only() {
    let (_dir, warehouse, service) = setup().await;

    let plan = service.plan_optimized_source("search").await.unwrap();
    assert_eq!(plan.optimized_table, "search_events_optimized");

    let full = service
        .refresh_optimized_source("search", RefreshMode::Full)
        .await
        .unwrap();
    assert_eq!(full.row_count, 5);
    assert_eq!(
        scalar(
            &warehouse,
            "SELECT COUNT(DISTINCT _key_query_visit_id) FROM search_events_optimized"
        )
        .await,
        5
    );

    warehouse
        .execute(
            "INSERT INTO search_events VALUES \
             ('2024-03-03', 'US', 'mobile', 5, 9, 'v5', 'shoes', 'shop.example.com', 0)",
        )
        .await
        .unwrap();
    let staleness = service.check_optimized_staleness("search").await.unwrap();
    assert!(staleness.is_stale);
    assert_eq!(
        staleness.optimized_max_date,
        NaiveDate::from_ymd_opt(2024, 3, 2)
    );

    let incremental = service
        .refresh_optimized_source("search", RefreshMode::Incremental)
        .await
        .unwrap();
    assert_eq!(
        incremental.partitions_added,
        vec![NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()]
    );
    assert_eq!(incremental.row_count, 6);
    assert!(!service.check_optimized_staleness("search").await.unwrap().is_stale);
}

#[tokio::test]
async fn expressions_are_checked_against_the_engine() {
    let (_dir, _warehouse, service) = setup().await;

    let validated = service
        .validate_expression("search", "LOWER({hostname})")
        .await
        .unwrap();
    assert_eq!(validated.depends_on, vec!["hostname"]);

    let err = service
        .validate_expression("search", "UPPER({referrer})")
        .await
        .unwrap_err();
    match err {
        TallyError::UnknownReference { references } => assert_eq!(references, vec!["referrer"]),
        other => panic!("unexpected error: {other}"),
    }
}
