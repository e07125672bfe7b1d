//! Refresh lifecycle through the table service, persisted to a file store.

mod common;

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;
use tally::{
    Aggregation, BaseMetric, BuildStatus, FileStore, RefreshMode, RollupDefinition, RollupMetric,
    RollupUpdate, RouteRequest, RouteSource, TableService, TallyConfig, TallyError,
};
use tempfile::TempDir;

use common::{column, search_registry, FakeWarehouse};

struct Harness {
    _dir: TempDir,
    warehouse: Arc<FakeWarehouse>,
    service: TableService<FileStore>,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let warehouse = Arc::new(FakeWarehouse::new());
    warehouse.respond("COUNT(*)", column("row_count", vec![Value::from(42)]));
    let service = TableService::new(
        Arc::new(FileStore::new(dir.path())),
        warehouse.clone(),
        TallyConfig::default(),
    );
    service.save(search_registry()).unwrap();
    Harness {
        _dir: dir,
        warehouse,
        service,
    }
}

fn daily() -> RollupDefinition {
    RollupDefinition::new(
        "daily",
        &["date", "country"],
        vec![
            RollupMetric::new("clicks"),
            RollupMetric::new("impressions"),
        ],
    )
}

fn status(service: &TableService<FileStore>, id: &str) -> BuildStatus {
    service.get_rollup("search", id).unwrap().build.status
}

#[tokio::test]
async fn rollup_refresh_records_ready_state() {
    let h = harness();
    let created = h.service.create_rollup("search", daily()).unwrap();
    assert_eq!(
        created.target_table_name,
        "proj.analytics.search_events_rollup_daily"
    );
    assert_eq!(created.build.status, BuildStatus::Pending);

    let refreshed = h.service.refresh_rollup("search", "daily").await.unwrap();
    assert_eq!(refreshed.build.status, BuildStatus::Ready);
    assert_eq!(refreshed.build.row_count, Some(42));

    let stored = h.service.list_rollups("search").unwrap();
    assert_eq!(stored[0].build, refreshed.build);

    let executed = h.warehouse.executed();
    assert!(executed[0].starts_with(
        "CREATE OR REPLACE TABLE `proj.analytics.search_events_rollup_daily` AS SELECT"
    ));
    assert!(executed[1].contains("COUNT(*)"));

    let decision = h
        .service
        .route_query("search", &RouteRequest::new(&["date"], &["ctr"]))
        .unwrap();
    assert!(decision.use_rollup);
    assert_eq!(decision.source, RouteSource::Rollup);
    assert!(decision.needs_reaggregation);
}

#[tokio::test]
async fn failed_rollup_refresh_is_persisted_as_error() {
    let h = harness();
    h.service.create_rollup("search", daily()).unwrap();
    h.warehouse.fail_on("CREATE OR REPLACE TABLE");

    let err = h.service.refresh_rollup("search", "daily").await.unwrap_err();
    assert!(matches!(err, TallyError::WarehouseExecution(_)));

    let stored = h.service.list_rollups("search").unwrap();
    assert_eq!(stored[0].build.status, BuildStatus::Error);
    assert!(stored[0]
        .build
        .last_refresh_error
        .as_deref()
        .unwrap()
        .contains("injected failure"));
    assert!(!h.service.jobs().is_running("rollup:search:daily"));
}

#[tokio::test]
async fn concurrent_refresh_of_the_same_rollup_is_rejected() {
    let h = harness();
    h.service.create_rollup("search", daily()).unwrap();

    let held = h.service.jobs().try_start("rollup:search:daily").unwrap();
    let err = h.service.refresh_rollup("search", "daily").await.unwrap_err();
    assert!(matches!(err, TallyError::RefreshInProgress(_)));
    assert_eq!(status(&h.service, "daily"), BuildStatus::Pending);
    assert!(h.warehouse.executed().is_empty());

    drop(held);
    h.service.refresh_rollup("search", "daily").await.unwrap();
    assert_eq!(status(&h.service, "daily"), BuildStatus::Ready);
}

#[tokio::test]
async fn edits_made_while_a_rollup_builds_are_kept_and_mark_it_stale() {
    let h = harness();
    h.service.create_rollup("search", daily()).unwrap();
    h.warehouse.hold("CREATE OR REPLACE TABLE");

    let (refreshed, updated) = tokio::join!(h.service.refresh_rollup("search", "daily"), async {
        h.warehouse.wait_for_hold().await;
        assert_eq!(status(&h.service, "daily"), BuildStatus::Building);
        let updated = h.service.update_rollup(
            "search",
            "daily",
            RollupUpdate {
                dimensions: Some(vec!["date".to_string()]),
                metrics: Some(vec![RollupMetric::new("clicks")]),
                ..Default::default()
            },
        );
        h.warehouse.release();
        updated
    });
    // the table that was built follows the old definition
    assert_eq!(refreshed.unwrap().build.status, BuildStatus::Ready);
    updated.unwrap();

    let stored = h.service.get_rollup("search", "daily").unwrap();
    assert_eq!(stored.dimensions, vec!["date"]);
    assert_eq!(stored.metrics, vec![RollupMetric::new("clicks")]);
    assert_eq!(stored.build.status, BuildStatus::Stale);
    assert_eq!(stored.build.row_count, Some(42));

    let decision = h
        .service
        .route_query("search", &RouteRequest::new(&["date"], &["impressions"]))
        .unwrap();
    assert!(!decision.use_rollup);
}

#[tokio::test]
async fn rollup_deleted_while_building_stays_deleted() {
    let h = harness();
    h.service.create_rollup("search", daily()).unwrap();
    h.warehouse.hold("CREATE OR REPLACE TABLE");

    let (refreshed, deleted) = tokio::join!(h.service.refresh_rollup("search", "daily"), async {
        h.warehouse.wait_for_hold().await;
        let deleted = h.service.delete_rollup("search", "daily");
        h.warehouse.release();
        deleted
    });
    refreshed.unwrap();
    deleted.unwrap();
    assert!(h.service.list_rollups("search").unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_refresh_restores_the_previous_status() {
    let h = harness();
    h.service.create_rollup("search", daily()).unwrap();
    h.warehouse.hold("CREATE OR REPLACE TABLE");

    let mid_flight = tokio::select! {
        _ = h.service.refresh_rollup("search", "daily") => panic!("refresh should be parked"),
        mid = async {
            h.warehouse.wait_for_hold().await;
            status(&h.service, "daily")
        } => mid,
    };
    assert_eq!(mid_flight, BuildStatus::Building);
    assert_eq!(status(&h.service, "daily"), BuildStatus::Pending);
    assert!(!h.service.jobs().is_running("rollup:search:daily"));

    h.warehouse.release();
    h.service.refresh_rollup("search", "daily").await.unwrap();
    assert_eq!(status(&h.service, "daily"), BuildStatus::Ready);
}

#[tokio::test]
async fn changing_a_stored_base_metric_marks_rollups_stale() {
    let h = harness();
    h.service.create_rollup("search", daily()).unwrap();
    h.service
        .create_rollup(
            "search",
            RollupDefinition::new("visits_daily", &["date"], vec![RollupMetric::new("visits")]),
        )
        .unwrap();
    h.service.refresh_rollup("search", "daily").await.unwrap();
    h.service.refresh_rollup("search", "visits_daily").await.unwrap();

    let outcome = h
        .service
        .update_base_metric(
            "search",
            BaseMetric::new("clicks", "click_count", Aggregation::Sum),
        )
        .unwrap();
    assert_eq!(outcome.updated_ids(), vec!["ctr", "ctr_ratio"]);

    assert_eq!(status(&h.service, "daily"), BuildStatus::Stale);
    assert_eq!(status(&h.service, "visits_daily"), BuildStatus::Ready);
    assert_eq!(h.service.registry("search").unwrap().document().version, 2);
}

#[tokio::test]
async fn calculated_metric_rollup_is_rejected_with_its_inputs() {
    let h = harness();
    let err = h
        .service
        .create_rollup(
            "search",
            RollupDefinition::new("bad", &["date"], vec![RollupMetric::new("ctr")]),
        )
        .unwrap_err();
    assert!(matches!(err, TallyError::SchemaValidation(_)));
    assert!(err.to_string().contains("clicks, impressions"));
    assert!(h.service.list_rollups("search").unwrap().is_empty());
}

#[tokio::test]
async fn optimized_source_builds_full_then_appends_missing_partitions() {
    let h = harness();
    h.warehouse.respond(
        "APPROX_COUNT_DISTINCT(`country`)",
        column("cardinality", vec![Value::from(180)]),
    );
    h.warehouse.respond(
        "APPROX_COUNT_DISTINCT(`device`)",
        column("cardinality", vec![Value::from(3)]),
    );

    let plan = h.service.plan_optimized_source("search").await.unwrap();
    assert_eq!(plan.optimized_table, "proj.analytics.search_events_optimized");
    assert_eq!(plan.cluster_columns, vec!["country", "device"]);
    let keys: Vec<&str> = plan
        .key_mappings
        .iter()
        .map(|m| m.key_column_name.as_str())
        .collect();
    assert_eq!(keys, vec!["_key_query_visit_id"]);

    // not built yet, so an incremental request rebuilds everything
    let first = h
        .service
        .refresh_optimized_source("search", RefreshMode::Incremental)
        .await
        .unwrap();
    assert_eq!(first.mode, RefreshMode::Full);
    assert_eq!(first.row_count, 42);
    assert!(h
        .warehouse
        .executed()
        .iter()
        .any(|sql| sql.starts_with("CREATE OR REPLACE TABLE `proj.analytics.search_events_optimized` PARTITION BY `date` CLUSTER BY `country`, `device`")));

    h.warehouse.respond(
        "partition_date",
        column(
            "partition_date",
            vec![Value::from("2024-03-02"), Value::from("2024-03-01")],
        ),
    );
    let second = h
        .service
        .refresh_optimized_source("search", RefreshMode::Incremental)
        .await
        .unwrap();
    assert_eq!(second.mode, RefreshMode::Incremental);
    assert_eq!(
        second.partitions_added,
        vec![
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        ]
    );
    let insert = h
        .warehouse
        .executed()
        .into_iter()
        .find(|sql| sql.starts_with("INSERT INTO"))
        .unwrap();
    assert!(insert.ends_with("WHERE `date` IN (DATE '2024-03-01', DATE '2024-03-02')"));

    // rollups over distinct identities now read the key column
    h.service
        .create_rollup(
            "search",
            RollupDefinition::new(
                "searches",
                &["date"],
                vec![RollupMetric::new("unique_searches")],
            ),
        )
        .unwrap();
    let sql = h.service.preview_rollup_sql("search", "searches").unwrap();
    assert!(sql.contains("COUNT(DISTINCT `_key_query_visit_id`)"), "{sql}");
    assert!(sql.contains("FROM `proj.analytics.search_events_optimized`"), "{sql}");
}

#[tokio::test]
async fn replanning_while_the_optimized_source_builds_keeps_the_new_plan() {
    let h = harness();
    h.warehouse.respond(
        "APPROX_COUNT_DISTINCT",
        column("cardinality", vec![Value::from(10)]),
    );
    h.service.plan_optimized_source("search").await.unwrap();
    h.warehouse.hold("CREATE OR REPLACE TABLE");

    let (refreshed, replanned) = tokio::join!(
        h.service.refresh_optimized_source("search", RefreshMode::Full),
        async {
            h.warehouse.wait_for_hold().await;
            h.service
                .update_base_metric(
                    "search",
                    BaseMetric::distinct_over("unique_searches", &["visit_id", "device"]),
                )
                .unwrap();
            let replanned = h.service.plan_optimized_source("search").await;
            h.warehouse.release();
            replanned
        }
    );
    assert_eq!(refreshed.unwrap().row_count, 42);
    let replanned = replanned.unwrap();
    assert_eq!(replanned.build.status, BuildStatus::Stale);

    let decision = h
        .service
        .route_query("search", &RouteRequest::new(&["date"], &["unique_searches"]))
        .unwrap();
    assert_ne!(decision.source, RouteSource::Optimized);

    let stored = h.service.plan_optimized_source("search").await.unwrap();
    let keys: Vec<&str> = stored
        .key_mappings
        .iter()
        .map(|m| m.key_column_name.as_str())
        .collect();
    assert_eq!(keys, vec!["_key_device_visit_id"]);
    assert_eq!(stored.build.status, BuildStatus::Stale);
    assert_eq!(stored.build.row_count, Some(42));
}

#[tokio::test]
async fn unknown_table_is_an_unknown_reference() {
    let h = harness();
    assert!(matches!(
        h.service.refresh_rollup("orders", "daily").await,
        Err(TallyError::UnknownReference { .. })
    ));
}

#[tokio::test]
async fn metrics_stored_by_rollups_cannot_be_removed() {
    let h = harness();
    h.service.create_rollup("search", daily()).unwrap();

    let err = h.service.remove_metric("search", "impressions").unwrap_err();
    assert!(err.to_string().contains("daily"));

    h.service.remove_metric("search", "searches_per_visit").unwrap();
    assert!(h
        .service
        .registry("search")
        .unwrap()
        .calculated_metric("searches_per_visit")
        .is_none());
}
