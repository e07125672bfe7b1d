#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tally::dialect::{BigQueryDialect, Dialect};
use tally::error::{Result, TallyError};
use tally::executor::{ColumnMeta, QueryResult};
use tally::schema_cache::{ColumnSchema, TableSchema};
use tally::{
    Aggregation, BaseMetric, CalculatedDimension, CalculatedMetric, DataType, Dimension,
    SchemaDocument, SchemaRegistry, Warehouse,
};

/// Warehouse double: records every statement and answers from canned results.
#[derive(Default)]
pub struct FakeWarehouse {
    dialect: BigQueryDialect,
    executed: Mutex<Vec<String>>,
    dry_runs: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, QueryResult)>>,
    fail_on: Mutex<Option<String>>,
    hold: Mutex<Option<String>>,
    reached: Notify,
    released: Notify,
    columns: Vec<String>,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self::with_columns(&[
            "date",
            "country",
            "device",
            "clicks",
            "impressions",
            "visit_id",
            "query",
            "hostname",
            "is_paid",
        ])
    }

    pub fn with_columns(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Answer statements containing `pattern` with `result`. First match wins.
    pub fn respond(&self, pattern: &str, result: QueryResult) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), result));
    }

    /// Fail every statement containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        *self.fail_on.lock().unwrap() = Some(pattern.to_string());
    }

    /// Park the next statement containing `pattern` until [`release`](Self::release).
    pub fn hold(&self, pattern: &str) {
        *self.hold.lock().unwrap() = Some(pattern.to_string());
    }

    /// Resolves once a held statement is parked.
    pub async fn wait_for_hold(&self) {
        self.reached.notified().await;
    }

    /// Let the parked statement through and stop holding.
    pub fn release(&self) {
        *self.hold.lock().unwrap() = None;
        self.released.notify_one();
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn dry_runs(&self) -> Vec<String> {
        self.dry_runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        self.executed.lock().unwrap().push(sql.to_string());
        let parked = self
            .hold
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|pattern| sql.contains(pattern));
        if parked {
            self.reached.notify_one();
            self.released.notified().await;
        }
        if let Some(pattern) = self.fail_on.lock().unwrap().as_deref() {
            if sql.contains(pattern) {
                return Err(TallyError::WarehouseExecution(format!(
                    "injected failure on {pattern}"
                )));
            }
        }
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_default())
    }

    async fn dry_run(&self, sql: &str) -> Result<()> {
        self.dry_runs.lock().unwrap().push(sql.to_string());
        if let Some(pattern) = self.fail_on.lock().unwrap().as_deref() {
            if sql.contains(pattern) {
                return Err(TallyError::WarehouseExecution(format!(
                    "injected failure on {pattern}"
                )));
            }
        }
        Ok(())
    }

    async fn fetch_schema(&self, _table: &str) -> Result<TableSchema> {
        Ok(TableSchema {
            columns: self
                .columns
                .iter()
                .map(|name| ColumnSchema {
                    name: name.clone(),
                    data_type: "STRING".to_string(),
                    nullable: true,
                })
                .collect(),
        })
    }
}

/// Single-column result with one row per value.
pub fn column(name: &str, values: Vec<Value>) -> QueryResult {
    QueryResult {
        columns: vec![ColumnMeta {
            name: name.to_string(),
        }],
        rows: values
            .into_iter()
            .map(|v| {
                let mut row = Map::new();
                row.insert(name.to_string(), v);
                row
            })
            .collect(),
    }
}

/// Search events: click metrics, a distinct visit count and a two-column identity.
pub fn search_document() -> SchemaDocument {
    let mut doc = SchemaDocument::new("search", "proj.analytics.search_events");
    doc.base_metrics = vec![
        BaseMetric::new("clicks", "clicks", Aggregation::Sum),
        BaseMetric::new("impressions", "impressions", Aggregation::Sum),
        BaseMetric::new("visits", "visit_id", Aggregation::CountDistinct),
        BaseMetric::distinct_over("unique_searches", &["visit_id", "query"]),
    ];
    doc.calculated_metrics = vec![
        CalculatedMetric::new("ctr", "{clicks} / {impressions}"),
        CalculatedMetric::new("ctr_ratio", "{ctr} / {clicks}"),
        CalculatedMetric::new("searches_per_visit", "{unique_searches} / {visits}"),
    ];
    doc.dimensions = vec![
        Dimension::new("date", "date", DataType::Date),
        Dimension::new("country", "country", DataType::String),
        Dimension::new("device", "device", DataType::String),
    ];
    doc.calculated_dimensions = vec![CalculatedDimension::new(
        "domain",
        "LOWER({hostname})",
        DataType::String,
    )];
    doc
}

/// The search registry with every calculated metric compiled.
pub fn search_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::from_document(search_document()).unwrap();
    let failures = registry.validate_all(&BigQueryDialect);
    assert!(failures.is_empty(), "{failures:?}");
    registry
}
