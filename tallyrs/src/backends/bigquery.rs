//! BigQuery backend implementation using gcp-bigquery-client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::query_response::ResultSet;
use gcp_bigquery_client::Client;
use tokio::sync::Semaphore;

use crate::config::BigQueryConfig;
use crate::dialect::{BigQueryDialect, Dialect};
use crate::error::{Result, TallyError};
use crate::executor::{ColumnMeta, QueryResult};
use crate::schema_cache::{ColumnSchema, TableSchema};

use super::{TableStats, Warehouse};

pub struct BigQueryConnection {
    client: Client,
    project_id: String,
    dataset: String,
    dialect: BigQueryDialect,
    config: BigQueryConfig,
    /// Semaphore to limit concurrent BigQuery queries for backpressure.
    limiter: Arc<Semaphore>,
}

impl BigQueryConnection {
    /// Create a connection from a service account key file.
    pub async fn from_service_account_key_file(
        service_account_path: &str,
        project_id: &str,
        dataset: &str,
        config: BigQueryConfig,
    ) -> Result<Self> {
        tracing::info!(
            project_id = %project_id,
            dataset = %dataset,
            use_query_cache = config.use_query_cache,
            maximum_bytes_billed = config.maximum_bytes_billed,
            "creating BigQuery connection from service account"
        );
        let client = Client::from_service_account_key_file(service_account_path)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to create BigQuery client");
                TallyError::WarehouseExecution(format!("create bigquery client: {e}"))
            })?;
        Ok(Self::from_client(client, project_id, dataset, config))
    }

    /// Create a connection from application default credentials
    /// (`GOOGLE_APPLICATION_CREDENTIALS` or the gcloud CLI login).
    pub async fn from_application_default_credentials(
        project_id: &str,
        dataset: &str,
        config: BigQueryConfig,
    ) -> Result<Self> {
        tracing::info!(
            project_id = %project_id,
            dataset = %dataset,
            "creating BigQuery connection from application default credentials"
        );
        let client = Client::from_application_default_credentials()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to create BigQuery client from ADC");
                TallyError::WarehouseExecution(format!("create bigquery client: {e}"))
            })?;
        Ok(Self::from_client(client, project_id, dataset, config))
    }

    fn from_client(client: Client, project_id: &str, dataset: &str, config: BigQueryConfig) -> Self {
        tracing::info!(
            project_id = %project_id,
            dataset = %dataset,
            max_concurrent = config.max_concurrent_queries,
            "BigQuery connection established"
        );
        Self {
            client,
            project_id: project_id.to_string(),
            dataset: dataset.to_string(),
            dialect: BigQueryDialect,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_queries.max(1))),
            config,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Acquire a query slot, waiting at most `queue_timeout_ms`.
    async fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!(
                max_concurrent = self.config.max_concurrent_queries,
                queue_timeout_ms = self.config.queue_timeout_ms,
                "BigQuery slots exhausted, waiting for permit"
            );
        }

        let timeout_ms = self.config.queue_timeout_ms;
        if timeout_ms == 0 {
            return self
                .limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| TallyError::WarehouseExecution(format!("limiter closed: {e}")));
        }
        let timeout = Duration::from_millis(timeout_ms);
        match tokio::time::timeout(timeout, self.limiter.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(e)) => Err(TallyError::WarehouseExecution(format!("limiter closed: {e}"))),
            Err(_) => {
                tracing::warn!(
                    max_concurrent = self.config.max_concurrent_queries,
                    timeout_ms = timeout_ms,
                    "BigQuery request rejected: queue timeout exceeded"
                );
                Err(TallyError::WarehouseExecution(format!(
                    "BigQuery overloaded: request queued for {}ms, max concurrent queries ({}) reached",
                    timeout_ms, self.config.max_concurrent_queries
                )))
            }
        }
    }

    fn request(&self, sql: &str) -> QueryRequest {
        let mut query_request = QueryRequest::new(sql);
        query_request.use_query_cache = Some(self.config.use_query_cache);
        if self.config.maximum_bytes_billed > 0 {
            query_request.maximum_bytes_billed = Some(self.config.maximum_bytes_billed.to_string());
        }
        query_request
    }

    /// Split `project.dataset.table`, `dataset.table` or `table` against the defaults.
    fn table_path<'a>(&'a self, table: &'a str) -> (&'a str, &'a str, &'a str) {
        let parts: Vec<&str> = table.split('.').collect();
        match parts.as_slice() {
            [project, dataset, name] => (*project, *dataset, *name),
            [dataset, name] => (self.project_id.as_str(), *dataset, *name),
            _ => (self.project_id.as_str(), self.dataset.as_str(), table),
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryConnection {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync) {
        &self.dialect
    }

    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        let _permit = self.acquire_slot().await?;
        let start = Instant::now();
        tracing::debug!(project = %self.project_id, sql_len = sql.len(), "executing BigQuery query");
        tracing::trace!(sql = %sql, "BigQuery SQL");

        let response = self
            .client
            .job()
            .query(&self.project_id, self.request(sql))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "BigQuery query execution failed");
                TallyError::WarehouseExecution(format!("bigquery query: {e}"))
            })?;

        let mut rs = ResultSet::new_from_query_response(response);
        // column_names() comes from a HashMap; read values by name to keep the mapping right
        let col_names: Vec<String> = rs.column_names().iter().map(|s| s.to_string()).collect();
        let columns: Vec<ColumnMeta> = col_names
            .iter()
            .map(|name| ColumnMeta { name: name.clone() })
            .collect();

        let mut rows = Vec::new();
        while rs.next_row() {
            let mut map = serde_json::Map::new();
            for col_name in &col_names {
                let value = rs
                    .get_json_value_by_name(col_name)
                    .ok()
                    .flatten()
                    .unwrap_or(serde_json::Value::Null);
                map.insert(col_name.to_string(), value);
            }
            rows.push(map);
        }

        tracing::debug!(
            rows = rows.len(),
            columns = columns.len(),
            ms = start.elapsed().as_millis(),
            "bigquery execute"
        );
        Ok(QueryResult { columns, rows })
    }

    async fn dry_run(&self, sql: &str) -> Result<()> {
        let _permit = self.acquire_slot().await?;
        let mut request = self.request(sql);
        request.dry_run = Some(true);
        self.client
            .job()
            .query(&self.project_id, request)
            .await
            .map_err(|e| TallyError::WarehouseExecution(format!("bigquery dry run: {e}")))?;
        Ok(())
    }

    async fn fetch_schema(&self, table: &str) -> Result<TableSchema> {
        let start = Instant::now();
        let (project, dataset, name) = self.table_path(table);
        let table_info = self
            .client
            .table()
            .get(project, dataset, name, None)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, table = %table, "failed to get BigQuery table info");
                TallyError::WarehouseExecution(format!("fetch bigquery table: {e}"))
            })?;

        let mut columns = Vec::new();
        if let Some(fields) = &table_info.schema.fields {
            for field in fields {
                columns.push(ColumnSchema {
                    name: field.name.clone(),
                    data_type: format!("{:?}", field.r#type),
                    nullable: field.mode.as_ref().is_none_or(|m| m != "REQUIRED"),
                });
            }
        }

        tracing::debug!(
            table = table,
            columns = columns.len(),
            ms = start.elapsed().as_millis(),
            "bigquery fetch_schema"
        );
        Ok(TableSchema { columns })
    }

    async fn table_stats(&self, table: &str) -> Result<TableStats> {
        let (project, dataset, name) = self.table_path(table);
        let info = self
            .client
            .table()
            .get(project, dataset, name, None)
            .await
            .map_err(|e| TallyError::WarehouseExecution(format!("fetch bigquery table: {e}")))?;
        Ok(TableStats {
            row_count: info
                .num_rows
                .as_deref()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            size_bytes: info.num_bytes.as_deref().and_then(|n| n.parse().ok()),
        })
    }
}
