use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::backends::Warehouse;
use crate::config::{SchemaCacheConfig, ValidationConfig};
use crate::error::{Result, TallyError};
use crate::expression::{ExpressionCompiler, ValidatedExpression};
use crate::registry::SchemaRegistry;
use crate::schema_cache::{SchemaCache, TableSchema};

/// Checks definitions against the live warehouse: columns must exist and
/// dimension expressions must compile on the engine.
pub struct Validator {
    warehouse: Arc<dyn Warehouse>,
    cache: Mutex<SchemaCache>,
    warn_only: bool,
    dry_run: bool,
}

impl Validator {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        validation: &ValidationConfig,
        cache: &SchemaCacheConfig,
    ) -> Self {
        Self {
            warehouse,
            cache: Mutex::new(SchemaCache::with_config(cache)),
            warn_only: validation.warn_only,
            dry_run: validation.dry_run,
        }
    }

    /// Drop the cached schema of `table`, e.g. after it was rebuilt.
    pub fn invalidate(&self, table: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate(table);
    }

    pub async fn ensure_schema(&self, table: &str) -> Result<TableSchema> {
        if let Some(schema) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
        {
            return Ok(schema);
        }
        let schema = self.warehouse.fetch_schema(table).await?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    /// Compile a dimension expression and check it against the source table.
    pub async fn validate_expression(
        &self,
        registry: &SchemaRegistry,
        expression: &str,
    ) -> Result<ValidatedExpression> {
        let dialect = self.warehouse.dialect();
        let validated = ExpressionCompiler::new(dialect).compile(expression)?;
        let source = registry.source_table();

        let schema = self.ensure_schema(source).await?;
        let missing: Vec<String> = validated
            .depends_on
            .iter()
            .filter(|c| !schema.has_column(c))
            .cloned()
            .collect();
        self.check(missing, source)?;

        if self.dry_run {
            let probe = format!(
                "SELECT {} AS __probe FROM {} LIMIT 0",
                validated.sql,
                dialect.qualify_table(source)
            );
            self.warehouse
                .dry_run(&probe)
                .await
                .map_err(TallyError::into_warehouse)?;
        }
        Ok(validated)
    }

    /// Every physical column the registry names must exist on the source table.
    pub async fn validate_registry_columns(&self, registry: &SchemaRegistry) -> Result<()> {
        let source = registry.source_table();
        let schema = self.ensure_schema(source).await?;

        let mut wanted: Vec<&str> = vec![registry.date_column()];
        for metric in registry.base_metrics() {
            wanted.extend(metric.source_columns.iter().map(String::as_str));
        }
        for dim in registry.dimensions() {
            wanted.push(&dim.column_name);
        }
        for dim in registry.calculated_dimensions() {
            wanted.extend(dim.depends_on.iter().map(String::as_str));
        }

        let mut missing: Vec<String> = Vec::new();
        for col in wanted {
            if !schema.has_column(col) && !missing.iter().any(|m| m == col) {
                missing.push(col.to_string());
            }
        }
        self.check(missing, source)
    }

    fn check(&self, missing: Vec<String>, table: &str) -> Result<()> {
        if missing.is_empty() {
            return Ok(());
        }
        if self.warn_only {
            warn!(table, missing = ?missing, "columns not found on table");
            Ok(())
        } else {
            Err(TallyError::UnknownReference {
                references: missing,
            })
        }
    }
}
