//! Table-level operations over persisted state.
//!
//! Every call loads what it needs from the store, works on that snapshot and
//! writes back only on success. Refreshes are the only long-running calls; each
//! holds an in-flight guard for its target so the same table is never rebuilt
//! twice at once. A refresh writes its outcome onto whatever is stored when it
//! finishes, not onto the snapshot it started from.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::backends::Warehouse;
use crate::config::TallyConfig;
use crate::error::{Result, TallyError};
use crate::expression::ValidatedExpression;
use crate::formula::{self, CascadeOutcome, CompiledFormula};
use crate::jobs::{BuildState, BuildStatus, RefreshJobs};
use crate::optimizer::{
    self, detect_cluster_columns, CompositeKeyMapping, OptimizedSourceConfig, RefreshMode,
    RefreshSummary, StalenessReport,
};
use crate::registry::SchemaRegistry;
use crate::rollup::{self, RollupBuilder, RollupCatalog, RollupDefinition, RollupUpdate};
use crate::router::{QueryRouter, RollupCandidate, RouteDecision, RouteRequest};
use crate::schema::{BaseMetric, CalculatedMetric};
use crate::store::{RollupStore, SchemaStore};
use crate::validation::Validator;

pub struct TableService<S> {
    store: Arc<S>,
    warehouse: Arc<dyn Warehouse>,
    config: TallyConfig,
    jobs: RefreshJobs,
    validator: Validator,
    /// Held across every load-modify-save of rollups and the optimized source.
    edits: Mutex<()>,
}

impl<S> TableService<S>
where
    S: SchemaStore + RollupStore,
{
    pub fn new(store: Arc<S>, warehouse: Arc<dyn Warehouse>, config: TallyConfig) -> Self {
        let validator = Validator::new(warehouse.clone(), &config.validation, &config.schema_cache);
        Self {
            store,
            warehouse,
            config,
            jobs: RefreshJobs::new(),
            validator,
            edits: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    pub fn jobs(&self) -> &RefreshJobs {
        &self.jobs
    }

    pub fn registry(&self, table: &str) -> Result<SchemaRegistry> {
        let document = self
            .store
            .load(table)?
            .ok_or_else(|| TallyError::unknown(table))?;
        SchemaRegistry::from_document(document)
    }

    /// Persist `registry`, returning it with the bumped version.
    pub fn save(&self, registry: SchemaRegistry) -> Result<SchemaRegistry> {
        let mut document = registry.into_document();
        self.store.save(&mut document)?;
        info!(table = %document.table, version = document.version, "saved schema");
        SchemaRegistry::from_document(document)
    }

    fn catalog(&self, table: &str) -> Result<RollupCatalog> {
        Ok(RollupCatalog::from_definitions(self.store.load_rollups(table)?))
    }

    fn lock_edits(&self) -> MutexGuard<'_, ()> {
        self.edits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the catalog, apply `edit` and save it when `edit` succeeds.
    fn edit_catalog<T>(
        &self,
        table: &str,
        edit: impl FnOnce(&mut RollupCatalog) -> Result<T>,
    ) -> Result<T> {
        let _lock = self.lock_edits();
        let mut catalog = self.catalog(table)?;
        let out = edit(&mut catalog)?;
        self.store.save_rollups(table, catalog.list())?;
        Ok(out)
    }

    pub fn compile_formula(
        &self,
        table: &str,
        formula: &str,
        current_metric_id: Option<&str>,
    ) -> Result<CompiledFormula> {
        let registry = self.registry(table)?;
        registry
            .compiler(self.warehouse.dialect())
            .compile(formula, current_metric_id)
    }

    pub async fn validate_expression(
        &self,
        table: &str,
        expression: &str,
    ) -> Result<ValidatedExpression> {
        let registry = self.registry(table)?;
        let validated = self.validator.validate_expression(&registry, expression).await?;
        for warning in &validated.warnings {
            warn!(table, expression, warning = %warning, "dimension expression warning");
        }
        Ok(validated)
    }

    pub async fn validate_columns(&self, table: &str) -> Result<()> {
        let registry = self.registry(table)?;
        self.validator.validate_registry_columns(&registry).await
    }

    pub fn add_calculated_metric(
        &self,
        table: &str,
        metric: CalculatedMetric,
    ) -> Result<CalculatedMetric> {
        let mut registry = self.registry(table)?;
        let added = registry
            .add_calculated_metric(metric, self.warehouse.dialect())?
            .clone();
        self.save(registry)?;
        Ok(added)
    }

    /// Replace a base metric, recompile its dependents and mark rollups storing it stale.
    pub fn update_base_metric(&self, table: &str, metric: BaseMetric) -> Result<CascadeOutcome> {
        let mut registry = self.registry(table)?;
        let id = metric.id.clone();
        let outcome = registry.update_base_metric(metric, self.warehouse.dialect())?;
        self.save(registry)?;

        let stale = self.edit_catalog(table, |catalog| {
            Ok(catalog.mark_stale_for_metrics(&[id.as_str()]))
        })?;
        if !stale.is_empty() {
            info!(table, metric = %id, rollups = ?stale, "rollups marked stale");
        }
        Ok(outcome)
    }

    pub fn update_calculated_metric(
        &self,
        table: &str,
        metric: CalculatedMetric,
    ) -> Result<CascadeOutcome> {
        let mut registry = self.registry(table)?;
        let outcome = registry.update_calculated_metric(metric, self.warehouse.dialect())?;
        self.save(registry)?;
        Ok(outcome)
    }

    /// Remove a metric nothing depends on, including rollup definitions.
    pub fn remove_metric(&self, table: &str, metric_id: &str) -> Result<()> {
        let stored_by: Vec<String> = self
            .catalog(table)?
            .list()
            .iter()
            .filter(|r| r.metrics.iter().any(|m| m.metric_id == metric_id))
            .map(|r| r.id.clone())
            .collect();
        if !stored_by.is_empty() {
            return Err(TallyError::SchemaValidation(format!(
                "{metric_id} is stored by rollups {}",
                stored_by.join(", ")
            )));
        }
        let mut registry = self.registry(table)?;
        registry.remove_metric(metric_id)?;
        self.save(registry)?;
        Ok(())
    }

    /// Recompile and store every dependent of `metric_id`.
    pub fn cascade_update_dependents(&self, table: &str, metric_id: &str) -> Result<CascadeOutcome> {
        let mut registry = self.registry(table)?;
        let outcome =
            formula::cascade_update_dependents(&registry, metric_id, self.warehouse.dialect())?;
        if !outcome.updated.is_empty() {
            registry.apply_cascade(&outcome);
            self.save(registry)?;
        }
        Ok(outcome)
    }

    pub fn analyze_composite_keys(&self, table: &str) -> Result<Vec<CompositeKeyMapping>> {
        let registry = self.registry(table)?;
        Ok(optimizer::analyze_composite_keys(
            &registry,
            self.warehouse.dialect(),
            &self.config.optimizer.key_prefix,
        ))
    }

    /// Derive key mappings and cluster columns for the table's optimized source.
    ///
    /// An already-built source whose plan changes is marked stale.
    pub async fn plan_optimized_source(&self, table: &str) -> Result<OptimizedSourceConfig> {
        let registry = self.registry(table)?;
        let key_mappings = optimizer::analyze_composite_keys(
            &registry,
            self.warehouse.dialect(),
            &self.config.optimizer.key_prefix,
        );
        let cluster_columns = detect_cluster_columns(
            &registry,
            self.warehouse.as_ref(),
            self.config.optimizer.max_cluster_columns,
        )
        .await?;

        let _lock = self.lock_edits();
        let mut plan = self.store.load_optimized_source(table)?.unwrap_or_else(|| {
            OptimizedSourceConfig::new(
                registry.source_table(),
                registry.date_column(),
                &self.config.optimizer,
            )
        });
        if key_mappings != plan.key_mappings || cluster_columns != plan.cluster_columns {
            plan.key_mappings = key_mappings;
            plan.cluster_columns = cluster_columns;
            plan.build.mark_stale();
        }
        self.store.save_optimized_source(table, &plan)?;
        Ok(plan)
    }

    pub async fn refresh_optimized_source(
        &self,
        table: &str,
        mode: RefreshMode,
    ) -> Result<RefreshSummary> {
        let _guard = self.jobs.try_start(format!("optimized:{table}"))?;
        let mut source = match self.store.load_optimized_source(table)? {
            Some(source) => source,
            None => self.plan_optimized_source(table).await?,
        };

        let previous = source.build.clone();
        self.edit_optimized_build(table, |build| build.mark_building())?;
        let interrupted = OnDrop::new(|| {
            let restored = self.edit_optimized_build(table, |build| {
                if build.status == BuildStatus::Building {
                    build.clone_from(&previous);
                }
            });
            match restored {
                Ok(()) => warn!(table, "optimized source refresh interrupted"),
                Err(err) => warn!(table, error = %err, "could not restore optimized source status"),
            }
        });

        let result = source.refresh(self.warehouse.as_ref(), mode).await;
        interrupted.disarm();
        self.record_optimized_build(table, &source)?;
        self.validator.invalidate(&source.optimized_table);
        result
    }

    fn edit_optimized_build(&self, table: &str, edit: impl FnOnce(&mut BuildState)) -> Result<()> {
        let _lock = self.lock_edits();
        if let Some(mut stored) = self.store.load_optimized_source(table)? {
            edit(&mut stored.build);
            self.store.save_optimized_source(table, &stored)?;
        }
        Ok(())
    }

    /// Store the outcome of refreshing `built`. A plan replaced mid-refresh keeps
    /// its own settings and is marked stale, since the new table follows the old plan.
    fn record_optimized_build(&self, table: &str, built: &OptimizedSourceConfig) -> Result<()> {
        let _lock = self.lock_edits();
        match self.store.load_optimized_source(table)? {
            Some(mut stored) if !stored.same_plan(built) => {
                warn!(table, "optimized source plan changed during refresh");
                stored.build.clone_from(&built.build);
                stored.build.mark_stale();
                self.store.save_optimized_source(table, &stored)
            }
            _ => self.store.save_optimized_source(table, built),
        }
    }

    pub async fn check_optimized_staleness(&self, table: &str) -> Result<StalenessReport> {
        let source = self.store.load_optimized_source(table)?.ok_or_else(|| {
            TallyError::SchemaValidation(format!("table {table} has no optimized source"))
        })?;
        let current = self.analyze_composite_keys(table)?;
        source
            .check_staleness(&current, self.warehouse.as_ref())
            .await
    }

    pub fn list_rollups(&self, table: &str) -> Result<Vec<RollupDefinition>> {
        self.store.load_rollups(table)
    }

    pub fn get_rollup(&self, table: &str, rollup_id: &str) -> Result<RollupDefinition> {
        self.catalog(table)?
            .get(rollup_id)
            .cloned()
            .ok_or_else(|| TallyError::unknown(rollup_id))
    }

    pub fn create_rollup(&self, table: &str, definition: RollupDefinition) -> Result<RollupDefinition> {
        let registry = self.registry(table)?;
        self.edit_catalog(table, |catalog| Ok(catalog.create(&registry, definition)?.clone()))
    }

    pub fn update_rollup(
        &self,
        table: &str,
        rollup_id: &str,
        update: RollupUpdate,
    ) -> Result<RollupDefinition> {
        let registry = self.registry(table)?;
        self.edit_catalog(table, |catalog| {
            Ok(catalog.update(&registry, rollup_id, update)?.clone())
        })
    }

    pub fn delete_rollup(&self, table: &str, rollup_id: &str) -> Result<RollupDefinition> {
        self.edit_catalog(table, |catalog| catalog.delete(rollup_id))
    }

    pub fn preview_rollup_sql(&self, table: &str, rollup_id: &str) -> Result<String> {
        let registry = self.registry(table)?;
        let catalog = self.catalog(table)?;
        let definition = catalog
            .get(rollup_id)
            .ok_or_else(|| TallyError::unknown(rollup_id))?;
        let optimized = self.store.load_optimized_source(table)?;
        RollupBuilder::new(&registry, self.warehouse.dialect())
            .with_optimized_source(optimized.as_ref())
            .build_sql(definition)
    }

    /// Rebuild one rollup table and persist its new status.
    pub async fn refresh_rollup(&self, table: &str, rollup_id: &str) -> Result<RollupDefinition> {
        let _guard = self.jobs.try_start(format!("rollup:{table}:{rollup_id}"))?;
        let registry = self.registry(table)?;
        let optimized = self.store.load_optimized_source(table)?;

        let mut definition = self.edit_catalog(table, |catalog| {
            let stored = catalog
                .get_mut(rollup_id)
                .ok_or_else(|| TallyError::unknown(rollup_id))?;
            let snapshot = stored.clone();
            stored.build.mark_building();
            Ok(snapshot)
        })?;
        let previous = definition.build.clone();
        let interrupted = OnDrop::new(|| {
            let restored = self.edit_catalog(table, |catalog| {
                if let Some(stored) = catalog
                    .get_mut(rollup_id)
                    .filter(|r| r.build.status == BuildStatus::Building)
                {
                    stored.build = previous;
                }
                Ok(())
            });
            match restored {
                Ok(()) => warn!(table, rollup = rollup_id, "rollup refresh interrupted"),
                Err(err) => warn!(table, rollup = rollup_id, error = %err, "could not restore rollup status"),
            }
        });

        let result =
            rollup::refresh_rollup(&mut definition, &registry, self.warehouse.as_ref(), optimized.as_ref())
                .await;
        interrupted.disarm();

        self.record_build(table, &definition)?;
        result.map(|_| definition)
    }

    /// Store the outcome of building `built`. A definition edited mid-refresh keeps
    /// its edits and is marked stale; a deleted one stays deleted.
    fn record_build(&self, table: &str, built: &RollupDefinition) -> Result<()> {
        self.edit_catalog(table, |catalog| {
            let Some(stored) = catalog.get_mut(&built.id) else {
                warn!(table, rollup = %built.id, "rollup deleted during refresh");
                return Ok(());
            };
            stored.build.clone_from(&built.build);
            if !stored.same_layout(built) {
                warn!(table, rollup = %built.id, "rollup changed during refresh");
                stored.build.mark_stale();
            }
            Ok(())
        })
    }

    pub fn route_query(&self, table: &str, request: &RouteRequest) -> Result<RouteDecision> {
        let registry = self.registry(table)?;
        let rollups = self.store.load_rollups(table)?;
        let optimized = self.store.load_optimized_source(table)?;
        QueryRouter::new(&registry, &rollups, optimized.as_ref(), self.config.router).route(request)
    }

    pub fn find_suitable_rollups(
        &self,
        table: &str,
        request: &RouteRequest,
    ) -> Result<Vec<RollupCandidate>> {
        let registry = self.registry(table)?;
        let rollups = self.store.load_rollups(table)?;
        let optimized = self.store.load_optimized_source(table)?;
        QueryRouter::new(&registry, &rollups, optimized.as_ref(), self.config.router)
            .find_suitable_rollups(request)
    }
}

/// Runs its callback when dropped unless disarmed first. Refresh futures use it
/// to put back the stored status when they are cancelled mid-build.
struct OnDrop<F: FnOnce()> {
    callback: Option<F>,
}

impl<F: FnOnce()> OnDrop<F> {
    fn new(callback: F) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    fn disarm(mut self) {
        self.callback = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}
