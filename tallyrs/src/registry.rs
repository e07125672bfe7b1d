use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::expression::ExpressionCompiler;
use crate::formula::{cascade_update_dependents, CascadeOutcome, DependencyGraph, FormulaCompiler};
use crate::schema::{
    check_id, BaseMetric, CalculatedDimension, CalculatedMetric, Dimension, DimensionKind,
    MetricKind, SchemaDocument, SystemMetric,
};

/// Metrics and dimensions of one logical table.
///
/// Every mutation validates first and only then writes, so a failed call leaves
/// the registry exactly as it was.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    document: SchemaDocument,
}

impl SchemaRegistry {
    pub fn new(table: impl Into<String>, source_table: impl Into<String>) -> Self {
        Self {
            document: SchemaDocument::new(table, source_table),
        }
    }

    /// Wrap a loaded document after checking ids and base-metric shapes.
    ///
    /// Stored derived fields of calculated metrics are taken as-is; use
    /// [`SchemaRegistry::validate_all`] to recompile them.
    pub fn from_document(document: SchemaDocument) -> Result<Self> {
        let mut metric_ids = HashSet::new();
        for metric in &document.base_metrics {
            metric.validate()?;
            ensure_unique(&mut metric_ids, &metric.id, "metric")?;
        }
        for metric in &document.calculated_metrics {
            check_id(&metric.id)?;
            ensure_unique(&mut metric_ids, &metric.id, "metric")?;
        }
        for system in SystemMetric::ALL {
            if metric_ids.contains(system.id()) {
                return Err(TallyError::SchemaValidation(format!(
                    "metric id {} is reserved",
                    system.id()
                )));
            }
        }

        let mut dimension_ids = HashSet::new();
        for dim in &document.dimensions {
            check_id(&dim.id)?;
            ensure_unique(&mut dimension_ids, &dim.id, "dimension")?;
        }
        for dim in &document.calculated_dimensions {
            check_id(&dim.id)?;
            ensure_unique(&mut dimension_ids, &dim.id, "dimension")?;
        }

        Ok(Self { document })
    }

    /// Load a schema document from YAML or JSON (by extension).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let document: SchemaDocument = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Self::from_document(document)
    }

    pub fn document(&self) -> &SchemaDocument {
        &self.document
    }

    pub fn into_document(self) -> SchemaDocument {
        self.document
    }

    pub fn table(&self) -> &str {
        &self.document.table
    }

    pub fn source_table(&self) -> &str {
        &self.document.source_table
    }

    pub fn date_column(&self) -> &str {
        &self.document.date_column
    }

    pub fn base_metrics(&self) -> &[BaseMetric] {
        &self.document.base_metrics
    }

    pub fn calculated_metrics(&self) -> &[CalculatedMetric] {
        &self.document.calculated_metrics
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.document.dimensions
    }

    pub fn calculated_dimensions(&self) -> &[CalculatedDimension] {
        &self.document.calculated_dimensions
    }

    pub fn base_metric(&self, id: &str) -> Option<&BaseMetric> {
        self.document.base_metrics.iter().find(|m| m.id == id)
    }

    pub fn calculated_metric(&self, id: &str) -> Option<&CalculatedMetric> {
        self.document.calculated_metrics.iter().find(|m| m.id == id)
    }

    pub fn metric(&self, id: &str) -> Option<MetricKind<'_>> {
        if let Some(m) = self.base_metric(id) {
            return Some(MetricKind::Base(m));
        }
        if let Some(m) = self.calculated_metric(id) {
            return Some(MetricKind::Calculated(m));
        }
        SystemMetric::from_id(id).map(MetricKind::System)
    }

    pub fn dimension(&self, id: &str) -> Option<DimensionKind<'_>> {
        if let Some(d) = self.document.dimensions.iter().find(|d| d.id == id) {
            return Some(DimensionKind::Column(d));
        }
        self.document
            .calculated_dimensions
            .iter()
            .find(|d| d.id == id)
            .map(DimensionKind::Calculated)
    }

    pub fn compiler<'a>(&'a self, dialect: &'a dyn Dialect) -> FormulaCompiler<'a> {
        FormulaCompiler::new(self, dialect)
    }

    pub fn add_base_metric(&mut self, metric: BaseMetric) -> Result<()> {
        metric.validate()?;
        self.ensure_metric_id_free(&metric.id)?;
        self.document.base_metrics.push(metric);
        Ok(())
    }

    /// Replace a base metric's definition and recompile everything built on it.
    pub fn update_base_metric(
        &mut self,
        metric: BaseMetric,
        dialect: &dyn Dialect,
    ) -> Result<CascadeOutcome> {
        metric.validate()?;
        let id = metric.id.clone();
        let slot = self
            .document
            .base_metrics
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| TallyError::unknown(&id))?;
        *slot = metric;
        let outcome = cascade_update_dependents(self, &id, dialect)?;
        self.apply_cascade(&outcome);
        Ok(outcome)
    }

    /// Compile and store a new calculated metric.
    pub fn add_calculated_metric(
        &mut self,
        mut metric: CalculatedMetric,
        dialect: &dyn Dialect,
    ) -> Result<&CalculatedMetric> {
        check_id(&metric.id)?;
        self.ensure_metric_id_free(&metric.id)?;
        let compiled = self.compiler(dialect).compile(&metric.formula, Some(&metric.id))?;
        metric.compiled_sql = compiled.sql;
        metric.depends_on_base = compiled.depends_on_base;
        metric.depends_on_calculated = compiled.depends_on_calculated;
        info!(metric = %metric.id, "added calculated metric");
        self.document.calculated_metrics.push(metric);
        let idx = self.document.calculated_metrics.len() - 1;
        Ok(&self.document.calculated_metrics[idx])
    }

    /// Recompile a calculated metric with its new definition, then its dependents.
    pub fn update_calculated_metric(
        &mut self,
        mut metric: CalculatedMetric,
        dialect: &dyn Dialect,
    ) -> Result<CascadeOutcome> {
        let idx = self
            .document
            .calculated_metrics
            .iter()
            .position(|m| m.id == metric.id)
            .ok_or_else(|| TallyError::unknown(&metric.id))?;
        let compiled = self.compiler(dialect).compile(&metric.formula, Some(&metric.id))?;
        metric.compiled_sql = compiled.sql;
        metric.depends_on_base = compiled.depends_on_base;
        metric.depends_on_calculated = compiled.depends_on_calculated;

        let id = metric.id.clone();
        self.document.calculated_metrics[idx] = metric;
        let outcome = cascade_update_dependents(self, &id, dialect)?;
        self.apply_cascade(&outcome);
        Ok(outcome)
    }

    /// Remove a base or calculated metric nothing else references.
    pub fn remove_metric(&mut self, id: &str) -> Result<()> {
        let graph = DependencyGraph::build(self);
        let dependents: Vec<String> = graph.direct_dependents(id).cloned().collect();
        if !dependents.is_empty() {
            return Err(TallyError::SchemaValidation(format!(
                "metric {id} is referenced by {}",
                dependents.join(", ")
            )));
        }
        let before = self.document.base_metrics.len() + self.document.calculated_metrics.len();
        self.document.base_metrics.retain(|m| m.id != id);
        self.document.calculated_metrics.retain(|m| m.id != id);
        if before == self.document.base_metrics.len() + self.document.calculated_metrics.len() {
            return Err(TallyError::unknown(id));
        }
        Ok(())
    }

    pub fn add_dimension(&mut self, dimension: Dimension) -> Result<()> {
        check_id(&dimension.id)?;
        self.ensure_dimension_id_free(&dimension.id)?;
        self.document.dimensions.push(dimension);
        Ok(())
    }

    /// Compile and store a calculated dimension; returns the compiler's warnings.
    pub fn add_calculated_dimension(
        &mut self,
        mut dimension: CalculatedDimension,
        dialect: &dyn Dialect,
    ) -> Result<Vec<String>> {
        check_id(&dimension.id)?;
        self.ensure_dimension_id_free(&dimension.id)?;
        let compiled = ExpressionCompiler::new(dialect).compile(&dimension.sql_expression)?;
        dimension.compiled_sql = compiled.sql;
        dimension.depends_on = compiled.depends_on;
        self.document.calculated_dimensions.push(dimension);
        Ok(compiled.warnings)
    }

    pub fn remove_dimension(&mut self, id: &str) -> Result<()> {
        let before = self.document.dimensions.len() + self.document.calculated_dimensions.len();
        self.document.dimensions.retain(|d| d.id != id);
        self.document.calculated_dimensions.retain(|d| d.id != id);
        if before == self.document.dimensions.len() + self.document.calculated_dimensions.len() {
            return Err(TallyError::unknown(id));
        }
        Ok(())
    }

    /// Write recompiled dependents back in one batch.
    pub fn apply_cascade(&mut self, outcome: &CascadeOutcome) {
        for updated in &outcome.updated {
            if let Some(slot) = self
                .document
                .calculated_metrics
                .iter_mut()
                .find(|m| m.id == updated.id)
            {
                *slot = updated.clone();
            }
        }
    }

    /// Recompile every calculated metric and dimension in place.
    ///
    /// Returns the ids that failed with their errors; failing entries keep their
    /// previously stored derived fields.
    pub fn validate_all(&mut self, dialect: &dyn Dialect) -> Vec<(String, TallyError)> {
        let mut failures = Vec::new();
        let mut compiled_metrics = Vec::new();
        {
            let compiler = FormulaCompiler::new(self, dialect);
            for metric in &self.document.calculated_metrics {
                match compiler.compile(&metric.formula, Some(&metric.id)) {
                    Ok(compiled) => compiled_metrics.push((metric.id.clone(), compiled)),
                    Err(err) => {
                        warn!(metric = %metric.id, error = %err, "calculated metric failed validation");
                        failures.push((metric.id.clone(), err));
                    }
                }
            }
        }
        for (id, compiled) in compiled_metrics {
            if let Some(slot) = self
                .document
                .calculated_metrics
                .iter_mut()
                .find(|m| m.id == id)
            {
                slot.compiled_sql = compiled.sql;
                slot.depends_on_base = compiled.depends_on_base;
                slot.depends_on_calculated = compiled.depends_on_calculated;
            }
        }

        let expressions = ExpressionCompiler::new(dialect);
        for dim in &mut self.document.calculated_dimensions {
            match expressions.compile(&dim.sql_expression) {
                Ok(compiled) => {
                    dim.compiled_sql = compiled.sql;
                    dim.depends_on = compiled.depends_on;
                }
                Err(err) => {
                    warn!(dimension = %dim.id, error = %err, "calculated dimension failed validation");
                    failures.push((dim.id.clone(), err));
                }
            }
        }
        failures
    }

    fn ensure_metric_id_free(&self, id: &str) -> Result<()> {
        if self.metric(id).is_some() {
            return Err(TallyError::SchemaValidation(format!(
                "metric {id} already exists"
            )));
        }
        Ok(())
    }

    fn ensure_dimension_id_free(&self, id: &str) -> Result<()> {
        if self.dimension(id).is_some() {
            return Err(TallyError::SchemaValidation(format!(
                "dimension {id} already exists"
            )));
        }
        Ok(())
    }
}

fn ensure_unique(seen: &mut HashSet<String>, id: &str, kind: &str) -> Result<()> {
    if !seen.insert(id.to_string()) {
        return Err(TallyError::SchemaValidation(format!(
            "duplicate {kind} id {id}"
        )));
    }
    Ok(())
}
