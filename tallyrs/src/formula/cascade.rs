use tracing::{debug, warn};

use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::registry::SchemaRegistry;
use crate::schema::CalculatedMetric;

use super::compiler::FormulaCompiler;

#[derive(Debug)]
pub struct SkippedMetric {
    pub id: String,
    pub error: TallyError,
}

/// Recompiled dependents, ready to be written back in one batch.
#[derive(Debug, Default)]
pub struct CascadeOutcome {
    /// In dependency order: every metric follows the metrics it references.
    pub updated: Vec<CalculatedMetric>,
    pub skipped: Vec<SkippedMetric>,
}

impl CascadeOutcome {
    pub fn updated_ids(&self) -> Vec<&str> {
        self.updated.iter().map(|m| m.id.as_str()).collect()
    }
}

/// Recompile every metric that transitively depends on `metric_id`.
///
/// Pure over the snapshot: the registry is not touched. A dependent that fails to
/// recompile is reported in `skipped` and does not stop the rest of the batch.
pub fn cascade_update_dependents(
    registry: &SchemaRegistry,
    metric_id: &str,
    dialect: &dyn Dialect,
) -> Result<CascadeOutcome> {
    if registry.base_metric(metric_id).is_none() && registry.calculated_metric(metric_id).is_none()
    {
        return Err(TallyError::unknown(metric_id));
    }

    let compiler = FormulaCompiler::new(registry, dialect);
    let dependents = compiler.graph().transitive_dependents(metric_id);
    let order = compiler.graph().topological_order(&dependents)?;
    debug!(metric = metric_id, order = ?order, "cascading recompilation");

    let mut outcome = CascadeOutcome::default();
    for id in order {
        let Some(current) = registry.calculated_metric(&id) else {
            continue;
        };
        match compiler.compile(&current.formula, Some(&id)) {
            Ok(compiled) => {
                let mut metric = current.clone();
                metric.compiled_sql = compiled.sql;
                metric.depends_on_base = compiled.depends_on_base;
                metric.depends_on_calculated = compiled.depends_on_calculated;
                outcome.updated.push(metric);
            }
            Err(error) => {
                warn!(metric = %id, trigger = metric_id, error = %error, "skipping dependent that no longer compiles");
                outcome.skipped.push(SkippedMetric { id, error });
            }
        }
    }
    Ok(outcome)
}
