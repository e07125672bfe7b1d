use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::optimizer::pattern::composite_key_expr;
use crate::reference::{extract_references, guard_sql, unique_names};
use crate::registry::SchemaRegistry;
use crate::schema::{Aggregation, BaseMetric, SystemMetric};
use crate::sql_ast::{Function, SqlBinaryOperator, SqlExpr, SqlRenderer, TimeGrain};

use super::graph::DependencyGraph;
use super::parser::{parse_formula, ArithOp, FormulaAst};

/// Result of compiling one formula against a registry snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFormula {
    pub sql: String,
    /// Expression tree the SQL was rendered from.
    pub expr: SqlExpr,
    pub depends_on_base: Vec<String>,
    pub depends_on_calculated: Vec<String>,
}

/// Compiles `{metric}` formulas to SQL for one dialect.
///
/// Holds a borrowed snapshot of the registry and never mutates it.
pub struct FormulaCompiler<'a> {
    registry: &'a SchemaRegistry,
    dialect: &'a dyn Dialect,
    graph: DependencyGraph,
}

impl<'a> FormulaCompiler<'a> {
    pub fn new(registry: &'a SchemaRegistry, dialect: &'a dyn Dialect) -> Self {
        Self {
            registry,
            dialect,
            graph: DependencyGraph::build(registry),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Compile `formula`. Pass `current_metric_id` when (re)validating an existing or new
    /// metric so references back to it are reported as cycles.
    pub fn compile(&self, formula: &str, current_metric_id: Option<&str>) -> Result<CompiledFormula> {
        let refs = extract_references(formula)?;
        let names = unique_names(&refs);

        let mut depends_on_base = Vec::new();
        let mut depends_on_calculated = Vec::new();
        let mut unknown = Vec::new();
        for name in names {
            if self.registry.base_metric(&name).is_some() {
                depends_on_base.push(name);
            } else if self.registry.calculated_metric(&name).is_some()
                || current_metric_id == Some(name.as_str())
            {
                depends_on_calculated.push(name);
            } else if SystemMetric::from_id(&name).is_none() {
                unknown.push(name);
            }
        }
        if !unknown.is_empty() {
            return Err(TallyError::UnknownReference {
                references: unknown,
            });
        }

        if let Some(id) = current_metric_id {
            if let Some(cycle) = self.graph.cycle_through(id, &depends_on_calculated) {
                return Err(TallyError::CircularDependency { cycle });
            }
        }

        let ast = parse_formula(formula)?;
        let mut visiting: Vec<String> = current_metric_id.map(str::to_string).into_iter().collect();
        let expr = self.lower(&ast, &mut visiting)?;
        let sql = SqlRenderer::new(self.dialect).render_expr(&expr);
        guard_sql(&sql)?;

        debug!(
            metric = current_metric_id.unwrap_or("<adhoc>"),
            formula,
            sql = %sql,
            dialect = self.dialect.name(),
            "compiled formula"
        );
        Ok(CompiledFormula {
            sql,
            expr,
            depends_on_base,
            depends_on_calculated,
        })
    }

    fn lower(&self, ast: &FormulaAst, visiting: &mut Vec<String>) -> Result<SqlExpr> {
        match ast {
            FormulaAst::Reference(name) => self.lower_reference(name, visiting),
            // The tokenizer only admits digits and one dot
            FormulaAst::Number(n) => Ok(SqlExpr::Raw(n.clone())),
            FormulaAst::Text(t) => Ok(SqlExpr::string(t.clone())),
            FormulaAst::Negate(inner) => Ok(SqlExpr::Negate(Box::new(self.lower(inner, visiting)?))),
            FormulaAst::Group(inner) => Ok(SqlExpr::nested(self.lower(inner, visiting)?)),
            FormulaAst::Binary { op, left, right } => {
                let left = self.lower(left, visiting)?;
                let right = self.lower(right, visiting)?;
                Ok(match op {
                    ArithOp::Divide => SqlExpr::func(Function::SafeDivide, vec![left, right]),
                    ArithOp::Add => SqlExpr::binary(SqlBinaryOperator::Add, left, right),
                    ArithOp::Subtract => SqlExpr::binary(SqlBinaryOperator::Subtract, left, right),
                    ArithOp::Multiply => SqlExpr::binary(SqlBinaryOperator::Multiply, left, right),
                    ArithOp::Modulo => SqlExpr::binary(SqlBinaryOperator::Modulo, left, right),
                })
            }
            FormulaAst::Call { name, args } => {
                let func = Function::from_formula_name(name).ok_or_else(|| {
                    TallyError::ForbiddenConstruct(format!(
                        "function {} is not allowed in formulas",
                        name.to_uppercase()
                    ))
                })?;
                check_arity(name, &func, args.len())?;
                let args = args
                    .iter()
                    .map(|a| self.lower(a, visiting))
                    .collect::<Result<Vec<_>>>()?;
                Ok(SqlExpr::func(func, args))
            }
        }
    }

    fn lower_reference(&self, name: &str, visiting: &mut Vec<String>) -> Result<SqlExpr> {
        if let Some(base) = self.registry.base_metric(name) {
            return Ok(base_metric_expr(base));
        }
        if let Some(calc) = self.registry.calculated_metric(name) {
            if visiting.iter().any(|v| v == name) {
                let mut cycle = visiting.clone();
                cycle.push(name.to_string());
                return Err(TallyError::CircularDependency { cycle });
            }
            visiting.push(name.to_string());
            let inner = parse_formula(&calc.formula).and_then(|ast| self.lower(&ast, visiting));
            visiting.pop();
            return Ok(SqlExpr::nested(inner?));
        }
        if let Some(system) = SystemMetric::from_id(name) {
            return Ok(system_metric_expr(system, self.registry.date_column()));
        }
        Err(TallyError::unknown(name))
    }
}

/// `AGG(column)`, or the distinct count of the composite identity for multi-column metrics.
pub fn base_metric_expr(metric: &BaseMetric) -> SqlExpr {
    SqlExpr::aggregate(metric.aggregation, base_metric_input(metric))
}

/// The row-level value a base metric aggregates.
pub fn base_metric_input(metric: &BaseMetric) -> SqlExpr {
    if metric.is_composite() {
        composite_key_expr(&metric.source_columns)
    } else {
        SqlExpr::column(metric.source_columns.first().cloned().unwrap_or_default())
    }
}

pub fn system_metric_expr(metric: SystemMetric, date_column: &str) -> SqlExpr {
    match metric {
        SystemMetric::DaysInRange => SqlExpr::binary(
            SqlBinaryOperator::Add,
            SqlExpr::func(
                Function::DateDiff {
                    unit: TimeGrain::Day,
                },
                vec![
                    SqlExpr::aggregate(Aggregation::Min, SqlExpr::column(date_column)),
                    SqlExpr::aggregate(Aggregation::Max, SqlExpr::column(date_column)),
                ],
            ),
            SqlExpr::int(1),
        ),
    }
}

fn check_arity(name: &str, func: &Function, given: usize) -> Result<()> {
    let (min, max) = match func {
        Function::SafeDivide | Function::NullIf | Function::Power | Function::IfNull => (2, 2),
        Function::Round => (1, 2),
        Function::Coalesce | Function::Greatest | Function::Least => (1, usize::MAX),
        _ => (1, 1),
    };
    if given < min || given > max {
        let expected = if max == usize::MAX {
            format!("at least {min}")
        } else if min == max {
            min.to_string()
        } else {
            format!("{min} to {max}")
        };
        return Err(TallyError::Syntax(format!(
            "{} expects {expected} argument(s), got {given}",
            name.to_uppercase()
        )));
    }
    Ok(())
}
