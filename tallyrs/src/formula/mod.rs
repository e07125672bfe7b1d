//! Metric formulas: parsing, dependency tracking and compilation to SQL.

mod cascade;
mod compiler;
mod graph;
mod parser;

pub use cascade::{cascade_update_dependents, CascadeOutcome, SkippedMetric};
pub use compiler::{
    base_metric_expr, base_metric_input, system_metric_expr, CompiledFormula, FormulaCompiler,
};
pub use graph::DependencyGraph;
pub use parser::{parse_formula, ArithOp, FormulaAst};
