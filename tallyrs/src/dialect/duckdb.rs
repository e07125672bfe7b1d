//! DuckDB dialect implementation.

use crate::sql_ast::Function;

use super::{grain_to_str, Dialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn string_type(&self) -> &'static str {
        "VARCHAR"
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String {
        match func {
            Function::DateDiff { unit } => {
                let unit_str = grain_to_str(unit);
                match args.as_slice() {
                    [start, end] => format!("date_diff('{unit_str}', {start}, {end})"),
                    _ => "NULL".to_string(),
                }
            }
            Function::Concat => format!("concat({})", args.join(", ")),
            Function::CastToString => match args.as_slice() {
                [expr] => format!("CAST({expr} AS VARCHAR)"),
                _ => "NULL".to_string(),
            },
            Function::Replace => format!("replace({})", args.join(", ")),

            // === Null Handling ===
            Function::Coalesce => format!("coalesce({})", args.join(", ")),
            Function::IfNull => format!("ifnull({})", args.join(", ")),
            Function::NullIf => match args.as_slice() {
                [expr1, expr2] => format!("nullif({expr1}, {expr2})"),
                _ => "NULL".to_string(),
            },

            // === Math Functions ===
            Function::SafeDivide => match args.as_slice() {
                [left, right] => format!("({left}) / NULLIF({right}, 0)"),
                _ => "NULL".to_string(),
            },
            Function::Greatest => format!("greatest({})", args.join(", ")),
            Function::Least => format!("least({})", args.join(", ")),
            Function::Abs => format!("abs({})", args.join(", ")),
            Function::Ceil => format!("ceil({})", args.join(", ")),
            Function::Floor => format!("floor({})", args.join(", ")),
            Function::Round => match args.as_slice() {
                [expr, decimals] => format!("round({expr}, {decimals})"),
                [expr] => format!("round({expr})"),
                _ => "NULL".to_string(),
            },
            Function::Power => match args.as_slice() {
                [base, exp] => format!("power({base}, {exp})"),
                _ => "NULL".to_string(),
            },
            Function::Sqrt => format!("sqrt({})", args.join(", ")),
            Function::Ln => format!("ln({})", args.join(", ")),
            Function::Log10 => format!("log10({})", args.join(", ")),
            Function::Exp => format!("exp({})", args.join(", ")),
            Function::Sign => format!("sign({})", args.join(", ")),
        }
    }
}
