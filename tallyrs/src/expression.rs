//! Row-level dimension expressions: `{column}` references over a single row.
//!
//! Unlike metric formulas these are passed through as SQL text, so the checks
//! here are lexical: references are substituted by quoted identifiers, function
//! calls are scanned by name, and the result goes through the same guard.

use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{Result, TallyError};
use crate::reference::{extract_references, guard_sql, unique_names};

/// Aggregates have no meaning on a single row.
const AGGREGATE_FUNCTIONS: &[&str] = &[
    "SUM",
    "AVG",
    "COUNT",
    "COUNT_DISTINCT",
    "MIN",
    "MAX",
    "APPROX_COUNT_DISTINCT",
    "COUNTIF",
    "ARRAY_AGG",
    "STRING_AGG",
    "ANY_VALUE",
    "LOGICAL_AND",
    "LOGICAL_OR",
    "STDDEV",
    "VARIANCE",
];

/// Extraction functions return NULL when nothing matches.
const NULL_PRONE_FUNCTIONS: &[&str] = &[
    "REGEXP_EXTRACT",
    "JSON_EXTRACT",
    "JSON_EXTRACT_SCALAR",
    "JSON_VALUE",
    "SPLIT",
    "SAFE_CAST",
];

const NULL_GUARDS: &[&str] = &["COALESCE", "IFNULL"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedExpression {
    pub sql: String,
    /// Referenced column names, first occurrence first.
    pub depends_on: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ExpressionCompiler<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> ExpressionCompiler<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn compile(&self, expression: &str) -> Result<ValidatedExpression> {
        if expression.trim().is_empty() {
            return Err(TallyError::Syntax("expression is empty".to_string()));
        }
        let refs = extract_references(expression)?;

        let mut sql = String::with_capacity(expression.len());
        let mut cursor = 0;
        for r in &refs {
            sql.push_str(&expression[cursor..r.start]);
            sql.push_str(&self.dialect.quote_ident(&r.name));
            cursor = r.end;
        }
        sql.push_str(&expression[cursor..]);
        guard_sql(&sql)?;

        let calls = scan_calls(&mask(expression));
        if let Some(call) = calls
            .iter()
            .find(|c| AGGREGATE_FUNCTIONS.contains(&c.name.as_str()))
        {
            return Err(TallyError::ForbiddenConstruct(format!(
                "aggregate function {} is not allowed in a row-level expression",
                call.name
            )));
        }

        let mut warnings = Vec::new();
        for call in &calls {
            if NULL_PRONE_FUNCTIONS.contains(&call.name.as_str())
                && !call
                    .enclosing
                    .iter()
                    .any(|outer| NULL_GUARDS.contains(&outer.as_str()))
            {
                warnings.push(format!(
                    "{} can return NULL; wrap it in COALESCE or IFNULL to supply a default",
                    call.name
                ));
            }
        }
        if refs.is_empty() {
            warnings.push(
                "expression references no columns and evaluates to the same value on every row"
                    .to_string(),
            );
        }

        let depends_on = unique_names(&refs);
        debug!(expression, sql = %sql, warnings = warnings.len(), "compiled dimension expression");
        Ok(ValidatedExpression {
            sql,
            depends_on,
            warnings,
        })
    }
}

#[derive(Debug)]
struct Call {
    /// Upper-cased function name.
    name: String,
    /// Names of the calls this one is nested in, outermost first.
    enclosing: Vec<String>,
}

/// Blank out string literals and `{...}` references so neither is read as a call.
fn mask(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut in_string = false;
    let mut in_ref = false;
    for ch in expression.chars() {
        match ch {
            '\'' if !in_ref => {
                in_string = !in_string;
                out.push(ch);
            }
            '{' if !in_string => {
                in_ref = true;
                out.push(' ');
            }
            '}' if in_ref => {
                in_ref = false;
                out.push(' ');
            }
            _ if in_string || in_ref => out.push(' '),
            _ => out.push(ch),
        }
    }
    out
}

fn scan_calls(masked: &str) -> Vec<Call> {
    let chars: Vec<char> = masked.chars().collect();
    let mut calls = Vec::new();
    // One entry per open paren; bare parentheses push an empty name
    let mut stack: Vec<String> = Vec::new();
    let mut ident = String::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch.is_ascii_alphanumeric() || ch == '_' {
            ident.push(ch);
            i += 1;
            continue;
        }
        let word = std::mem::take(&mut ident);
        let mut j = i;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        if chars.get(j) == Some(&'(') {
            let name = word.to_ascii_uppercase();
            if !name.is_empty() && !name.chars().all(|c| c.is_ascii_digit()) {
                calls.push(Call {
                    name: name.clone(),
                    enclosing: stack.iter().filter(|s| !s.is_empty()).cloned().collect(),
                });
            }
            stack.push(name);
            i = j + 1;
            continue;
        }
        if ch == ')' {
            stack.pop();
        }
        i += 1;
    }
    calls
}
