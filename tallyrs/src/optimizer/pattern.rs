//! The multi-column identity shape and its recognizer.
//!
//! A composite identity is rendered as `CONCAT(part(c1), '|', part(c2), ...)` where
//! `part(c)` is `COALESCE(REPLACE(REPLACE(CAST(c AS STRING), '~', '~~'), '|', '~p'), '~n')`.
//! Escaped parts never contain the separator and no non-null value escapes to
//! `~n`, so distinct tuples always give distinct keys.
//! The optimizer recognizes the shape on the expression tree, never on rendered SQL.

use serde_json::Value;

use crate::sql_ast::{Function, SqlExpr};

const SEPARATOR: &str = "|";
const ESCAPE: &str = "~";
const ESCAPED_ESCAPE: &str = "~~";
const ESCAPED_SEPARATOR: &str = "~p";
const NULL_MARKER: &str = "~n";

/// Null-safe concatenation of `columns`, one stable string per row identity.
pub fn composite_key_expr(columns: &[String]) -> SqlExpr {
    let mut args = Vec::with_capacity(columns.len() * 2);
    for (idx, col) in columns.iter().enumerate() {
        if idx > 0 {
            args.push(SqlExpr::string(SEPARATOR));
        }
        let text = SqlExpr::func(Function::CastToString, vec![SqlExpr::column(col.clone())]);
        let escaped = replace(replace(text, ESCAPE, ESCAPED_ESCAPE), SEPARATOR, ESCAPED_SEPARATOR);
        args.push(SqlExpr::func(
            Function::Coalesce,
            vec![escaped, SqlExpr::string(NULL_MARKER)],
        ));
    }
    SqlExpr::func(Function::Concat, args)
}

fn replace(expr: SqlExpr, from: &str, to: &str) -> SqlExpr {
    SqlExpr::func(
        Function::Replace,
        vec![expr, SqlExpr::string(from), SqlExpr::string(to)],
    )
}

/// Columns of a composite identity if `expr` has that shape.
///
/// Every non-literal argument of the `CONCAT` must be a null-coalescing wrapper
/// (`COALESCE` or `IFNULL`) around a single column, optionally cast to string
/// and passed through literal `REPLACE`s, with a literal fallback. Columns are
/// returned in written order.
pub fn match_composite_key(expr: &SqlExpr) -> Option<Vec<String>> {
    let SqlExpr::Function {
        func: Function::Concat,
        args,
    } = expr
    else {
        return None;
    };
    let mut columns = Vec::new();
    for arg in args {
        match arg {
            SqlExpr::Literal(Value::String(_)) => continue,
            SqlExpr::Function {
                func: Function::Coalesce | Function::IfNull,
                args: inner,
            } => match inner.as_slice() {
                [value, SqlExpr::Literal(_)] => columns.push(wrapped_column(value)?),
                _ => return None,
            },
            _ => return None,
        }
    }
    if columns.is_empty() {
        None
    } else {
        Some(columns)
    }
}

fn wrapped_column(expr: &SqlExpr) -> Option<String> {
    match expr {
        SqlExpr::Column { name, .. } => Some(name.clone()),
        SqlExpr::Function {
            func: Function::Replace,
            args,
        } => match args.as_slice() {
            [inner, SqlExpr::Literal(_), SqlExpr::Literal(_)] => wrapped_column(inner),
            _ => None,
        },
        SqlExpr::Function {
            func: Function::CastToString,
            args,
        } => match args.as_slice() {
            [SqlExpr::Column { name, .. }] => Some(name.clone()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{BigQueryDialect, DuckDbDialect};
    use crate::sql_ast::SqlRenderer;

    #[test]
    fn renders_null_safe_concatenation() {
        let expr = composite_key_expr(&["visit_id".to_string(), "query".to_string()]);
        let sql = SqlRenderer::new(&BigQueryDialect).render_expr(&expr);
        assert_eq!(
            sql,
            "CONCAT(\
             COALESCE(REPLACE(REPLACE(CAST(`visit_id` AS STRING), '~', '~~'), '|', '~p'), '~n'), '|', \
             COALESCE(REPLACE(REPLACE(CAST(`query` AS STRING), '~', '~~'), '|', '~p'), '~n'))"
        );

        let sql = SqlRenderer::new(&DuckDbDialect).render_expr(&expr);
        assert!(sql.starts_with(
            "concat(coalesce(replace(replace(CAST(\"visit_id\" AS VARCHAR), '~', '~~'), '|', '~p'), '~n'), '|'"
        ));
    }

    #[test]
    fn recognizes_its_own_shape() {
        let cols = vec!["visit_id".to_string(), "query".to_string()];
        assert_eq!(match_composite_key(&composite_key_expr(&cols)), Some(cols));
    }

    #[test]
    fn recognizes_hand_written_keys() {
        let expr = SqlExpr::func(
            Function::Concat,
            vec![
                SqlExpr::func(
                    Function::IfNull,
                    vec![SqlExpr::column("visit_id"), SqlExpr::string("")],
                ),
                SqlExpr::string("-"),
                SqlExpr::func(
                    Function::Coalesce,
                    vec![
                        SqlExpr::func(Function::CastToString, vec![SqlExpr::column("query")]),
                        SqlExpr::string(""),
                    ],
                ),
            ],
        );
        assert_eq!(
            match_composite_key(&expr),
            Some(vec!["visit_id".to_string(), "query".to_string()])
        );
    }

    #[test]
    fn rejects_other_concatenations() {
        let expr = SqlExpr::func(
            Function::Concat,
            vec![SqlExpr::column("a"), SqlExpr::string("-")],
        );
        assert_eq!(match_composite_key(&expr), None);
        assert_eq!(match_composite_key(&SqlExpr::column("a")), None);
    }
}
