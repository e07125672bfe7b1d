use chrono::NaiveDate;
use serde_json::Value;

use crate::dialect::Dialect;
use crate::schema::Aggregation;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    Date(NaiveDate),
    /// `*` in a select list.
    Wildcard,
    /// Pre-rendered SQL, e.g. a compiled calculated dimension.
    Raw(String),
    Function {
        func: Function,
        args: Vec<SqlExpr>,
    },
    Case {
        branches: Vec<(SqlExpr, SqlExpr)>,
        else_expr: Box<SqlExpr>,
    },
    BinaryOp {
        op: SqlBinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Negate(Box<SqlExpr>),
    /// Explicit parentheses.
    Nested(Box<SqlExpr>),
    Aggregate {
        agg: Aggregation,
        expr: Box<SqlExpr>,
    },
    /// Count of rows satisfying a predicate.
    CountIf(Box<SqlExpr>),
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
}

impl SqlExpr {
    pub fn column(name: impl Into<String>) -> Self {
        SqlExpr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        SqlExpr::Literal(Value::String(value.into()))
    }

    pub fn int(value: i64) -> Self {
        SqlExpr::Literal(Value::from(value))
    }

    pub fn binary(op: SqlBinaryOperator, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn func(func: Function, args: Vec<SqlExpr>) -> Self {
        SqlExpr::Function { func, args }
    }

    pub fn aggregate(agg: Aggregation, expr: SqlExpr) -> Self {
        SqlExpr::Aggregate {
            agg,
            expr: Box::new(expr),
        }
    }

    pub fn nested(expr: SqlExpr) -> Self {
        SqlExpr::Nested(Box::new(expr))
    }

    /// Visit this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a SqlExpr)) {
        visit(self);
        match self {
            SqlExpr::Function { args, .. } => args.iter().for_each(|a| a.walk(visit)),
            SqlExpr::Case {
                branches,
                else_expr,
            } => {
                for (when, then) in branches {
                    when.walk(visit);
                    then.walk(visit);
                }
                else_expr.walk(visit);
            }
            SqlExpr::BinaryOp { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            SqlExpr::Negate(inner) | SqlExpr::Nested(inner) | SqlExpr::CountIf(inner) => {
                inner.walk(visit)
            }
            SqlExpr::Aggregate { expr, .. } => expr.walk(visit),
            SqlExpr::InList { expr, list, .. } => {
                expr.walk(visit);
                list.iter().for_each(|v| v.walk(visit));
            }
            SqlExpr::Column { .. }
            | SqlExpr::Literal(_)
            | SqlExpr::Date(_)
            | SqlExpr::Wildcard
            | SqlExpr::Raw(_) => {}
        }
    }
}

/// Scalar functions the compiler can emit. Dialects decide the spelling.
#[derive(Debug, Clone, PartialEq)]
pub enum Function {
    SafeDivide,
    Coalesce,
    IfNull,
    NullIf,
    Concat,
    /// Cast to the dialect's string type.
    CastToString,
    /// `REPLACE(text, from, to)`; every occurrence.
    Replace,
    DateDiff { unit: TimeGrain },
    Round,
    Abs,
    Ceil,
    Floor,
    Greatest,
    Least,
    Sqrt,
    Power,
    Ln,
    Log10,
    Exp,
    Sign,
}

impl Function {
    /// Scalar functions a formula may call by name.
    pub fn from_formula_name(name: &str) -> Option<Function> {
        let func = match name.to_ascii_uppercase().as_str() {
            "ROUND" => Function::Round,
            "ABS" => Function::Abs,
            "CEIL" | "CEILING" => Function::Ceil,
            "FLOOR" => Function::Floor,
            "COALESCE" => Function::Coalesce,
            "IFNULL" => Function::IfNull,
            "NULLIF" => Function::NullIf,
            "GREATEST" => Function::Greatest,
            "LEAST" => Function::Least,
            "SQRT" => Function::Sqrt,
            "POWER" | "POW" => Function::Power,
            "LN" => Function::Ln,
            "LOG10" => Function::Log10,
            "EXP" => Function::Exp,
            "SIGN" => Function::Sign,
            "SAFE_DIVIDE" => Function::SafeDivide,
            _ => return None,
        };
        Some(func)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGrain {
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    And,
    Eq,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    pub filters: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub limit: Option<u64>,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> String {
        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| {
                let expr_sql = self.render_expr(&item.expr);
                match &item.alias {
                    Some(alias) => format!("{expr_sql} AS {}", self.dialect.quote_ident(alias)),
                    None => expr_sql,
                }
            })
            .collect();

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_items.join(", "),
            self.dialect.qualify_table(&query.from.name)
        );

        if !query.filters.is_empty() {
            let filters: Vec<String> = query.filters.iter().map(|f| self.render_expr(f)).collect();
            sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
        }

        if !query.group_by.is_empty() {
            let groups: Vec<String> = query.group_by.iter().map(|g| self.render_expr(g)).collect();
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        sql
    }

    pub fn render_expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column { table, name } => match table {
                Some(t) => format!(
                    "{}.{}",
                    self.dialect.quote_ident(t),
                    self.dialect.quote_ident(name)
                ),
                None => self.dialect.quote_ident(name),
            },
            SqlExpr::Literal(v) => self.dialect.render_literal(v),
            SqlExpr::Date(d) => format!("DATE '{}'", d.format("%Y-%m-%d")),
            SqlExpr::Wildcard => "*".to_string(),
            SqlExpr::Raw(sql) => sql.clone(),
            SqlExpr::Function { func, args } => {
                let rendered_args: Vec<String> = args.iter().map(|a| self.render_expr(a)).collect();
                self.dialect.render_function(func, rendered_args)
            }
            SqlExpr::Case {
                branches,
                else_expr,
            } => {
                let mut parts = Vec::new();
                parts.push("CASE".to_string());
                for (when, then) in branches {
                    parts.push(format!(
                        " WHEN {} THEN {}",
                        self.render_expr(when),
                        self.render_expr(then)
                    ));
                }
                parts.push(format!(" ELSE {} END", self.render_expr(else_expr)));
                parts.join("")
            }
            SqlExpr::BinaryOp { op, left, right } => {
                let op_sql = match op {
                    SqlBinaryOperator::Add => "+",
                    SqlBinaryOperator::Subtract => "-",
                    SqlBinaryOperator::Multiply => "*",
                    SqlBinaryOperator::Divide => "/",
                    SqlBinaryOperator::Modulo => "%",
                    SqlBinaryOperator::And => "AND",
                    SqlBinaryOperator::Eq => "=",
                };
                let right_sql = match **right {
                    SqlExpr::Negate(_) => format!("({})", self.render_expr(right)),
                    _ => self.render_expr(right),
                };
                format!("{} {} {}", self.render_expr(left), op_sql, right_sql)
            }
            // `--` would read as a comment
            SqlExpr::Negate(inner) if matches!(**inner, SqlExpr::Negate(_)) => {
                format!("-({})", self.render_expr(inner))
            }
            SqlExpr::Negate(inner) => format!("-{}", self.render_expr(inner)),
            SqlExpr::Nested(inner) => format!("({})", self.render_expr(inner)),
            SqlExpr::Aggregate { agg, expr } => self
                .dialect
                .render_aggregation(agg, &self.render_expr(expr)),
            SqlExpr::CountIf(cond) => self.dialect.render_count_if(&self.render_expr(cond)),
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let rendered_values: Vec<String> =
                    list.iter().map(|v| self.render_expr(v)).collect();
                let not_kw = if *negated { "NOT " } else { "" };
                format!(
                    "{} {}IN ({})",
                    self.render_expr(expr),
                    not_kw,
                    rendered_values.join(", ")
                )
            }
        }
    }
}
