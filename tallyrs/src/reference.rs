//! The `{token}` reference grammar shared by metric formulas and dimension expressions.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TallyError};

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid token regex"));

static DENYLIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(DROP|DELETE|INSERT|UPDATE|CREATE|ALTER|TRUNCATE|MERGE|GRANT|REVOKE|EXEC|EXECUTE)\b",
    )
    .expect("valid denylist regex")
});

/// A `{token}` occurrence with its byte span in the source text (braces included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

pub fn is_valid_token(s: &str) -> bool {
    TOKEN.is_match(s)
}

/// Extract every `{token}` in `input`, in order of appearance. Braces inside
/// single-quoted literals are text; a doubled `''` stays inside the literal.
pub fn extract_references(input: &str) -> Result<Vec<Reference>> {
    let mut refs = Vec::new();
    let mut open: Option<usize> = None;
    let mut in_string = false;
    for (idx, ch) in input.char_indices() {
        match (ch, open) {
            ('\'', None) => in_string = !in_string,
            _ if in_string => {}
            ('{', None) => open = Some(idx),
            ('{', Some(at)) => {
                return Err(TallyError::Syntax(format!(
                    "nested '{{' at position {idx} (reference opened at {at})"
                )))
            }
            ('}', None) => {
                return Err(TallyError::Syntax(format!(
                    "unmatched '}}' at position {idx}"
                )))
            }
            ('}', Some(at)) => {
                let name = &input[at + 1..idx];
                if name.trim().is_empty() {
                    return Err(TallyError::Syntax(format!(
                        "empty reference at position {at}"
                    )));
                }
                if !is_valid_token(name) {
                    return Err(TallyError::Syntax(format!(
                        "invalid reference '{{{name}}}': references start with a letter or underscore and contain only letters, digits and underscores"
                    )));
                }
                refs.push(Reference {
                    name: name.to_string(),
                    start: at,
                    end: idx + 1,
                });
                open = None;
            }
            _ => {}
        }
    }
    if let Some(at) = open {
        return Err(TallyError::Syntax(format!(
            "unclosed '{{' at position {at}"
        )));
    }
    Ok(refs)
}

/// Distinct reference names in first-occurrence order.
pub fn unique_names(refs: &[Reference]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for r in refs {
        if !out.contains(&r.name) {
            out.push(r.name.clone());
        }
    }
    out
}

/// Reject SQL whose parentheses do not balance or that smuggles in DDL/DML.
pub fn guard_sql(sql: &str) -> Result<()> {
    let mut depth: i64 = 0;
    let mut in_string = false;
    for ch in sql.chars() {
        match ch {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth -= 1;
                if depth < 0 {
                    return Err(TallyError::Syntax("unbalanced parentheses: unexpected ')'".to_string()));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(TallyError::Syntax(format!(
            "unbalanced parentheses: {depth} unclosed '('"
        )));
    }
    for sep in [";", "--", "/*"] {
        if sql.contains(sep) {
            return Err(TallyError::ForbiddenConstruct(format!(
                "statement separator or comment '{sep}' is not allowed"
            )));
        }
    }
    if let Some(m) = DENYLIST.find(sql) {
        return Err(TallyError::ForbiddenConstruct(format!(
            "keyword {} is not allowed",
            m.as_str().to_uppercase()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_references_in_order() {
        let refs = extract_references("({a} + {b_2}) / {a}").unwrap();
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b_2", "a"]);
        assert_eq!(unique_names(&refs), vec!["a", "b_2"]);
        assert_eq!(refs[0].start, 1);
        assert_eq!(refs[0].end, 4);
    }

    #[test]
    fn rejects_malformed_references() {
        for bad in ["{}", "{1abc}", "{a-b}", "{a", "a}", "{{a}}", "{ }"] {
            assert!(
                matches!(extract_references(bad), Err(TallyError::Syntax(_))),
                "{bad} should be a syntax error"
            );
        }
    }

    #[test]
    fn braces_inside_string_literals_are_not_references() {
        let refs = extract_references(r"REGEXP_EXTRACT({url}, r'[0-9]{4}')").unwrap();
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["url"]);

        let refs = extract_references("CONCAT('it''s {x}', {a}, '}')").unwrap();
        assert_eq!(unique_names(&refs), vec!["a"]);
        assert_eq!(refs[0].start, 20);

        // a quote inside a reference does not open a literal
        assert!(matches!(
            extract_references("{a'b} + '{c}'"),
            Err(TallyError::Syntax(_))
        ));
    }

    #[test]
    fn guard_rejects_ddl_and_unbalanced_sql() {
        assert!(guard_sql("SUM(a) + (1").is_err());
        assert!(matches!(
            guard_sql("SUM(a); DROP TABLE x"),
            Err(TallyError::ForbiddenConstruct(_))
        ));
        assert!(matches!(
            guard_sql("SUM(deleted_rows) + delete_me"),
            Ok(())
        ));
        assert!(matches!(
            guard_sql("SUM(a) + truncate"),
            Err(TallyError::ForbiddenConstruct(_))
        ));
        assert!(guard_sql("SAFE_DIVIDE(SUM(a), COUNT(b))").is_ok());
    }

    #[test]
    fn guard_ignores_parens_inside_string_literals() {
        assert!(guard_sql("COALESCE(x, ')')").is_ok());
    }
}
