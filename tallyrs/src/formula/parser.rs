//! Precedence-climbing parser for metric formulas.
//!
//! Grammar:
//! ```text
//! expr    := unary (op unary)*            -- `*` `/` `%` bind tighter than `+` `-`
//! unary   := ('-' | '+') unary | primary
//! primary := '{' id '}' | number | 'text' | name '(' args ')' | '(' expr ')'
//! ```
//! Operators are left associative.

use crate::error::{Result, TallyError};
use crate::reference::is_valid_token;

#[derive(Debug, Clone, PartialEq)]
pub enum FormulaAst {
    Reference(String),
    Number(String),
    Text(String),
    Negate(Box<FormulaAst>),
    Binary {
        op: ArithOp,
        left: Box<FormulaAst>,
        right: Box<FormulaAst>,
    },
    Call {
        name: String,
        args: Vec<FormulaAst>,
    },
    /// Parentheses written by the author.
    Group(Box<FormulaAst>),
}

impl FormulaAst {
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FormulaAst::Reference(name) => out.push(name),
            FormulaAst::Negate(inner) | FormulaAst::Group(inner) => inner.collect_references(out),
            FormulaAst::Binary { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            FormulaAst::Call { args, .. } => args.iter().for_each(|a| a.collect_references(out)),
            FormulaAst::Number(_) | FormulaAst::Text(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

impl ArithOp {
    fn precedence(self) -> u8 {
        match self {
            ArithOp::Add | ArithOp::Subtract => 1,
            ArithOp::Multiply | ArithOp::Divide | ArithOp::Modulo => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Reference(String),
    Number(String),
    Text(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Op(ArithOp),
}

pub fn parse_formula(input: &str) -> Result<FormulaAst> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(TallyError::Syntax("formula is empty".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr(1)?;
    if let Some((token, at)) = parser.tokens.get(parser.pos) {
        return Err(TallyError::Syntax(format!(
            "unexpected {} at position {at}",
            describe(token)
        )));
    }
    Ok(ast)
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (at, ch) = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '{' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|(_, c)| *c == '}' || *c == '{')
                    .map(|p| p + i + 1)
                    .filter(|&p| chars[p].1 == '}')
                    .ok_or_else(|| {
                        TallyError::Syntax(format!("unclosed '{{' at position {at}"))
                    })?;
                let name: String = chars[i + 1..close].iter().map(|(_, c)| *c).collect();
                if name.trim().is_empty() {
                    return Err(TallyError::Syntax(format!(
                        "empty reference at position {at}"
                    )));
                }
                if !is_valid_token(&name) {
                    return Err(TallyError::Syntax(format!(
                        "invalid reference '{{{name}}}' at position {at}"
                    )));
                }
                tokens.push((Token::Reference(name), at));
                i = close + 1;
            }
            '}' => {
                return Err(TallyError::Syntax(format!(
                    "unmatched '}}' at position {at}"
                )))
            }
            '\'' => {
                let mut text = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => {
                            return Err(TallyError::Syntax(format!(
                                "unterminated string at position {at}"
                            )))
                        }
                        Some((_, '\'')) if matches!(chars.get(j + 1), Some((_, '\''))) => {
                            text.push('\'');
                            j += 2;
                        }
                        Some((_, '\'')) => break,
                        Some((_, c)) => {
                            text.push(*c);
                            j += 1;
                        }
                    }
                }
                tokens.push((Token::Text(text), at));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut j = i;
                let mut seen_dot = false;
                while let Some((_, c)) = chars.get(j) {
                    if c.is_ascii_digit() {
                        j += 1;
                    } else if *c == '.' && !seen_dot {
                        seen_dot = true;
                        j += 1;
                    } else {
                        break;
                    }
                }
                let number: String = chars[i..j].iter().map(|(_, c)| *c).collect();
                if number == "." {
                    return Err(TallyError::Syntax(format!(
                        "unexpected '.' at position {at}"
                    )));
                }
                tokens.push((Token::Number(number), at));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while let Some((_, c)) = chars.get(j) {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let ident: String = chars[i..j].iter().map(|(_, c)| *c).collect();
                tokens.push((Token::Ident(ident), at));
                i = j;
            }
            '(' => {
                tokens.push((Token::LParen, at));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, at));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, at));
                i += 1;
            }
            '+' | '-' | '*' | '/' | '%' => {
                let op = match ch {
                    '+' => ArithOp::Add,
                    '-' => ArithOp::Subtract,
                    '*' => ArithOp::Multiply,
                    '/' => ArithOp::Divide,
                    _ => ArithOp::Modulo,
                };
                tokens.push((Token::Op(op), at));
                i += 1;
            }
            other => {
                return Err(TallyError::Syntax(format!(
                    "unexpected character '{other}' at position {at}"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<FormulaAst> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if op.precedence() < min_prec {
                break;
            }
            self.pos += 1;
            let right = self.parse_expr(op.precedence() + 1)?;
            left = FormulaAst::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FormulaAst> {
        match self.peek() {
            Some(Token::Op(ArithOp::Subtract)) => {
                self.pos += 1;
                Ok(FormulaAst::Negate(Box::new(self.parse_unary()?)))
            }
            Some(Token::Op(ArithOp::Add)) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<FormulaAst> {
        match self.next() {
            Some((Token::Reference(name), _)) => Ok(FormulaAst::Reference(name)),
            Some((Token::Number(n), _)) => Ok(FormulaAst::Number(n)),
            Some((Token::Text(t), _)) => Ok(FormulaAst::Text(t)),
            Some((Token::Ident(name), at)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Err(TallyError::Syntax(format!(
                        "bare identifier '{name}' at position {at}; reference metrics as {{{name}}}"
                    )));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() == Some(&Token::RParen) {
                    self.pos += 1;
                    return Ok(FormulaAst::Call { name, args });
                }
                loop {
                    args.push(self.parse_expr(1)?);
                    match self.next() {
                        Some((Token::Comma, _)) => continue,
                        Some((Token::RParen, _)) => break,
                        Some((token, at)) => {
                            return Err(TallyError::Syntax(format!(
                                "expected ',' or ')' but found {} at position {at}",
                                describe(&token)
                            )))
                        }
                        None => {
                            return Err(TallyError::Syntax(format!(
                                "unbalanced parentheses: call to {name} is never closed"
                            )))
                        }
                    }
                }
                Ok(FormulaAst::Call { name, args })
            }
            Some((Token::LParen, at)) => {
                let inner = self.parse_expr(1)?;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(FormulaAst::Group(Box::new(inner))),
                    _ => Err(TallyError::Syntax(format!(
                        "unbalanced parentheses: '(' at position {at} is never closed"
                    ))),
                }
            }
            Some((token, at)) => Err(TallyError::Syntax(format!(
                "unexpected {} at position {at}",
                describe(&token)
            ))),
            None => Err(TallyError::Syntax(
                "unexpected end of formula".to_string(),
            )),
        }
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Reference(name) => format!("reference {{{name}}}"),
        Token::Number(n) => format!("number {n}"),
        Token::Text(t) => format!("string '{t}'"),
        Token::Ident(name) => format!("identifier {name}"),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::Comma => "','".to_string(),
        Token::Op(op) => format!("operator {op:?}"),
    }
}
