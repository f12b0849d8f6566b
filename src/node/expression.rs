//! Conditional expressions over project options.
//!
//! The `(?)` directive guards composition branches with a small boolean
//! language: `==`, `!=`, `in`, `and`, `or`, `not`, parentheses, quoted
//! strings, numbers and option names. Option values come from an
//! [`ExprScope`], normally the project's option pool.

use crate::error::{LoadError, Result};
use crate::node::Provenance;

/// A value an expression can produce or an option can hold.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprValue {
    Bool(bool),
    Str(String),
    List(Vec<String>),
}

impl ExprValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }

    fn as_comparable(&self) -> Option<String> {
        match self {
            Self::Bool(b) => Some(b.to_string()),
            Self::Str(s) => Some(s.clone()),
            Self::List(_) => None,
        }
    }
}

/// Name resolution for expressions.
pub trait ExprScope {
    fn lookup(&self, name: &str) -> Option<ExprValue>;
}

/// An empty scope; every option reference is undefined.
pub struct EmptyScope;

impl ExprScope for EmptyScope {
    fn lookup(&self, _name: &str) -> Option<ExprValue> {
        None
    }
}

/// Evaluates a conditional expression to a boolean.
pub fn evaluate(expr: &str, scope: &dyn ExprScope, provenance: &Provenance) -> Result<bool, LoadError> {
    let tokens = tokenize(expr, provenance)?;
    let mut parser = ExprParser { tokens, pos: 0, scope, provenance, expr };
    let value = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error(format!("trailing input in expression '{expr}'")));
    }
    match value {
        ExprValue::Bool(b) => Ok(b),
        other => Err(parser.error(format!(
            "expression '{expr}' evaluates to a {}, not a boolean",
            other.type_name()
        ))),
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Eq,
    NotEq,
    LParen,
    RParen,
    And,
    Or,
    Not,
    In,
}

fn tokenize(expr: &str, provenance: &Provenance) -> Result<Vec<Token>, LoadError> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' | '!' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => {
                        tokens.push(if c == '=' { Token::Eq } else { Token::NotEq })
                    }
                    _ => {
                        return Err(load_error!(
                            InvalidExpression,
                            provenance.clone(),
                            "unexpected '{c}' in expression '{expr}'"
                        ))
                    }
                }
            }
            '\'' | '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, ch)) if ch == c => break,
                        Some((_, ch)) => s.push(ch),
                        None => {
                            return Err(load_error!(
                                InvalidExpression,
                                provenance.clone(),
                                "unterminated string in expression '{expr}'"
                            ))
                        }
                    }
                }
                tokens.push(Token::Literal(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                let mut end = i;
                while let Some(&(j, ch)) = chars.peek() {
                    if ch.is_ascii_digit() {
                        end = j + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Literal(expr[start..end].to_string()));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while let Some(&(j, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                        end = j + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &expr[start..end];
                tokens.push(match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "True" | "true" => Token::Literal("true".into()),
                    "False" | "false" => Token::Literal("false".into()),
                    _ => Token::Ident(word.to_string()),
                });
            }
            _ => {
                return Err(load_error!(
                    InvalidExpression,
                    provenance.clone(),
                    "unexpected '{c}' in expression '{expr}'"
                ))
            }
        }
    }
    Ok(tokens)
}

struct ExprParser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    scope: &'a dyn ExprScope,
    provenance: &'a Provenance,
    expr: &'a str,
}

impl ExprParser<'_> {
    fn error(&self, message: String) -> LoadError {
        load_error!(InvalidExpression, self.provenance.clone(), "{message}")
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> Result<ExprValue, LoadError> {
        let mut value = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            value = ExprValue::Bool(self.truthy(value)? || self.truthy(rhs)?);
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<ExprValue, LoadError> {
        let mut value = self.not_expr()?;
        while self.eat(&Token::And) {
            let rhs = self.not_expr()?;
            value = ExprValue::Bool(self.truthy(value)? && self.truthy(rhs)?);
        }
        Ok(value)
    }

    fn not_expr(&mut self) -> Result<ExprValue, LoadError> {
        if self.eat(&Token::Not) {
            let value = self.not_expr()?;
            return Ok(ExprValue::Bool(!self.truthy(value)?));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<ExprValue, LoadError> {
        let lhs = self.primary()?;
        match self.peek() {
            Some(Token::Eq) | Some(Token::NotEq) => {
                let negate = matches!(self.bump(), Some(Token::NotEq));
                let rhs = self.primary()?;
                let l = lhs.as_comparable().ok_or_else(|| {
                    self.error(format!("cannot compare a {} in '{}'", lhs.type_name(), self.expr))
                })?;
                let r = rhs.as_comparable().ok_or_else(|| {
                    self.error(format!("cannot compare a {} in '{}'", rhs.type_name(), self.expr))
                })?;
                Ok(ExprValue::Bool((l == r) != negate))
            }
            Some(Token::In) => {
                self.bump();
                let rhs = self.primary()?;
                let needle = lhs.as_comparable().ok_or_else(|| {
                    self.error(format!("cannot search for a {} in '{}'", lhs.type_name(), self.expr))
                })?;
                match rhs {
                    ExprValue::List(items) => Ok(ExprValue::Bool(items.contains(&needle))),
                    other => Err(self.error(format!(
                        "'in' requires a flags or element-mask option, not a {} in '{}'",
                        other.type_name(),
                        self.expr
                    ))),
                }
            }
            _ => Ok(lhs),
        }
    }

    fn primary(&mut self) -> Result<ExprValue, LoadError> {
        match self.bump() {
            Some(Token::LParen) => {
                let value = self.or_expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error(format!("missing ')' in expression '{}'", self.expr)));
                }
                Ok(value)
            }
            Some(Token::Literal(s)) => Ok(ExprValue::Str(s)),
            Some(Token::Ident(name)) => self.scope.lookup(&name).ok_or_else(|| {
                load_error!(
                    UndefinedOption,
                    self.provenance.clone(),
                    "reference to undefined option '{name}'"
                )
            }),
            other => Err(self.error(format!(
                "expected a value, found {other:?} in expression '{}'",
                self.expr
            ))),
        }
    }

    fn truthy(&self, value: ExprValue) -> Result<bool, LoadError> {
        match value {
            ExprValue::Bool(b) => Ok(b),
            // Comparisons against string options must be explicit; there is
            // no implicit truthiness for strings or lists.
            other => Err(self.error(format!(
                "a {} is not a boolean in expression '{}'",
                other.type_name(),
                self.expr
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MapScope(BTreeMap<&'static str, ExprValue>);

    impl ExprScope for MapScope {
        fn lookup(&self, name: &str) -> Option<ExprValue> {
            self.0.get(name).cloned()
        }
    }

    fn scope() -> MapScope {
        let mut map = BTreeMap::new();
        map.insert("debug", ExprValue::Bool(true));
        map.insert("arch", ExprValue::Str("x86_64".into()));
        map.insert("features", ExprValue::List(vec!["doc".into(), "tests".into()]));
        MapScope(map)
    }

    fn eval(expr: &str) -> Result<bool, LoadError> {
        evaluate(expr, &scope(), &Provenance::synthetic("test"))
    }

    #[test]
    fn comparisons() {
        assert!(eval("arch == 'x86_64'").unwrap());
        assert!(eval("arch != 'aarch64'").unwrap());
        assert!(!eval("arch == 'aarch64'").unwrap());
    }

    #[test]
    fn boolean_operators() {
        assert!(eval("debug").unwrap());
        assert!(eval("not (arch == 'aarch64')").unwrap());
        assert!(eval("debug and arch == 'x86_64'").unwrap());
        assert!(eval("arch == 'aarch64' or debug").unwrap());
    }

    #[test]
    fn flags_membership() {
        assert!(eval("'doc' in features").unwrap());
        assert!(!eval("'gui' in features").unwrap());
    }

    #[test]
    fn undefined_option_is_fatal() {
        let err = eval("enable_gui").unwrap_err();
        assert!(err.to_string().contains("enable_gui"));
    }

    #[test]
    fn non_boolean_result_is_fatal() {
        assert!(eval("arch").is_err());
        assert!(eval("features").is_err());
    }

    #[test]
    fn numbers_compare_as_strings() {
        let mut map = BTreeMap::new();
        map.insert("level", ExprValue::Str("2".into()));
        let scope = MapScope(map);
        assert!(evaluate("level == 2", &scope, &Provenance::synthetic("t")).unwrap());
    }
}
