//! The rule expression language: a fixed, deterministic vocabulary small
//! enough to interpret without touching a host runtime.
//!
//! ```text
//! expr   := or
//! or     := and ("||" and)*
//! and    := eq ("&&" eq)*
//! eq     := unary (("==" | "!=") unary)?
//! unary  := "!" unary | primary
//! primary:= "true" | "false" | "null" | string | variable | "(" expr ")"
//! ```
//!
//! Variables are dotted identifiers: `auth.userId` dereferences into the
//! auth context, a bare name resolves a bound path capture. Anything
//! unresolved, any type mismatch, and any unknown syntax denies.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprValue {
    Bool(bool),
    Str(String),
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(ExprValue),
    Var(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprError(pub String);

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolves variables during evaluation.
pub trait Scope {
    fn resolve(&self, path: &[String]) -> Option<ExprValue>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    True,
    False,
    Null,
    Str(String),
    Ident(Vec<String>),
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
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
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(ExprError("expected '=='".into()));
                }
                tokens.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(ExprError("expected '&&'".into()));
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(ExprError("expected '||'".into()));
                }
                tokens.push(Token::OrOr);
            }
            quote @ ('\'' | '"') => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => literal.push(c),
                        None => return Err(ExprError("unterminated string literal".into())),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut parts = Vec::new();
                let mut current = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        current.push(c);
                        chars.next();
                    } else if c == '.' {
                        if current.is_empty() {
                            return Err(ExprError("empty identifier segment".into()));
                        }
                        parts.push(std::mem::take(&mut current));
                        chars.next();
                    } else {
                        break;
                    }
                }
                if current.is_empty() {
                    return Err(ExprError("identifier ends with '.'".into()));
                }
                parts.push(current);
                tokens.push(match parts.as_slice() {
                    [single] if single == "true" => Token::True,
                    [single] if single == "false" => Token::False,
                    [single] if single == "null" => Token::Null,
                    _ => Token::Ident(parts),
                });
            }
            other => return Err(ExprError(format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        while self.eat(&Token::OrOr) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExprError> {
        let left = self.unary()?;
        if self.eat(&Token::EqEq) {
            let right = self.unary()?;
            return Ok(Expr::Eq(Box::new(left), Box::new(right)));
        }
        if self.eat(&Token::NotEq) {
            let right = self.unary()?;
            return Ok(Expr::Ne(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::True) => Ok(Expr::Literal(ExprValue::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(ExprValue::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(ExprValue::Null)),
            Some(Token::Str(literal)) => Ok(Expr::Literal(ExprValue::Str(literal))),
            Some(Token::Ident(parts)) => Ok(Expr::Var(parts)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                if !self.eat(&Token::RParen) {
                    return Err(ExprError("expected ')'".into()));
                }
                Ok(inner)
            }
            other => Err(ExprError(format!("unexpected token {other:?}"))),
        }
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let expr = parser.or()?;
        if parser.peek().is_some() {
            return Err(ExprError("trailing tokens after expression".into()));
        }
        Ok(expr)
    }

    /// Deterministic evaluation. Equality across mismatched types is false;
    /// logical operators require booleans; unresolved variables error.
    pub fn eval(&self, scope: &dyn Scope) -> Result<ExprValue, ExprError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Var(path) => scope
                .resolve(path)
                .ok_or_else(|| ExprError(format!("unresolved variable {}", path.join(".")))),
            Self::Not(inner) => match inner.eval(scope)? {
                ExprValue::Bool(value) => Ok(ExprValue::Bool(!value)),
                other => Err(ExprError(format!("'!' applied to non-boolean {other:?}"))),
            },
            Self::And(left, right) => {
                match (left.eval(scope)?, right.eval(scope)?) {
                    (ExprValue::Bool(a), ExprValue::Bool(b)) => Ok(ExprValue::Bool(a && b)),
                    _ => Err(ExprError("'&&' applied to non-booleans".into())),
                }
            }
            Self::Or(left, right) => {
                match (left.eval(scope)?, right.eval(scope)?) {
                    (ExprValue::Bool(a), ExprValue::Bool(b)) => Ok(ExprValue::Bool(a || b)),
                    _ => Err(ExprError("'||' applied to non-booleans".into())),
                }
            }
            Self::Eq(left, right) => Ok(ExprValue::Bool(left.eval(scope)? == right.eval(scope)?)),
            Self::Ne(left, right) => Ok(ExprValue::Bool(left.eval(scope)? != right.eval(scope)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapScope(HashMap<String, ExprValue>);

    impl Scope for MapScope {
        fn resolve(&self, path: &[String]) -> Option<ExprValue> {
            self.0.get(&path.join(".")).cloned()
        }
    }

    fn scope(entries: &[(&str, ExprValue)]) -> MapScope {
        MapScope(
            entries
                .iter()
                .map(|(key, value)| ((*key).to_owned(), value.clone()))
                .collect(),
        )
    }

    #[test]
    fn parses_and_evaluates_the_fixed_vocabulary() {
        let expr = Expr::parse("auth.userId != null && (userId == auth.userId || admin == 'yes')")
            .unwrap();
        let allowed = scope(&[
            ("auth.userId", ExprValue::Str("u1".into())),
            ("userId", ExprValue::Str("u1".into())),
            ("admin", ExprValue::Str("no".into())),
        ]);
        assert_eq!(expr.eval(&allowed).unwrap(), ExprValue::Bool(true));

        let denied = scope(&[
            ("auth.userId", ExprValue::Str("u2".into())),
            ("userId", ExprValue::Str("u1".into())),
            ("admin", ExprValue::Str("no".into())),
        ]);
        assert_eq!(expr.eval(&denied).unwrap(), ExprValue::Bool(false));
    }

    #[test]
    fn null_checks_work_against_anonymous_callers() {
        let expr = Expr::parse("auth.userId != null").unwrap();
        let anonymous = scope(&[("auth.userId", ExprValue::Null)]);
        assert_eq!(expr.eval(&anonymous).unwrap(), ExprValue::Bool(false));
    }

    #[test]
    fn mismatched_types_are_unequal_not_errors() {
        let expr = Expr::parse("'true' == true").unwrap();
        let empty = scope(&[]);
        assert_eq!(expr.eval(&empty).unwrap(), ExprValue::Bool(false));
    }

    #[test]
    fn unresolved_variables_and_bad_operands_error() {
        let empty = scope(&[]);
        assert!(Expr::parse("ghost == 'x'").unwrap().eval(&empty).is_err());
        assert!(Expr::parse("!'text'").unwrap().eval(&empty).is_err());
        assert!(Expr::parse("true && null").unwrap().eval(&empty).is_err());
    }

    #[test]
    fn unknown_syntax_fails_to_parse() {
        assert!(Expr::parse("auth.userId = 'u1'").is_err());
        assert!(Expr::parse("1 < 2").is_err());
        assert!(Expr::parse("auth.userId ==").is_err());
        assert!(Expr::parse("true true").is_err());
        assert!(Expr::parse("").is_err());
    }
}
