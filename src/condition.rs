//! Evaluation of `#if` and `#elif` conditions.
//!
//! Conditions are constant expressions over numbers. Identifiers that survived macro expansion count as `0`, and
//! `defined(NAME)` (or `defined NAME`) tests whether a macro exists. The grammar, loosest binding first:
//!
//! ```text
//! or      := and ('||' and)*
//! and     := eq ('&&' eq)*
//! eq      := cmp (('==' | '!=') cmp)*
//! cmp     := add (('<' | '<=' | '>' | '>=') add)*
//! add     := mul (('+' | '-') mul)*
//! mul     := pow (('*' | '/' | '%') pow)*
//! pow     := unary ('**' pow)?
//! unary   := '!' unary | '-' unary | '+' unary | primary
//! primary := '(' or ')' | number | 'defined' ['('] name [')'] | identifier
//! ```

use crate::error::{PreprocessError, PreprocessResult};
use crate::token::{Location, Token, TokenKind};

/// Evaluates a condition. `is_defined` answers `defined(...)` queries.
/// `fallback` is the location reported for errors at the end of the expression.
pub fn evaluate(tokens: &[Token], is_defined: &dyn Fn(&str) -> bool, fallback: &Location) -> PreprocessResult<f32> {
    let tokens: Vec<&Token> = tokens.iter().filter(|x| !matches!(x.kind, TokenKind::Whitespace | TokenKind::LineSplice | TokenKind::Newline)).collect();
    if tokens.is_empty() {
        return Err(PreprocessError::directive(fallback, "expression expected"));
    }

    let mut parser = Parser { tokens: &tokens, pos: 0, is_defined, fallback };
    let value = parser.or()?;
    match parser.current() {
        Some(token) => Err(PreprocessError::directive(&token.location, format!("unexpected '{}' in condition", token.text))),
        None => Ok(value),
    }
}

/// Whether a condition value selects its branch.
pub fn is_truthy(value: f32) -> bool {
    value != 0.0
}

struct Parser<'a> {
    tokens: &'a [&'a Token],
    pos: usize,
    is_defined: &'a dyn Fn(&str) -> bool,
    fallback: &'a Location,
}
impl<'a> Parser<'a> {
    fn current(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).copied()
    }
    fn check(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        let token = self.current()?;
        if token.kind != TokenKind::Punctuator { return None }
        let op = ops.iter().find(|x| **x == token.text.as_str())?;
        self.pos += 1;
        Some(*op)
    }
    fn check_kind(&mut self, kind: TokenKind) -> bool {
        match self.current() {
            Some(token) if token.kind == kind => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }
    fn error(&self, message: &str) -> PreprocessError {
        let location = self.current().map(|x| &x.location).unwrap_or(self.fallback);
        PreprocessError::directive(location, message)
    }

    fn or(&mut self) -> PreprocessResult<f32> {
        let mut a = self.and()?;
        while self.check(&["||"]).is_some() {
            let b = self.and()?;
            a = bool_value(is_truthy(a) || is_truthy(b));
        }
        Ok(a)
    }
    fn and(&mut self) -> PreprocessResult<f32> {
        let mut a = self.equality()?;
        while self.check(&["&&"]).is_some() {
            let b = self.equality()?;
            a = bool_value(is_truthy(a) && is_truthy(b));
        }
        Ok(a)
    }
    fn equality(&mut self) -> PreprocessResult<f32> {
        let mut a = self.comparison()?;
        while let Some(op) = self.check(&["==", "!="]) {
            let b = self.comparison()?;
            a = bool_value(if op == "==" { a == b } else { a != b });
        }
        Ok(a)
    }
    fn comparison(&mut self) -> PreprocessResult<f32> {
        let mut a = self.additive()?;
        while let Some(op) = self.check(&["<=", ">=", "<", ">"]) {
            let b = self.additive()?;
            a = bool_value(match op {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a >= b,
            });
        }
        Ok(a)
    }
    fn additive(&mut self) -> PreprocessResult<f32> {
        let mut a = self.multiplicative()?;
        while let Some(op) = self.check(&["+", "-"]) {
            let b = self.multiplicative()?;
            a = if op == "+" { a + b } else { a - b };
        }
        Ok(a)
    }
    fn multiplicative(&mut self) -> PreprocessResult<f32> {
        let mut a = self.power()?;
        while let Some(op) = self.check(&["*", "/", "%"]) {
            let b = self.power()?;
            a = match op {
                "*" => a * b,
                _ if b == 0.0 => return Err(self.error("division by zero in condition")),
                "/" => a / b,
                _ => a % b,
            };
        }
        Ok(a)
    }
    fn power(&mut self) -> PreprocessResult<f32> {
        let a = self.unary()?;
        if self.check(&["**"]).is_some() {
            let b = self.power()?;
            return Ok(a.powf(b));
        }
        Ok(a)
    }
    fn unary(&mut self) -> PreprocessResult<f32> {
        match self.check(&["!", "-", "+"]) {
            Some("!") => Ok(bool_value(!is_truthy(self.unary()?))),
            Some("-") => Ok(-self.unary()?),
            Some(_) => self.unary(),
            None => self.primary(),
        }
    }
    fn primary(&mut self) -> PreprocessResult<f32> {
        let token = match self.current() {
            Some(x) => x,
            None => return Err(self.error("expected a value")),
        };
        match token.kind {
            TokenKind::LeftParen => {
                self.pos += 1;
                let inner = self.or()?;
                if !self.check_kind(TokenKind::RightParen) {
                    return Err(self.error("expected ')' to close expression"));
                }
                Ok(inner)
            }
            TokenKind::Number => {
                self.pos += 1;
                parse_number(&token.text).ok_or_else(|| PreprocessError::directive(&token.location, format!("invalid number '{}'", token.text)))
            }
            TokenKind::Identifier if token.text == "defined" => {
                self.pos += 1;
                let parens = self.check_kind(TokenKind::LeftParen);
                let name = match self.current() {
                    Some(x) if x.kind == TokenKind::Identifier => x,
                    _ => return Err(self.error("expected a macro name after 'defined'")),
                };
                self.pos += 1;
                if parens && !self.check_kind(TokenKind::RightParen) {
                    return Err(self.error("expected ')' after macro name"));
                }
                Ok(bool_value((self.is_defined)(&name.text)))
            }
            TokenKind::Identifier => {
                self.pos += 1;
                Ok(0.0)
            }
            _ => Err(PreprocessError::directive(&token.location, format!("'{}' is not allowed in a condition", token.text))),
        }
    }
}

fn bool_value(value: bool) -> f32 {
    if value { 1.0 } else { 0.0 }
}

/// Parses a DM numeric literal as it appears in a condition.
fn parse_number(text: &str) -> Option<f32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|x| x as f32);
    }
    match text {
        "1.#INF" => return Some(f32::INFINITY),
        "1.#IND" => return Some(f32::NAN),
        _ => (),
    }
    text.parse::<f32>().ok()
}

#[cfg(test)]
fn eval(src: &str, defined: &[&str]) -> PreprocessResult<f32> {
    let mut tokens = crate::lexer::tokenize("cond.dm", src).unwrap();
    tokens.pop();
    evaluate(&tokens, &|name| defined.contains(&name), &Location::internal())
}

#[test]
fn test_condition_arithmetic() {
    assert_eq!(eval("1 + 2 * 3", &[]).unwrap(), 7.0);
    assert_eq!(eval("(1 + 2) * 3", &[]).unwrap(), 9.0);
    assert_eq!(eval("2 ** 3 ** 2", &[]).unwrap(), 512.0);
    assert_eq!(eval("-4 + 10 % 4", &[]).unwrap(), -2.0);
    assert_eq!(eval("0x10", &[]).unwrap(), 16.0);
    assert_eq!(eval("1.5 * 2", &[]).unwrap(), 3.0);
}

#[test]
fn test_condition_logic() {
    assert_eq!(eval("1 < 2 && 3 >= 3", &[]).unwrap(), 1.0);
    assert_eq!(eval("1 == 2 || 2 != 2", &[]).unwrap(), 0.0);
    assert_eq!(eval("!0", &[]).unwrap(), 1.0);
    assert_eq!(eval("!!5", &[]).unwrap(), 1.0);
    assert_eq!(eval("UNKNOWN", &[]).unwrap(), 0.0);
}

#[test]
fn test_condition_defined() {
    assert_eq!(eval("defined(FOO)", &["FOO"]).unwrap(), 1.0);
    assert_eq!(eval("defined FOO", &["FOO"]).unwrap(), 1.0);
    assert_eq!(eval("defined(BAR) || defined(FOO)", &["FOO"]).unwrap(), 1.0);
    assert_eq!(eval("!defined(BAR)", &["FOO"]).unwrap(), 1.0);
}

#[test]
fn test_condition_errors() {
    for src in ["", "(1 + 2", "1 +", "\"text\"", "1 / 0", "defined()", "1 2"] {
        assert!(matches!(eval(src, &[]), Err(PreprocessError::Directive { .. })), "{src:?}");
    }
}
