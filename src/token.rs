//! Tokens produced by the lexer and consumed by the preprocessor.

use std::fmt;
use std::rc::Rc;

use compact_str::CompactString;

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

/// A position in a source file. Lines and columns are 1-based.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub file: Rc<str>,
    pub line: u32,
    pub column: u32,
}
impl Location {
    pub fn new(file: Rc<str>, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }
    /// A location that does not point at any real file, used for command-line defines.
    pub fn internal() -> Self {
        Self { file: Rc::from("<internal>"), line: 0, column: 0 }
    }
}
impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TokenKind {
    Newline,
    Whitespace,
    /// A `\` directly followed by a newline. Consumed by the preprocessor.
    LineSplice,

    Identifier,
    Number,
    /// A string literal without interpolation. The token value holds the unquoted text.
    ConstantString,
    /// The first fragment of an interpolated string, up to its first embedded expression.
    StringBegin,
    /// A fragment between two embedded expressions.
    StringMiddle,
    /// The last fragment of an interpolated string.
    StringEnd,
    /// Any punctuator without a dedicated kind below.
    Punctuator,
    Comma,
    Period,
    Colon,
    Question,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Semicolon,

    /// `##` in a macro body.
    TokenConcat,
    /// `#name` in a macro body. The token value holds `name`.
    ParameterStringify,

    Include,
    Define,
    Undefine,
    If,
    Ifdef,
    Ifndef,
    Elif,
    Else,
    EndIf,
    Error,
    Warning,
    Pragma,

    EndOfFile,
}
impl TokenKind {
    /// Whether this kind is a preprocessor directive.
    pub fn is_directive(self) -> bool {
        matches!(self,
            Self::Include | Self::Define | Self::Undefine | Self::If | Self::Ifdef | Self::Ifndef
            | Self::Elif | Self::Else | Self::EndIf | Self::Error | Self::Warning | Self::Pragma)
    }
    /// Looks up the directive kind for a `#name` spelling.
    pub fn directive(name: &str) -> Option<Self> {
        Some(match name {
            "include" => Self::Include,
            "define" => Self::Define,
            "undef" => Self::Undefine,
            "if" => Self::If,
            "ifdef" => Self::Ifdef,
            "ifndef" => Self::Ifndef,
            "elif" => Self::Elif,
            "else" => Self::Else,
            "endif" => Self::EndIf,
            "error" => Self::Error,
            "warn" | "warning" => Self::Warning,
            "pragma" => Self::Pragma,
            _ => return None,
        })
    }
    pub(crate) fn for_punctuator(text: &str) -> Self {
        match text {
            "," => Self::Comma,
            "." => Self::Period,
            ":" => Self::Colon,
            "?" => Self::Question,
            "(" => Self::LeftParen,
            ")" => Self::RightParen,
            "[" => Self::LeftBracket,
            "]" => Self::RightBracket,
            ";" => Self::Semicolon,
            _ => Self::Punctuator,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// The source text of the token, exactly as written.
    pub text: CompactString,
    /// The literal value for strings and string fragments, or the argument of a stringify marker.
    pub value: Option<CompactString>,
    pub location: Location,
}
impl Token {
    pub fn new(kind: TokenKind, text: impl Into<CompactString>, location: Location) -> Self {
        Self { kind, text: text.into(), value: None, location }
    }
    pub fn with_value(kind: TokenKind, text: impl Into<CompactString>, value: impl Into<CompactString>, location: Location) -> Self {
        Self { kind, text: text.into(), value: Some(value.into()), location }
    }
    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }
    /// Returns a copy of this token that reports `location` instead of its own.
    pub fn relocated(&self, location: &Location) -> Self {
        Self { location: location.clone(), ..self.clone() }
    }
    /// The literal value, falling back to the source text.
    pub fn value_or_text(&self) -> &str {
        self.value.as_deref().unwrap_or(&self.text)
    }
}
impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Escapes `text` so it can be placed inside a double-quoted DM string.
pub fn escape_string(text: &str) -> String {
    let mut res = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        match c {
            '"' | '\\' | '[' | ']' => { res.push('\\'); res.push(c); }
            '\n' => res.push_str("\\n"),
            _ => res.push(c),
        }
    }
    res
}

#[test]
fn test_directive_names() {
    assert_eq!(TokenKind::directive("define"), Some(TokenKind::Define));
    assert_eq!(TokenKind::directive("warn"), Some(TokenKind::Warning));
    assert_eq!(TokenKind::directive("Define"), None);
    assert!(TokenKind::Elif.is_directive());
    assert!(!TokenKind::Identifier.is_directive());
}

#[test]
fn test_escape_string() {
    assert_eq!(escape_string(r#"a"b\c[d]"#), r#"a\"b\\c\[d\]"#);
    assert_eq!(escape_string("a\nb"), "a\\nb");
}
