//! The preprocessor lexer.
//!
//! This turns raw source text into the coarse tokens the preprocessor operates on. Whitespace and newlines are kept
//! as tokens since they matter for macro definitions and directive placement. Comments are dropped.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::fs;

use compact_str::CompactString;

use crate::error::{PreprocessError, PreprocessResult};
use crate::token::*;

/// Punctuators that are lexed by longest match. Longer spellings must come before their prefixes.
const PUNCTUATORS: &[&str] = &[
    ">>=", ">>", ">=", ">",
    "<<=", "<<", "<=", "<>", "<",
    "||=", "||", "|=", "|",
    "&&=", "&&", "&=", "&",
    "%%=", "%%", "%=", "%",
    "**", "*=", "*",
    "++", "+=", "+",
    "--", "-=", "-",
    "~=", "~!", "~",
    "^=", "^",
    "!=", "!",
    "==", "=",
    "/=", "/",
];

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    file: Rc<str>,
    include_dir: PathBuf,
    pending: VecDeque<Token>,
    warnings: Vec<(Location, String)>,
}
impl Lexer {
    pub fn new(include_dir: impl Into<PathBuf>, file: &str, source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            file: Rc::from(file),
            include_dir: include_dir.into(),
            pending: Default::default(),
            warnings: vec![],
        }
    }
    /// Opens `file`, relative to `include_dir`.
    pub fn open(include_dir: &Path, file: &str) -> PreprocessResult<Self> {
        let path = include_dir.join(file);
        let source = fs::read_to_string(&path).map_err(|source| PreprocessError::Io { path, source })?;
        Ok(Self::new(include_dir, file, source.strip_prefix('\u{feff}').unwrap_or(&source)))
    }

    /// The file name tokens from this lexer are attributed to, relative to [`Lexer::include_dir`].
    pub fn file(&self) -> &Rc<str> {
        &self.file
    }
    pub fn include_dir(&self) -> &Path {
        &self.include_dir
    }
    /// Takes the warnings produced since the last call.
    pub fn take_warnings(&mut self) -> Vec<(Location, String)> {
        std::mem::take(&mut self.warnings)
    }

    fn location(&self) -> Location {
        Location::new(self.file.clone(), self.line, self.column)
    }
    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }
    fn current(&self) -> char {
        self.source.get(self.pos).copied().unwrap_or('\0')
    }
    fn peek(&self, offset: usize) -> char {
        self.source.get(self.pos + offset).copied().unwrap_or('\0')
    }
    fn advance(&mut self) -> char {
        if !self.at_end() {
            self.pos += 1;
            self.column += 1;
        }
        self.current()
    }
    fn at_line_end(&self) -> bool {
        matches!(self.current(), '\r' | '\n')
    }
    /// Consumes a line ending (any run of `\r` optionally followed by `\n`) and bumps the line counter.
    fn handle_line_end(&mut self) -> bool {
        match self.current() {
            '\r' => {
                while self.current() == '\r' { self.advance(); }
                if self.current() == '\n' { self.advance(); }
            }
            '\n' => { self.advance(); }
            _ => return false,
        }
        self.line += 1;
        self.column = 1;
        true
    }
    fn skip_to_line_end(&mut self) {
        while !self.at_line_end() && !self.at_end() {
            self.advance();
        }
    }
    fn rest_of_line(&mut self) -> String {
        let mut res = String::new();
        while !self.at_line_end() && !self.at_end() {
            res.push(self.current());
            self.advance();
        }
        res
    }
    fn starts_with(&self, text: &str) -> bool {
        text.chars().enumerate().all(|(i, c)| self.peek(i) == c)
    }

    /// Lexes the next token. Once the source is exhausted this keeps returning [`TokenKind::EndOfFile`].
    pub fn next_token(&mut self, ignore_whitespace: bool) -> PreprocessResult<Token> {
        if let Some(token) = self.pending.pop_front() {
            if ignore_whitespace && token.is(TokenKind::Whitespace) {
                return self.next_token(true);
            }
            return Ok(token);
        }

        let start = self.location();
        if self.at_end() {
            return Ok(Token::new(TokenKind::EndOfFile, "", start));
        }

        let c = self.current();
        let single = |lexer: &mut Self, kind: TokenKind| {
            lexer.advance();
            Ok(Token::new(kind, c.to_string(), start.clone()))
        };
        match c {
            '\r' | '\n' => {
                self.handle_line_end();
                Ok(Token::new(TokenKind::Newline, "\n", start))
            }
            ' ' | '\t' => {
                let mut text = CompactString::default();
                while matches!(self.current(), ' ' | '\t') {
                    text.push(self.current());
                    self.advance();
                }
                if ignore_whitespace { return self.next_token(true) }
                Ok(Token::new(TokenKind::Whitespace, text, start))
            }
            '}' => single(self, TokenKind::Punctuator),
            ';' => single(self, TokenKind::Semicolon),
            '.' => single(self, TokenKind::Period),
            ',' => single(self, TokenKind::Comma),
            '(' => single(self, TokenKind::LeftParen),
            ')' => single(self, TokenKind::RightParen),
            ']' => single(self, TokenKind::RightBracket),
            '?' => single(self, TokenKind::Question),
            ':' => {
                if self.peek(1) == '=' {
                    self.advance();
                    self.advance();
                    return Ok(Token::new(TokenKind::Punctuator, ":=", start));
                }
                single(self, TokenKind::Colon)
            }
            '[' => {
                if self.peek(1) == ']' {
                    let text = if self.peek(2) == '=' { "[]=" } else { "[]" };
                    for _ in 0..text.len() { self.advance(); }
                    return Ok(Token::new(TokenKind::Punctuator, text, start));
                }
                single(self, TokenKind::LeftBracket)
            }
            '\\' => {
                self.advance();
                if self.handle_line_end() {
                    return Ok(Token::new(TokenKind::LineSplice, "\\", start));
                }
                // an escaped identifier: the next character becomes an identifier on its own
                let escaped = self.current();
                self.advance();
                Ok(Token::new(TokenKind::Identifier, escaped.to_string(), start))
            }
            '/' if self.peek(1) == '/' => {
                self.skip_line_comment();
                self.next_token(ignore_whitespace)
            }
            '/' if self.peek(1) == '*' => {
                self.skip_block_comment(&start)?;
                self.next_token(ignore_whitespace)
            }
            '@' => self.lex_raw_string(start),
            '\'' | '"' => self.lex_string(start, false),
            '{' => {
                if self.peek(1) == '"' {
                    self.advance();
                    return self.lex_string(start, true);
                }
                single(self, TokenKind::Punctuator)
            }
            '#' => self.lex_hash(start),
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = CompactString::default();
                while self.current().is_ascii_alphanumeric() || self.current() == '_' {
                    text.push(self.current());
                    self.advance();
                }
                Ok(Token::new(TokenKind::Identifier, text, start))
            }
            _ if c.is_ascii_digit() => self.lex_number(start),
            _ => match PUNCTUATORS.iter().find(|x| self.starts_with(x)) {
                Some(punct) => {
                    for _ in 0..punct.len() { self.advance(); }
                    Ok(Token::new(TokenKind::Punctuator, *punct, start))
                }
                None => {
                    self.advance();
                    Err(PreprocessError::directive(&start, format!("unknown character '{c}'")))
                }
            }
        }
    }

    fn skip_line_comment(&mut self) {
        loop {
            self.skip_to_line_end();
            // a line splice at the end of a line comment continues the comment
            if self.pos > 0 && self.source[self.pos - 1] == '\\' && self.handle_line_end() {
                continue;
            }
            break;
        }
    }

    fn skip_block_comment(&mut self, start: &Location) -> PreprocessResult<()> {
        self.advance();
        self.advance();
        let mut depth = 1;
        while depth > 0 {
            if self.at_end() {
                return Err(PreprocessError::UnterminatedComment { location: start.clone() });
            }
            match (self.current(), self.peek(1)) {
                ('/', '*') => {
                    depth += 1;
                    self.advance();
                    self.advance();
                }
                ('*', '/') => {
                    depth -= 1;
                    self.advance();
                    self.advance();
                }
                ('/', '/') => self.skip_to_line_end(),
                _ => if !self.handle_line_end() { self.advance(); }
            }
        }
        while matches!(self.current(), ' ' | '\t') {
            self.advance();
        }
        Ok(())
    }

    fn lex_hash(&mut self, start: Location) -> PreprocessResult<Token> {
        let concat = self.advance() == '#';
        if concat { self.advance(); }
        while matches!(self.current(), ' ' | '\t') {
            self.advance();
        }

        let mut name = CompactString::default();
        while self.current().is_ascii_alphabetic() || self.current() == '_' {
            name.push(self.current());
            self.advance();
        }

        if name.is_empty() {
            return self.next_token(false);
        }
        if concat {
            return Ok(Token::with_value(TokenKind::TokenConcat, format!("##{name}"), name, start));
        }

        if let Some(kind) = TokenKind::directive(&name) {
            return Ok(match kind {
                TokenKind::Warning | TokenKind::Error => {
                    let message = self.rest_of_line();
                    Token::with_value(kind, format!("#{name}{message}"), message.trim(), start)
                }
                _ => Token::new(kind, format!("#{name}"), start),
            });
        }
        let lowered = name.to_ascii_lowercase();
        if TokenKind::directive(&lowered).is_some() {
            self.warnings.push((start.clone(), format!("#{name} is not a valid directive, did you mean #{lowered}?")));
        }
        Ok(Token::with_value(TokenKind::ParameterStringify, format!("#{name}"), name, start))
    }

    fn lex_number(&mut self, start: Location) -> PreprocessResult<Token> {
        let mut c = self.current();
        let mut text = CompactString::default();
        text.push(c);

        while !self.at_end() {
            let mut next = self.advance();
            if matches!(c, 'e' | 'E') && matches!(next, '-' | '+') {
                text.push(next);
                next = self.advance();
            } else if c == '#' && next == 'I' {
                // 1.#INF and 1.#IND
                let n = self.advance();
                let last = self.advance();
                if n != 'N' || !matches!(last, 'F' | 'D') {
                    return Err(PreprocessError::directive(&start, "invalid number"));
                }
                text.push_str("IN");
                text.push(last);
                next = self.advance();
            }

            c = next;
            if c.is_ascii_hexdigit() || matches!(c, '.' | 'x' | '#' | 'e' | 'E' | 'p' | 'P') {
                text.push(c);
            } else {
                break;
            }
        }
        Ok(Token::new(TokenKind::Number, text, start))
    }

    /// Lexes `@Xtext X` or `@{"text"}`. Raw strings never interpolate.
    fn lex_raw_string(&mut self, start: Location) -> PreprocessResult<Token> {
        let delimiter = self.advance();
        if self.at_end() || self.at_line_end() {
            return Err(PreprocessError::UnterminatedString { location: start, terminator: "@".into() });
        }
        if delimiter == '{' && self.peek(1) == '"' {
            self.advance();
            self.advance();
            let mut value = String::new();
            loop {
                if self.at_end() {
                    return Err(PreprocessError::UnterminatedString { location: start, terminator: "\"}".into() });
                }
                if self.current() == '"' && self.peek(1) == '}' {
                    self.advance();
                    self.advance();
                    break;
                }
                if self.at_line_end() {
                    self.handle_line_end();
                    value.push('\n');
                } else {
                    value.push(self.current());
                    self.advance();
                }
            }
            return Ok(Token::with_value(TokenKind::ConstantString, format!("@{{\"{value}\"}}"), value, start));
        }

        self.advance();
        let mut value = String::new();
        while self.current() != delimiter {
            if self.at_end() || self.at_line_end() {
                return Err(PreprocessError::UnterminatedString { location: start, terminator: delimiter.to_string() });
            }
            value.push(self.current());
            self.advance();
        }
        self.advance();
        Ok(Token::with_value(TokenKind::ConstantString, format!("@{delimiter}{value}{delimiter}"), value, start))
    }

    /// Lexes a quoted or long string. The current character is the opening quote.
    ///
    /// A string without embedded expressions becomes one [`TokenKind::ConstantString`]. Otherwise the string is split
    /// into [`TokenKind::StringBegin`], [`TokenKind::StringMiddle`] and [`TokenKind::StringEnd`] fragments with the
    /// tokens of each embedded expression between them.
    fn lex_string(&mut self, start: Location, is_long: bool) -> PreprocessResult<Token> {
        let terminator = self.current();
        let mut text = if is_long { String::from("{\"") } else { terminator.to_string() };
        let mut value = String::new();
        let mut fragment_start = start.clone();
        let mut parts: Vec<Token> = vec![];

        self.advance();
        let mut closed = false;
        while !self.at_end() && !(!is_long && self.at_line_end()) {
            let c = self.current();
            match c {
                '[' => {
                    let bracket = self.location();
                    self.advance();

                    let mut expr = vec![];
                    let mut depth = 0usize;
                    loop {
                        let token = self.next_token(false)?;
                        match token.kind {
                            TokenKind::EndOfFile => return Err(PreprocessError::UnterminatedString { location: bracket, terminator: "]".into() }),
                            TokenKind::RightBracket if depth == 0 => break,
                            TokenKind::RightBracket => depth -= 1,
                            TokenKind::LeftBracket => depth += 1,
                            _ => (),
                        }
                        expr.push(token);
                    }

                    if expr.iter().all(|x| x.is(TokenKind::Whitespace)) {
                        let inner: String = expr.iter().map(|x| x.text.as_str()).collect();
                        for s in [&mut text, &mut value] {
                            s.push('[');
                            s.push_str(&inner);
                            s.push(']');
                        }
                        continue;
                    }

                    text.push('[');
                    let kind = if parts.is_empty() { TokenKind::StringBegin } else { TokenKind::StringMiddle };
                    parts.push(Token::with_value(kind, std::mem::replace(&mut text, "]".into()), std::mem::take(&mut value), fragment_start));
                    parts.extend(expr);
                    fragment_start = self.location();
                }
                '\\' => {
                    self.advance();
                    if self.at_line_end() {
                        // line splice: drop the newline and any leading whitespace on the next line
                        while self.handle_line_end() || matches!(self.current(), ' ' | '\t') {
                            if !self.at_line_end() { self.advance(); }
                        }
                    } else if !self.at_end() {
                        for s in [&mut text, &mut value] {
                            s.push('\\');
                            s.push(self.current());
                        }
                        self.advance();
                    }
                }
                _ if c == terminator => {
                    self.advance();
                    if !is_long {
                        text.push(c);
                        closed = true;
                        break;
                    }
                    if self.current() == '}' {
                        self.advance();
                        text.push_str("\"}");
                        closed = true;
                        break;
                    }
                    text.push(c);
                    value.push(c);
                }
                _ => {
                    if self.handle_line_end() {
                        text.push('\n');
                        value.push('\n');
                    } else {
                        text.push(c);
                        value.push(c);
                        self.advance();
                    }
                }
            }
        }

        if !closed {
            let terminator = if is_long { "\"}".into() } else { terminator.to_string() };
            return Err(PreprocessError::UnterminatedString { location: start, terminator });
        }

        if parts.is_empty() {
            return Ok(Token::with_value(TokenKind::ConstantString, text, value, start));
        }
        parts.push(Token::with_value(TokenKind::StringEnd, text, value, fragment_start));
        let mut parts = parts.into_iter();
        let first = parts.next();
        self.pending.extend(parts);
        first.ok_or_else(|| PreprocessError::directive(&start, "empty string"))
    }
}

/// Lexes `source` to completion, ending with a single [`TokenKind::EndOfFile`] token.
pub fn tokenize(file: &str, source: &str) -> PreprocessResult<Vec<Token>> {
    let mut lexer = Lexer::new(".", file, source);
    let mut res = vec![];
    loop {
        let token = lexer.next_token(false)?;
        let done = token.is(TokenKind::EndOfFile);
        res.push(token);
        if done { return Ok(res) }
    }
}

#[cfg(test)]
fn kinds_and_texts(source: &str) -> Vec<(TokenKind, String)> {
    tokenize("test.dm", source).unwrap().into_iter().map(|x| (x.kind, x.text.to_string())).collect()
}

#[test]
fn test_lex_punctuators() {
    let tokens = kinds_and_texts("a:=b<<=c[]=d||=e%%f~!g<>h");
    let texts: Vec<&str> = tokens.iter().map(|x| x.1.as_str()).collect();
    assert_eq!(texts, ["a", ":=", "b", "<<=", "c", "[]=", "d", "||=", "e", "%%", "f", "~!", "g", "<>", "h", ""]);
    assert_eq!(tokens[1].0, TokenKind::Punctuator);
    assert_eq!(tokens[15].0, TokenKind::EndOfFile);
}

#[test]
fn test_lex_numbers() {
    for (src, expected) in [("123", "123"), ("1.5e-10", "1.5e-10"), ("0x1F", "0x1F"), ("1.#INF", "1.#INF"), ("1.#IND", "1.#IND")] {
        let tokens = kinds_and_texts(src);
        assert_eq!(tokens[0], (TokenKind::Number, expected.to_owned()), "{src}");
        assert_eq!(tokens.len(), 2, "{src}");
    }
    assert!(tokenize("test.dm", "1.#IQ").is_err());
}

#[test]
fn test_lex_comments() {
    let tokens = kinds_and_texts("a /* x /* nested */ y */ b // tail\nc");
    let kinds: Vec<TokenKind> = tokens.iter().map(|x| x.0).collect();
    assert_eq!(kinds, [TokenKind::Identifier, TokenKind::Whitespace, TokenKind::Identifier, TokenKind::Whitespace, TokenKind::Newline, TokenKind::Identifier, TokenKind::EndOfFile]);
    assert!(matches!(tokenize("test.dm", "a /* never closed"), Err(PreprocessError::UnterminatedComment { .. })));
}

#[test]
fn test_lex_line_splice_and_escape() {
    let tokens = kinds_and_texts("a\\\nb \\x");
    assert_eq!(tokens[0], (TokenKind::Identifier, "a".into()));
    assert_eq!(tokens[1].0, TokenKind::LineSplice);
    assert_eq!(tokens[2], (TokenKind::Identifier, "b".into()));
    assert_eq!(tokens[4], (TokenKind::Identifier, "x".into()));

    let tokens = tokenize("test.dm", "a\nb").unwrap();
    assert_eq!((tokens[2].location.line, tokens[2].location.column), (2, 1));
}

#[test]
fn test_lex_constant_strings() {
    let tokens = tokenize("test.dm", r#""hello \"you\"" 'icon.dmi' {"long
text"} @"raw[x]" @{"raw long"} "a[]b""#).unwrap();
    let strings: Vec<(&str, &str)> = tokens.iter().filter(|x| x.is(TokenKind::ConstantString)).map(|x| (x.text.as_str(), x.value_or_text())).collect();
    assert_eq!(strings, [
        (r#""hello \"you\"""#, r#"hello \"you\""#),
        ("'icon.dmi'", "icon.dmi"),
        ("{\"long\ntext\"}", "long\ntext"),
        (r#"@"raw[x]""#, "raw[x]"),
        (r#"@{"raw long"}"#, "raw long"),
        (r#""a[]b""#, "a[]b"),
    ]);

    assert!(matches!(tokenize("test.dm", "\"open\nx"), Err(PreprocessError::UnterminatedString { .. })));
    assert!(matches!(tokenize("test.dm", "{\"open"), Err(PreprocessError::UnterminatedString { .. })));
    assert!(matches!(tokenize("test.dm", "@\"abc"), Err(PreprocessError::UnterminatedString { .. })));
    for src in ["x = @", "x = @\ny"] {
        match tokenize("test.dm", src) {
            Err(PreprocessError::UnterminatedString { location, terminator }) => {
                assert_eq!((location.line, location.column), (1, 5));
                assert_eq!(terminator, "@");
            }
            x => panic!("{src:?}: {x:?}"),
        }
    }
}

#[test]
fn test_lex_interpolated_string() {
    let tokens = tokenize("test.dm", r#""There are [count[1]] of [name]!""#).unwrap();
    let got: Vec<(TokenKind, &str)> = tokens.iter().map(|x| (x.kind, x.value_or_text())).collect();
    assert_eq!(got, [
        (TokenKind::StringBegin, "There are "),
        (TokenKind::Identifier, "count"),
        (TokenKind::LeftBracket, "["),
        (TokenKind::Number, "1"),
        (TokenKind::RightBracket, "]"),
        (TokenKind::StringMiddle, " of "),
        (TokenKind::Identifier, "name"),
        (TokenKind::StringEnd, "!"),
        (TokenKind::EndOfFile, ""),
    ]);
    assert_eq!(tokens[0].text, "\"There are [");
    assert_eq!(tokens[7].text, "]!\"");

    assert!(matches!(tokenize("test.dm", "\"a [b"), Err(PreprocessError::UnterminatedString { .. })));
}

#[test]
fn test_lex_directives() {
    let tokens = tokenize("test.dm", "#define X\n#warn careful now\n##name #arg #Define").unwrap();
    assert_eq!(tokens[0].kind, TokenKind::Define);
    let warn = tokens.iter().find(|x| x.is(TokenKind::Warning)).unwrap();
    assert_eq!(warn.value.as_deref(), Some("careful now"));
    let concat = tokens.iter().find(|x| x.is(TokenKind::TokenConcat)).unwrap();
    assert_eq!(concat.value.as_deref(), Some("name"));
    let stringify: Vec<&str> = tokens.iter().filter(|x| x.is(TokenKind::ParameterStringify)).map(|x| x.value_or_text()).collect();
    assert_eq!(stringify, ["arg", "Define"]);

    let mut lexer = Lexer::new(".", "test.dm", "#Define");
    lexer.next_token(false).unwrap();
    assert_eq!(lexer.take_warnings().len(), 1);
}
