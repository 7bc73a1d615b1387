//! Macro definitions and their expansion.

use compact_str::{CompactString, format_compact};

use crate::error::{PreprocessError, PreprocessResult};
use crate::preprocessor::PreprocessorSettings;
use crate::token::*;

/// The name a bare `...` parameter is exposed as.
pub const VARIADIC_ARGS: &str = "__VA_ARGS__";

/// Macros the preprocessor defines on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    /// `__LINE__`: the line of the invocation.
    Line,
    /// `__FILE__`: the file of the invocation as a string.
    File,
    /// `DM_VERSION`
    Version,
    /// `DM_BUILD`
    Build,
}
impl Builtin {
    pub const ALL: [(&'static str, Builtin); 4] = [
        ("__LINE__", Builtin::Line),
        ("__FILE__", Builtin::File),
        ("DM_VERSION", Builtin::Version),
        ("DM_BUILD", Builtin::Build),
    ];
}

#[derive(Clone, Debug)]
pub enum Macro {
    Builtin(Builtin),
    Defined(MacroDefinition),
}
impl Macro {
    /// Whether an invocation must be followed by an argument list.
    pub fn has_params(&self) -> bool {
        match self {
            Macro::Builtin(_) => false,
            Macro::Defined(def) => def.params.is_some(),
        }
    }

    /// Expands an invocation. `args` must be given exactly when [`Macro::has_params`] is true.
    pub fn expand(&self, invocation: &Token, args: Option<Vec<Vec<Token>>>, settings: &PreprocessorSettings) -> PreprocessResult<Vec<Token>> {
        let location = &invocation.location;
        Ok(match self {
            Macro::Builtin(Builtin::Line) => vec![Token::new(TokenKind::Number, format_compact!("{}", location.line), location.clone())],
            Macro::Builtin(Builtin::File) => {
                let path = location.file.replace('\\', "\\\\");
                vec![Token::with_value(TokenKind::ConstantString, format!("\"{path}\""), path, location.clone())]
            }
            Macro::Builtin(Builtin::Version) => vec![Token::new(TokenKind::Number, settings.dm_version.as_str(), location.clone())],
            Macro::Builtin(Builtin::Build) => vec![Token::new(TokenKind::Number, settings.dm_build.as_str(), location.clone())],
            Macro::Defined(def) => def.expand(invocation, args)?,
        })
    }
}

/// A macro defined with `#define`.
#[derive(Clone, Debug)]
pub struct MacroDefinition {
    params: Option<Vec<CompactString>>,
    /// Index and name of the overflow parameter. It is always the last parameter.
    overflow: Option<usize>,
    body: Vec<Token>,
}
impl MacroDefinition {
    /// Creates a macro. Parameters spelled `name...` or `...` are overflow parameters.
    /// An overflow parameter that is not the last one is an error.
    pub fn new(params: Option<Vec<CompactString>>, mut body: Vec<Token>, location: &Location) -> PreprocessResult<Self> {
        let mut overflow = None;
        let params = match params {
            None => None,
            Some(raw) => {
                let mut params = Vec::with_capacity(raw.len());
                for (i, param) in raw.into_iter().enumerate() {
                    if overflow.is_some() {
                        return Err(PreprocessError::directive(location, format!("variadic parameter '{}' must be the last parameter", params[i - 1])));
                    }
                    match param.strip_suffix("...") {
                        Some("") => { overflow = Some(i); params.push(VARIADIC_ARGS.into()); }
                        Some(name) => { overflow = Some(i); params.push(name.into()); }
                        None => params.push(param),
                    }
                }
                Some(params)
            }
        };

        // whitespace directly before a ## is dropped
        let mut i = 1;
        while i < body.len() {
            if body[i].is(TokenKind::TokenConcat) && body[i - 1].is(TokenKind::Whitespace) {
                body.remove(i - 1);
            } else {
                i += 1;
            }
        }
        while body.last().is_some_and(|x| x.is(TokenKind::Whitespace)) {
            body.pop();
        }

        Ok(Self { params, overflow, body })
    }
    /// A parameterless macro that expands to `body`.
    pub fn object(body: Vec<Token>) -> Self {
        Self { params: None, overflow: None, body }
    }

    pub fn params(&self) -> Option<&[CompactString]> {
        self.params.as_deref()
    }
    pub fn body(&self) -> &[Token] {
        &self.body
    }

    fn expand(&self, invocation: &Token, args: Option<Vec<Vec<Token>>>) -> PreprocessResult<Vec<Token>> {
        let params = match &self.params {
            None => return Ok(self.body.clone()),
            Some(x) => x,
        };
        let mut args = args.ok_or_else(|| PreprocessError::directive(&invocation.location, format!("macro '{}' requires arguments", invocation.text)))?;

        // `M()` passes one empty argument, which is no argument at all for a macro without parameters
        if params.is_empty() && args.len() == 1 && args[0].is_empty() {
            args.clear();
        }
        let arity_ok = match self.overflow {
            Some(overflow) => args.len() >= overflow,
            None => args.len() == params.len(),
        };
        if !arity_ok {
            return Err(PreprocessError::MacroArity {
                location: invocation.location.clone(),
                name: invocation.text.clone(),
                expected: self.overflow.unwrap_or(params.len()),
                given: args.len(),
            });
        }

        let mut res: Vec<Token> = Vec::with_capacity(self.body.len());
        for token in self.body.iter() {
            let name = match token.kind {
                TokenKind::TokenConcat | TokenKind::ParameterStringify => token.value_or_text(),
                TokenKind::Identifier => token.text.as_str(),
                _ => {
                    res.push(token.clone());
                    continue;
                }
            };

            let replacement = match params.iter().position(|x| x == name) {
                Some(i) if Some(i) == self.overflow => Some(join_overflow(&args[i.min(args.len())..], &token.location)),
                Some(i) => Some(args[i].clone()),
                None => None,
            };

            match (token.kind, replacement) {
                (TokenKind::ParameterStringify, Some(arg)) => res.push(stringify(&arg, &token.location)),
                (TokenKind::ParameterStringify, None) => res.push(Token::with_value(TokenKind::ConstantString, format!("\"{}\"", escape_string(name)), name, token.location.clone())),
                (_, Some(arg)) => {
                    let mut arg = arg.into_iter();
                    if token.kind == TokenKind::TokenConcat {
                        if let Some(first) = arg.next() {
                            paste(&mut res, first);
                        }
                    }
                    res.extend(arg);
                }
                (TokenKind::TokenConcat, None) => paste(&mut res, Token::new(TokenKind::Identifier, name, token.location.clone())),
                (_, None) => res.push(token.clone()),
            }
        }
        Ok(res)
    }
}

/// Appends `token`, gluing it onto a directly preceding identifier if it is an identifier or number.
fn paste(res: &mut Vec<Token>, token: Token) {
    if matches!(token.kind, TokenKind::Identifier | TokenKind::Number) {
        if let Some(last) = res.last_mut().filter(|x| x.is(TokenKind::Identifier)) {
            last.text.push_str(&token.text);
            return;
        }
    }
    res.push(token);
}

fn join_overflow(args: &[Vec<Token>], location: &Location) -> Vec<Token> {
    let mut res = vec![];
    for (i, arg) in args.iter().enumerate() {
        if i != 0 {
            res.push(Token::new(TokenKind::Comma, ",", location.clone()));
        }
        res.extend(arg.iter().cloned());
    }
    res
}

fn stringify(arg: &[Token], location: &Location) -> Token {
    let value: String = arg.iter().map(|x| x.text.as_str()).collect();
    Token::with_value(TokenKind::ConstantString, format!("\"{}\"", escape_string(&value)), value, location.clone())
}

#[cfg(test)]
fn lex_body(src: &str) -> Vec<Token> {
    let mut tokens = crate::lexer::tokenize("def.dm", src).unwrap();
    tokens.pop();
    tokens
}

#[cfg(test)]
fn texts(tokens: &[Token]) -> Vec<&str> {
    tokens.iter().map(|x| x.text.as_str()).collect()
}

#[test]
fn test_definition_cleanup() {
    let def = MacroDefinition::new(Some(vec!["a".into(), "b".into()]), lex_body("a ##b  "), &Location::internal()).unwrap();
    assert_eq!(texts(def.body()), ["a", "##b"]);

    let def = MacroDefinition::new(Some(vec!["fmt".into(), "...".into()]), vec![], &Location::internal()).unwrap();
    assert_eq!(def.params().unwrap(), ["fmt", VARIADIC_ARGS]);

    let err = MacroDefinition::new(Some(vec!["rest...".into(), "late".into()]), vec![], &Location::internal());
    assert!(matches!(err, Err(PreprocessError::Directive { .. })));
}

#[test]
fn test_expand_paste_and_stringify() {
    let settings = PreprocessorSettings::default();
    let call = Token::new(TokenKind::Identifier, "M", Location::internal());

    let m = Macro::Defined(MacroDefinition::new(Some(vec!["x".into()]), lex_body("var_##x = #x"), &Location::internal()).unwrap());
    let out = m.expand(&call, Some(vec![lex_body("speed")]), &settings).unwrap();
    assert_eq!(texts(&out), ["var_speed", " ", "=", " ", "\"speed\""]);
    assert_eq!(out[4].value.as_deref(), Some("speed"));

    let m = Macro::Defined(MacroDefinition::new(Some(vec![]), lex_body("nothing"), &Location::internal()).unwrap());
    assert_eq!(texts(&m.expand(&call, Some(vec![vec![]]), &settings).unwrap()), ["nothing"]);
    assert!(matches!(m.expand(&call, Some(vec![lex_body("1")]), &settings), Err(PreprocessError::MacroArity { expected: 0, given: 1, .. })));
}

#[test]
fn test_expand_builtins() {
    let settings = PreprocessorSettings::default();
    let call = Token::new(TokenKind::Identifier, "__FILE__", Location::new("code\\main.dm".into(), 12, 3));
    let file = Macro::Builtin(Builtin::File).expand(&call, None, &settings).unwrap();
    assert_eq!(file[0].text, "\"code\\\\main.dm\"");
    let line = Macro::Builtin(Builtin::Line).expand(&call, None, &settings).unwrap();
    assert_eq!(line[0].text, "12");
    let version = Macro::Builtin(Builtin::Version).expand(&call, None, &settings).unwrap();
    assert_eq!(version[0].text, settings.dm_version);
}
