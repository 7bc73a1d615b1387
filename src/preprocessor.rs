//! The DM preprocessor.
//!
//! [`Preprocessor`] pulls tokens from a stack of [`Lexer`]s (one per file being included), executes directives, and
//! expands macros by pushing their bodies back onto a stack of unprocessed tokens so that nested macros are expanded
//! in turn. The result is a flat token stream together with the maps, interface file and resource directories the
//! sources asked for.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::fmt;

use compact_str::CompactString;
use tracing::{debug, instrument, warn};

use crate::condition;
use crate::error::{PreprocessError, PreprocessResult};
use crate::lexer::Lexer;
use crate::macros::{Builtin, Macro, MacroDefinition};
use crate::token::*;

/// Settings for a [`Preprocessor`].
#[derive(Clone, Debug)]
pub struct PreprocessorSettings {
    /// Maximum number of nested macro expansions a single token may go through before expansion fails.
    /// This is what stops self-referential macros (default `128`).
    pub max_expansion_depth: usize,
    /// Value of the `DM_VERSION` builtin macro (default `"515"`).
    pub dm_version: String,
    /// Value of the `DM_BUILD` builtin macro (default `"1633"`).
    pub dm_build: String,
    /// Whether directives are allowed at all. When disabled, any directive is an error (default `true`).
    pub enable_directives: bool,
}
impl Default for PreprocessorSettings {
    fn default() -> Self {
        Self {
            max_expansion_depth: 128,
            dm_version: "515".into(),
            dm_build: "1633".into(),
            enable_directives: true,
        }
    }
}

/// A non-fatal diagnostic raised while preprocessing.
#[derive(Clone, Debug, PartialEq)]
pub struct Warning {
    pub location: Location,
    pub message: String,
}
impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: warning: {}", self.location, self.message)
    }
}

/// Everything produced by a preprocessor run.
#[derive(Debug, Default)]
pub struct PreprocessOutput {
    pub tokens: Vec<Token>,
    /// Map files (`.dmm`/`.dmp`) in inclusion order.
    pub included_maps: Vec<PathBuf>,
    /// The interface file (`.dmf`), if one was included.
    pub included_interface: Option<PathBuf>,
    /// Directories added with `#define FILE_DIR`.
    pub resource_dirs: Vec<PathBuf>,
    pub warnings: Vec<Warning>,
}

pub struct Preprocessor {
    settings: PreprocessorSettings,
    lexers: Vec<Lexer>,
    /// Tokens waiting to be read again, with the number of macro expansions that produced them. Top of stack is next.
    unprocessed: Vec<(Token, usize)>,
    defines: HashMap<CompactString, Rc<Macro>>,
    /// One entry per open `#if`. `Some(taken)` while in an if/elif branch, `None` once its `#else` was reached.
    if_stack: Vec<Option<bool>>,
    last_seen_if: Option<Location>,
    included: HashSet<PathBuf>,
    buffered_whitespace: Vec<Token>,
    line_has_content: bool,
    can_use_directive: bool,
    output: PreprocessOutput,
}
impl Preprocessor {
    pub fn new(settings: PreprocessorSettings) -> Self {
        let defines = Builtin::ALL.iter().map(|(name, builtin)| (CompactString::from(*name), Rc::new(Macro::Builtin(*builtin)))).collect();
        Self {
            settings,
            lexers: vec![],
            unprocessed: vec![],
            defines,
            if_stack: vec![],
            last_seen_if: None,
            included: Default::default(),
            buffered_whitespace: vec![],
            line_has_content: false,
            can_use_directive: true,
            output: Default::default(),
        }
    }

    /// Defines a parameterless macro from source text, as `-D NAME=value` would on a command line.
    pub fn define_macro(&mut self, name: &str, value: &str) -> PreprocessResult<()> {
        let mut lexer = Lexer::new(".", "<command line>", value);
        let mut body = vec![];
        loop {
            let token = lexer.next_token(false)?;
            if token.is(TokenKind::EndOfFile) { break }
            body.push(token);
        }
        self.defines.insert(name.into(), Rc::new(Macro::Defined(MacroDefinition::object(body))));
        Ok(())
    }
    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    /// Queues source text that does not come from the filesystem.
    /// Files queued later are processed first.
    pub fn push_source(&mut self, file: &str, source: &str) {
        self.lexers.push(Lexer::new(".", file, source));
    }

    /// Queues `file` (relative to `include_dir`) as it would be by an `#include` directive.
    /// Files queued later are processed first.
    pub fn include_file(&mut self, include_dir: &Path, file: &str) -> PreprocessResult<()> {
        self.include(include_dir, file, None)
    }

    /// Runs the preprocessor over every queued file.
    #[instrument(skip_all)]
    pub fn run(mut self) -> PreprocessResult<PreprocessOutput> {
        while !self.lexers.is_empty() {
            let (token, depth) = self.next_token(false)?;
            match token.kind {
                TokenKind::Whitespace => match self.line_has_content {
                    true => self.output.tokens.push(token),
                    false => self.buffered_whitespace.push(token),
                }
                TokenKind::EndOfFile => {
                    if let Some(lexer) = self.lexers.pop() {
                        debug!(file = %lexer.file(), "finished file");
                    }
                }
                TokenKind::Newline => {
                    self.can_use_directive = true;
                    self.buffered_whitespace.clear();
                    if self.line_has_content {
                        self.line_has_content = false;
                        self.output.tokens.push(token);
                    }
                }
                TokenKind::LineSplice => {
                    let (next, depth) = loop {
                        let (next, depth) = self.next_token(true)?;
                        if !next.is(TokenKind::Newline) { break (next, depth) }
                    };
                    self.can_use_directive = true;
                    self.unprocessed.push((next, depth));
                }

                TokenKind::Include => {
                    if !self.line_has_content {
                        self.buffered_whitespace.clear();
                    }
                    self.handle_include(&token)?;
                }
                TokenKind::Define => self.handle_define(&token)?,
                TokenKind::Undefine => self.handle_undefine(&token)?,
                TokenKind::If => {
                    self.buffered_whitespace.clear();
                    self.handle_if(&token)?;
                }
                TokenKind::Ifdef => self.handle_ifdef(&token, true)?,
                TokenKind::Ifndef => self.handle_ifdef(&token, false)?,
                TokenKind::Elif => self.handle_elif(&token)?,
                TokenKind::Else => match self.if_stack.pop() {
                    Some(Some(true)) => self.skip_if_body(true)?,
                    Some(Some(false)) => self.if_stack.push(None),
                    _ => return Err(PreprocessError::directive(&token.location, "unexpected #else")),
                }
                TokenKind::EndIf => if self.if_stack.pop().is_none() {
                    return Err(PreprocessError::directive(&token.location, "unexpected #endif"));
                }
                TokenKind::Warning | TokenKind::Error => {
                    self.verify_directive(&token)?;
                    let message = token.value.as_deref().unwrap_or_default().to_owned();
                    if token.is(TokenKind::Error) {
                        return Err(PreprocessError::ErrorDirective { location: token.location, message });
                    }
                    self.warn(&token.location, message);
                }
                TokenKind::Pragma => self.handle_pragma(&token)?,

                TokenKind::Identifier => {
                    if !self.try_macro(&token, depth)? {
                        self.emit(token);
                    }
                }
                TokenKind::Number | TokenKind::Punctuator | TokenKind::ConstantString
                | TokenKind::StringBegin | TokenKind::StringMiddle | TokenKind::StringEnd
                | TokenKind::Comma | TokenKind::Period | TokenKind::Colon | TokenKind::Question
                | TokenKind::LeftParen | TokenKind::RightParen | TokenKind::LeftBracket | TokenKind::RightBracket
                | TokenKind::Semicolon => self.emit(token),

                TokenKind::TokenConcat | TokenKind::ParameterStringify => {
                    self.warn(&token.location, format!("'{}' is only meaningful inside a macro body", token.text));
                }
            }
        }

        if !self.if_stack.is_empty() {
            let location = self.last_seen_if.unwrap_or_else(Location::internal);
            let count = self.if_stack.len();
            return Err(PreprocessError::directive(&location, format!("missing {count} #endif directive{}", if count != 1 { "s" } else { "" })));
        }
        Ok(self.output)
    }

    fn emit(&mut self, token: Token) {
        self.output.tokens.append(&mut self.buffered_whitespace);
        self.line_has_content = true;
        self.can_use_directive = token.is(TokenKind::Semicolon);
        self.output.tokens.push(token);
    }

    fn warn(&mut self, location: &Location, message: String) {
        warn!(%location, "{message}");
        self.output.warnings.push(Warning { location: location.clone(), message });
    }

    fn next_token(&mut self, ignore_whitespace: bool) -> PreprocessResult<(Token, usize)> {
        if let Some((token, depth)) = self.unprocessed.pop() {
            if ignore_whitespace && token.is(TokenKind::Whitespace) {
                return self.next_token(true);
            }
            return Ok((token, depth));
        }

        let (token, warnings) = match self.lexers.last_mut() {
            Some(lexer) => (lexer.next_token(ignore_whitespace)?, lexer.take_warnings()),
            None => (Token::new(TokenKind::EndOfFile, "", Location::internal()), vec![]),
        };
        for (location, message) in warnings {
            self.warn(&location, message);
        }
        Ok((token, 0))
    }

    /// Reads the next token if it has the given kind. Otherwise leaves it in place.
    fn check(&mut self, kind: TokenKind) -> PreprocessResult<bool> {
        let (token, depth) = self.next_token(false)?;
        if token.is(kind) { return Ok(true) }
        self.unprocessed.push((token, depth));
        Ok(false)
    }

    fn current_lexer(&self, location: &Location) -> PreprocessResult<&Lexer> {
        self.lexers.last().ok_or_else(|| PreprocessError::directive(location, "directive outside of any file"))
    }

    fn verify_directive(&self, token: &Token) -> PreprocessResult<()> {
        if !self.settings.enable_directives {
            return Err(PreprocessError::directive(&token.location, "cannot use a preprocessor directive here"));
        }
        if !self.can_use_directive {
            return Err(PreprocessError::directive(&token.location, "there can only be whitespace before a preprocessor directive"));
        }
        Ok(())
    }

    fn handle_include(&mut self, token: &Token) -> PreprocessResult<()> {
        self.verify_directive(token)?;

        let (path, _) = self.next_token(true)?;
        if !path.is(TokenKind::ConstantString) {
            return Err(PreprocessError::directive(&path.location, format!("\"{}\" is not a valid include path", path.text)));
        }

        let lexer = self.current_lexer(&token.location)?;
        let relative = Path::new(&**lexer.file()).parent().unwrap_or(Path::new("")).join(path.value_or_text().replace('\\', "/"));
        let include_dir = lexer.include_dir().to_path_buf();
        self.include(&include_dir, &relative.to_string_lossy(), Some(&token.location))
    }

    fn include(&mut self, include_dir: &Path, file: &str, from: Option<&Location>) -> PreprocessResult<()> {
        let file = normalize(Path::new(&file.replace('\\', "/")));
        let full_path = normalize(&include_dir.join(&file));
        let location = from.cloned().unwrap_or_else(Location::internal);

        if self.included.contains(&full_path) {
            self.warn(&location, format!("file \"{}\" was already included", full_path.display()));
            return Ok(());
        }
        if !full_path.is_file() {
            return Err(PreprocessError::Include { location, path: full_path, reason: "file does not exist" });
        }
        self.included.insert(full_path.clone());

        let extension = full_path.extension().and_then(|x| x.to_str()).map(|x| x.to_ascii_lowercase());
        match extension.as_deref() {
            Some("dmm" | "dmp") => self.output.included_maps.push(full_path),
            Some("dmf") => match &self.output.included_interface {
                Some(_) => return Err(PreprocessError::Include { location, path: full_path, reason: "an interface file was already included" }),
                None => self.output.included_interface = Some(full_path),
            }
            Some("dm" | "dme") => {
                debug!(file = %file.display(), "including file");
                self.lexers.push(Lexer::open(include_dir, &file.to_string_lossy())?);
            }
            _ => return Err(PreprocessError::Include { location, path: full_path, reason: "unsupported file type" }),
        }
        Ok(())
    }

    fn handle_define(&mut self, token: &Token) -> PreprocessResult<()> {
        self.verify_directive(token)?;

        let (name, _) = self.next_token(true)?;
        if !name.is(TokenKind::Identifier) {
            return Err(PreprocessError::directive(&name.location, "identifier expected for #define"));
        }

        // each FILE_DIR define adds a resource directory instead of defining a macro
        if name.text == "FILE_DIR" {
            let (dir, _) = self.next_token(true)?;
            let value = match dir.kind {
                TokenKind::ConstantString => dir.value_or_text(),
                TokenKind::Period => ".",
                _ => return Err(PreprocessError::directive(&dir.location, format!("\"{}\" is not a valid directory", dir.text))),
            };
            let resource_dir = self.current_lexer(&token.location)?.include_dir().join(value);
            debug!(dir = %resource_dir.display(), "adding resource directory");
            self.output.resource_dirs.push(resource_dir);
            return Ok(());
        }
        if name.text == "defined" {
            self.warn(&name.location, "'defined' is reserved and cannot be used as a macro name".into());
        }

        let mut params = None;
        let (mut next, _) = self.next_token(false)?;
        if next.is(TokenKind::LeftParen) {
            let mut list: Vec<CompactString> = vec![];
            let mut can_consume_comma = false;
            loop {
                let (param, depth) = self.next_token(true)?;
                match param.kind {
                    TokenKind::Identifier => {
                        if self.check(TokenKind::Period)? {
                            if !(self.check(TokenKind::Period)? && self.check(TokenKind::Period)?) {
                                return Err(PreprocessError::directive(&param.location, format!("invalid macro parameter, '{}...' expected", param.text)));
                            }
                            list.push(compact_str::format_compact!("{}...", param.text));
                        } else {
                            list.push(param.text);
                        }
                        can_consume_comma = true;
                    }
                    TokenKind::Period => {
                        if !(self.check(TokenKind::Period)? && self.check(TokenKind::Period)?) {
                            return Err(PreprocessError::directive(&param.location, "invalid macro parameter, '...' expected"));
                        }
                        list.push("...".into());
                        can_consume_comma = true;
                    }
                    TokenKind::Comma => {
                        if !can_consume_comma {
                            return Err(PreprocessError::directive(&param.location, "unexpected ',' in macro parameter list"));
                        }
                        can_consume_comma = false;
                    }
                    TokenKind::RightParen => break,
                    TokenKind::EndOfFile | TokenKind::Newline => {
                        self.unprocessed.push((param, depth));
                        return Err(PreprocessError::directive(&next.location, "missing ')' in macro definition"));
                    }
                    _ => return Err(PreprocessError::directive(&param.location, "expected a macro parameter")),
                }
            }
            params = Some(list);
            next = self.next_token(true)?.0;
        } else if next.is(TokenKind::Whitespace) {
            // whitespace between the name and a '(' makes this a plain macro
            next = self.next_token(false)?.0;
        }

        let mut body = vec![];
        while !matches!(next.kind, TokenKind::Newline | TokenKind::EndOfFile) {
            if next.is(TokenKind::LineSplice) {
                // a line splice followed by an empty line ends the macro
                next = self.next_token(true)?.0;
                if next.is(TokenKind::Newline) { break }
                continue;
            }
            body.push(next);
            next = self.next_token(false)?.0;
        }

        let definition = MacroDefinition::new(params, body, &name.location)?;
        self.defines.insert(name.text, Rc::new(Macro::Defined(definition)));
        self.unprocessed.push((next, 0));
        Ok(())
    }

    fn handle_undefine(&mut self, token: &Token) -> PreprocessResult<()> {
        self.verify_directive(token)?;

        let (name, _) = self.next_token(true)?;
        if !name.is(TokenKind::Identifier) {
            return Err(PreprocessError::directive(&name.location, "invalid macro identifier"));
        }
        if self.defines.remove(&name.text).is_none() {
            self.warn(&name.location, format!("no macro named \"{}\"", name.text));
        }
        Ok(())
    }

    /// Reads the rest of the line for an `#if` condition, expanding macros except for the operand of `defined`.
    fn condition_line(&mut self) -> PreprocessResult<Vec<Token>> {
        enum Defined { No, Name, Parens }

        let mut tokens = vec![];
        let mut defined = Defined::No;
        loop {
            let (token, depth) = self.next_token(true)?;
            match token.kind {
                TokenKind::Newline => break,
                TokenKind::EndOfFile => {
                    self.unprocessed.push((token, depth));
                    break;
                }
                TokenKind::LineSplice => continue,
                TokenKind::Identifier => match defined {
                    Defined::Name => defined = Defined::No,
                    Defined::Parens => (),
                    Defined::No if token.text == "defined" => defined = Defined::Name,
                    Defined::No => if self.try_macro(&token, depth)? { continue },
                }
                TokenKind::LeftParen => if let Defined::Name = defined { defined = Defined::Parens },
                TokenKind::RightParen => if let Defined::Parens = defined { defined = Defined::No },
                _ => (),
            }
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn handle_if(&mut self, token: &Token) -> PreprocessResult<()> {
        self.last_seen_if = Some(token.location.clone());
        self.verify_directive(token)?;

        let tokens = self.condition_line()?;
        let defines = &self.defines;
        let value = condition::evaluate(&tokens, &|name| defines.contains_key(name), &token.location)?;
        let taken = condition::is_truthy(value);
        self.if_stack.push(Some(taken));
        if !taken {
            self.skip_if_body(false)?;
        }
        Ok(())
    }

    fn handle_ifdef(&mut self, token: &Token, expect_defined: bool) -> PreprocessResult<()> {
        self.last_seen_if = Some(token.location.clone());
        self.verify_directive(token)?;

        let (name, _) = self.next_token(true)?;
        if !name.is(TokenKind::Identifier) {
            return Err(PreprocessError::directive(&token.location, "expected a macro name"));
        }
        let taken = self.is_defined(&name.text) == expect_defined;
        self.if_stack.push(Some(taken));
        if !taken {
            self.skip_if_body(false)?;
        }
        Ok(())
    }

    fn handle_elif(&mut self, token: &Token) -> PreprocessResult<()> {
        match self.if_stack.last() {
            None => Err(PreprocessError::directive(&token.location, "unexpected #elif")),
            Some(None) => Err(PreprocessError::directive(&token.location, "#elif cannot follow #else")),
            Some(Some(true)) => self.skip_if_body(false),
            Some(Some(false)) => {
                self.if_stack.pop();
                self.handle_if(token)
            }
        }
    }

    fn handle_pragma(&mut self, token: &Token) -> PreprocessResult<()> {
        self.verify_directive(token)?;

        let mut text = String::new();
        loop {
            let (next, depth) = self.next_token(false)?;
            if matches!(next.kind, TokenKind::Newline | TokenKind::EndOfFile) {
                self.unprocessed.push((next, depth));
                break;
            }
            text.push_str(&next.text);
        }
        debug!(location = %token.location, pragma = text.trim(), "ignoring #pragma");
        Ok(())
    }

    /// Skips to the `#else`, `#elif` or `#endif` matching the current conditional.
    ///
    /// The terminating directive is left to be read again, except for the `#endif` ending an `#else` body.
    /// Lexer errors inside the skipped region are ignored.
    fn skip_if_body(&mut self, in_else: bool) -> PreprocessResult<()> {
        let mut depth = 1usize;
        loop {
            let (token, expansion_depth) = match self.next_token(true) {
                Ok(x) => x,
                Err(PreprocessError::Io { path, source }) => return Err(PreprocessError::Io { path, source }),
                Err(_) => continue,
            };
            match token.kind {
                TokenKind::EndOfFile => {
                    self.unprocessed.push((token, expansion_depth));
                    return Ok(());
                }
                TokenKind::If | TokenKind::Ifdef | TokenKind::Ifndef => depth += 1,
                TokenKind::EndIf => {
                    depth -= 1;
                    if depth == 0 {
                        if !in_else {
                            self.unprocessed.push((token, expansion_depth));
                        }
                        return Ok(());
                    }
                }
                TokenKind::Else | TokenKind::Elif if depth == 1 => {
                    if in_else {
                        return Err(PreprocessError::directive(&token.location, format!("unexpected {} directive", token.text)));
                    }
                    self.unprocessed.push((token, expansion_depth));
                    return Ok(());
                }
                _ => (),
            }
        }
    }

    /// Expands `token` if it names a macro. Returns `false` if the token should be emitted as-is.
    fn try_macro(&mut self, token: &Token, depth: usize) -> PreprocessResult<bool> {
        let definition = match self.defines.get(&token.text) {
            Some(x) => x.clone(),
            None => return Ok(false),
        };

        let args = match definition.has_params() {
            true => match self.macro_args()? {
                Some(args) => Some(args),
                None => return Ok(false),
            }
            false => None,
        };

        if depth >= self.settings.max_expansion_depth {
            return Err(PreprocessError::ExpansionOverflow { location: token.location.clone(), name: token.text.clone(), limit: self.settings.max_expansion_depth });
        }

        let expanded = definition.expand(token, args, &self.settings)?;
        for mut expanded_token in expanded.into_iter().rev() {
            expanded_token.location = token.location.clone();
            self.unprocessed.push((expanded_token, depth + 1));
        }
        Ok(true)
    }

    /// Reads a parenthesized macro argument list. Returns `None` (consuming nothing) if there is no `(`.
    fn macro_args(&mut self) -> PreprocessResult<Option<Vec<Vec<Token>>>> {
        let (first, first_depth) = self.next_token(false)?;
        let open = if first.is(TokenKind::LeftParen) {
            first
        } else if first.is(TokenKind::Whitespace) {
            let (second, second_depth) = self.next_token(false)?;
            if !second.is(TokenKind::LeftParen) {
                self.unprocessed.push((second, second_depth));
                self.unprocessed.push((first, first_depth));
                return Ok(None);
            }
            second
        } else {
            self.unprocessed.push((first, first_depth));
            return Ok(None);
        };

        let mut args = vec![];
        let mut current = vec![];
        let mut nesting = 1usize;
        let (mut token, _) = self.next_token(true)?;
        loop {
            match token.kind {
                TokenKind::Comma if nesting == 1 => {
                    args.push(trim_arg(std::mem::take(&mut current)));
                    token = self.next_token(true)?.0;
                    continue;
                }
                TokenKind::Newline | TokenKind::LineSplice => {
                    token = self.next_token(current.is_empty())?.0;
                    continue;
                }
                TokenKind::LeftParen => nesting += 1,
                TokenKind::RightParen => {
                    nesting -= 1;
                    if nesting == 0 { break }
                }
                TokenKind::EndOfFile => {
                    self.unprocessed.push((token, 0));
                    return Err(PreprocessError::directive(&open.location, "missing ')' in macro call"));
                }
                _ => (),
            }
            current.push(token);
            token = self.next_token(false)?.0;
        }
        args.push(trim_arg(current));
        Ok(Some(args))
    }
}

fn trim_arg(mut arg: Vec<Token>) -> Vec<Token> {
    while arg.last().is_some_and(|x| x.is(TokenKind::Whitespace)) {
        arg.pop();
    }
    arg
}

/// Resolves `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut res = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => (),
            Component::ParentDir => if !res.pop() { res.push(".."); }
            other => res.push(other.as_os_str()),
        }
    }
    res
}

/// Preprocesses `entry` (relative to `include_dir`) with default settings.
pub fn expand(include_dir: &Path, entry: &str) -> PreprocessResult<PreprocessOutput> {
    let mut preprocessor = Preprocessor::new(Default::default());
    preprocessor.include_file(include_dir, entry)?;
    preprocessor.run()
}

#[test]
fn test_normalize() {
    assert_eq!(normalize(Path::new("a/./b/../c.dm")), PathBuf::from("a/c.dm"));
    assert_eq!(normalize(Path::new("../x.dm")), PathBuf::from("../x.dm"));
}

#[test]
fn test_settings_default() {
    let settings = PreprocessorSettings::default();
    assert_eq!(settings.max_expansion_depth, 128);
    assert_eq!(settings.dm_version, "515");
    assert!(settings.enable_directives);
}
