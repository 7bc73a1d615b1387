//! Error types for every stage of the toolchain.
//!
//! Errors fall into two groups. Bad input (malformed directives, missing labels, undecodable bytes) is reported
//! through the stage-specific enums and collected per file or per procedure by [`CompileError`].
//! [`InternalError`] marks an inconsistency in this crate itself; callers should treat it as fatal.

use std::path::PathBuf;
use std::io;

use compact_str::CompactString;
use thiserror::Error;

use crate::token::Location;

/// Result type of the preprocessor.
pub type PreprocessResult<T> = Result<T, PreprocessError>;

/// An inconsistency in the opcode table or the control-flow classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("opcodes {first} and {second} share value {value:#04x}")]
    OpcodeCollision { first: &'static str, second: &'static str, value: u8 },
    #[error("opcode name {name} is declared twice")]
    DuplicateOpcodeName { name: &'static str },
    #[error("control flow splitting opcode {opcode} is not handled")]
    UnhandledControlFlowOpcode { opcode: &'static str },
    #[error("variadic opcode {opcode} has no item grammar")]
    MalformedVariadicOpcode { opcode: &'static str },
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("{location}: {message}")]
    Directive { location: Location, message: String },
    #[error("{location}: expected '{terminator}' to end string")]
    UnterminatedString { location: Location, terminator: String },
    #[error("{location}: expected \"*/\" to end multiline comment")]
    UnterminatedComment { location: Location },
    #[error("{location}: macro '{name}' expects {expected} argument(s) but was given {given}")]
    MacroArity { location: Location, name: CompactString, expected: usize, given: usize },
    #[error("{location}: expansion of macro '{name}' exceeded the nesting limit of {limit}")]
    ExpansionOverflow { location: Location, name: CompactString, limit: usize },
    #[error("{location}: cannot include \"{path}\": {reason}")]
    Include { location: Location, path: PathBuf, reason: &'static str },
    #[error("{location}: #error {message}")]
    ErrorDirective { location: Location, message: String },
    #[error("failed to read \"{path}\": {source}")]
    Io { path: PathBuf, #[source] source: io::Error },
}
impl PreprocessError {
    pub(crate) fn directive(location: &Location, message: impl Into<String>) -> Self {
        Self::Directive { location: location.clone(), message: message.into() }
    }
    /// The source location the error points at, if it has one.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::Directive { location, .. } | Self::UnterminatedString { location, .. } | Self::UnterminatedComment { location }
            | Self::MacroArity { location, .. } | Self::ExpansionOverflow { location, .. } | Self::Include { location, .. }
            | Self::ErrorDirective { location, .. } => Some(location),
            Self::Io { .. } => None,
        }
    }
}

/// An operand list that does not match its opcode's grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperandError {
    #[error("{opcode} expects {expected} operand(s) but was given {given}")]
    Arity { opcode: &'static str, expected: usize, given: usize },
    #[error("{opcode} operand {index} should be {expected} but was {given}")]
    Kind { opcode: &'static str, index: usize, expected: &'static str, given: &'static str },
    #[error("{opcode} has a negative item count ({count})")]
    NegativeCount { opcode: &'static str, count: i32 },
    #[error("{kind} index {index} does not fit in one byte")]
    IndexOutOfRange { kind: &'static str, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CfgError {
    #[error("duplicate label {label}")]
    DuplicateLabel { label: CompactString },
    #[error("{}label {label} does not exist", line_prefix(*line))]
    UnresolvedLabel { label: CompactString, line: Option<u32> },
    #[error("{}{opcode} has no label operand", line_prefix(*line))]
    MissingLabelOperand { opcode: &'static str, line: Option<u32> },
    #[error("EndTry without a matching Try")]
    UnbalancedTry,
    #[error(transparent)]
    Internal(#[from] InternalError),
}
impl CfgError {
    /// Whether this error indicates a bug in the toolchain rather than bad input.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

fn line_prefix(line: Option<u32>) -> String {
    match line {
        Some(line) => format!("line {line}: "),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("label {label} was referenced but never placed")]
    UnresolvedLabel { label: CompactString },
    #[error("label {label} was placed twice")]
    DuplicateLabel { label: CompactString },
    #[error("{opcode} at line {line:?}: {source}")]
    Operand { opcode: &'static str, line: Option<u32>, #[source] source: OperandError },
    #[error("procedure is too large to address ({len} bytes)")]
    OffsetOverflow { len: usize },
    #[error("{opcode} at line {line:?}: stack depth does not fit in 32 bits")]
    StackOverflow { opcode: &'static str, line: Option<u32> },
}

/// A byte sequence the disassembler cannot interpret.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("offset {offset}: unexpected end of bytecode")]
    UnexpectedEnd { offset: usize },
    #[error("offset {offset}: unknown opcode {value:#04x}")]
    UnknownOpcode { offset: usize, value: u8 },
    #[error("offset {offset}: unknown reference type {value:#04x}")]
    UnknownReferenceType { offset: usize, value: u8 },
    #[error("offset {offset}: unknown argument type {value:#04x}")]
    UnknownArgumentType { offset: usize, value: u8 },
    #[error("offset {offset}: string id {id} is not in the string table")]
    BadString { offset: usize, id: i32 },
    #[error("offset {offset}: negative item count {count}")]
    NegativeCount { offset: usize, count: i32 },
}

/// Errors raised while loading or querying a compiled artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read \"{path}\": {source}")]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("malformed artifact: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed bytecode encoding: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("artifact was built for opcode table {found} but this build uses {expected}")]
    FingerprintMismatch { expected: String, found: String },
    #[error("no type named \"{path}\"")]
    UnknownType { path: String },
    #[error("type \"{path}\" has no proc named \"{name}\"")]
    UnknownProc { path: String, name: String },
}

/// Any recoverable failure while compiling one file or procedure.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Operand(#[from] OperandError),
}
