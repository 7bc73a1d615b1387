//! A toolchain for DM procedure bytecode.
//!
//! The stages line up as follows:
//!
//! 1. [`preprocessor`] turns DM source (with [`lexer`], [`macros`] and [`condition`]) into a token stream.
//! 2. A front end (not part of this crate) lowers procedures into [`annotated`] items, a symbolic form of the [`opcode`] set.
//! 3. [`cfg`] and [`optimizer`] clean up the control flow of each procedure, and [`peephole`] fuses common
//!    instruction sequences.
//! 4. [`bytecode`] encodes procedures to bytes and decodes them back into listings.
//! 5. [`artifact`] bundles every procedure of a project into a single JSON document.

#![forbid(unsafe_code)]

pub mod error;
pub mod token;
pub mod lexer;
pub mod macros;
pub mod condition;
pub mod preprocessor;

pub mod opcode;
pub mod reference;
pub mod annotated;
pub mod cfg;
pub mod optimizer;
pub mod peephole;
pub mod bytecode;

#[cfg(feature = "serde")]
pub mod artifact;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
mod test;

pub use compact_str::CompactString;

pub use error::*;
pub use opcode::{Opcode, OpcodeMetadata, ArgKind, verify_isa, compute_isa_fingerprint};
pub use reference::{Reference, ReferenceType};
pub use annotated::{AnnotatedItem, Instruction, Operand, Label, LocalVariable, StringTable};
pub use cfg::{build_cfg, Cfg, BasicBlock, BlockId};
pub use optimizer::{optimize, OptimizerSettings};
pub use peephole::{peephole, PeepholeStats};
pub use bytecode::{encode, decode, disassemble, EncodedProc};
pub use preprocessor::{Preprocessor, PreprocessorSettings, PreprocessOutput};
