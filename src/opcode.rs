//! The DM opcode set and the metadata attached to each opcode.
//!
//! Every opcode is declared exactly once in the [`opcodes!`] table below, which produces both the [`Opcode`] enum
//! and [`OPCODE_TABLE`]. Metadata is looked up through [`Opcode::metadata`], which indexes a 256-entry table that is
//! built on first use and never mutated afterwards.
//!
//! Compilers and runtimes built from different versions of this table can detect the mismatch by comparing
//! [`compute_isa_fingerprint`] before exchanging bytecode.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::InternalError;

/// The kind of a single operand in an opcode's operand grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ArgKind {
    /// How call arguments are passed (see [`CallArgumentsType`](crate::annotated::CallArgumentsType)).
    ArgType,
    /// Explicit stack delta of a call-like instruction.
    StackDelta,
    Resource,
    TypeId,
    ProcId,
    FilterId,
    EnumeratorId,
    ListSize,
    /// Plain integer. Variadic opcodes use it as their item count.
    Int,
    /// A jump target.
    Label,
    Float,
    String,
    Reference,
    FormatCount,
    PickCount,
    ConcatCount,
}

impl ArgKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::ArgType => "ArgType",
            Self::StackDelta => "StackDelta",
            Self::Resource => "Resource",
            Self::TypeId => "TypeId",
            Self::ProcId => "ProcId",
            Self::FilterId => "FilterId",
            Self::EnumeratorId => "EnumeratorId",
            Self::ListSize => "ListSize",
            Self::Int => "Int",
            Self::Label => "Label",
            Self::Float => "Float",
            Self::String => "String",
            Self::Reference => "Reference",
            Self::FormatCount => "FormatCount",
            Self::PickCount => "PickCount",
            Self::ConcatCount => "ConcatCount",
        }
    }
    /// Whether an operand of this kind counts values popped off the stack.
    pub fn is_count(self) -> bool {
        matches!(self, Self::StackDelta | Self::ListSize | Self::FormatCount | Self::PickCount | Self::ConcatCount)
    }
}

use ArgKind as A;

/// Static information about one opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpcodeMetadata {
    /// Net change in stack height. For variadic opcodes and opcodes with a count operand this is the base amount,
    /// see [`OpcodeMetadata::item_delta`] and [`OpcodeMetadata::pops_per_count`].
    pub stack_delta: i32,
    /// The opcode has no side effects and cannot raise an error.
    pub pure: bool,
    /// A basic block must end directly after this opcode.
    pub splits_basic_block: bool,
    /// The operand list is an [`ArgKind::Int`] count followed by that many repetitions of [`OpcodeMetadata::args`].
    pub variable_args: bool,
    /// Stack delta contributed by each repetition of a variadic opcode's item grammar.
    pub item_delta: i32,
    /// Stack slots popped for each unit of a count operand (`StackDelta`, `ListSize`, `FormatCount`, `PickCount`
    /// or `ConcatCount`).
    pub pops_per_count: i32,
    /// Operand grammar, or the item grammar for variadic opcodes.
    pub args: &'static [ArgKind],
}
impl OpcodeMetadata {
    /// Metadata used for opcodes that do not override anything.
    pub const DEFAULT: OpcodeMetadata = OpcodeMetadata {
        stack_delta: 0,
        pure: false,
        splits_basic_block: false,
        variable_args: false,
        item_delta: 0,
        pops_per_count: 1,
        args: &[],
    };

    /// Index of the label operand, if this opcode carries one.
    pub fn label_position(&self) -> Option<usize> {
        if self.variable_args { return None }
        self.args.iter().position(|x| *x == ArgKind::Label)
    }
}
impl Default for OpcodeMetadata {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One row of [`OPCODE_TABLE`].
#[derive(Clone, Copy, Debug)]
pub struct OpcodeEntry {
    pub name: &'static str,
    pub value: u8,
    pub opcode: Opcode,
    pub metadata: OpcodeMetadata,
}

macro_rules! opcodes {
    ($($(#[doc = $doc:literal])* $name:ident = $value:literal $({ $($key:ident : $val:expr),* $(,)? })?,)*) => {
        /// A single DM bytecode opcode. The discriminant is the byte written to the instruction stream.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[doc = $doc])* $name = $value,)*
        }

        /// Every opcode with its name, byte value, and metadata, in declaration order.
        pub const OPCODE_TABLE: &[OpcodeEntry] = &[
            $(OpcodeEntry {
                name: stringify!($name),
                value: $value,
                opcode: Opcode::$name,
                metadata: OpcodeMetadata { $($($key: $val,)*)? ..OpcodeMetadata::DEFAULT },
            },)*
        ];
    };
}

opcodes! {
    BitShiftLeft = 0x01 { stack_delta: -1, pure: true },
    PushType = 0x02 { stack_delta: 1, pure: true, args: &[A::TypeId] },
    PushString = 0x03 { stack_delta: 1, pure: true, args: &[A::String] },
    /// Pops `FormatCount` values and pushes the formatted string.
    FormatString = 0x04 { stack_delta: 1, args: &[A::String, A::FormatCount] },
    SwitchCaseRange = 0x05 { stack_delta: -2, splits_basic_block: true, args: &[A::Label] },
    PushReferenceValue = 0x06 { stack_delta: 1, args: &[A::Reference] },
    Rgb = 0x07 { stack_delta: 1, args: &[A::ArgType, A::StackDelta] },
    Add = 0x08 { stack_delta: -1, pure: true },
    Assign = 0x09 { args: &[A::Reference] },
    Call = 0x0A { stack_delta: 1, args: &[A::Reference, A::ArgType, A::StackDelta] },
    MultiplyReference = 0x0B { args: &[A::Reference] },
    /// Pops the condition and jumps if it is false.
    JumpIfFalse = 0x0C { stack_delta: -1, splits_basic_block: true, args: &[A::Label] },
    CreateStrictAssociativeList = 0x0D { stack_delta: 1, pops_per_count: 2, args: &[A::ListSize] },
    /// Unconditional jump.
    Jump = 0x0E { splits_basic_block: true, args: &[A::Label] },
    CompareEquals = 0x0F { stack_delta: -1, pure: true },
    /// Pops the return value and leaves the procedure.
    Return = 0x10 { stack_delta: -1, splits_basic_block: true },
    PushNull = 0x11 { stack_delta: 1, pure: true },
    Subtract = 0x12 { stack_delta: -1, pure: true },
    CompareLessThan = 0x13 { stack_delta: -1, pure: true },
    CompareGreaterThan = 0x14 { stack_delta: -1, pure: true },
    /// Jumps keeping the value if it is false, otherwise pops it and falls through.
    BooleanAnd = 0x15 { stack_delta: -1, splits_basic_block: true, args: &[A::Label] },
    BooleanNot = 0x16 { pure: true },
    DivideReference = 0x17 { args: &[A::Reference] },
    Negate = 0x18 { pure: true },
    Modulus = 0x19 { stack_delta: -1 },
    Append = 0x1A { args: &[A::Reference] },
    CreateRangeEnumerator = 0x1B { stack_delta: -3, args: &[A::EnumeratorId] },
    Input = 0x1C { args: &[A::Reference, A::Reference] },
    CompareLessThanOrEqual = 0x1D { stack_delta: -1, pure: true },
    CreateAssociativeList = 0x1E { stack_delta: 1, pops_per_count: 2, args: &[A::ListSize] },
    Remove = 0x1F { args: &[A::Reference] },
    DeleteObject = 0x20 { stack_delta: -1 },
    PushResource = 0x21 { stack_delta: 1, pure: true, args: &[A::Resource] },
    CreateList = 0x22 { stack_delta: 1, args: &[A::ListSize] },
    CallStatement = 0x23 { args: &[A::ArgType, A::StackDelta] },
    BitAnd = 0x24 { stack_delta: -1, pure: true },
    CompareNotEquals = 0x25 { stack_delta: -1, pure: true },
    PushProc = 0x26 { stack_delta: 1, pure: true, args: &[A::ProcId] },
    Divide = 0x27 { stack_delta: -1 },
    Multiply = 0x28 { stack_delta: -1, pure: true },
    BitXorReference = 0x29 { args: &[A::Reference] },
    BitXor = 0x2A { stack_delta: -1, pure: true },
    BitOr = 0x2B { stack_delta: -1, pure: true },
    BitNot = 0x2C { pure: true },
    Combine = 0x2D { args: &[A::Reference] },
    CreateObject = 0x2E { args: &[A::ArgType, A::StackDelta] },
    /// Jumps keeping the value if it is true, otherwise pops it and falls through.
    BooleanOr = 0x2F { stack_delta: -1, splits_basic_block: true, args: &[A::Label] },
    CreateMultidimensionalList = 0x30 { stack_delta: 1, args: &[A::ListSize] },
    CompareGreaterThanOrEqual = 0x31 { stack_delta: -1, pure: true },
    SwitchCase = 0x32 { stack_delta: -1, splits_basic_block: true, args: &[A::Label] },
    Mask = 0x33 { args: &[A::Reference] },
    /// Pops the condition and jumps if it is true.
    JumpIfTrue = 0x34 { stack_delta: -1, splits_basic_block: true, args: &[A::Label] },
    Error = 0x35,
    IsInList = 0x36 { stack_delta: -1 },
    PushFloat = 0x38 { stack_delta: 1, pure: true, args: &[A::Float] },
    ModulusReference = 0x39 { args: &[A::Reference] },
    CreateListEnumerator = 0x3A { stack_delta: -1, args: &[A::EnumeratorId] },
    /// Advances an enumerator into a reference, jumping to the label once it is exhausted.
    Enumerate = 0x3B { splits_basic_block: true, args: &[A::EnumeratorId, A::Reference, A::Label] },
    DestroyEnumerator = 0x3C { args: &[A::EnumeratorId] },
    Browse = 0x3D { stack_delta: -3 },
    BrowseResource = 0x3E { stack_delta: -3 },
    OutputControl = 0x3F { stack_delta: -3 },
    BitShiftRight = 0x40 { stack_delta: -1, pure: true },
    CreateFilteredListEnumerator = 0x41 { stack_delta: -1, args: &[A::EnumeratorId, A::FilterId] },
    Power = 0x42 { stack_delta: -1, pure: true },
    EnumerateAssoc = 0x43 { splits_basic_block: true, args: &[A::EnumeratorId, A::Reference, A::Reference, A::Label] },
    Link = 0x44 { stack_delta: -2 },
    Prompt = 0x45 { stack_delta: -3, args: &[A::TypeId] },
    Ftp = 0x46 { stack_delta: -3 },
    Initial = 0x47 { stack_delta: -1 },
    AsType = 0x48 { stack_delta: -1 },
    IsType = 0x49 { stack_delta: -1 },
    LocateCoord = 0x4A { stack_delta: -2 },
    Locate = 0x4B { stack_delta: -1 },
    IsNull = 0x4C { pure: true },
    /// Runs the following code in a new thread while this one continues at the label.
    Spawn = 0x4D { stack_delta: -1, splits_basic_block: true, args: &[A::Label] },
    OutputReference = 0x4E { stack_delta: -1, args: &[A::Reference] },
    Output = 0x4F { stack_delta: -2 },
    Pop = 0x51 { stack_delta: -1, pure: true },
    Prob = 0x52,
    IsSaved = 0x53 { stack_delta: -1 },
    PickUnweighted = 0x54 { stack_delta: 1, args: &[A::PickCount] },
    PickWeighted = 0x55 { stack_delta: 1, args: &[A::PickCount] },
    Increment = 0x56 { stack_delta: 1, args: &[A::Reference] },
    Decrement = 0x57 { stack_delta: 1, args: &[A::Reference] },
    CompareEquivalent = 0x58 { stack_delta: -1 },
    CompareNotEquivalent = 0x59 { stack_delta: -1 },
    /// Raises the popped value as an exception.
    Throw = 0x5A { splits_basic_block: true },
    IsInRange = 0x5B { stack_delta: -2, pure: true },
    MassConcatenation = 0x5C { stack_delta: 1, args: &[A::ConcatCount] },
    CreateTypeEnumerator = 0x5D { stack_delta: -1, args: &[A::EnumeratorId] },
    PushGlobalVars = 0x5F { stack_delta: 1 },
    ModulusModulus = 0x60 { stack_delta: -1 },
    ModulusModulusReference = 0x61 { args: &[A::Reference] },
    JumpIfNull = 0x64 { splits_basic_block: true, args: &[A::Label] },
    JumpIfNullNoPop = 0x65 { splits_basic_block: true, args: &[A::Label] },
    JumpIfTrueReference = 0x66 { splits_basic_block: true, args: &[A::Reference, A::Label] },
    JumpIfFalseReference = 0x67 { splits_basic_block: true, args: &[A::Reference, A::Label] },
    DereferenceField = 0x68 { args: &[A::String] },
    DereferenceIndex = 0x69 { stack_delta: -1 },
    DereferenceCall = 0x6A { args: &[A::String, A::ArgType, A::StackDelta] },
    PopReference = 0x6B { args: &[A::Reference] },
    BitShiftLeftReference = 0x6D { args: &[A::Reference] },
    BitShiftRightReference = 0x6E { args: &[A::Reference] },
    /// Opens a try region whose catch block stores the exception into the reference.
    Try = 0x6F { args: &[A::Label, A::Reference] },
    TryNoValue = 0x70 { args: &[A::Label] },
    EndTry = 0x71,
    EnumerateNoAssign = 0x72 { splits_basic_block: true, args: &[A::EnumeratorId, A::Label] },
    Gradient = 0x73 { stack_delta: 1, args: &[A::ArgType, A::StackDelta] },
    AssignInto = 0x74 { args: &[A::Reference] },
    GetStep = 0x75 { stack_delta: -1 },
    Length = 0x76,
    GetDir = 0x77 { stack_delta: -1 },
    DebuggerBreakpoint = 0x78,
    Sin = 0x79 { pure: true },
    Cos = 0x7A { pure: true },
    Tan = 0x7B { pure: true },
    ArcSin = 0x7C { pure: true },
    ArcCos = 0x7D { pure: true },
    ArcTan = 0x7E { pure: true },
    ArcTan2 = 0x7F { stack_delta: -1, pure: true },
    Sqrt = 0x80 { pure: true },
    Log = 0x81 { stack_delta: -1 },
    LogE = 0x82,
    Abs = 0x83 { pure: true },

    AppendNoPush = 0x84 { stack_delta: -1, args: &[A::Reference] },
    AssignNoPush = 0x85 { stack_delta: -1, args: &[A::Reference] },
    PushRefAndDereferenceField = 0x86 { stack_delta: 1, args: &[A::Reference, A::String] },
    PushNRefs = 0x87 { variable_args: true, item_delta: 1, args: &[A::Reference] },
    PushNFloats = 0x88 { variable_args: true, item_delta: 1, pure: true, args: &[A::Float] },
    PushNResources = 0x89 { variable_args: true, item_delta: 1, pure: true, args: &[A::Resource] },
    PushStringFloat = 0x8A { stack_delta: 2, pure: true, args: &[A::String, A::Float] },
    JumpIfReferenceFalse = 0x8B { splits_basic_block: true, args: &[A::Reference, A::Label] },
    PushNStrings = 0x8C { variable_args: true, item_delta: 1, pure: true, args: &[A::String] },
    SwitchOnFloat = 0x8D { splits_basic_block: true, args: &[A::Float, A::Label] },
    PushNOfStringFloats = 0x8E { variable_args: true, item_delta: 2, pure: true, args: &[A::String, A::Float] },
    CreateListNFloats = 0x8F { stack_delta: 1, variable_args: true, args: &[A::Float] },
    CreateListNStrings = 0x90 { stack_delta: 1, variable_args: true, args: &[A::String] },
    CreateListNRefs = 0x91 { stack_delta: 1, variable_args: true, args: &[A::Reference] },
    CreateListNResources = 0x92 { stack_delta: 1, variable_args: true, args: &[A::Resource] },
    SwitchOnString = 0x93 { splits_basic_block: true, args: &[A::String, A::Label] },
    IsTypeDirect = 0x95 { args: &[A::TypeId] },
    NullRef = 0x96 { args: &[A::Reference] },
    ReturnReferenceValue = 0x97 { splits_basic_block: true, args: &[A::Reference] },
    ReturnFloat = 0x98 { splits_basic_block: true, args: &[A::Float] },
    IndexRefWithString = 0x99 { stack_delta: 1, args: &[A::Reference, A::String] },
    PushFloatAssign = 0x9A { args: &[A::Float, A::Reference] },
    NPushFloatAssign = 0x9B { variable_args: true, args: &[A::Float, A::Reference] },
    Animate = 0x9C { args: &[A::ArgType, A::StackDelta] },
}

fn metadata_table() -> &'static [OpcodeMetadata; 256] {
    static TABLE: OnceLock<[OpcodeMetadata; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [OpcodeMetadata::DEFAULT; 256];
        for entry in OPCODE_TABLE {
            table[entry.value as usize] = entry.metadata;
        }
        table
    })
}

impl Opcode {
    /// Decodes an opcode byte, returning `None` for unassigned values.
    pub fn from_byte(value: u8) -> Option<Self> {
        Self::from_u8(value)
    }
    /// Looks up the opcode by its symbolic name.
    pub fn from_name(name: &str) -> Option<Self> {
        OPCODE_TABLE.iter().find(|x| x.name == name).map(|x| x.opcode)
    }
    pub fn name(self) -> &'static str {
        OPCODE_TABLE.iter().find(|x| x.opcode == self).map(|x| x.name).unwrap_or("<unknown>")
    }
    pub fn metadata(self) -> &'static OpcodeMetadata {
        &metadata_table()[self as usize]
    }
    /// Iterates over every assigned opcode.
    pub fn all() -> impl Iterator<Item = Opcode> {
        OPCODE_TABLE.iter().map(|x| x.opcode)
    }
}
impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a block-splitting opcode affects control flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlFlow {
    /// Always transfers to its label.
    Jump,
    /// Transfers to its label or falls through.
    ConditionalJump,
    /// Leaves the procedure.
    Return,
    /// Transfers to the innermost catch block, or leaves the procedure if there is none.
    Throw,
}
impl ControlFlow {
    /// Classifies `opcode`. Returns `Ok(None)` for opcodes that do not split blocks,
    /// and an error for splitting opcodes that have no classification.
    pub fn of(opcode: Opcode) -> Result<Option<Self>, InternalError> {
        Self::classify(opcode, opcode.metadata().splits_basic_block)
    }
    fn classify(opcode: Opcode, splits_basic_block: bool) -> Result<Option<Self>, InternalError> {
        Ok(Some(match opcode {
            Opcode::Jump => ControlFlow::Jump,

            Opcode::JumpIfFalse | Opcode::JumpIfTrue | Opcode::BooleanAnd | Opcode::BooleanOr
            | Opcode::SwitchCase | Opcode::SwitchCaseRange | Opcode::SwitchOnFloat | Opcode::SwitchOnString
            | Opcode::JumpIfNull | Opcode::JumpIfNullNoPop
            | Opcode::JumpIfTrueReference | Opcode::JumpIfFalseReference | Opcode::JumpIfReferenceFalse
            | Opcode::Enumerate | Opcode::EnumerateAssoc | Opcode::EnumerateNoAssign
            | Opcode::Spawn => ControlFlow::ConditionalJump,

            Opcode::Return | Opcode::ReturnReferenceValue | Opcode::ReturnFloat => ControlFlow::Return,
            Opcode::Throw => ControlFlow::Throw,

            _ if splits_basic_block => return Err(InternalError::UnhandledControlFlowOpcode { opcode: opcode.name() }),
            _ => return Ok(None),
        }))
    }
}

/// Checks a table of opcode entries for internal consistency.
///
/// Fails if two entries share a byte value or a name, if an entry's byte value disagrees with its
/// discriminant, if a variadic opcode has no item grammar, or if a block-splitting opcode has no
/// [`ControlFlow`] classification.
pub fn check_table(entries: &[OpcodeEntry]) -> Result<(), InternalError> {
    let mut by_value: BTreeMap<u8, &'static str> = BTreeMap::new();
    let mut by_name: BTreeMap<&'static str, u8> = BTreeMap::new();
    for entry in entries {
        if let Some(first) = by_value.insert(entry.value, entry.name) {
            return Err(InternalError::OpcodeCollision { first, second: entry.name, value: entry.value });
        }
        if by_name.insert(entry.name, entry.value).is_some() {
            return Err(InternalError::DuplicateOpcodeName { name: entry.name });
        }
        if entry.opcode as u8 != entry.value {
            return Err(InternalError::OpcodeCollision { first: entry.opcode.name(), second: entry.name, value: entry.value });
        }
        if entry.metadata.variable_args && entry.metadata.args.is_empty() {
            return Err(InternalError::MalformedVariadicOpcode { opcode: entry.name });
        }
        if entry.metadata.splits_basic_block {
            ControlFlow::classify(entry.opcode, true)?;
        }
    }
    Ok(())
}

/// Runs [`check_table`] over the real opcode table. Must succeed before any compilation begins.
pub fn verify_isa() -> Result<(), InternalError> {
    check_table(OPCODE_TABLE)
}

/// Computes a content hash over `(name, value)` pairs.
/// The result does not depend on the order the pairs are given in.
pub fn fingerprint_of<'a, I: IntoIterator<Item = (&'a str, u8)>>(entries: I) -> String {
    let mut sorted: Vec<(u8, &str)> = entries.into_iter().map(|(name, value)| (value, name)).collect();
    sorted.sort_unstable();

    let mut context = md5::Context::new();
    for (value, name) in sorted {
        context.consume(name.as_bytes());
        context.consume([b'=', value, b';']);
    }
    format!("{:x}", context.compute())
}

/// Content hash of the whole opcode table, used to detect compiler/runtime version skew.
pub fn compute_isa_fingerprint() -> String {
    fingerprint_of(OPCODE_TABLE.iter().map(|x| (x.name, x.value)))
}

#[test]
fn test_opcode_table_consistent() {
    verify_isa().unwrap();
    for entry in OPCODE_TABLE {
        assert_eq!(Opcode::from_byte(entry.value), Some(entry.opcode));
        assert_eq!(Opcode::from_name(entry.name), Some(entry.opcode));
        assert_eq!(entry.opcode.to_string(), entry.name);
        assert_eq!(*entry.opcode.metadata(), entry.metadata);
    }
    assert_eq!(Opcode::from_byte(0x00), None);
    assert_eq!(Opcode::from_byte(0x37), None);
    assert_eq!(Opcode::from_byte(0xff), None);
}

#[test]
fn test_opcode_collision_detected() {
    let mut entries = OPCODE_TABLE[..4].to_vec();
    entries.push(OpcodeEntry { name: "Impostor", value: OPCODE_TABLE[2].value, opcode: OPCODE_TABLE[2].opcode, metadata: OpcodeMetadata::DEFAULT });
    match check_table(&entries) {
        Err(InternalError::OpcodeCollision { first, second, value }) => {
            assert_eq!(first, OPCODE_TABLE[2].name);
            assert_eq!(second, "Impostor");
            assert_eq!(value, OPCODE_TABLE[2].value);
        }
        x => panic!("{x:?}"),
    }

    let mut entries = OPCODE_TABLE[..4].to_vec();
    entries.push(OpcodeEntry { name: OPCODE_TABLE[1].name, value: 0xfe, opcode: OPCODE_TABLE[1].opcode, metadata: OpcodeMetadata::DEFAULT });
    assert!(matches!(check_table(&entries), Err(InternalError::DuplicateOpcodeName { .. })));
}

#[test]
fn test_unclassified_splitter_detected() {
    let entries = [OpcodeEntry {
        name: "Locate",
        value: Opcode::Locate as u8,
        opcode: Opcode::Locate,
        metadata: OpcodeMetadata { splits_basic_block: true, ..OpcodeMetadata::DEFAULT },
    }];
    match check_table(&entries) {
        Err(InternalError::UnhandledControlFlowOpcode { opcode }) => assert_eq!(opcode, "Locate"),
        x => panic!("{x:?}"),
    }

    for opcode in Opcode::all() {
        let class = ControlFlow::of(opcode).unwrap();
        assert_eq!(class.is_some(), opcode.metadata().splits_basic_block, "{opcode}");
    }
}

#[test]
fn test_fingerprint() {
    let a = compute_isa_fingerprint();
    assert_eq!(a, compute_isa_fingerprint());
    assert_eq!(a.len(), 32);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

    let base: Vec<(&str, u8)> = OPCODE_TABLE.iter().map(|x| (x.name, x.value)).collect();
    assert_eq!(fingerprint_of(base.iter().rev().copied()), a);

    let mut renamed = base.clone();
    renamed[5].0 = "Renamed";
    assert_ne!(fingerprint_of(renamed), a);

    let mut renumbered = base.clone();
    renumbered[5].1 = 0xfe;
    assert_ne!(fingerprint_of(renumbered), a);
}

#[test]
fn test_label_positions() {
    assert_eq!(Opcode::Jump.metadata().label_position(), Some(0));
    assert_eq!(Opcode::JumpIfFalseReference.metadata().label_position(), Some(1));
    assert_eq!(Opcode::Enumerate.metadata().label_position(), Some(2));
    assert_eq!(Opcode::EnumerateAssoc.metadata().label_position(), Some(3));
    assert_eq!(Opcode::Try.metadata().label_position(), Some(0));
    assert_eq!(Opcode::Add.metadata().label_position(), None);
    assert_eq!(Opcode::PushNFloats.metadata().label_position(), None);
}
