//! The annotated bytecode model: instructions with typed operand lists, labels, and local-variable markers.
//!
//! This is the representation the CFG builder and optimizer work on. Operands still carry symbolic labels and
//! plain strings; the encoder in [`crate::bytecode`] resolves them into offsets and string ids.

use std::collections::HashMap;
use std::fmt;

use compact_str::CompactString;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use crate::error::OperandError;
use crate::opcode::{ArgKind, Opcode};
use crate::reference::Reference;

/// How the arguments of a call are laid out on the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum CallArgumentsType {
    None,
    FromStack,
    FromStackKeyed,
    FromArgumentList,
    FromProcArguments,
}
impl CallArgumentsType {
    pub fn from_byte(value: u8) -> Option<Self> {
        Self::from_u8(value)
    }
}

/// A single operand of an [`Instruction`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(tag = "kind", content = "value"))]
pub enum Operand {
    ArgType(CallArgumentsType),
    StackDelta(i32),
    /// A resource path. Stored in the string table like [`Operand::String`].
    Resource(CompactString),
    TypeId(i32),
    ProcId(i32),
    FilterId(i32),
    EnumeratorId(i32),
    ListSize(i32),
    Int(i32),
    /// A symbolic jump target.
    Label(CompactString),
    /// A resolved jump target, as produced by the decoder. Treated as a label by everything else.
    JumpTarget(u32),
    Float(f32),
    String(CompactString),
    Reference(Reference),
    FormatCount(i32),
    PickCount(i32),
    ConcatCount(i32),
}
impl Operand {
    pub fn label(name: impl Into<CompactString>) -> Self {
        Self::Label(name.into())
    }
    pub fn string(value: impl Into<CompactString>) -> Self {
        Self::String(value.into())
    }

    pub fn kind(&self) -> ArgKind {
        match self {
            Self::ArgType(_) => ArgKind::ArgType,
            Self::StackDelta(_) => ArgKind::StackDelta,
            Self::Resource(_) => ArgKind::Resource,
            Self::TypeId(_) => ArgKind::TypeId,
            Self::ProcId(_) => ArgKind::ProcId,
            Self::FilterId(_) => ArgKind::FilterId,
            Self::EnumeratorId(_) => ArgKind::EnumeratorId,
            Self::ListSize(_) => ArgKind::ListSize,
            Self::Int(_) => ArgKind::Int,
            Self::Label(_) | Self::JumpTarget(_) => ArgKind::Label,
            Self::Float(_) => ArgKind::Float,
            Self::String(_) => ArgKind::String,
            Self::Reference(_) => ArgKind::Reference,
            Self::FormatCount(_) => ArgKind::FormatCount,
            Self::PickCount(_) => ArgKind::PickCount,
            Self::ConcatCount(_) => ArgKind::ConcatCount,
        }
    }

    /// The value of an integer-like operand.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::StackDelta(x) | Self::TypeId(x) | Self::ProcId(x) | Self::FilterId(x)
            | Self::EnumeratorId(x) | Self::ListSize(x) | Self::Int(x) | Self::FormatCount(x) | Self::PickCount(x)
            | Self::ConcatCount(x) => Some(*x),
            _ => None,
        }
    }

    /// Compares two operands, treating floats as equal only if their bits are.
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }
}
impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArgType(x) => write!(f, "{x:?}"),
            Self::Label(x) => f.write_str(x),
            Self::JumpTarget(x) => write!(f, "{x}"),
            Self::Float(x) => f.write_str(ryu::Buffer::new().format(*x)),
            Self::String(x) => write!(f, "{x:?}"),
            Self::Resource(x) => write!(f, "'{x}'"),
            Self::Reference(x) => write!(f, "{x}"),
            x => match x.as_int() {
                Some(v) => write!(f, "{v}"),
                None => Ok(()),
            },
        }
    }
}

/// Where an instruction came from.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceLoc {
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub file: Option<CompactString>,
    pub line: u32,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub location: Option<SourceLoc>,
}
impl Instruction {
    /// Creates an instruction, checking the operands against the opcode's grammar.
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Result<Self, OperandError> {
        let res = Self { opcode, operands, location: None };
        res.validate()?;
        Ok(res)
    }
    /// Shorthand for an instruction without operands.
    pub fn simple(opcode: Opcode) -> Result<Self, OperandError> {
        Self::new(opcode, vec![])
    }
    pub fn at_line(mut self, line: u32) -> Self {
        self.location = Some(SourceLoc { file: None, line });
        self
    }
    pub fn at(mut self, file: impl Into<CompactString>, line: u32) -> Self {
        self.location = Some(SourceLoc { file: Some(file.into()), line });
        self
    }
    pub fn line(&self) -> Option<u32> {
        self.location.as_ref().map(|x| x.line)
    }

    /// Checks the operands against the opcode's grammar.
    ///
    /// Variadic opcodes take an `Int` item count followed by that many repetitions of the item grammar.
    pub fn validate(&self) -> Result<(), OperandError> {
        let meta = self.opcode.metadata();
        let opcode = self.opcode.name();

        let items = if meta.variable_args {
            let count = match self.operands.first() {
                Some(Operand::Int(x)) => *x,
                Some(x) => return Err(OperandError::Kind { opcode, index: 0, expected: ArgKind::Int.name(), given: x.kind().name() }),
                None => return Err(OperandError::Arity { opcode, expected: 1, given: 0 }),
            };
            let count = usize::try_from(count).map_err(|_| OperandError::NegativeCount { opcode, count })?;
            let expected = 1 + count * meta.args.len();
            if self.operands.len() != expected {
                return Err(OperandError::Arity { opcode, expected, given: self.operands.len() });
            }
            &self.operands[1..]
        } else {
            if self.operands.len() != meta.args.len() {
                return Err(OperandError::Arity { opcode, expected: meta.args.len(), given: self.operands.len() });
            }
            &self.operands[..]
        };

        let skip = if meta.variable_args { 1 } else { 0 };
        for (i, (operand, expected)) in items.iter().zip(meta.args.iter().cycle()).enumerate() {
            if operand.kind() != *expected {
                return Err(OperandError::Kind { opcode, index: i + skip, expected: expected.name(), given: operand.kind().name() });
            }
        }
        Ok(())
    }

    /// The net change in stack height caused by executing this instruction.
    ///
    /// Computed in 64 bits so that no count an operand can hold overflows it.
    pub fn stack_delta(&self) -> i64 {
        let meta = self.opcode.metadata();
        if meta.variable_args {
            let count = self.operands.first().and_then(Operand::as_int).unwrap_or(0) as i64;
            return (meta.stack_delta as i64).saturating_add((meta.item_delta as i64).saturating_mul(count));
        }
        let popped = self.operands.iter()
            .filter(|x| x.kind().is_count())
            .filter_map(Operand::as_int)
            .fold(0i64, |acc, x| acc.saturating_add((x as i64).saturating_mul(meta.pops_per_count as i64)));
        (meta.stack_delta as i64).saturating_sub(popped)
    }

    /// The jump target of this instruction, if it has one.
    pub fn label_operand(&self) -> Option<&Operand> {
        self.opcode.metadata().label_position().and_then(|i| self.operands.get(i))
    }
    /// The symbolic jump target of this instruction, if it has one.
    pub fn label_target(&self) -> Option<&str> {
        match self.label_operand() {
            Some(Operand::Label(x)) => Some(x),
            _ => None,
        }
    }
    /// Replaces the jump target. Returns `false` if this instruction has no label operand.
    pub fn set_label_target(&mut self, label: &str) -> bool {
        let pos = self.opcode.metadata().label_position();
        match pos.and_then(|i| self.operands.get_mut(i)) {
            Some(x) => {
                *x = Operand::label(label);
                true
            }
            None => false,
        }
    }
}
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for operand in self.operands.iter() {
            write!(f, " {operand}")?;
        }
        Ok(())
    }
}

/// A jump target in the instruction stream.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Label {
    pub name: CompactString,
}
impl Label {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self { name: name.into() }
    }
}

/// Marks the start or end of a local variable's scope.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LocalVariable {
    Declare { name: CompactString },
    /// Ends the scope of the `pop_count` most recently declared locals.
    Exit { pop_count: u32 },
}

/// One element of an annotated instruction stream.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(tag = "type", rename_all = "snake_case"))]
pub enum AnnotatedItem {
    Instruction(Instruction),
    Label(Label),
    LocalVariable(LocalVariable),
}
impl AnnotatedItem {
    pub fn label(name: impl Into<CompactString>) -> Self {
        Self::Label(Label::new(name))
    }
    pub fn as_instruction(&self) -> Option<&Instruction> {
        match self {
            Self::Instruction(x) => Some(x),
            _ => None,
        }
    }
    pub fn as_label(&self) -> Option<&str> {
        match self {
            Self::Label(x) => Some(&x.name),
            _ => None,
        }
    }
}
impl From<Instruction> for AnnotatedItem {
    fn from(value: Instruction) -> Self {
        Self::Instruction(value)
    }
}
impl fmt::Display for AnnotatedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instruction(x) => write!(f, "{x}"),
            Self::Label(x) => write!(f, "{}:", x.name),
            Self::LocalVariable(LocalVariable::Declare { name }) => write!(f, "local {name}"),
            Self::LocalVariable(LocalVariable::Exit { pop_count }) => write!(f, "end scope ({pop_count})"),
        }
    }
}

/// Interned strings shared by every procedure in an artifact. Ids are assigned in insertion order.
#[derive(Clone, Debug, Default)]
pub struct StringTable {
    strings: Vec<CompactString>,
    ids: HashMap<CompactString, i32>,
}
impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }
    /// Returns the id of `value`, adding it if it is not present yet.
    pub fn intern(&mut self, value: &str) -> i32 {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }
        let id = self.strings.len() as i32;
        self.strings.push(value.into());
        self.ids.insert(value.into(), id);
        id
    }
    pub fn get(&self, id: i32) -> Option<&str> {
        usize::try_from(id).ok().and_then(|i| self.strings.get(i)).map(CompactString::as_str)
    }
    pub fn len(&self) -> usize {
        self.strings.len()
    }
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(CompactString::as_str)
    }
}
impl<S: AsRef<str>> FromIterator<S> for StringTable {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut res = Self::new();
        for value in iter {
            let value = value.as_ref();
            // duplicates keep their own id so that existing ids stay valid
            let id = res.strings.len() as i32;
            res.strings.push(value.into());
            res.ids.entry(value.into()).or_insert(id);
        }
        res
    }
}

#[test]
fn test_validate_fixed() {
    assert!(Instruction::new(Opcode::PushFloat, vec![Operand::Float(1.0)]).is_ok());
    assert_eq!(Instruction::new(Opcode::PushFloat, vec![]), Err(OperandError::Arity { opcode: "PushFloat", expected: 1, given: 0 }));
    assert_eq!(Instruction::new(Opcode::PushFloat, vec![Operand::Int(1)]), Err(OperandError::Kind { opcode: "PushFloat", index: 0, expected: "Float", given: "Int" }));

    let jump = Instruction::new(Opcode::JumpIfFalseReference, vec![Operand::Reference(Reference::Local(0)), Operand::label("end")]).unwrap();
    assert_eq!(jump.label_target(), Some("end"));
    let decoded = Instruction::new(Opcode::Jump, vec![Operand::JumpTarget(12)]).unwrap();
    assert_eq!(decoded.label_target(), None);
    assert_eq!(decoded.label_operand(), Some(&Operand::JumpTarget(12)));
}

#[test]
fn test_validate_variadic() {
    let ok = Instruction::new(Opcode::PushNOfStringFloats, vec![Operand::Int(2), Operand::string("a"), Operand::Float(1.0), Operand::string("b"), Operand::Float(2.0)]).unwrap();
    assert_eq!(ok.stack_delta(), 4);
    assert_eq!(Instruction::new(Opcode::PushNFloats, vec![Operand::Int(2), Operand::Float(1.0)]), Err(OperandError::Arity { opcode: "PushNFloats", expected: 3, given: 2 }));
    assert_eq!(Instruction::new(Opcode::PushNFloats, vec![Operand::Int(-1)]), Err(OperandError::NegativeCount { opcode: "PushNFloats", count: -1 }));
    assert_eq!(Instruction::new(Opcode::PushNRefs, vec![Operand::Float(1.0)]), Err(OperandError::Kind { opcode: "PushNRefs", index: 0, expected: "Int", given: "Float" }));
    assert_eq!(Instruction::new(Opcode::PushNStrings, vec![Operand::Int(1), Operand::Int(5)]), Err(OperandError::Kind { opcode: "PushNStrings", index: 1, expected: "String", given: "Int" }));

    let list = Instruction::new(Opcode::CreateListNFloats, vec![Operand::Int(3), Operand::Float(1.0), Operand::Float(2.0), Operand::Float(3.0)]).unwrap();
    assert_eq!(list.stack_delta(), 1);
}

#[test]
fn test_stack_delta() {
    assert_eq!(Instruction::new(Opcode::PushFloat, vec![Operand::Float(1.0)]).unwrap().stack_delta(), 1);
    assert_eq!(Instruction::simple(Opcode::Add).unwrap().stack_delta(), -1);
    let call = Instruction::new(Opcode::Call, vec![Operand::Reference(Reference::SrcProc("f".into())), Operand::ArgType(CallArgumentsType::FromStack), Operand::StackDelta(3)]).unwrap();
    assert_eq!(call.stack_delta(), -2);
    let statement = Instruction::new(Opcode::CallStatement, vec![Operand::ArgType(CallArgumentsType::FromStack), Operand::StackDelta(3)]).unwrap();
    assert_eq!(statement.stack_delta(), -3);
    assert_eq!(Instruction::new(Opcode::CreateList, vec![Operand::ListSize(4)]).unwrap().stack_delta(), -3);
    assert_eq!(Instruction::new(Opcode::CreateAssociativeList, vec![Operand::ListSize(2)]).unwrap().stack_delta(), -3);

    let huge = Instruction::new(Opcode::CreateAssociativeList, vec![Operand::ListSize(i32::MAX)]).unwrap();
    assert_eq!(huge.stack_delta(), 1 - 2 * i32::MAX as i64);
    let huge = Instruction::new(Opcode::PushNOfStringFloats, vec![Operand::Int(i32::MAX)]);
    assert!(huge.is_err());
}

#[test]
fn test_string_table() {
    let mut table = StringTable::new();
    assert_eq!(table.intern("a"), 0);
    assert_eq!(table.intern("b"), 1);
    assert_eq!(table.intern("a"), 0);
    assert_eq!(table.get(1), Some("b"));
    assert_eq!(table.get(2), None);
    assert_eq!(table.get(-1), None);

    let mut loaded: StringTable = ["x", "y", "x"].into_iter().collect();
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.get(2), Some("x"));
    assert_eq!(loaded.intern("x"), 0);
    assert_eq!(loaded.intern("z"), 3);
}

#[test]
fn test_display() {
    let ins = Instruction::new(Opcode::PushStringFloat, vec![Operand::string("hi"), Operand::Float(2.0)]).unwrap();
    assert_eq!(ins.to_string(), "PushStringFloat \"hi\" 2.0");
    assert_eq!(AnnotatedItem::label("L1").to_string(), "L1:");
}
