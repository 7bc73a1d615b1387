//! Packing annotated bytecode into bytes, and reading it back.
//!
//! To encode a procedure, use [`encode`]. To inspect encoded bytes, use [`decode`] for the instructions,
//! [`disassemble`] for a listing with jump targets marked, or [`dump_code`] for a hex dump.
//!
//! Every integer is little-endian. Strings, resources and field names are written as `i32` ids into a
//! [`StringTable`] shared by the whole artifact. Jump targets are absolute `i32` byte offsets; the encoder writes a
//! placeholder and patches it once every label has been placed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};

use compact_str::CompactString;
use tracing::{instrument, warn};

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use crate::annotated::*;
use crate::error::{DecodeError, EncodeError};
use crate::opcode::{ArgKind, Opcode};
use crate::reference::{Reference, ReferenceType};

/// Number of bytes to display on each line of a hex dump
const BYTES_PER_LINE: usize = 10;

pub(crate) enum RelocateInfo {
    Label { code_addr: usize, label: CompactString },
}

pub(crate) trait BinaryRead: Sized {
    /// Reads a value from `code` starting at `start`.
    /// Returns the read value and the position of the first byte after the read segment.
    fn read(code: &[u8], strings: &StringTable, start: usize) -> Result<(Self, usize), DecodeError>;
}
pub(crate) trait BinaryWrite: Sized {
    /// Appends a binary representation of the value to `code`, interning any strings it holds.
    /// Jump targets are written as placeholders and recorded in `relocate_info` in ascending order of code address.
    fn append(val: &Self, code: &mut Vec<u8>, strings: &mut StringTable, relocate_info: &mut Vec<RelocateInfo>);
}

fn read_bytes<const N: usize>(code: &[u8], start: usize) -> Result<[u8; N], DecodeError> {
    code.get(start..start + N)
        .and_then(|x| x.try_into().ok())
        .ok_or(DecodeError::UnexpectedEnd { offset: start })
}

impl BinaryRead for u8 { fn read(code: &[u8], _: &StringTable, start: usize) -> Result<(Self, usize), DecodeError> { Ok((read_bytes::<1>(code, start)?[0], start + 1)) } }
impl BinaryWrite for u8 { fn append(val: &Self, code: &mut Vec<u8>, _: &mut StringTable, _: &mut Vec<RelocateInfo>) { code.push(*val) } }

impl BinaryRead for i32 { fn read(code: &[u8], _: &StringTable, start: usize) -> Result<(Self, usize), DecodeError> { Ok((i32::from_le_bytes(read_bytes(code, start)?), start + 4)) } }
impl BinaryWrite for i32 { fn append(val: &Self, code: &mut Vec<u8>, _: &mut StringTable, _: &mut Vec<RelocateInfo>) { code.extend_from_slice(&val.to_le_bytes()) } }

impl BinaryRead for f32 { fn read(code: &[u8], _: &StringTable, start: usize) -> Result<(Self, usize), DecodeError> { Ok((f32::from_le_bytes(read_bytes(code, start)?), start + 4)) } }
impl BinaryWrite for f32 { fn append(val: &Self, code: &mut Vec<u8>, _: &mut StringTable, _: &mut Vec<RelocateInfo>) { code.extend_from_slice(&val.to_le_bytes()) } }

impl BinaryRead for Opcode {
    fn read(code: &[u8], strings: &StringTable, start: usize) -> Result<(Self, usize), DecodeError> {
        let (value, aft) = u8::read(code, strings, start)?;
        Ok((Opcode::from_byte(value).ok_or(DecodeError::UnknownOpcode { offset: start, value })?, aft))
    }
}
impl BinaryWrite for Opcode { fn append(val: &Self, code: &mut Vec<u8>, _: &mut StringTable, _: &mut Vec<RelocateInfo>) { code.push(*val as u8) } }

impl BinaryRead for CallArgumentsType {
    fn read(code: &[u8], strings: &StringTable, start: usize) -> Result<(Self, usize), DecodeError> {
        let (value, aft) = u8::read(code, strings, start)?;
        Ok((CallArgumentsType::from_byte(value).ok_or(DecodeError::UnknownArgumentType { offset: start, value })?, aft))
    }
}
impl BinaryWrite for CallArgumentsType { fn append(val: &Self, code: &mut Vec<u8>, _: &mut StringTable, _: &mut Vec<RelocateInfo>) { code.push(*val as u8) } }

/// A string id, resolved through the string table.
struct StringId(CompactString);

impl BinaryRead for StringId {
    fn read(code: &[u8], strings: &StringTable, start: usize) -> Result<(Self, usize), DecodeError> {
        let (id, aft) = i32::read(code, strings, start)?;
        let value = strings.get(id).ok_or(DecodeError::BadString { offset: start, id })?;
        Ok((StringId(value.into()), aft))
    }
}
fn append_string(val: &str, code: &mut Vec<u8>, strings: &mut StringTable, relocate_info: &mut Vec<RelocateInfo>) {
    let id = strings.intern(val);
    BinaryWrite::append(&id, code, strings, relocate_info)
}

impl BinaryRead for Reference {
    fn read(code: &[u8], strings: &StringTable, start: usize) -> Result<(Self, usize), DecodeError> {
        let (tag, aft) = u8::read(code, strings, start)?;
        let ty = ReferenceType::from_byte(tag).ok_or(DecodeError::UnknownReferenceType { offset: start, value: tag })?;
        if let Some(res) = Reference::from_unit_type(ty) {
            return Ok((res, aft));
        }
        Ok(match ty {
            ReferenceType::Argument => { let (v, aft) = u8::read(code, strings, aft)?; (Reference::Argument(v), aft) }
            ReferenceType::Local => { let (v, aft) = u8::read(code, strings, aft)?; (Reference::Local(v), aft) }
            ReferenceType::Global => { let (v, aft) = i32::read(code, strings, aft)?; (Reference::Global(v), aft) }
            ReferenceType::GlobalProc => { let (v, aft) = i32::read(code, strings, aft)?; (Reference::GlobalProc(v), aft) }
            ReferenceType::Field => { let (v, aft) = StringId::read(code, strings, aft)?; (Reference::Field(v.0), aft) }
            ReferenceType::SrcField => { let (v, aft) = StringId::read(code, strings, aft)?; (Reference::SrcField(v.0), aft) }
            ReferenceType::SrcProc => { let (v, aft) = StringId::read(code, strings, aft)?; (Reference::SrcProc(v.0), aft) }
            _ => return Err(DecodeError::UnknownReferenceType { offset: start, value: tag }),
        })
    }
}
impl BinaryWrite for Reference {
    fn append(val: &Self, code: &mut Vec<u8>, strings: &mut StringTable, relocate_info: &mut Vec<RelocateInfo>) {
        code.push(val.ref_type() as u8);
        match val {
            Reference::Argument(x) | Reference::Local(x) => code.push(*x),
            Reference::Global(x) | Reference::GlobalProc(x) => BinaryWrite::append(x, code, strings, relocate_info),
            Reference::Field(x) | Reference::SrcField(x) | Reference::SrcProc(x) => append_string(x, code, strings, relocate_info),
            _ => (),
        }
    }
}

fn read_operand(kind: ArgKind, code: &[u8], strings: &StringTable, start: usize) -> Result<(Operand, usize), DecodeError> {
    fn int(code: &[u8], strings: &StringTable, start: usize, f: fn(i32) -> Operand) -> Result<(Operand, usize), DecodeError> {
        i32::read(code, strings, start).map(|(v, aft)| (f(v), aft))
    }
    match kind {
        ArgKind::ArgType => CallArgumentsType::read(code, strings, start).map(|(v, aft)| (Operand::ArgType(v), aft)),
        ArgKind::StackDelta => int(code, strings, start, Operand::StackDelta),
        ArgKind::TypeId => int(code, strings, start, Operand::TypeId),
        ArgKind::ProcId => int(code, strings, start, Operand::ProcId),
        ArgKind::FilterId => int(code, strings, start, Operand::FilterId),
        ArgKind::EnumeratorId => int(code, strings, start, Operand::EnumeratorId),
        ArgKind::ListSize => int(code, strings, start, Operand::ListSize),
        ArgKind::Int => int(code, strings, start, Operand::Int),
        ArgKind::FormatCount => int(code, strings, start, Operand::FormatCount),
        ArgKind::PickCount => int(code, strings, start, Operand::PickCount),
        ArgKind::ConcatCount => int(code, strings, start, Operand::ConcatCount),
        ArgKind::Label => int(code, strings, start, |x| Operand::JumpTarget(x as u32)),
        ArgKind::Float => f32::read(code, strings, start).map(|(v, aft)| (Operand::Float(v), aft)),
        ArgKind::String => StringId::read(code, strings, start).map(|(v, aft)| (Operand::String(v.0), aft)),
        ArgKind::Resource => StringId::read(code, strings, start).map(|(v, aft)| (Operand::Resource(v.0), aft)),
        ArgKind::Reference => Reference::read(code, strings, start).map(|(v, aft)| (Operand::Reference(v), aft)),
    }
}

impl BinaryWrite for Operand {
    fn append(val: &Self, code: &mut Vec<u8>, strings: &mut StringTable, relocate_info: &mut Vec<RelocateInfo>) {
        match val {
            Operand::ArgType(x) => BinaryWrite::append(x, code, strings, relocate_info),
            Operand::Label(label) => {
                relocate_info.push(RelocateInfo::Label { code_addr: code.len(), label: label.clone() });
                BinaryWrite::append(&0i32, code, strings, relocate_info);
            }
            Operand::JumpTarget(x) => BinaryWrite::append(&(*x as i32), code, strings, relocate_info),
            Operand::Float(x) => BinaryWrite::append(x, code, strings, relocate_info),
            Operand::String(x) | Operand::Resource(x) => append_string(x, code, strings, relocate_info),
            Operand::Reference(x) => BinaryWrite::append(x, code, strings, relocate_info),
            Operand::StackDelta(x) | Operand::TypeId(x) | Operand::ProcId(x) | Operand::FilterId(x) | Operand::EnumeratorId(x)
            | Operand::ListSize(x) | Operand::Int(x) | Operand::FormatCount(x) | Operand::PickCount(x) | Operand::ConcatCount(x) => {
                BinaryWrite::append(x, code, strings, relocate_info)
            }
        }
    }
}

impl BinaryRead for Instruction {
    fn read(code: &[u8], strings: &StringTable, start: usize) -> Result<(Self, usize), DecodeError> {
        let (opcode, mut pos) = Opcode::read(code, strings, start)?;
        let meta = opcode.metadata();

        let mut operands = vec![];
        let kinds: Box<dyn Iterator<Item = &ArgKind>> = if meta.variable_args {
            let (count, aft) = i32::read(code, strings, pos)?;
            let count = usize::try_from(count).map_err(|_| DecodeError::NegativeCount { offset: start, count })?;
            operands.push(Operand::Int(count as i32));
            pos = aft;
            Box::new(meta.args.iter().cycle().take(count * meta.args.len()))
        } else {
            Box::new(meta.args.iter())
        };
        for kind in kinds {
            let (operand, aft) = read_operand(*kind, code, strings, pos)?;
            operands.push(operand);
            pos = aft;
        }
        Ok((Instruction { opcode, operands, location: None }, pos))
    }
}
impl BinaryWrite for Instruction {
    fn append(val: &Self, code: &mut Vec<u8>, strings: &mut StringTable, relocate_info: &mut Vec<RelocateInfo>) {
        BinaryWrite::append(&val.opcode, code, strings, relocate_info);
        for operand in val.operands.iter() {
            BinaryWrite::append(operand, code, strings, relocate_info);
        }
    }
}

/// Marks the start or end of a local variable's scope at a byte offset.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocalVariableInfo {
    pub offset: u32,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub add: Option<CompactString>,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub remove: Option<u32>,
}

/// The source line of the code starting at a byte offset.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SourceInfo {
    pub offset: u32,
    /// Only present when the file differs from the previous entry.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub file: Option<CompactString>,
    pub line: u32,
}

/// The encoded form of one procedure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EncodedProc {
    pub bytecode: Vec<u8>,
    pub locals: Vec<LocalVariableInfo>,
    pub source_info: Vec<SourceInfo>,
    pub labels: BTreeMap<CompactString, u32>,
    /// The deepest the stack gets when the instructions run in order.
    pub max_stack_size: i32,
}

fn to_offset(value: usize) -> Result<u32, EncodeError> {
    i32::try_from(value).map(|x| x as u32).map_err(|_| EncodeError::OffsetOverflow { len: value })
}

/// Encodes a procedure, interning its strings into `strings`.
///
/// Fails if an instruction does not match its opcode's grammar, if a label is placed twice,
/// or if a jump refers to a label that is never placed.
#[instrument(skip_all, fields(items = items.len()))]
pub fn encode(items: &[AnnotatedItem], strings: &mut StringTable) -> Result<EncodedProc, EncodeError> {
    let mut code = vec![];
    let mut relocate_info = vec![];
    let mut res = EncodedProc::default();

    let mut stack = 0i64;
    let mut last_file: Option<&CompactString> = None;
    let mut last_line = None;
    for item in items {
        let offset = to_offset(code.len())?;
        match item {
            AnnotatedItem::Label(label) => {
                if res.labels.insert(label.name.clone(), offset).is_some() {
                    return Err(EncodeError::DuplicateLabel { label: label.name.clone() });
                }
            }
            AnnotatedItem::LocalVariable(LocalVariable::Declare { name }) => {
                res.locals.push(LocalVariableInfo { offset, add: Some(name.clone()), remove: None });
            }
            AnnotatedItem::LocalVariable(LocalVariable::Exit { pop_count }) => {
                res.locals.push(LocalVariableInfo { offset, add: None, remove: Some(*pop_count) });
            }
            AnnotatedItem::Instruction(ins) => {
                ins.validate().map_err(|source| EncodeError::Operand { opcode: ins.opcode.name(), line: ins.line(), source })?;

                if let Some(loc) = &ins.location {
                    if last_line != Some(loc.line) || (loc.file.is_some() && loc.file.as_ref() != last_file) {
                        let file = match &loc.file {
                            Some(file) if Some(file) != last_file => {
                                last_file = Some(file);
                                Some(file.clone())
                            }
                            _ => None,
                        };
                        last_line = Some(loc.line);
                        // a later entry for the same offset replaces the earlier one
                        if res.source_info.last().is_some_and(|x| x.offset == offset) {
                            res.source_info.pop();
                        }
                        res.source_info.push(SourceInfo { offset, file, line: loc.line });
                    }
                }

                stack = stack.saturating_add(ins.stack_delta());
                let depth = i32::try_from(stack).map_err(|_| EncodeError::StackOverflow { opcode: ins.opcode.name(), line: ins.line() })?;
                res.max_stack_size = res.max_stack_size.max(depth);
                BinaryWrite::append(ins, &mut code, strings, &mut relocate_info);
            }
        }
    }
    to_offset(code.len())?;

    for info in relocate_info {
        match info {
            RelocateInfo::Label { code_addr, label } => {
                let target = match res.labels.get(&label) {
                    Some(x) => *x,
                    None => {
                        warn!(%label, "label was referenced but never placed");
                        return Err(EncodeError::UnresolvedLabel { label });
                    }
                };
                code[code_addr..code_addr + 4].copy_from_slice(&(target as i32).to_le_bytes());
            }
        }
    }

    res.bytecode = code;
    Ok(res)
}

/// Decodes every instruction in `code` along with its byte offset.
pub fn decode(code: &[u8], strings: &StringTable) -> Result<Vec<(usize, Instruction)>, DecodeError> {
    let mut res = vec![];
    let mut pos = 0;
    while pos < code.len() {
        let (ins, aft) = Instruction::read(code, strings, pos).map_err(|e| at_instruction(e, pos))?;
        res.push((pos, ins));
        pos = aft;
    }
    Ok(res)
}

/// Reports a decode error at the offset of the instruction being decoded rather than the failing operand.
fn at_instruction(err: DecodeError, pos: usize) -> DecodeError {
    match err {
        DecodeError::UnexpectedEnd { .. } => DecodeError::UnexpectedEnd { offset: pos },
        DecodeError::UnknownOpcode { value, .. } => DecodeError::UnknownOpcode { offset: pos, value },
        DecodeError::UnknownReferenceType { value, .. } => DecodeError::UnknownReferenceType { offset: pos, value },
        DecodeError::UnknownArgumentType { value, .. } => DecodeError::UnknownArgumentType { offset: pos, value },
        DecodeError::BadString { id, .. } => DecodeError::BadString { offset: pos, id },
        DecodeError::NegativeCount { count, .. } => DecodeError::NegativeCount { offset: pos, count },
    }
}

/// A decoded procedure ready to be printed as a listing.
///
/// Decoding stops at the first error. Everything decoded before it is kept so the listing can still be shown.
#[derive(Clone, Debug)]
pub struct Disassembly {
    pub instructions: Vec<(usize, Instruction)>,
    /// Every offset some instruction jumps to.
    pub jump_targets: BTreeSet<usize>,
    pub len: usize,
    pub error: Option<DecodeError>,
}
impl Disassembly {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub fn disassemble(code: &[u8], strings: &StringTable) -> Disassembly {
    let mut instructions = vec![];
    let mut jump_targets = BTreeSet::new();
    let mut error = None;

    let mut pos = 0;
    while pos < code.len() {
        match Instruction::read(code, strings, pos) {
            Ok((ins, aft)) => {
                if let Some(Operand::JumpTarget(target)) = ins.label_operand() {
                    jump_targets.insert(*target as usize);
                }
                instructions.push((pos, ins));
                pos = aft;
            }
            Err(e) => {
                error = Some(at_instruction(e, pos));
                break;
            }
        }
    }
    Disassembly { instructions, jump_targets, len: code.len(), error }
}

impl fmt::Display for Disassembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, ins) in self.instructions.iter() {
            if self.jump_targets.contains(pos) {
                write!(f, "{pos}")?;
            }
            writeln!(f, "\t{ins}")?;
        }
        // a jump off the end of the procedure
        if self.jump_targets.contains(&self.len) {
            writeln!(f, "{}", self.len)?;
        }
        if let Some(e) = &self.error {
            writeln!(f, "{e}")?;
        }
        Ok(())
    }
}

/// Generates a hex dump of `code`, including instructions and addresses.
pub fn dump_code(code: &[u8], strings: &StringTable, f: &mut dyn Write) -> io::Result<()> {
    let mut pos = 0;
    while pos < code.len() {
        let (ins, aft) = match Instruction::read(code, strings, pos) {
            Ok(x) => x,
            Err(e) => return writeln!(f, "{pos:08}    {}", at_instruction(e, pos)),
        };
        for (i, bytes) in code[pos..aft].chunks(BYTES_PER_LINE).enumerate() {
            if i == 0 {
                write!(f, "{pos:08}   ")?;
            } else {
                write!(f, "           ")?;
            }

            for &b in bytes {
                write!(f, " {b:02x}")?;
            }
            for _ in bytes.len()..BYTES_PER_LINE {
                write!(f, "   ")?;
            }

            if i == 0 {
                write!(f, "    {ins}")?;
            }
            writeln!(f)?;
        }
        pos = aft;
    }
    Ok(())
}

#[test]
fn test_binary_primitives() {
    let mut strings = StringTable::new();
    let mut code = vec![];
    BinaryWrite::append(&-2i32, &mut code, &mut strings, &mut vec![]);
    BinaryWrite::append(&1.5f32, &mut code, &mut strings, &mut vec![]);
    assert_eq!(code, [0xfe, 0xff, 0xff, 0xff, 0x00, 0x00, 0xc0, 0x3f]);

    assert_eq!(i32::read(&code, &strings, 0).unwrap(), (-2, 4));
    assert_eq!(f32::read(&code, &strings, 4).unwrap(), (1.5, 8));
    assert_eq!(i32::read(&code, &strings, 6).err(), Some(DecodeError::UnexpectedEnd { offset: 6 }));
}

#[test]
fn test_reference_encoding() {
    let mut strings = StringTable::new();
    strings.intern("unrelated");
    let cases = [
        (Reference::Src, vec![0]),
        (Reference::Local(3), vec![8, 3]),
        (Reference::Argument(255), vec![7, 255]),
        (Reference::Global(-1), vec![9, 0xff, 0xff, 0xff, 0xff]),
        (Reference::field("x"), vec![11, 1, 0, 0, 0]),
        (Reference::Invalid, vec![16]),
    ];
    for (reference, bytes) in cases {
        let mut code = vec![];
        BinaryWrite::append(&reference, &mut code, &mut strings, &mut vec![]);
        assert_eq!(code, bytes, "{reference}");
        assert_eq!(Reference::read(&code, &strings, 0).unwrap(), (reference, bytes.len()));
    }
    assert_eq!(Reference::read(&[17], &strings, 0).err(), Some(DecodeError::UnknownReferenceType { offset: 0, value: 17 }));
    assert_eq!(Reference::read(&[11, 9, 0, 0, 0], &strings, 0).err(), Some(DecodeError::BadString { offset: 1, id: 9 }));
}

#[test]
fn test_encode_labels() {
    let items = vec![
        AnnotatedItem::label("top"),
        Instruction::new(Opcode::PushFloat, vec![Operand::Float(0.0)]).unwrap().into(),
        Instruction::new(Opcode::JumpIfFalse, vec![Operand::label("end")]).unwrap().into(),
        Instruction::new(Opcode::Jump, vec![Operand::label("top")]).unwrap().into(),
        AnnotatedItem::label("end"),
    ];
    let mut strings = StringTable::new();
    let proc = encode(&items, &mut strings).unwrap();
    assert_eq!(proc.bytecode, [
        0x38, 0, 0, 0, 0,
        0x0C, 15, 0, 0, 0,
        0x0E, 0, 0, 0, 0,
    ]);
    assert_eq!(proc.labels.get("end"), Some(&15));
    assert_eq!(proc.max_stack_size, 1);

    let listing = disassemble(&proc.bytecode, &strings);
    assert!(listing.is_ok());
    assert_eq!(listing.to_string(), "0\tPushFloat 0.0\n\tJumpIfFalse 15\n\tJump 0\n15\n");

    let missing = [Instruction::new(Opcode::Jump, vec![Operand::label("gone")]).unwrap().into()];
    assert_eq!(encode(&missing, &mut strings).unwrap_err(), EncodeError::UnresolvedLabel { label: "gone".into() });
    let twice = [AnnotatedItem::label("a"), AnnotatedItem::label("a")];
    assert_eq!(encode(&twice, &mut strings).unwrap_err(), EncodeError::DuplicateLabel { label: "a".into() });
}

#[test]
fn test_encode_stack_overflow() {
    let mut strings = StringTable::new();
    let assoc = Instruction::new(Opcode::CreateAssociativeList, vec![Operand::ListSize(i32::MAX)]).unwrap().at_line(4);
    assert_eq!(encode(&[assoc.into()], &mut strings).unwrap_err(), EncodeError::StackOverflow { opcode: "CreateAssociativeList", line: Some(4) });

    let list = || AnnotatedItem::from(Instruction::new(Opcode::CreateList, vec![Operand::ListSize(i32::MAX)]).unwrap());
    assert!(encode(&[list()], &mut strings).is_ok());
    assert!(matches!(encode(&[list(), list()], &mut strings), Err(EncodeError::StackOverflow { .. })));
}

#[test]
fn test_encode_side_tables() {
    let push = |v: f32| Instruction::new(Opcode::PushFloat, vec![Operand::Float(v)]).unwrap();
    let items = vec![
        AnnotatedItem::LocalVariable(LocalVariable::Declare { name: "x".into() }),
        push(1.0).at("a.dm", 1).into(),
        push(2.0).at("a.dm", 1).into(),
        push(3.0).at("a.dm", 2).into(),
        Instruction::simple(Opcode::Add).unwrap().at("b.dm", 2).into(),
        AnnotatedItem::LocalVariable(LocalVariable::Exit { pop_count: 1 }),
        Instruction::simple(Opcode::Return).unwrap().at("b.dm", 3).into(),
    ];
    let proc = encode(&items, &mut StringTable::new()).unwrap();
    assert_eq!(proc.locals, [
        LocalVariableInfo { offset: 0, add: Some("x".into()), remove: None },
        LocalVariableInfo { offset: 16, add: None, remove: Some(1) },
    ]);
    assert_eq!(proc.source_info, [
        SourceInfo { offset: 0, file: Some("a.dm".into()), line: 1 },
        SourceInfo { offset: 10, file: None, line: 2 },
        SourceInfo { offset: 15, file: Some("b.dm".into()), line: 2 },
        SourceInfo { offset: 16, file: None, line: 3 },
    ]);
    assert_eq!(proc.max_stack_size, 3);
}

#[test]
fn test_encode_rejects_bad_operands() {
    let bad = Instruction { opcode: Opcode::PushFloat, operands: vec![Operand::Int(1)], location: None }.at_line(4);
    match encode(&[bad.into()], &mut StringTable::new()) {
        Err(EncodeError::Operand { opcode: "PushFloat", line: Some(4), .. }) => (),
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_decode_errors() {
    let strings = StringTable::new();
    assert_eq!(decode(&[0x00], &strings).unwrap_err(), DecodeError::UnknownOpcode { offset: 0, value: 0 });
    assert_eq!(decode(&[0x08, 0x38, 0, 0], &strings).unwrap_err(), DecodeError::UnexpectedEnd { offset: 1 });
    assert_eq!(decode(&[0x08, 0x88, 0xff, 0xff, 0xff, 0xff], &strings).unwrap_err(), DecodeError::NegativeCount { offset: 1, count: -1 });
    assert_eq!(decode(&[0x0A, 0x00, 0x09, 0, 0, 0, 0], &strings).unwrap_err(), DecodeError::UnknownArgumentType { offset: 0, value: 9 });

    let partial = disassemble(&[0x08, 0x03, 0x05, 0, 0, 0], &strings);
    assert_eq!(partial.instructions.len(), 1);
    assert_eq!(partial.error, Some(DecodeError::BadString { offset: 1, id: 5 }));
    assert_eq!(partial.to_string(), "\tAdd\noffset 1: string id 5 is not in the string table\n");
}

#[test]
fn test_dump_code() {
    let mut strings = StringTable::new();
    let proc = encode(&[
        Instruction::new(Opcode::PushString, vec![Operand::string("hi")]).unwrap().into(),
        Instruction::simple(Opcode::Return).unwrap().into(),
    ], &mut strings).unwrap();
    let mut out = Vec::new();
    dump_code(&proc.bytecode, &strings, &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "\
00000000    03 00 00 00 00                   PushString \"hi\"
00000005    10                               Return
");
}
