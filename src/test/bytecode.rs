use crate::annotated::*;
use crate::bytecode::{decode, disassemble, encode};
use crate::opcode::{ArgKind, Opcode};
use crate::optimizer::{optimize, OptimizerSettings};
use crate::reference::Reference;

use super::{jump, label, op, push};

const REFERENCES: [fn() -> Reference; 8] = [
    || Reference::Local(1),
    || Reference::Field("name".into()),
    || Reference::Global(3),
    || Reference::Src,
    || Reference::Argument(0),
    || Reference::SrcProc("act".into()),
    || Reference::GlobalProc(2),
    || Reference::SrcField("x".into()),
];

fn sample(kind: ArgKind, i: usize) -> Operand {
    match kind {
        ArgKind::ArgType => Operand::ArgType(CallArgumentsType::FromStack),
        ArgKind::StackDelta => Operand::StackDelta(2),
        ArgKind::Resource => Operand::Resource("icons/mob.dmi".into()),
        ArgKind::TypeId => Operand::TypeId(3),
        ArgKind::ProcId => Operand::ProcId(4),
        ArgKind::FilterId => Operand::FilterId(5),
        ArgKind::EnumeratorId => Operand::EnumeratorId(6),
        ArgKind::ListSize => Operand::ListSize(2),
        ArgKind::Int => Operand::Int(7),
        ArgKind::Label => Operand::label("end"),
        ArgKind::Float => Operand::Float(i as f32 + 0.25),
        ArgKind::String => Operand::string(format!("text {i}")),
        ArgKind::Reference => Operand::Reference(REFERENCES[i % REFERENCES.len()]()),
        ArgKind::FormatCount => Operand::FormatCount(1),
        ArgKind::PickCount => Operand::PickCount(2),
        ArgKind::ConcatCount => Operand::ConcatCount(3),
    }
}

/// One instruction per opcode, with two items for every variadic opcode.
fn every_opcode() -> Vec<Instruction> {
    Opcode::all().enumerate().map(|(i, opcode)| {
        let meta = opcode.metadata();
        let operands = if meta.variable_args {
            let mut operands = vec![Operand::Int(2)];
            for item in 0..2 {
                operands.extend(meta.args.iter().map(|kind| sample(*kind, i + item)));
            }
            operands
        } else {
            meta.args.iter().map(|kind| sample(*kind, i)).collect()
        };
        Instruction::new(opcode, operands).unwrap()
    }).collect()
}

#[test]
fn test_decode_every_opcode() {
    let instructions = every_opcode();
    let mut items: Vec<AnnotatedItem> = instructions.iter().cloned().map(Into::into).collect();
    items.push(label("end"));

    let mut strings = StringTable::new();
    let proc = encode(&items, &mut strings).unwrap();
    let end = proc.labels["end"];
    assert_eq!(end as usize, proc.bytecode.len());

    let decoded = decode(&proc.bytecode, &strings).unwrap();
    assert_eq!(decoded.len(), instructions.len());
    let mut last = None;
    for (original, (pos, decoded)) in instructions.iter().zip(decoded.iter()) {
        assert!(last.map_or(true, |x| x < *pos));
        last = Some(*pos);

        assert_eq!(original.opcode, decoded.opcode);
        assert_eq!(original.operands.len(), decoded.operands.len(), "{original}");
        for (a, b) in original.operands.iter().zip(decoded.operands.iter()) {
            let expected = match a {
                Operand::Label(_) => Operand::JumpTarget(end),
                x => x.clone(),
            };
            assert!(expected.same_as(b), "{original}: expected {expected:?}, got {b:?}");
        }
    }

    // decoded jump targets are written back verbatim
    let mut reencode_strings = strings.clone();
    let decoded_items: Vec<AnnotatedItem> = decoded.into_iter().map(|(_, x)| x.into()).collect();
    let again = encode(&decoded_items, &mut reencode_strings).unwrap();
    assert_eq!(again.bytecode, proc.bytecode);
    assert_eq!(reencode_strings.len(), strings.len());
}

#[test]
fn test_listing_reference_jump() {
    let items = vec![
        AnnotatedItem::from(Instruction::new(Opcode::JumpIfFalseReference, vec![Operand::Reference(Reference::Local(0)), Operand::label("end")]).unwrap()),
        label("end"),
    ];
    let mut strings = StringTable::new();
    let proc = encode(&items, &mut strings).unwrap();
    assert_eq!(proc.bytecode, [Opcode::JumpIfFalseReference as u8, 8, 0, 7, 0, 0, 0]);
    assert_eq!(disassemble(&proc.bytecode, &strings).to_string(), "\tJumpIfFalseReference Local(0) 7\n7\n");
}

#[test]
fn test_optimize_then_encode() {
    let items = vec![
        push(1.0),
        jump(Opcode::Jump, "a"),
        push(99.0),
        op(Opcode::Return),
        label("a"),
        jump(Opcode::Jump, "b"),
        label("b"),
        push(2.0),
        op(Opcode::Add),
        op(Opcode::Return),
    ];
    let listings = [
        (OptimizerSettings { peephole: false, ..Default::default() }, "\tPushFloat 1.0\n\tPushFloat 2.0\n\tAdd\n\tReturn\n"),
        (OptimizerSettings::default(), "\tPushNFloats 2 1.0 2.0\n\tAdd\n\tReturn\n"),
    ];
    for (settings, expected) in listings {
        let optimized = optimize(items.clone(), &settings).unwrap();

        let mut strings = StringTable::new();
        let proc = encode(&optimized, &mut strings).unwrap();
        assert!(proc.labels.is_empty());
        assert_eq!(proc.max_stack_size, 2);

        let listing = disassemble(&proc.bytecode, &strings);
        assert!(listing.is_ok());
        assert_eq!(listing.to_string(), expected);
    }
}
