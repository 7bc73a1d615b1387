//! Peephole rewrites over a linear procedure.
//!
//! Rewrites only ever look at runs of consecutive instructions, so a label or local-variable marker always ends a
//! window and no jump can land inside a rewritten sequence. Every rewrite replaces a window with fewer
//! instructions of the same net stack effect, which also means each phase terminates.
//!
//! The phases run in order, each until nothing changes:
//!
//! **Dead jumps**: a `Jump` directly after a jump, return or throw is dropped.
//!
//! **Fuse**
//!
//! | Pattern | Replacement |
//! |---------|-------------|
//! | `PushReferenceValue r; PushString s; DereferenceIndex` | `IndexRefWithString r s` |
//! | `Append r; Pop` | `AppendNoPush r` |
//! | `Assign r; Pop` | `AssignNoPush r` |
//! | `PushNull; AssignNoPush r` | `NullRef r` |
//! | `PushReferenceValue r; DereferenceField f` | `PushRefAndDereferenceField r f` |
//! | `PushReferenceValue r; Return` | `ReturnReferenceValue r` |
//! | `PushFloat x; Return` | `ReturnFloat x` |
//! | `PushReferenceValue r; JumpIfFalse l` | `JumpIfReferenceFalse r l` |
//! | `PushFloat x; SwitchCase l` | `SwitchOnFloat x l` |
//! | `PushString s; SwitchCase l` | `SwitchOnString s l` |
//! | `PushType t; IsType` | `IsTypeDirect t` |
//! | `AssignNoPush r; PushReferenceValue r` | `Assign r` |
//! | `AppendNoPush r; PushReferenceValue r` | `Append r` |
//!
//! **Compact**
//!
//! | Pattern | Replacement |
//! |---------|-------------|
//! | `n` pairs of `PushFloat x; AssignNoPush r` | `PushFloatAssign x r`, or `NPushFloatAssign n (x r)*` |
//! | `n` pairs of `PushString s; PushFloat x` | `PushStringFloat s x`, or `PushNOfStringFloats n (s x)*` |
//! | `n >= 2` of `PushString`, `PushFloat`, `PushReferenceValue` or `PushResource` | `PushNStrings` and friends |
//!
//! **Compact lists**
//!
//! | Pattern | Replacement |
//! |---------|-------------|
//! | `PushNFloats n ...; CreateList n` | `CreateListNFloats n ...` (likewise for strings, refs and resources) |
//!
//! Constant folding is not done here.

use tracing::{debug, instrument, trace};

use crate::annotated::{AnnotatedItem, Instruction, Operand, SourceLoc};
use crate::opcode::{ControlFlow, Opcode};

/// What [`peephole`] changed. Each count is the number of windows rewritten in that phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeepholeStats {
    pub fused: usize,
    pub removed_jumps: usize,
    pub compacted: usize,
    pub compacted_lists: usize,
}
impl PeepholeStats {
    pub fn total(&self) -> usize {
        self.fused + self.removed_jumps + self.compacted + self.compacted_lists
    }
}

/// Sequences whose fused form takes the operands of every instruction in order. Longer sequences come first.
const FUSIONS: &[(&[Opcode], Opcode)] = &[
    (&[Opcode::PushReferenceValue, Opcode::PushString, Opcode::DereferenceIndex], Opcode::IndexRefWithString),
    (&[Opcode::Append, Opcode::Pop], Opcode::AppendNoPush),
    (&[Opcode::Assign, Opcode::Pop], Opcode::AssignNoPush),
    (&[Opcode::PushNull, Opcode::AssignNoPush], Opcode::NullRef),
    (&[Opcode::PushReferenceValue, Opcode::DereferenceField], Opcode::PushRefAndDereferenceField),
    (&[Opcode::PushReferenceValue, Opcode::Return], Opcode::ReturnReferenceValue),
    (&[Opcode::PushFloat, Opcode::Return], Opcode::ReturnFloat),
    (&[Opcode::PushReferenceValue, Opcode::JumpIfFalse], Opcode::JumpIfReferenceFalse),
    (&[Opcode::PushFloat, Opcode::SwitchCase], Opcode::SwitchOnFloat),
    (&[Opcode::PushString, Opcode::SwitchCase], Opcode::SwitchOnString),
    (&[Opcode::PushType, Opcode::IsType], Opcode::IsTypeDirect),
];

/// A store that leaves no value behind, followed by a push of the same reference.
const STORE_THEN_PUSH: &[(Opcode, Opcode)] = &[
    (Opcode::AssignNoPush, Opcode::Assign),
    (Opcode::AppendNoPush, Opcode::Append),
];

/// `(first, second, single, many)`: runs of `first; second` pairs become `single` or the variadic `many`.
const PAIR_RUNS: &[(Opcode, Opcode, Opcode, Opcode)] = &[
    (Opcode::PushFloat, Opcode::AssignNoPush, Opcode::PushFloatAssign, Opcode::NPushFloatAssign),
    (Opcode::PushString, Opcode::PushFloat, Opcode::PushStringFloat, Opcode::PushNOfStringFloats),
];

/// Runs of at least two single-operand pushes and the variadic push that replaces them.
const PUSH_RUNS: &[(Opcode, Opcode)] = &[
    (Opcode::PushString, Opcode::PushNStrings),
    (Opcode::PushFloat, Opcode::PushNFloats),
    (Opcode::PushReferenceValue, Opcode::PushNRefs),
    (Opcode::PushResource, Opcode::PushNResources),
];

/// Variadic pushes that, followed by a `CreateList` of the same size, become a single list constructor.
const LIST_RUNS: &[(Opcode, Opcode)] = &[
    (Opcode::PushNFloats, Opcode::CreateListNFloats),
    (Opcode::PushNStrings, Opcode::CreateListNStrings),
    (Opcode::PushNRefs, Opcode::CreateListNRefs),
    (Opcode::PushNResources, Opcode::CreateListNResources),
];

/// A window of `len` items starting at the current position, and what goes in its place.
struct Rewrite {
    len: usize,
    replacement: Instruction,
}

type Rule = fn(&[AnnotatedItem]) -> Option<Rewrite>;

/// Applies every rewrite until none matches. Never fails: windows whose operands do not have the expected shape
/// are left alone.
#[instrument(skip_all)]
pub fn peephole(items: &mut Vec<AnnotatedItem>) -> PeepholeStats {
    let before = items.len();
    let mut stats = PeepholeStats::default();

    stats.removed_jumps = run_phase(items, &[drop_dead_jump]);
    stats.fused = run_phase(items, &[fuse_sequence, fuse_store_then_push]);
    stats.compacted = run_phase(items, &[compact_pairs, compact_pushes]);
    stats.compacted_lists = run_phase(items, &[compact_list]);

    debug!(before, after = items.len(), ?stats, "peephole");
    stats
}

/// Tries `rules` in order at each position until a whole sweep changes nothing. Returns the number of rewrites.
fn run_phase(items: &mut Vec<AnnotatedItem>, rules: &[Rule]) -> usize {
    let mut total = 0;
    loop {
        let mut changes = 0;
        let mut i = 0;
        while i < items.len() {
            match rules.iter().find_map(|rule| rule(&items[i..])) {
                Some(rewrite) => {
                    trace!(at = i, len = rewrite.len, replacement = %rewrite.replacement.opcode, "rewrite");
                    items.splice(i..i + rewrite.len, [AnnotatedItem::Instruction(rewrite.replacement)]);
                    changes += 1;
                }
                None => i += 1,
            }
        }
        if changes == 0 {
            return total;
        }
        total += changes;
    }
}

fn at(items: &[AnnotatedItem], i: usize) -> Option<&Instruction> {
    items.get(i)?.as_instruction()
}
fn at_op(items: &[AnnotatedItem], i: usize, opcode: Opcode) -> Option<&Instruction> {
    at(items, i).filter(|x| x.opcode == opcode)
}

/// The first location with a line among the first `len` instructions.
fn location(items: &[AnnotatedItem], len: usize) -> Option<SourceLoc> {
    items[..len].iter().filter_map(AnnotatedItem::as_instruction).find_map(|x| x.location.clone())
}

/// Builds the replacement for `items[..len]`, provided the operands fit the opcode.
fn rewrite(items: &[AnnotatedItem], len: usize, opcode: Opcode, operands: Vec<Operand>) -> Option<Rewrite> {
    let res = Instruction { opcode, operands, location: location(items, len) };
    res.validate().ok()?;
    Some(Rewrite { len, replacement: res })
}

fn fuse_sequence(items: &[AnnotatedItem]) -> Option<Rewrite> {
    FUSIONS.iter().find_map(|(pattern, fused)| {
        let window = pattern.iter().enumerate().map(|(i, opcode)| at_op(items, i, *opcode)).collect::<Option<Vec<_>>>()?;
        let operands = window.iter().flat_map(|x| x.operands.iter().cloned()).collect();
        rewrite(items, pattern.len(), *fused, operands)
    })
}

fn fuse_store_then_push(items: &[AnnotatedItem]) -> Option<Rewrite> {
    STORE_THEN_PUSH.iter().find_map(|(store, fused)| {
        let first = at_op(items, 0, *store)?;
        let second = at_op(items, 1, Opcode::PushReferenceValue)?;
        if first.operands != second.operands {
            return None;
        }
        rewrite(items, 2, *fused, first.operands.clone())
    })
}

/// A `Jump` directly after an instruction that never falls through is unreachable.
fn drop_dead_jump(items: &[AnnotatedItem]) -> Option<Rewrite> {
    let first = at(items, 0)?;
    at_op(items, 1, Opcode::Jump)?;
    match ControlFlow::of(first.opcode).ok()? {
        Some(ControlFlow::Jump | ControlFlow::Return | ControlFlow::Throw) => Some(Rewrite { len: 2, replacement: first.clone() }),
        _ => None,
    }
}

fn compact_pairs(items: &[AnnotatedItem]) -> Option<Rewrite> {
    PAIR_RUNS.iter().find_map(|(first, second, single, many)| {
        let mut operands = vec![];
        let mut count = 0usize;
        while let (Some(a), Some(b)) = (at_op(items, 2 * count, *first), at_op(items, 2 * count + 1, *second)) {
            operands.extend(a.operands.iter().cloned());
            operands.extend(b.operands.iter().cloned());
            count += 1;
        }
        match count {
            0 => None,
            1 => rewrite(items, 2, *single, operands),
            _ => {
                operands.insert(0, Operand::Int(i32::try_from(count).ok()?));
                rewrite(items, 2 * count, *many, operands)
            }
        }
    })
}

fn compact_pushes(items: &[AnnotatedItem]) -> Option<Rewrite> {
    PUSH_RUNS.iter().find_map(|(push, many)| {
        let run: Vec<&Instruction> = (0..).map_while(|i| at_op(items, i, *push)).collect();
        if run.len() < 2 {
            return None;
        }
        let mut operands = vec![Operand::Int(i32::try_from(run.len()).ok()?)];
        operands.extend(run.iter().flat_map(|x| x.operands.iter().cloned()));
        rewrite(items, run.len(), *many, operands)
    })
}

fn compact_list(items: &[AnnotatedItem]) -> Option<Rewrite> {
    let pushes = at(items, 0)?;
    let (_, fused) = LIST_RUNS.iter().find(|(push, _)| *push == pushes.opcode)?;
    let create = at_op(items, 1, Opcode::CreateList)?;
    match (pushes.operands.first(), create.operands.first()) {
        (Some(Operand::Int(count)), Some(Operand::ListSize(size))) if count == size => rewrite(items, 2, *fused, pushes.operands.clone()),
        _ => None,
    }
}

#[cfg(test)]
use crate::reference::Reference;

#[cfg(test)]
fn ins(opcode: Opcode, operands: Vec<Operand>) -> AnnotatedItem {
    Instruction::new(opcode, operands).unwrap().into()
}
#[cfg(test)]
fn local(index: u8) -> Operand {
    Operand::Reference(Reference::Local(index))
}

#[test]
fn test_fusion_operands_fit() {
    for (pattern, fused) in FUSIONS {
        let joined: Vec<_> = pattern.iter().flat_map(|x| x.metadata().args.iter().copied()).collect();
        assert_eq!(joined, fused.metadata().args, "{fused}");
        let delta: i32 = pattern.iter().map(|x| x.metadata().stack_delta).sum();
        assert_eq!(delta, fused.metadata().stack_delta, "{fused}");
    }
    for (store, fused) in STORE_THEN_PUSH {
        assert_eq!(store.metadata().stack_delta + 1, fused.metadata().stack_delta, "{fused}");
    }
}

#[test]
fn test_fuse() {
    let mut items = vec![
        ins(Opcode::PushFloat, vec![Operand::Float(3.0)]),
        ins(Opcode::Assign, vec![local(0)]),
        ins(Opcode::Pop, vec![]),
        ins(Opcode::PushReferenceValue, vec![local(1)]),
        ins(Opcode::PushString, vec![Operand::string("key")]),
        ins(Opcode::DereferenceIndex, vec![]),
        ins(Opcode::PushType, vec![Operand::TypeId(7)]),
        ins(Opcode::IsType, vec![]),
        ins(Opcode::Return, vec![]),
    ];
    let stats = peephole(&mut items);
    assert_eq!(items, [
        ins(Opcode::PushFloatAssign, vec![Operand::Float(3.0), local(0)]),
        ins(Opcode::IndexRefWithString, vec![local(1), Operand::string("key")]),
        ins(Opcode::IsTypeDirect, vec![Operand::TypeId(7)]),
        ins(Opcode::Return, vec![]),
    ]);
    assert_eq!(stats, PeepholeStats { fused: 3, removed_jumps: 0, compacted: 1, compacted_lists: 0 });
    assert_eq!(peephole(&mut items).total(), 0);
}

#[test]
fn test_store_then_push() {
    let mut items = vec![
        ins(Opcode::AssignNoPush, vec![local(1)]),
        ins(Opcode::PushReferenceValue, vec![local(1)]),
        ins(Opcode::AppendNoPush, vec![local(2)]),
        ins(Opcode::PushReferenceValue, vec![local(3)]),
    ];
    peephole(&mut items);
    assert_eq!(items, [
        ins(Opcode::Assign, vec![local(1)]),
        ins(Opcode::AppendNoPush, vec![local(2)]),
        ins(Opcode::PushReferenceValue, vec![local(3)]),
    ]);
}

#[test]
fn test_windows_stop_at_labels() {
    let mut items = vec![
        ins(Opcode::PushFloat, vec![Operand::Float(1.0)]),
        AnnotatedItem::label("target"),
        ins(Opcode::Return, vec![]),
        ins(Opcode::PushString, vec![Operand::string("a")]),
        AnnotatedItem::LocalVariable(crate::annotated::LocalVariable::Exit { pop_count: 1 }),
        ins(Opcode::PushString, vec![Operand::string("b")]),
    ];
    let before = items.clone();
    assert_eq!(peephole(&mut items).total(), 0);
    assert_eq!(items, before);
}

#[test]
fn test_dead_jumps() {
    let mut items = vec![
        ins(Opcode::Jump, vec![Operand::label("a")]),
        ins(Opcode::Jump, vec![Operand::label("b")]),
        ins(Opcode::Jump, vec![Operand::label("c")]),
        AnnotatedItem::label("a"),
        ins(Opcode::PushFloat, vec![Operand::Float(2.0)]),
        ins(Opcode::Return, vec![]),
        ins(Opcode::Jump, vec![Operand::label("a")]),
    ];
    let stats = peephole(&mut items);
    assert_eq!(items, [
        ins(Opcode::Jump, vec![Operand::label("a")]),
        AnnotatedItem::label("a"),
        ins(Opcode::ReturnFloat, vec![Operand::Float(2.0)]),
    ]);
    assert_eq!(stats.removed_jumps, 3);
    assert_eq!(stats.fused, 1);
}

#[test]
fn test_compact() {
    let mut items = vec![
        ins(Opcode::PushFloat, vec![Operand::Float(1.0)]),
        ins(Opcode::AssignNoPush, vec![local(0)]),
        ins(Opcode::PushFloat, vec![Operand::Float(2.0)]),
        ins(Opcode::AssignNoPush, vec![local(1)]),
        ins(Opcode::PushString, vec![Operand::string("x")]),
        ins(Opcode::PushFloat, vec![Operand::Float(3.0)]),
        ins(Opcode::PushResource, vec![Operand::Resource("a.dmi".into())]),
        ins(Opcode::PushResource, vec![Operand::Resource("b.dmi".into())]),
        ins(Opcode::PushResource, vec![Operand::Resource("c.dmi".into())]),
    ];
    peephole(&mut items);
    assert_eq!(items, [
        ins(Opcode::NPushFloatAssign, vec![Operand::Int(2), Operand::Float(1.0), local(0), Operand::Float(2.0), local(1)]),
        ins(Opcode::PushStringFloat, vec![Operand::string("x"), Operand::Float(3.0)]),
        ins(Opcode::PushNResources, vec![
            Operand::Int(3),
            Operand::Resource("a.dmi".into()),
            Operand::Resource("b.dmi".into()),
            Operand::Resource("c.dmi".into()),
        ]),
    ]);
}

#[test]
fn test_compact_lists() {
    let list = |size: i32| vec![
        ins(Opcode::PushFloat, vec![Operand::Float(1.0)]),
        ins(Opcode::PushFloat, vec![Operand::Float(2.0)]),
        ins(Opcode::CreateList, vec![Operand::ListSize(size)]),
    ];

    let mut items = list(2);
    let stats = peephole(&mut items);
    assert_eq!(items, [ins(Opcode::CreateListNFloats, vec![Operand::Int(2), Operand::Float(1.0), Operand::Float(2.0)])]);
    assert_eq!((stats.compacted, stats.compacted_lists), (1, 1));

    let mut items = list(3);
    peephole(&mut items);
    assert_eq!(items, [
        ins(Opcode::PushNFloats, vec![Operand::Int(2), Operand::Float(1.0), Operand::Float(2.0)]),
        ins(Opcode::CreateList, vec![Operand::ListSize(3)]),
    ]);
}

#[test]
fn test_location_of_fused() {
    let mut items: Vec<AnnotatedItem> = vec![
        Instruction::new(Opcode::PushFloat, vec![Operand::Float(1.0)]).unwrap().into(),
        Instruction::simple(Opcode::Return).unwrap().at("code.dm", 12).into(),
    ];
    peephole(&mut items);
    let fused = items[0].as_instruction().unwrap();
    assert_eq!(fused.opcode, Opcode::ReturnFloat);
    assert_eq!(fused.line(), Some(12));
}

#[test]
fn test_stack_effect_kept() {
    let items = vec![
        ins(Opcode::PushNull, vec![]),
        ins(Opcode::AssignNoPush, vec![local(0)]),
        ins(Opcode::PushReferenceValue, vec![local(0)]),
        ins(Opcode::DereferenceField, vec![Operand::string("name")]),
        ins(Opcode::PushString, vec![Operand::string("a")]),
        ins(Opcode::PushString, vec![Operand::string("b")]),
        ins(Opcode::PushReferenceValue, vec![local(1)]),
        ins(Opcode::PushReferenceValue, vec![local(2)]),
        ins(Opcode::CreateList, vec![Operand::ListSize(2)]),
    ];
    let delta = |items: &[AnnotatedItem]| items.iter().filter_map(AnnotatedItem::as_instruction).map(Instruction::stack_delta).sum::<i64>();
    let mut fused = items.clone();
    peephole(&mut fused);
    assert_eq!(delta(&fused), delta(&items));
    assert_eq!(fused.len(), 4);
    assert_eq!(fused[0].as_instruction().unwrap().opcode, Opcode::NullRef);
    assert_eq!(fused[3].as_instruction().unwrap().opcode, Opcode::CreateListNRefs);
}
