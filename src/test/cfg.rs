use crate::annotated::AnnotatedItem;
use crate::cfg::build_cfg;
use crate::opcode::Opcode;
use crate::optimizer::*;
use crate::peephole::peephole;

use super::*;

const MAX_STEPS: usize = 1000;

/// Checks that `items` behaves the same before optimizing, after the graph passes, and after the peephole rewrites.
fn assert_equivalent(items: Vec<AnnotatedItem>, expected: Outcome) -> Vec<AnnotatedItem> {
    assert_eq!(interpret(&items, MAX_STEPS), Ok(expected));
    let plain = optimize(items.clone(), &OptimizerSettings { peephole: false, ..Default::default() }).unwrap();
    assert_eq!(interpret(&plain, MAX_STEPS), Ok(expected), "optimized:\n{plain:#?}");
    let optimized = optimize(items.clone(), &OptimizerSettings::default()).unwrap();
    assert_eq!(interpret(&optimized, MAX_STEPS), Ok(expected), "rewritten:\n{optimized:#?}");
    assert!(optimized.len() <= plain.len() && plain.len() <= items.len());

    // a second run has nothing left to do
    let mut cfg = build_cfg(optimized.clone()).unwrap();
    let stats = optimize_cfg(&mut cfg, &OptimizerSettings::default()).unwrap();
    assert_eq!((stats.removed_blocks, stats.removed_jumps, stats.threaded_jumps, stats.merged_blocks), (0, 0, 0, 0));
    let mut again = optimized.clone();
    assert_eq!(peephole(&mut again).total(), 0);
    optimized
}

fn instructions(items: &[AnnotatedItem]) -> Vec<Opcode> {
    items.iter().filter_map(AnnotatedItem::as_instruction).map(|x| x.opcode).collect()
}

#[test]
fn test_equivalent_straight_line() {
    let optimized = assert_equivalent(vec![
        push(1.0),
        jump(Opcode::Jump, "next"),
        label("next"),
        push(2.0),
        op(Opcode::Add),
        op(Opcode::Return),
    ], Outcome::Returned(3.0));
    assert_eq!(instructions(&optimized), [Opcode::PushNFloats, Opcode::Add, Opcode::Return]);
    assert!(optimized.iter().all(|x| x.as_label().is_none()));
}

#[test]
fn test_equivalent_if_else() {
    assert_equivalent(vec![
        push(1.0),
        push(2.0),
        op(Opcode::CompareLessThan),
        jump(Opcode::JumpIfFalse, "else"),
        push(10.0),
        jump(Opcode::Jump, "end"),
        label("else"),
        push(20.0),
        label("end"),
        op(Opcode::Return),
    ], Outcome::Returned(10.0));

    assert_equivalent(vec![
        push(3.0),
        push(2.0),
        op(Opcode::CompareLessThan),
        jump(Opcode::JumpIfFalse, "else"),
        push(10.0),
        jump(Opcode::Jump, "end"),
        label("else"),
        push(20.0),
        label("end"),
        op(Opcode::Return),
    ], Outcome::Returned(20.0));
}

#[test]
fn test_equivalent_jump_chain() {
    let optimized = assert_equivalent(vec![
        jump(Opcode::Jump, "a"),
        push(99.0),
        op(Opcode::Return),
        label("a"),
        jump(Opcode::Jump, "b"),
        label("b"),
        push(5.0),
        op(Opcode::Return),
    ], Outcome::Returned(5.0));
    assert_eq!(instructions(&optimized), [Opcode::ReturnFloat]);
}

#[test]
fn test_equivalent_try_catch() {
    let optimized = assert_equivalent(vec![
        try_catch("catch"),
        push(7.0),
        op(Opcode::Throw),
        op(Opcode::EndTry),
        push(0.0),
        op(Opcode::Return),
        label("catch"),
        push(1.0),
        op(Opcode::Add),
        op(Opcode::Return),
    ], Outcome::Returned(8.0));
    // the handler must survive even though only the exception edge reaches it
    assert_eq!(optimized.iter().filter(|x| x.as_label() == Some("catch")).count(), 1);
}

#[test]
fn test_equivalent_uncaught_throw() {
    assert_equivalent(vec![
        push(1.0),
        push(2.0),
        op(Opcode::CompareLessThan),
        jump(Opcode::JumpIfFalse, "l1"),
        jump(Opcode::Jump, "l2"),
        label("l1"),
        push(0.0),
        op(Opcode::Return),
        label("l2"),
        jump(Opcode::Jump, "l3"),
        label("l3"),
        push(4.0),
        op(Opcode::Throw),
    ], Outcome::Threw(4.0));
}

#[test]
fn test_equivalent_counting_loop() {
    let optimized = assert_equivalent(vec![
        push(0.0),
        ins(Opcode::AssignNoPush, vec![local(0)]),
        label("loop"),
        ins(Opcode::PushReferenceValue, vec![local(0)]),
        push(5.0),
        op(Opcode::CompareLessThan),
        jump(Opcode::JumpIfFalse, "end"),
        ins(Opcode::PushReferenceValue, vec![local(0)]),
        push(1.0),
        op(Opcode::Add),
        ins(Opcode::Assign, vec![local(0)]),
        op(Opcode::Pop),
        jump(Opcode::Jump, "loop"),
        label("end"),
        ins(Opcode::PushReferenceValue, vec![local(0)]),
        op(Opcode::Return),
    ], Outcome::Returned(5.0));
    assert_eq!(instructions(&optimized), [
        Opcode::PushFloatAssign,
        Opcode::PushReferenceValue,
        Opcode::PushFloat,
        Opcode::CompareLessThan,
        Opcode::JumpIfFalse,
        Opcode::PushReferenceValue,
        Opcode::PushFloat,
        Opcode::Add,
        Opcode::AssignNoPush,
        Opcode::Jump,
        Opcode::ReturnReferenceValue,
    ]);
}

#[test]
fn test_equivalent_countdown_loop() {
    // sums 3 + 2 + 1 while the counter is truthy
    let optimized = assert_equivalent(vec![
        push(3.0),
        ins(Opcode::AssignNoPush, vec![local(0)]),
        push(0.0),
        ins(Opcode::AssignNoPush, vec![local(1)]),
        label("loop"),
        ins(Opcode::PushReferenceValue, vec![local(0)]),
        jump(Opcode::JumpIfFalse, "end"),
        ins(Opcode::PushReferenceValue, vec![local(1)]),
        ins(Opcode::PushReferenceValue, vec![local(0)]),
        op(Opcode::Add),
        ins(Opcode::AssignNoPush, vec![local(1)]),
        ins(Opcode::PushReferenceValue, vec![local(0)]),
        push(1.0),
        op(Opcode::Subtract),
        ins(Opcode::Assign, vec![local(0)]),
        op(Opcode::Pop),
        jump(Opcode::Jump, "loop"),
        label("end"),
        ins(Opcode::PushReferenceValue, vec![local(1)]),
        op(Opcode::Return),
    ], Outcome::Returned(6.0));
    assert_eq!(instructions(&optimized), [
        Opcode::NPushFloatAssign,
        Opcode::JumpIfReferenceFalse,
        Opcode::PushNRefs,
        Opcode::Add,
        Opcode::AssignNoPush,
        Opcode::PushReferenceValue,
        Opcode::PushFloat,
        Opcode::Subtract,
        Opcode::AssignNoPush,
        Opcode::Jump,
        Opcode::ReturnReferenceValue,
    ]);
}

#[test]
fn test_equivalent_switch() {
    let switch = |value: f32| vec![
        push(value),
        push(1.0),
        jump(Opcode::SwitchCase, "one"),
        push(2.0),
        jump(Opcode::SwitchCase, "two"),
        op(Opcode::Pop),
        push(0.0),
        op(Opcode::Return),
        label("one"),
        push(10.0),
        op(Opcode::Return),
        label("two"),
        push(20.0),
        op(Opcode::Return),
    ];
    let optimized = assert_equivalent(switch(2.0), Outcome::Returned(20.0));
    assert_eq!(instructions(&optimized), [
        Opcode::PushFloat,
        Opcode::SwitchOnFloat,
        Opcode::SwitchOnFloat,
        Opcode::Pop,
        Opcode::ReturnFloat,
        Opcode::ReturnFloat,
        Opcode::ReturnFloat,
    ]);
    assert_equivalent(switch(1.0), Outcome::Returned(10.0));
    assert_equivalent(switch(3.0), Outcome::Returned(0.0));
}

#[test]
fn test_threading_is_transitive() {
    let items = vec![
        push(1.0),
        jump(Opcode::Jump, "L1"),
        label("L3"),
        op(Opcode::Return),
        label("L2"),
        jump(Opcode::Jump, "L3"),
        label("L1"),
        jump(Opcode::Jump, "L2"),
    ];

    let mut cfg = build_cfg(items.clone()).unwrap();
    let entry = cfg.entry();
    assert!(thread_jumps(&mut cfg, 64).unwrap() >= 1);
    let last = cfg.block(entry).unwrap().instructions().last().unwrap();
    assert_eq!(last.label_target(), Some("L3"));

    let optimized = optimize(items, &OptimizerSettings::default()).unwrap();
    assert_eq!(instructions(&optimized), [Opcode::ReturnFloat]);
    assert_eq!(interpret(&optimized, MAX_STEPS), Ok(Outcome::Returned(1.0)));
}

#[test]
fn test_unreachable_removal_is_idempotent() {
    let items = vec![
        push(1.0),
        op(Opcode::Return),
        push(2.0),
        jump(Opcode::Jump, "dead"),
        label("dead"),
        push(3.0),
        op(Opcode::Return),
    ];
    let mut cfg = build_cfg(items).unwrap();
    assert_eq!(remove_unreachable(&mut cfg).unwrap(), 2);
    let once = relinearize(&cfg);
    assert_eq!(remove_unreachable(&mut cfg).unwrap(), 0);
    assert_eq!(relinearize(&cfg), once);
    assert_eq!(instructions(&once), [Opcode::PushFloat, Opcode::Return]);
}
