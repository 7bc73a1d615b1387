use std::collections::HashMap;

use crate::annotated::*;
use crate::opcode::Opcode;
use crate::reference::Reference;

mod preprocessor;
mod cfg;
mod bytecode;

pub(crate) fn ins(opcode: Opcode, operands: Vec<Operand>) -> AnnotatedItem {
    Instruction::new(opcode, operands).unwrap().into()
}
pub(crate) fn op(opcode: Opcode) -> AnnotatedItem {
    ins(opcode, vec![])
}
pub(crate) fn push(value: f32) -> AnnotatedItem {
    ins(Opcode::PushFloat, vec![Operand::Float(value)])
}
pub(crate) fn jump(opcode: Opcode, label: &str) -> AnnotatedItem {
    ins(opcode, vec![Operand::label(label)])
}
pub(crate) fn label(name: &str) -> AnnotatedItem {
    AnnotatedItem::label(name)
}
pub(crate) fn local(index: u8) -> Operand {
    Operand::Reference(Reference::Local(index))
}
pub(crate) fn try_catch(catch: &str) -> AnnotatedItem {
    ins(Opcode::Try, vec![Operand::label(catch), Operand::Reference(Reference::Local(0))])
}

/// How a run of [`interpret`] ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Outcome {
    Returned(f32),
    /// An exception escaped every try block.
    Threw(f32),
    /// Execution ran past the last item.
    Finished,
}

struct TryFrame {
    catch: usize,
    stack_len: usize,
    keeps_value: bool,
}

/// Runs a procedure made of the opcodes the control flow tests use.
///
/// Values are floats and falsy means zero. Null is zero, as is any local that was never assigned. `Append` adds to
/// the stored value. A caught exception is pushed onto the stack unless the try block was opened with `TryNoValue`.
/// Fails on stack underflow, unsupported opcodes or operands, unknown labels, or after `max_steps`.
pub(crate) fn interpret(items: &[AnnotatedItem], max_steps: usize) -> Result<Outcome, String> {
    let mut labels = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        if let Some(name) = item.as_label() {
            labels.insert(name.to_owned(), i);
        }
    }
    let target = |ins: &Instruction| -> Result<usize, String> {
        let name = ins.label_target().ok_or_else(|| format!("{ins} has no label"))?;
        labels.get(name).copied().ok_or_else(|| format!("unknown label {name}"))
    };
    let float = |operand: Option<&Operand>| match operand {
        Some(Operand::Float(x)) => Ok(*x),
        x => Err(format!("expected a float, got {x:?}")),
    };
    let reference = |operand: Option<&Operand>| match operand {
        Some(Operand::Reference(x @ Reference::Local(_))) => Ok(x.clone()),
        x => Err(format!("expected a local, got {x:?}")),
    };

    let mut stack: Vec<f32> = vec![];
    let mut locals: HashMap<Reference, f32> = HashMap::new();
    let mut tries: Vec<TryFrame> = vec![];
    let mut pos = 0;
    let mut steps = 0;
    macro_rules! pop {
        () => { stack.pop().ok_or_else(|| format!("stack underflow at item {pos}"))? };
    }
    macro_rules! load {
        ($r:expr) => { locals.get(&$r).copied().unwrap_or(0.0) };
    }

    while pos < items.len() {
        steps += 1;
        if steps > max_steps {
            return Err(format!("exceeded {max_steps} steps"));
        }

        let ins = match &items[pos] {
            AnnotatedItem::Instruction(x) => x,
            _ => {
                pos += 1;
                continue;
            }
        };
        let arg = move |i: usize| ins.operands.get(i);
        let mut next = pos + 1;
        match ins.opcode {
            Opcode::PushFloat => stack.push(float(arg(0))?),
            Opcode::PushNull => stack.push(0.0),
            Opcode::PushReferenceValue => stack.push(load!(reference(arg(0))?)),
            Opcode::PushNFloats => for x in ins.operands[1..].iter() { stack.push(float(Some(x))?) },
            Opcode::PushNRefs => for x in ins.operands[1..].iter() { stack.push(load!(reference(Some(x))?)) },
            Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::CompareLessThan | Opcode::CompareEquals => {
                let b = pop!();
                let a = pop!();
                stack.push(match ins.opcode {
                    Opcode::Add => a + b,
                    Opcode::Subtract => a - b,
                    Opcode::Multiply => a * b,
                    Opcode::CompareLessThan => if a < b { 1.0 } else { 0.0 },
                    _ => if a == b { 1.0 } else { 0.0 },
                });
            }
            Opcode::Pop => { pop!(); }
            Opcode::Assign | Opcode::AssignNoPush => {
                let value = pop!();
                locals.insert(reference(arg(0))?, value);
                if ins.opcode == Opcode::Assign {
                    stack.push(value);
                }
            }
            Opcode::Append | Opcode::AppendNoPush => {
                let r = reference(arg(0))?;
                let value = load!(r) + pop!();
                locals.insert(r, value);
                if ins.opcode == Opcode::Append {
                    stack.push(value);
                }
            }
            Opcode::NullRef => { locals.insert(reference(arg(0))?, 0.0); }
            Opcode::PushFloatAssign => { locals.insert(reference(arg(1))?, float(arg(0))?); }
            Opcode::NPushFloatAssign => for pair in ins.operands[1..].chunks(2) {
                locals.insert(reference(pair.get(1))?, float(pair.first())?);
            }
            Opcode::Jump => next = target(ins)?,
            Opcode::JumpIfFalse => if pop!() == 0.0 { next = target(ins)? },
            Opcode::JumpIfTrue => if pop!() != 0.0 { next = target(ins)? },
            Opcode::JumpIfReferenceFalse => if load!(reference(arg(0))?) == 0.0 { next = target(ins)? },
            Opcode::SwitchCase | Opcode::SwitchOnFloat => {
                let case = if ins.opcode == Opcode::SwitchCase { pop!() } else { float(arg(0))? };
                if stack.last() == Some(&case) {
                    pop!();
                    next = target(ins)?;
                }
            }
            Opcode::Return => return Ok(Outcome::Returned(pop!())),
            Opcode::ReturnFloat => return Ok(Outcome::Returned(float(arg(0))?)),
            Opcode::ReturnReferenceValue => return Ok(Outcome::Returned(load!(reference(arg(0))?))),
            Opcode::Try | Opcode::TryNoValue => tries.push(TryFrame { catch: target(ins)?, stack_len: stack.len(), keeps_value: ins.opcode == Opcode::Try }),
            Opcode::EndTry => { tries.pop(); }
            Opcode::Throw => {
                let value = pop!();
                let frame = match tries.pop() {
                    Some(x) => x,
                    None => return Ok(Outcome::Threw(value)),
                };
                stack.truncate(frame.stack_len);
                if frame.keeps_value {
                    stack.push(value);
                }
                next = frame.catch;
            }
            _ => return Err(format!("unsupported instruction {ins}")),
        }
        pos = next;
    }
    Ok(Outcome::Finished)
}

#[test]
fn test_interpret_basics() {
    let items = vec![push(2.0), push(5.0), op(Opcode::Subtract), op(Opcode::Return)];
    assert_eq!(interpret(&items, 100), Ok(Outcome::Returned(-3.0)));

    let items = vec![push(1.0), op(Opcode::Pop)];
    assert_eq!(interpret(&items, 100), Ok(Outcome::Finished));

    let items = vec![op(Opcode::Add)];
    assert!(interpret(&items, 100).is_err());

    let items = vec![label("spin"), jump(Opcode::Jump, "spin")];
    assert!(interpret(&items, 100).is_err());
}

#[test]
fn test_interpret_exceptions() {
    let items = vec![
        try_catch("catch"),
        push(9.0),
        push(4.0),
        op(Opcode::Throw),
        label("catch"),
        op(Opcode::Return),
    ];
    assert_eq!(interpret(&items, 100), Ok(Outcome::Returned(4.0)));

    let items = vec![
        jump(Opcode::TryNoValue, "catch"),
        push(4.0),
        op(Opcode::EndTry),
        push(6.0),
        op(Opcode::Throw),
        label("catch"),
        push(0.0),
        op(Opcode::Return),
    ];
    assert_eq!(interpret(&items, 100), Ok(Outcome::Threw(6.0)));
}

#[test]
fn test_interpret_locals() {
    let items = vec![
        push(4.0),
        ins(Opcode::AssignNoPush, vec![local(0)]),
        push(3.0),
        ins(Opcode::Append, vec![local(0)]),
        ins(Opcode::PushReferenceValue, vec![local(0)]),
        op(Opcode::Multiply),
        ins(Opcode::PushReferenceValue, vec![local(1)]),
        op(Opcode::Add),
        op(Opcode::Return),
    ];
    assert_eq!(interpret(&items, 100), Ok(Outcome::Returned(49.0)));

    let items = vec![
        ins(Opcode::NPushFloatAssign, vec![Operand::Int(2), Operand::Float(2.0), local(0), Operand::Float(5.0), local(1)]),
        ins(Opcode::PushNRefs, vec![Operand::Int(2), local(0), local(1)]),
        op(Opcode::Subtract),
        ins(Opcode::ReturnFloat, vec![Operand::Float(1.0)]),
    ];
    assert_eq!(interpret(&items, 100), Ok(Outcome::Returned(1.0)));

    let items = vec![ins(Opcode::PushReferenceValue, vec![Operand::Reference(Reference::Global(3))])];
    assert!(interpret(&items, 100).is_err());
}
