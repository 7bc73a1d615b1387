//! Fixed-point simplification of a [`Cfg`].
//!
//! Every pass preserves the positional order of the surviving items, so relinearizing an optimized graph only ever
//! drops items (dead blocks, redundant jumps, unused labels) or retargets unconditional jumps. Passes recompute the
//! graph's edges after each rewrite.

use std::collections::HashSet;

use tracing::{debug, instrument, trace, warn};

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use crate::annotated::{AnnotatedItem, Instruction};
use crate::cfg::{build_cfg, BlockId, Cfg};
use crate::error::CfgError;
use crate::opcode::Opcode;
use crate::peephole::peephole;

/// Settings for [`optimize`] and [`optimize_cfg`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OptimizerSettings {
    /// Maximum number of rounds the passes are repeated for before giving up on a fixed point (default `64`).
    pub max_iterations: usize,
    /// Retarget jumps that land on a block holding nothing but another jump (default `true`).
    pub thread_jumps: bool,
    /// Fold linear chains of blocks together (default `true`).
    pub merge_blocks: bool,
    /// Remove labels nothing refers to once the graph is final (default `true`).
    pub remove_labels: bool,
    /// Run the [`peephole`] rewrites over the relinearized procedure in [`optimize`] (default `true`).
    pub peephole: bool,
}
impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 64,
            thread_jumps: true,
            merge_blocks: true,
            remove_labels: true,
            peephole: true,
        }
    }
}

/// What [`optimize_cfg`] changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub rounds: usize,
    pub removed_blocks: usize,
    pub removed_jumps: usize,
    pub threaded_jumps: usize,
    pub merged_blocks: usize,
    pub forwarded_labels: usize,
    pub removed_labels: usize,
}

/// Builds a graph from `items`, optimizes it, and linearizes it again.
/// With [`OptimizerSettings::peephole`] set, the [`peephole`] rewrites then run over the result.
pub fn optimize(items: Vec<AnnotatedItem>, settings: &OptimizerSettings) -> Result<Vec<AnnotatedItem>, CfgError> {
    let mut cfg = build_cfg(items)?;
    optimize_cfg(&mut cfg, settings)?;
    let mut res = relinearize(&cfg);
    if settings.peephole {
        peephole(&mut res);
    }
    Ok(res)
}

/// Emits the items of every block in block order.
pub fn relinearize(cfg: &Cfg) -> Vec<AnnotatedItem> {
    cfg.relinearize()
}

/// Runs every enabled pass until none of them changes anything, then renumbers the blocks and cleans up labels.
#[instrument(skip_all)]
pub fn optimize_cfg(cfg: &mut Cfg, settings: &OptimizerSettings) -> Result<OptimizeStats, CfgError> {
    let before = cfg.len();
    let mut stats = OptimizeStats::default();

    let mut stable = false;
    while stats.rounds < settings.max_iterations {
        stats.rounds += 1;

        let removed_blocks = remove_unreachable(cfg)?;
        let removed_jumps = remove_jumps_to_next(cfg)?;
        let threaded_jumps = if settings.thread_jumps { thread_jumps(cfg, settings.max_iterations)? } else { 0 };
        let merged_blocks = if settings.merge_blocks { merge_blocks(cfg)? } else { 0 };
        trace!(round = stats.rounds, removed_blocks, removed_jumps, threaded_jumps, merged_blocks, "optimizer round");

        stats.removed_blocks += removed_blocks;
        stats.removed_jumps += removed_jumps;
        stats.threaded_jumps += threaded_jumps;
        stats.merged_blocks += merged_blocks;
        if removed_blocks + removed_jumps + threaded_jumps + merged_blocks == 0 {
            stable = true;
            break;
        }
    }
    if !stable {
        warn!(rounds = stats.rounds, "optimizer stopped before reaching a fixed point");
    }

    cfg.renumber()?;
    if settings.remove_labels {
        stats.forwarded_labels = forward_aliases(cfg)?;
        stats.removed_labels = remove_labels(cfg)?;
    }

    debug!(before, after = cfg.len(), ?stats, "optimized control flow graph");
    Ok(stats)
}

/// Deletes every block other than the entry that has no predecessors, until there are none left.
pub fn remove_unreachable(cfg: &mut Cfg) -> Result<usize, CfgError> {
    let mut removed = 0;
    loop {
        let entry = cfg.entry();
        let dead: Vec<BlockId> = cfg.blocks().filter(|x| x.id != entry && x.predecessors.is_empty()).map(|x| x.id).collect();
        if dead.is_empty() {
            return Ok(removed);
        }
        for id in dead {
            cfg.remove(id);
            removed += 1;
        }
        cfg.compute_edges()?;
    }
}

/// Deletes unconditional jumps to the block that follows anyway.
pub fn remove_jumps_to_next(cfg: &mut Cfg) -> Result<usize, CfgError> {
    let mut doomed = vec![];
    for block in cfg.blocks() {
        let last = block.items.iter().rposition(|x| x.as_instruction().is_some());
        let index = match last {
            Some(i) => i,
            None => continue,
        };
        let ins = match &block.items[index] {
            AnnotatedItem::Instruction(x) if x.opcode == Opcode::Jump => x,
            _ => continue,
        };
        let target = ins.label_target().and_then(|x| cfg.resolve(x));
        if target.is_some() && target == cfg.next_block(block.id) {
            doomed.push((block.id, index));
        }
    }

    for (id, index) in doomed.iter() {
        if let Some(block) = cfg.block_mut(*id) {
            block.items.remove(*index);
        }
    }
    if !doomed.is_empty() {
        cfg.compute_edges()?;
    }
    Ok(doomed.len())
}

/// The jump a block consists of, ignoring its labels.
fn lone_jump(cfg: &Cfg, id: BlockId) -> Option<&Instruction> {
    let block = cfg.block(id)?;
    let mut rest = block.items.iter().filter(|x| !matches!(x, AnnotatedItem::Label(_)));
    match (rest.next(), rest.next()) {
        (Some(AnnotatedItem::Instruction(ins)), None) if ins.opcode == Opcode::Jump => Some(ins),
        _ => None,
    }
}

/// Retargets each unconditional jump past any chain of blocks that only jump onwards.
///
/// Chains are followed for at most `max_depth` links and never around a cycle.
pub fn thread_jumps(cfg: &mut Cfg, max_depth: usize) -> Result<usize, CfgError> {
    let mut rewrites = vec![];
    for block in cfg.blocks() {
        for (index, item) in block.items.iter().enumerate() {
            let ins = match item {
                AnnotatedItem::Instruction(x) if x.opcode == Opcode::Jump => x,
                _ => continue,
            };
            let original = match ins.label_target() {
                Some(x) => x,
                None => continue,
            };

            let mut label = original;
            let mut visited = HashSet::from([block.id]);
            for _ in 0..max_depth {
                let next = cfg.resolve(label)
                    .filter(|x| visited.insert(*x))
                    .and_then(|x| lone_jump(cfg, x))
                    .and_then(Instruction::label_target);
                match next {
                    Some(x) => label = x,
                    None => break,
                }
            }
            if label != original {
                rewrites.push((block.id, index, label.to_owned()));
            }
        }
    }

    for (id, index, label) in rewrites.iter() {
        if let Some(AnnotatedItem::Instruction(ins)) = cfg.block_mut(*id).and_then(|x| x.items.get_mut(*index)) {
            ins.set_label_target(label);
        }
    }
    if !rewrites.is_empty() {
        cfg.compute_edges()?;
    }
    Ok(rewrites.len())
}

/// Folds linear chains of blocks together.
///
/// A block `B` is appended onto its predecessor `P` when `P` directly precedes it, `P` only flows into `B`, and `B`
/// only flows into the block directly after it, which has no other predecessor. An entry block without
/// predecessors absorbs its successor instead if that successor directly follows it and has no other predecessor.
/// A block is never absorbed while one of its labels is still referenced.
pub fn merge_blocks(cfg: &mut Cfg) -> Result<usize, CfgError> {
    let mut merged = 0;
    while let Some((into, from)) = find_merge(cfg) {
        trace!(%into, %from, "merging blocks");
        let absorbed = match cfg.remove(from) {
            Some(x) => x,
            None => break,
        };
        if let Some(block) = cfg.block_mut(into) {
            block.items.extend(absorbed.items);
        }
        cfg.compute_edges()?;
        merged += 1;
    }
    Ok(merged)
}

fn find_merge(cfg: &Cfg) -> Option<(BlockId, BlockId)> {
    let referenced = cfg.referenced_labels();
    let free = |id: BlockId| cfg.block(id).is_some_and(|x| x.labels().all(|l| !referenced.contains(l)));
    let single_pred = |id: BlockId, pred: BlockId| cfg.block(id).is_some_and(|x| x.predecessors.len() == 1 && x.predecessors.contains(&pred));

    for block in cfg.blocks() {
        let id = block.id;
        let next = cfg.next_block(id);

        if id == cfg.entry() {
            if let (true, [succ]) = (block.predecessors.is_empty(), block.successors.as_slice()) {
                if Some(*succ) == next && single_pred(*succ, id) && free(*succ) {
                    return Some((id, *succ));
                }
            }
            continue;
        }

        let (pred, succ) = match (block.predecessors.iter().next(), block.successors.as_slice()) {
            (Some(pred), [succ]) if block.predecessors.len() == 1 => (*pred, *succ),
            _ => continue,
        };
        let pred_flows_here = cfg.block(pred).is_some_and(|x| x.successors.as_slice() == [id]);
        if cfg.prev_block(id) == Some(pred) && pred_flows_here && Some(succ) == next && single_pred(succ, id) && free(id) {
            return Some((pred, id));
        }
    }
    None
}

/// Points jumps at an alias label to the label it aliases, if that label still exists.
pub fn forward_aliases(cfg: &mut Cfg) -> Result<usize, CfgError> {
    let aliases = cfg.aliases().clone();
    let placed: HashSet<String> = cfg.blocks().flat_map(|x| x.labels()).map(str::to_owned).collect();

    let mut forwarded = 0;
    for id in cfg.ids() {
        let block = match cfg.block_mut(id) {
            Some(x) => x,
            None => continue,
        };
        for item in block.items.iter_mut() {
            if let AnnotatedItem::Instruction(ins) = item {
                let primary = ins.label_target().and_then(|x| aliases.get(x)).filter(|x| placed.contains(x.as_str())).cloned();
                if let Some(primary) = primary {
                    ins.set_label_target(&primary);
                    forwarded += 1;
                }
            }
        }
    }
    if forwarded != 0 {
        cfg.compute_edges()?;
    }
    Ok(forwarded)
}

/// Removes every label no instruction refers to.
pub fn remove_labels(cfg: &mut Cfg) -> Result<usize, CfgError> {
    let referenced = cfg.referenced_labels();
    let mut removed = 0;
    for id in cfg.ids() {
        if let Some(block) = cfg.block_mut(id) {
            let len = block.items.len();
            block.items.retain(|x| x.as_label().map_or(true, |l| referenced.contains(l)));
            removed += len - block.items.len();
        }
    }
    if removed != 0 {
        cfg.compute_edges()?;
    }
    Ok(removed)
}

#[cfg(test)]
use crate::annotated::Operand;

#[cfg(test)]
fn jump(opcode: Opcode, label: &str) -> AnnotatedItem {
    Instruction::new(opcode, vec![Operand::label(label)]).unwrap().into()
}
#[cfg(test)]
fn op(opcode: Opcode) -> AnnotatedItem {
    Instruction::simple(opcode).unwrap().into()
}
#[cfg(test)]
fn push(value: f32) -> AnnotatedItem {
    Instruction::new(Opcode::PushFloat, vec![Operand::Float(value)]).unwrap().into()
}

#[cfg(test)]
fn cfg_only() -> OptimizerSettings {
    OptimizerSettings { peephole: false, ..Default::default() }
}

#[test]
fn test_settings_default() {
    let settings = OptimizerSettings::default();
    assert_eq!(settings.max_iterations, 64);
    assert!(settings.thread_jumps && settings.merge_blocks && settings.remove_labels && settings.peephole);
}

#[test]
fn test_remove_unreachable() {
    let mut cfg = build_cfg(vec![
        push(1.0),
        op(Opcode::Return),
        push(2.0),
        op(Opcode::Return),
        AnnotatedItem::label("dead"),
        push(3.0),
        jump(Opcode::Jump, "dead2"),
        AnnotatedItem::label("dead2"),
        op(Opcode::Return),
    ]).unwrap();
    assert_eq!(cfg.len(), 4);
    assert_eq!(remove_unreachable(&mut cfg).unwrap(), 3);
    assert_eq!(cfg.len(), 1);
    assert_eq!(remove_unreachable(&mut cfg).unwrap(), 0);
}

#[test]
fn test_entry_without_predecessors_survives() {
    let mut cfg = build_cfg(vec![op(Opcode::Return)]).unwrap();
    assert_eq!(remove_unreachable(&mut cfg).unwrap(), 0);
    assert_eq!(cfg.len(), 1);

    let empty = optimize(vec![], &OptimizerSettings::default()).unwrap();
    assert!(empty.is_empty());
}

#[test]
fn test_jump_to_next_removed() {
    let items = vec![
        push(1.0),
        jump(Opcode::Jump, "next"),
        AnnotatedItem::label("next"),
        op(Opcode::Return),
    ];
    assert_eq!(optimize(items.clone(), &cfg_only()).unwrap(), [push(1.0), op(Opcode::Return)]);

    let fused = optimize(items, &OptimizerSettings::default()).unwrap();
    assert_eq!(fused, [Instruction::new(Opcode::ReturnFloat, vec![Operand::Float(1.0)]).unwrap().into()]);
}

#[test]
fn test_threading_stops_at_cycles() {
    let mut cfg = build_cfg(vec![
        jump(Opcode::Jump, "a"),
        AnnotatedItem::label("a"),
        jump(Opcode::Jump, "b"),
        AnnotatedItem::label("b"),
        jump(Opcode::Jump, "a"),
    ]).unwrap();
    thread_jumps(&mut cfg, 64).unwrap();
    let targets: Vec<_> = cfg.blocks().flat_map(|x| x.instructions()).filter_map(|x| x.label_target()).collect();
    assert_eq!(targets, ["a", "a", "b"]);

    let out = optimize(vec![
        jump(Opcode::Jump, "spin"),
        AnnotatedItem::label("spin"),
        jump(Opcode::Jump, "spin"),
    ], &OptimizerSettings::default()).unwrap();
    assert_eq!(out, [AnnotatedItem::label("spin"), jump(Opcode::Jump, "spin")]);
}

#[test]
fn test_disabled_passes() {
    let items = vec![
        push(1.0),
        jump(Opcode::JumpIfFalse, "a"),
        jump(Opcode::Jump, "b"),
        AnnotatedItem::label("a"),
        jump(Opcode::Jump, "b"),
        AnnotatedItem::label("b"),
        op(Opcode::Return),
    ];
    let settings = OptimizerSettings { thread_jumps: false, merge_blocks: false, remove_labels: false, ..Default::default() };
    let mut cfg = build_cfg(items.clone()).unwrap();
    let stats = optimize_cfg(&mut cfg, &settings).unwrap();
    assert_eq!(stats.threaded_jumps, 0);
    assert_eq!(stats.merged_blocks, 0);
    assert_eq!(stats.removed_labels, 0);
    assert_eq!(cfg.relinearize(), [
        push(1.0),
        jump(Opcode::JumpIfFalse, "a"),
        jump(Opcode::Jump, "b"),
        AnnotatedItem::label("a"),
        AnnotatedItem::label("b"),
        op(Opcode::Return),
    ]);
}

#[test]
fn test_alias_forwarding() {
    let out = optimize(vec![
        push(1.0),
        jump(Opcode::JumpIfFalse, "second"),
        push(2.0),
        op(Opcode::Return),
        AnnotatedItem::label("first"),
        AnnotatedItem::label("second"),
        push(3.0),
        op(Opcode::Return),
    ], &cfg_only()).unwrap();
    assert_eq!(out, [
        push(1.0),
        jump(Opcode::JumpIfFalse, "first"),
        push(2.0),
        op(Opcode::Return),
        AnnotatedItem::label("first"),
        push(3.0),
        op(Opcode::Return),
    ]);
}
