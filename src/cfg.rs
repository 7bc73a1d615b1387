//! Control-flow graphs over annotated bytecode.
//!
//! Blocks live in an arena indexed by [`BlockId`]. A removed block leaves a hole, so ids stay stable while the
//! optimizer rewrites the graph; [`Cfg::renumber`] compacts them again. The positional order of blocks is the order
//! of their ids, which is also the order [`Cfg::relinearize`] emits them in.
//!
//! Edges are never edited by hand. They are derived from the instructions of each block by [`Cfg::compute_edges`],
//! which every pass calls after it rewrites instructions or moves them between blocks.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use compact_str::CompactString;
use tracing::{debug, instrument};

use crate::annotated::{AnnotatedItem, Instruction, Label, Operand};
use crate::error::CfgError;
use crate::opcode::{ControlFlow, Opcode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);
impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A maximal straight-line run of items with a single entry and a single exit.
#[derive(Clone, Debug, PartialEq)]
pub struct BasicBlock {
    pub id: BlockId,
    pub items: Vec<AnnotatedItem>,
    /// Every block with an edge into this one, including exceptional edges.
    pub predecessors: BTreeSet<BlockId>,
    /// Normal successors. A conditional jump lists its target first and its fallthrough second.
    pub successors: Vec<BlockId>,
    /// The innermost catch block covering an instruction in this block.
    /// An `EndTry` closes its region before it is looked at, so it is never covered by the region it ends.
    pub exception_successor: Option<BlockId>,
}
impl BasicBlock {
    fn new(id: BlockId) -> Self {
        Self { id, items: vec![], predecessors: BTreeSet::new(), successors: vec![], exception_successor: None }
    }
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.items.iter().filter_map(AnnotatedItem::as_instruction)
    }
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(AnnotatedItem::as_label)
    }
    pub fn has_instructions(&self) -> bool {
        self.instructions().next().is_some()
    }
    /// Every successor, normal and exceptional.
    pub fn all_successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.successors.iter().copied().chain(self.exception_successor)
    }
}

#[derive(Clone, Debug)]
pub struct Cfg {
    blocks: Vec<Option<BasicBlock>>,
    labels: HashMap<CompactString, BlockId>,
    /// Labels that directly followed another label, mapped to that label.
    aliases: HashMap<CompactString, CompactString>,
}

/// Splits `items` into basic blocks and resolves the edges between them.
///
/// A new block starts at every label that follows an instruction, and after every instruction whose opcode
/// splits basic blocks. A label that follows another label with no instruction in between joins its block and
/// is recorded as an alias.
#[instrument(skip_all, fields(items = items.len()))]
pub fn build_cfg(items: Vec<AnnotatedItem>) -> Result<Cfg, CfgError> {
    let mut depth = 0usize;
    for ins in items.iter().filter_map(AnnotatedItem::as_instruction) {
        match ins.opcode {
            Opcode::Try | Opcode::TryNoValue => depth += 1,
            Opcode::EndTry => depth = depth.checked_sub(1).ok_or(CfgError::UnbalancedTry)?,
            _ => (),
        }
    }

    let mut blocks = vec![];
    let mut aliases = HashMap::new();
    let mut seen: HashSet<CompactString> = HashSet::new();

    let mut current = BasicBlock::new(BlockId(0));
    let mut primary: Option<CompactString> = None;
    for item in items {
        match item {
            AnnotatedItem::Label(label) => {
                if !seen.insert(label.name.clone()) {
                    return Err(CfgError::DuplicateLabel { label: label.name });
                }
                if current.has_instructions() {
                    let id = BlockId(blocks.len() + 1);
                    blocks.push(Some(std::mem::replace(&mut current, BasicBlock::new(id))));
                    primary = None;
                }
                match &primary {
                    Some(first) => { aliases.insert(label.name.clone(), first.clone()); }
                    None => primary = Some(label.name.clone()),
                }
                current.items.push(AnnotatedItem::Label(label));
            }
            AnnotatedItem::Instruction(ins) => {
                let splits = ins.opcode.metadata().splits_basic_block;
                current.items.push(AnnotatedItem::Instruction(ins));
                if splits {
                    let id = BlockId(blocks.len() + 1);
                    blocks.push(Some(std::mem::replace(&mut current, BasicBlock::new(id))));
                    primary = None;
                }
            }
            item @ AnnotatedItem::LocalVariable(_) => current.items.push(item),
        }
    }
    if !current.items.is_empty() || blocks.is_empty() {
        blocks.push(Some(current));
    }

    let mut cfg = Cfg { blocks, labels: HashMap::new(), aliases };
    cfg.compute_edges()?;
    debug!(blocks = cfg.len(), aliases = cfg.aliases.len(), "built control flow graph");
    Ok(cfg)
}

impl Cfg {
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }
    /// Live blocks in positional order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter().flatten()
    }
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.0).and_then(Option::as_ref)
    }
    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(id.0).and_then(Option::as_mut)
    }
    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.blocks().count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn ids(&self) -> Vec<BlockId> {
        self.blocks().map(|x| x.id).collect()
    }
    pub fn aliases(&self) -> &HashMap<CompactString, CompactString> {
        &self.aliases
    }

    /// Finds the block a label lives in, going through the alias table if needed.
    pub fn resolve(&self, label: &str) -> Option<BlockId> {
        self.labels.get(label).or_else(|| self.aliases.get(label).and_then(|x| self.labels.get(x))).copied()
    }
    /// The live block positionally after `id`.
    pub fn next_block(&self, id: BlockId) -> Option<BlockId> {
        self.blocks.iter().skip(id.0 + 1).flatten().next().map(|x| x.id)
    }
    /// The live block positionally before `id`.
    pub fn prev_block(&self, id: BlockId) -> Option<BlockId> {
        self.blocks.iter().take(id.0).flatten().last().map(|x| x.id)
    }

    pub(crate) fn remove(&mut self, id: BlockId) -> Option<BasicBlock> {
        self.blocks.get_mut(id.0).and_then(Option::take)
    }

    /// Labels that some instruction in the graph jumps to or uses as a catch target.
    pub fn referenced_labels(&self) -> HashSet<CompactString> {
        let mut res = HashSet::new();
        for ins in self.blocks().flat_map(BasicBlock::instructions) {
            if let Some(label) = ins.label_target() {
                res.insert(CompactString::from(label));
                if let Some(primary) = self.aliases.get(label) {
                    res.insert(primary.clone());
                }
            }
        }
        res
    }

    /// Recomputes the label map and all edges from the current instructions.
    pub fn compute_edges(&mut self) -> Result<(), CfgError> {
        self.labels.clear();
        for block in self.blocks.iter().flatten() {
            for label in block.labels() {
                self.labels.insert(label.into(), block.id);
            }
        }

        let order = self.ids();
        let mut try_stack: Vec<BlockId> = vec![];
        let mut edges = Vec::with_capacity(order.len());
        for (pos, id) in order.iter().enumerate() {
            let block = match self.block(*id) {
                Some(x) => x,
                None => continue,
            };

            let mut successors = vec![];
            let mut exception_successor = None;
            let mut severed = false;
            for ins in block.instructions() {
                match ins.opcode {
                    Opcode::Try | Opcode::TryNoValue => try_stack.push(self.jump_target(ins)?),
                    // an unmatched EndTry can only appear once its Try was removed as unreachable
                    Opcode::EndTry => { try_stack.pop(); }
                    _ => (),
                }
                // anything after a jump, return or throw is dead until the next block
                if severed { continue }
                if let Some(catch) = try_stack.last() {
                    exception_successor = Some(*catch);
                }
                match ControlFlow::of(ins.opcode)? {
                    None => (),
                    Some(ControlFlow::Jump) => {
                        successors.push(self.jump_target(ins)?);
                        severed = true;
                    }
                    Some(ControlFlow::ConditionalJump) => successors.push(self.jump_target(ins)?),
                    Some(ControlFlow::Return) => severed = true,
                    Some(ControlFlow::Throw) => {
                        successors.extend(try_stack.last().copied());
                        severed = true;
                    }
                }
            }
            if !severed {
                successors.extend(order.get(pos + 1).copied());
            }
            edges.push((*id, successors, exception_successor));
        }

        for block in self.blocks.iter_mut().flatten() {
            block.predecessors.clear();
        }
        for (id, successors, exception_successor) in edges {
            for succ in successors.iter().copied().chain(exception_successor) {
                if let Some(target) = self.block_mut(succ) {
                    target.predecessors.insert(id);
                }
            }
            if let Some(block) = self.block_mut(id) {
                block.successors = successors;
                block.exception_successor = exception_successor;
            }
        }
        Ok(())
    }

    fn jump_target(&self, ins: &Instruction) -> Result<BlockId, CfgError> {
        match ins.label_operand() {
            Some(Operand::Label(label)) => self.resolve(label).ok_or_else(|| CfgError::UnresolvedLabel { label: label.clone(), line: ins.line() }),
            _ => Err(CfgError::MissingLabelOperand { opcode: ins.opcode.name(), line: ins.line() }),
        }
    }

    /// Reassigns block ids to a contiguous range starting at the entry, keeping their order.
    pub fn renumber(&mut self) -> Result<(), CfgError> {
        let blocks: Vec<Option<BasicBlock>> = std::mem::take(&mut self.blocks).into_iter()
            .flatten()
            .enumerate()
            .map(|(i, mut block)| {
                block.id = BlockId(i);
                Some(block)
            })
            .collect();
        self.blocks = blocks;
        self.compute_edges()
    }

    /// Concatenates the items of every live block in positional order.
    pub fn relinearize(&self) -> Vec<AnnotatedItem> {
        self.blocks().flat_map(|x| x.items.iter().cloned()).collect()
    }
    pub fn into_items(self) -> Vec<AnnotatedItem> {
        self.blocks.into_iter().flatten().flat_map(|x| x.items).collect()
    }

    /// Writes a listing of every block with its items and edges.
    pub fn dump(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        fn ids<I: Iterator<Item = BlockId>>(iter: I) -> String {
            iter.map(|x| x.to_string()).collect::<Vec<_>>().join(", ")
        }

        for block in self.blocks() {
            writeln!(f, "Block {}:", block.id)?;
            for item in block.items.iter() {
                match item {
                    AnnotatedItem::Label(Label { name }) => writeln!(f, "  {name}:")?,
                    x => writeln!(f, "    {x}")?,
                }
            }
            writeln!(f, "  Successors: {}", ids(block.successors.iter().copied()))?;
            writeln!(f, "  Predecessors: {}", ids(block.predecessors.iter().copied()))?;
            writeln!(f, "  Exception successors: {}", ids(block.exception_successor.into_iter()))?;
        }
        Ok(())
    }
}

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

#[test]
fn test_split_and_edges() {
    let cfg = build_cfg(vec![
        push(1.0),
        jump(Opcode::JumpIfFalse, "else"),
        push(2.0),
        jump(Opcode::Jump, "end"),
        AnnotatedItem::label("else"),
        push(3.0),
        AnnotatedItem::label("end"),
        op(Opcode::Return),
    ]).unwrap();

    assert_eq!(cfg.len(), 4);
    let b = |i| cfg.block(BlockId(i)).unwrap();
    assert_eq!(b(0).successors, [BlockId(2), BlockId(1)]);
    assert_eq!(b(1).successors, [BlockId(3)]);
    assert_eq!(b(2).successors, [BlockId(3)]);
    assert!(b(3).successors.is_empty());
    assert_eq!(b(3).predecessors.iter().copied().collect::<Vec<_>>(), [BlockId(1), BlockId(2)]);
    assert!(b(0).predecessors.is_empty());
    assert_eq!(cfg.resolve("else"), Some(BlockId(2)));
}

#[test]
fn test_label_aliases() {
    let cfg = build_cfg(vec![
        jump(Opcode::Jump, "second"),
        AnnotatedItem::label("first"),
        AnnotatedItem::label("second"),
        op(Opcode::Return),
    ]).unwrap();
    assert_eq!(cfg.len(), 2);
    assert_eq!(cfg.aliases().get("second").map(|x| x.as_str()), Some("first"));
    assert_eq!(cfg.resolve("second"), Some(BlockId(1)));
    assert_eq!(cfg.block(BlockId(0)).unwrap().successors, [BlockId(1)]);
}

#[test]
fn test_label_errors() {
    let dup = build_cfg(vec![AnnotatedItem::label("a"), push(1.0), AnnotatedItem::label("a")]);
    assert_eq!(dup.unwrap_err(), CfgError::DuplicateLabel { label: "a".into() });

    let missing = build_cfg(vec![Instruction::new(Opcode::Jump, vec![Operand::label("nowhere")]).unwrap().at_line(7).into()]);
    assert_eq!(missing.unwrap_err(), CfgError::UnresolvedLabel { label: "nowhere".into(), line: Some(7) });

    let decoded = build_cfg(vec![Instruction::new(Opcode::Jump, vec![Operand::JumpTarget(0)]).unwrap().into()]);
    assert!(matches!(decoded, Err(CfgError::MissingLabelOperand { opcode: "Jump", .. })));

    assert_eq!(build_cfg(vec![op(Opcode::EndTry)]).unwrap_err(), CfgError::UnbalancedTry);
}

#[test]
fn test_try_edges() {
    let cfg = build_cfg(vec![
        jump(Opcode::TryNoValue, "catch"),
        push(1.0),
        op(Opcode::Throw),
        op(Opcode::EndTry),
        push(2.0),
        op(Opcode::Return),
        AnnotatedItem::label("catch"),
        push(3.0),
        op(Opcode::Return),
    ]).unwrap();

    let b = |i| cfg.block(BlockId(i)).unwrap();
    assert_eq!(cfg.len(), 3);
    assert_eq!(b(0).successors, [BlockId(2)]);
    assert_eq!(b(0).exception_successor, Some(BlockId(2)));
    assert!(b(1).successors.is_empty());
    assert_eq!(b(1).exception_successor, None);
    assert!(b(2).predecessors.contains(&BlockId(0)));

    let outside = build_cfg(vec![push(1.0), op(Opcode::Throw)]).unwrap();
    assert!(outside.block(BlockId(0)).unwrap().successors.is_empty());
}

#[test]
fn test_dump() {
    let cfg = build_cfg(vec![push(1.0), AnnotatedItem::label("top"), op(Opcode::Return)]).unwrap();
    let mut out = String::new();
    cfg.dump(&mut out).unwrap();
    assert_eq!(out, "Block 0:\n    PushFloat 1.0\n  Successors: 1\n  Predecessors: \n  Exception successors: \n\
                     Block 1:\n  top:\n    Return\n  Successors: \n  Predecessors: 0\n  Exception successors: \n");
}
