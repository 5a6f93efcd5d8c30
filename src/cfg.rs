//! Basic blocks and the control flow graph.
//!
//! The CFG splits the linear instruction list into basic blocks and keeps,
//! per block, the predecessor and successor sets plus reachability flags.
//! Block order mirrors program order: a distinguished empty entry block
//! precedes everything and a distinguished empty exit block follows
//! everything. Every non-empty block is normalized to begin with a LABEL,
//! synthesizing a fresh one if needed.

use crate::dataflow::{solve, DataflowProblem, Direction};
use crate::diag::Diagnostics;
use crate::inst_predicates::{is_label, is_local_control_flow_transfer, is_return};
use crate::ir::{Block, Function, Inst, InstructionData, Label, Layout};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// One basic block.
#[derive(Clone, Default)]
pub struct BlockData {
    /// First instruction, `None` iff the block is empty.
    pub first: PackedOption<Inst>,
    /// Last instruction, `None` iff the block is empty.
    pub last: PackedOption<Inst>,
    /// Blocks with an edge into this one.
    pub predecessors: BTreeSet<Block>,
    /// Blocks this one has an edge to.
    pub successors: BTreeSet<Block>,
    /// Reachable from the entry block.
    pub entry_reachable: bool,
    /// Reaches the exit block.
    pub exit_reachable: bool,
    prev: PackedOption<Block>,
    next: PackedOption<Block>,
}

/// The control flow graph of one procedure.
pub struct ControlFlowGraph {
    blocks: PrimaryMap<Block, BlockData>,
    entry: PackedOption<Block>,
    exit: PackedOption<Block>,
    valid: bool,
}

impl ControlFlowGraph {
    /// Allocate a blank control flow graph.
    pub fn new() -> Self {
        Self {
            blocks: PrimaryMap::new(),
            entry: None.into(),
            exit: None.into(),
            valid: false,
        }
    }

    /// Throw away all blocks and edges.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.entry = None.into();
        self.exit = None.into();
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The distinguished empty entry block.
    pub fn entry(&self) -> Block {
        self.entry.expand().expect("CFG not computed")
    }

    /// The distinguished empty exit block.
    pub fn exit(&self) -> Block {
        self.exit.expand().expect("CFG not computed")
    }

    /// Number of blocks, including the entry and exit sentinels.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The block after `block` in block order.
    pub fn next_block(&self, block: Block) -> Option<Block> {
        self.blocks[block].next.expand()
    }

    /// The block before `block` in block order.
    pub fn prev_block(&self, block: Block) -> Option<Block> {
        self.blocks[block].prev.expand()
    }

    /// Iterate over blocks in block order, entry first, exit last.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            cfg: self,
            next: self.entry.expand(),
        }
    }

    /// Iterate over the instructions of `block` in program order.
    pub fn block_insts<'a>(&self, block: Block, layout: &'a Layout) -> BlockInsts<'a> {
        let data = &self.blocks[block];
        BlockInsts {
            layout,
            next: data.first.expand(),
            stop: data.last.expand(),
        }
    }

    /// The block containing `inst`, by scanning block bounds. Only used on
    /// cold paths.
    pub fn containing_block(&self, inst: Inst, layout: &Layout) -> Option<Block> {
        self.blocks()
            .find(|&b| self.block_insts(b, layout).any(|i| i == inst))
    }

    /// Compute the control flow graph of `func`, forming basic blocks and
    /// normalizing each to begin with a label.
    pub fn compute(&mut self, func: &mut Function, diag: &mut Diagnostics) {
        self.clear();

        let entry = self.blocks.push(BlockData::default());
        self.entry = entry.into();
        let mut chain_tail = entry;

        let mut begin = func.layout.first();
        while let Some(b) = begin {
            let end = find_block_end(func, b);
            let block = self.make_block(func, b, end);
            self.link_after(block, chain_tail);
            chain_tail = block;
            begin = func.layout.next(end);
        }

        let exit = self.blocks.push(BlockData::default());
        self.exit = exit.into();
        self.link_after(exit, chain_tail);

        self.relink(func, diag);
        self.valid = true;
        log::trace!(
            "computed CFG for {}: {} blocks",
            func.name,
            self.blocks.len()
        );
    }

    /// Rebuild the successor/predecessor sets from the current instruction
    /// list, then recompute reachability.
    pub fn relink(&mut self, func: &Function, diag: &mut Diagnostics) {
        // Index the labels and block leaders.
        let mut label_inst: FxHashMap<Label, Inst> = FxHashMap::default();
        for inst in func.layout.insts() {
            if let InstructionData::Label { label } = func.dfg[inst] {
                label_inst.insert(label, inst);
            }
        }

        let order: Vec<Block> = self.blocks().collect();
        let mut leader_block: FxHashMap<Inst, Block> = FxHashMap::default();
        for &b in &order {
            self.blocks[b].successors.clear();
            self.blocks[b].predecessors.clear();
            if let Some(first) = self.blocks[b].first.expand() {
                leader_block.insert(first, b);
            }
        }

        let entry = self.entry();
        let exit = self.exit();
        self.connect(Some(entry), self.next_block(entry));

        for &b in order.iter().skip(1) {
            let Some(last) = self.blocks[b].last.expand() else {
                continue;
            };
            match &func.dfg[last] {
                InstructionData::Branch { target, .. } => {
                    self.connect(Some(b), self.next_block(b));
                    let t = self.lookup_label(func, &label_inst, &leader_block, *target, diag);
                    self.connect(Some(b), t);
                }
                InstructionData::Jump { target } => {
                    let t = self.lookup_label(func, &label_inst, &leader_block, *target, diag);
                    self.connect(Some(b), t);
                }
                InstructionData::MultiBranch {
                    default, targets, ..
                } => {
                    let d = self.lookup_label(func, &label_inst, &leader_block, *default, diag);
                    self.connect(Some(b), d);
                    for target in targets.clone() {
                        let t = self.lookup_label(func, &label_inst, &leader_block, target, diag);
                        self.connect(Some(b), t);
                    }
                }
                InstructionData::Ret { .. } => self.connect(Some(b), Some(exit)),
                _ => self.connect(Some(b), self.next_block(b)),
            }
        }

        self.find_closure();
    }

    /// Splice a new block holding `insts` between `prev` and `next` in block
    /// order. The instructions must not yet be linked into the layout; they
    /// are stitched in at instruction level and the block is normalized to
    /// begin with a label. Successor/predecessor sets are *not* touched; the
    /// caller must `relink` before using the edges again.
    pub fn unsafe_insert_block(
        &mut self,
        func: &mut Function,
        diag: &mut Diagnostics,
        prev: Block,
        next: Block,
        insts: &[Inst],
    ) -> Option<Block> {
        if insts.is_empty() || !slice_forms_block(func, insts) {
            diag.error(
                "Attempting to insert a block failed because the specified last instruction \
                 does not end a basic block beginning with the first instruction.",
            );
            return None;
        }

        // Stitch the instructions into the layout between the neighboring
        // blocks.
        if let Some(anchor) = self.blocks[prev].last.expand() {
            let mut after = anchor;
            for &inst in insts {
                func.layout.insert_after(inst, after);
                after = inst;
            }
        } else if let Some(anchor) = self.blocks[next].first.expand() {
            for &inst in insts {
                func.layout.insert_before(inst, anchor);
            }
        } else {
            diag.error("Attempting to insert a block between two empty blocks.");
            return None;
        }

        let mut first = insts[0];
        let last = insts[insts.len() - 1];
        if !is_label(&func.dfg[first]) {
            let label = func.dfg.make_label();
            let label_inst = func.dfg.make_inst(InstructionData::Label { label });
            func.layout.insert_before(label_inst, first);
            first = label_inst;
        }

        let block = self.blocks.push(BlockData {
            first: first.into(),
            last: last.into(),
            prev: prev.into(),
            next: next.into(),
            ..BlockData::default()
        });
        self.blocks[prev].next = block.into();
        self.blocks[next].prev = block.into();
        Some(block)
    }

    /// Recompute the entry/exit reachability flags.
    pub fn find_closure(&mut self) {
        let mut entry_out = SecondaryMap::new();
        solve(&mut EntryClosure, self, &mut entry_out);
        let mut exit_out = SecondaryMap::new();
        solve(&mut ExitClosure, self, &mut exit_out);

        let order: Vec<Block> = self.blocks().collect();
        for b in order {
            self.blocks[b].entry_reachable = entry_out[b];
            self.blocks[b].exit_reachable = exit_out[b];
        }
    }

    fn make_block(&mut self, func: &mut Function, first: Inst, last: Inst) -> Block {
        let mut first = first;
        if !is_label(&func.dfg[first]) {
            let label = func.dfg.make_label();
            let label_inst = func.dfg.make_inst(InstructionData::Label { label });
            func.layout.insert_before(label_inst, first);
            first = label_inst;
        }
        self.blocks.push(BlockData {
            first: first.into(),
            last: last.into(),
            ..BlockData::default()
        })
    }

    fn link_after(&mut self, block: Block, after: Block) {
        self.blocks[block].prev = after.into();
        self.blocks[block].next = None.into();
        self.blocks[after].next = block.into();
    }

    fn connect(&mut self, pred: Option<Block>, succ: Option<Block>) {
        let (Some(p), Some(s)) = (pred, succ) else {
            return;
        };
        self.blocks[p].successors.insert(s);
        self.blocks[s].predecessors.insert(p);
    }

    fn lookup_label(
        &self,
        func: &Function,
        label_inst: &FxHashMap<Label, Inst>,
        leader_block: &FxHashMap<Inst, Block>,
        label: Label,
        diag: &mut Diagnostics,
    ) -> Option<Block> {
        let name = &func.dfg.labels[label].name;
        let Some(&inst) = label_inst.get(&label) else {
            diag.error(format!(
                "Attempting to jump/branch to an unknown label '{name}'."
            ));
            return None;
        };
        let Some(&block) = leader_block.get(&inst) else {
            diag.error(format!("The label '{name}' is not a leader for any basic block."));
            return None;
        };
        Some(block)
    }
}

impl Default for ControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Index<Block> for ControlFlowGraph {
    type Output = BlockData;

    fn index(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }
}

impl core::ops::IndexMut<Block> for ControlFlowGraph {
    fn index_mut(&mut self, block: Block) -> &mut BlockData {
        &mut self.blocks[block]
    }
}

/// Find the last instruction of the basic block starting at `begin`: the
/// block ends at a local control transfer or return (inclusive), or just
/// before the next label.
pub(crate) fn find_block_end(func: &Function, begin: Inst) -> Inst {
    let mut prev = begin;
    let mut cur = Some(begin);
    while let Some(c) = cur {
        let data = &func.dfg[c];
        if is_local_control_flow_transfer(data) || is_return(data) {
            return c;
        }
        if is_label(data) && c != begin {
            return prev;
        }
        prev = c;
        cur = func.layout.next(c);
    }
    prev
}

/// Would `insts`, linked in order, form exactly one basic block?
fn slice_forms_block(func: &Function, insts: &[Inst]) -> bool {
    for (i, &inst) in insts.iter().enumerate() {
        let data = &func.dfg[inst];
        let is_last = i + 1 == insts.len();
        if (is_local_control_flow_transfer(data) || is_return(data)) && !is_last {
            return false;
        }
        if is_label(data) && i != 0 {
            return false;
        }
    }
    true
}

/// Iterator over blocks in block order.
pub struct Blocks<'a> {
    cfg: &'a ControlFlowGraph,
    next: Option<Block>,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let cur = self.next?;
        self.next = self.cfg.next_block(cur);
        Some(cur)
    }
}

/// Iterator over the instructions of one block.
pub struct BlockInsts<'a> {
    layout: &'a Layout,
    next: Option<Inst>,
    stop: Option<Inst>,
}

impl<'a> Iterator for BlockInsts<'a> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        let cur = self.next?;
        self.next = if Some(cur) == self.stop {
            None
        } else {
            self.layout.next(cur)
        };
        Some(cur)
    }
}

/// Forward any-path reachability from the entry block.
struct EntryClosure;

impl DataflowProblem for EntryClosure {
    type Value = bool;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn init(&mut self, cfg: &ControlFlowGraph, out: &mut SecondaryMap<Block, bool>) {
        out[cfg.entry()] = true;
    }

    fn meet(&self, inputs: &[bool], merged: &mut bool) {
        *merged = inputs.iter().any(|&b| b);
    }

    fn transfer(&mut self, _cfg: &ControlFlowGraph, _block: Block, input: &bool, output: &mut bool) {
        *output = *input || *output;
    }
}

/// Backward any-path reachability to the exit block.
struct ExitClosure;

impl DataflowProblem for ExitClosure {
    type Value = bool;

    fn direction(&self) -> Direction {
        Direction::Backward
    }

    fn init(&mut self, cfg: &ControlFlowGraph, out: &mut SecondaryMap<Block, bool>) {
        out[cfg.exit()] = true;
    }

    fn meet(&self, inputs: &[bool], merged: &mut bool) {
        *merged = inputs.iter().any(|&b| b);
    }

    fn transfer(&mut self, _cfg: &ControlFlowGraph, _block: Block, input: &bool, output: &mut bool) {
        *output = *input || *output;
    }
}
