//! Live uses.
//!
//! A backward, any-path dataflow problem. Each block's output is the set of
//! register uses that are live at its entry: uses not preceded (walking
//! backwards) by a definition of the same register. A use records the exact
//! operand slot so a transform can rewrite one operand in place.

use crate::cfg::ControlFlowGraph;
use crate::dataflow::{solve, DataflowProblem, Direction};
use crate::ir::{Block, Function, Inst, Reg};
use cranelift_entity::{EntityRef, SecondaryMap};
use std::collections::BTreeSet;

/// One use of `reg` at operand slot `slot` of `inst` inside `block`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct VarUse {
    /// Register read. Primary sort key.
    pub reg: Reg,
    /// Reading instruction. Secondary sort key.
    pub inst: Inst,
    /// Operand slot within the instruction, in `InstructionData::uses()`
    /// order.
    pub slot: u16,
    /// Block containing the use.
    pub block: Block,
}

/// An ordered set of uses, grouped by register.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct VarUseSet(BTreeSet<VarUse>);

impl VarUseSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a use.
    pub fn insert(&mut self, use_: VarUse) -> bool {
        self.0.insert(use_)
    }

    /// Remove every use of `reg`.
    pub fn erase_reg(&mut self, reg: Reg) {
        let doomed: Vec<VarUse> = self.uses_of(reg).copied().collect();
        for u in doomed {
            self.0.remove(&u);
        }
    }

    /// All uses of `reg` in the set.
    pub fn uses_of(&self, reg: Reg) -> impl Iterator<Item = &VarUse> {
        let lo = VarUse {
            reg,
            inst: Inst::new(0),
            slot: 0,
            block: Block::new(0),
        };
        self.0.range(lo..).take_while(move |u| u.reg == reg)
    }

    /// Union another set into this one.
    pub fn union_with(&mut self, other: &VarUseSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// All uses.
    pub fn iter(&self) -> impl Iterator<Item = &VarUse> {
        self.0.iter()
    }

    /// Number of uses.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-block live-use sets at block entry.
pub struct LiveUses {
    out: SecondaryMap<Block, VarUseSet>,
    valid: bool,
}

impl LiveUses {
    /// Allocate an empty analysis.
    pub fn new() -> Self {
        Self {
            out: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Clear the analysis.
    pub fn clear(&mut self) {
        self.out.clear();
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Recompute the live uses for every block.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.out.clear();
        let mut problem = LiveProblem { func };
        solve(&mut problem, cfg, &mut self.out);
        self.valid = true;
    }

    /// Uses live at the entry of `block`.
    pub fn live_into(&self, block: Block) -> &VarUseSet {
        &self.out[block]
    }
}

impl Default for LiveUses {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the uses and defs of `block` to `set`, walking backwards. A
/// definition kills the uses below it, then the instruction's own uses are
/// added. Shared between the boundary seeding and the transfer function.
pub(crate) fn apply_block_uses(
    func: &Function,
    cfg: &ControlFlowGraph,
    block: Block,
    set: &mut VarUseSet,
) {
    let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();
    for &inst in insts.iter().rev() {
        let data = &func.dfg[inst];
        if let Some(reg) = data.def() {
            set.erase_reg(reg);
        }
        for (slot, reg) in data.uses().into_iter().enumerate() {
            set.insert(VarUse {
                reg,
                inst,
                slot: slot as u16,
                block,
            });
        }
    }
}

struct LiveProblem<'a> {
    func: &'a Function,
}

impl<'a> DataflowProblem for LiveProblem<'a> {
    type Value = VarUseSet;

    fn direction(&self) -> Direction {
        Direction::Backward
    }

    fn init(&mut self, cfg: &ControlFlowGraph, out: &mut SecondaryMap<Block, VarUseSet>) {
        for block in cfg.blocks() {
            let mut set = VarUseSet::new();
            apply_block_uses(self.func, cfg, block, &mut set);
            out[block] = set;
        }
    }

    fn meet(&self, inputs: &[VarUseSet], merged: &mut VarUseSet) {
        *merged = VarUseSet::new();
        for s in inputs {
            merged.union_with(s);
        }
    }

    fn transfer(
        &mut self,
        cfg: &ControlFlowGraph,
        block: Block,
        input: &VarUseSet,
        output: &mut VarUseSet,
    ) {
        *output = input.clone();
        apply_block_uses(self.func, cfg, block, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::ir::{Imm, InstructionData, Opcode, RegKind, Type};

    #[test]
    fn def_kills_downstream_use() {
        let mut func = Function::new("p");
        let a = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let b = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        // a = ldc 1 ; b = cpy a ; ret b
        func.push(InstructionData::Ldc {
            dst: a,
            imm: Imm::Int(1),
        });
        func.push(InstructionData::Unary {
            opcode: Opcode::Cpy,
            dst: b,
            src: a,
        });
        func.push(InstructionData::Ret { value: Some(b) });

        let mut cfg = ControlFlowGraph::new();
        let mut diag = Diagnostics::new();
        cfg.compute(&mut func, &mut diag);
        let mut lu = LiveUses::new();
        lu.compute(&func, &cfg);

        // Nothing is live into the block: `a` is defined before its use and
        // `b` likewise.
        let body = cfg.next_block(cfg.entry()).unwrap();
        assert!(lu.live_into(body).is_empty());
    }

    #[test]
    fn use_before_def_is_live_into_preds() {
        let mut func = Function::new("p");
        let a = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let b = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let next_l = func.dfg.make_label();
        func.push(InstructionData::Ldc {
            dst: a,
            imm: Imm::Int(1),
        });
        // Block break so the use sits in a successor block.
        let next_i = func.dfg.make_inst(InstructionData::Label { label: next_l });
        func.layout.append(next_i);
        func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: b,
            src1: a,
            src2: a,
        });
        func.push(InstructionData::Ret { value: Some(b) });

        let mut cfg = ControlFlowGraph::new();
        let mut diag = Diagnostics::new();
        cfg.compute(&mut func, &mut diag);
        let mut lu = LiveUses::new();
        lu.compute(&func, &cfg);

        let first = cfg.next_block(cfg.entry()).unwrap();
        let second = cfg.next_block(first).unwrap();
        // Both operand slots of the add are live into the second block, and
        // the definition of `a` in the first block kills them there.
        assert_eq!(lu.live_into(second).uses_of(a).count(), 2);
        assert!(lu.live_into(first).is_empty());
    }
}
