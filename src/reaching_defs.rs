//! Reaching definitions.
//!
//! A forward, any-path dataflow problem. Each block's output is the set of
//! register definitions that reach its end. Definitions are grouped by
//! register (and tie-broken by instruction) so that all definitions of one
//! register form a contiguous run that `erase_reg` can remove in one sweep.

use crate::cfg::ControlFlowGraph;
use crate::dataflow::{solve, DataflowProblem, Direction};
use crate::ir::{Block, Function, Inst, Reg};
use cranelift_entity::{EntityRef, SecondaryMap};
use std::collections::BTreeSet;

/// One definition of `reg` by `inst` inside `block`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct VarDef {
    /// Register assigned. Primary sort key.
    pub reg: Reg,
    /// Assigning instruction. Secondary sort key.
    pub inst: Inst,
    /// Block containing the assignment.
    pub block: Block,
}

/// An ordered set of definitions, grouped by register.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct VarDefSet(BTreeSet<VarDef>);

impl VarDefSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition.
    pub fn insert(&mut self, def: VarDef) -> bool {
        self.0.insert(def)
    }

    /// Remove every definition of `reg`.
    pub fn erase_reg(&mut self, reg: Reg) {
        let doomed: Vec<VarDef> = self.defs_of(reg).copied().collect();
        for d in doomed {
            self.0.remove(&d);
        }
    }

    /// Record a fresh definition of `reg`, killing all previous ones.
    pub fn define(&mut self, reg: Reg, inst: Inst, block: Block) {
        self.erase_reg(reg);
        self.insert(VarDef { reg, inst, block });
    }

    /// All definitions of `reg` in the set.
    pub fn defs_of(&self, reg: Reg) -> impl Iterator<Item = &VarDef> {
        let lo = VarDef {
            reg,
            inst: Inst::new(0),
            block: Block::new(0),
        };
        self.0.range(lo..).take_while(move |d| d.reg == reg)
    }

    /// Union another set into this one.
    pub fn union_with(&mut self, other: &VarDefSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// All definitions.
    pub fn iter(&self) -> impl Iterator<Item = &VarDef> {
        self.0.iter()
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-block reaching-definition sets at block exit.
pub struct ReachingDefs {
    out: SecondaryMap<Block, VarDefSet>,
    valid: bool,
}

impl ReachingDefs {
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

    /// Recompute the reaching definitions for every block.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.out.clear();
        let mut problem = ReachProblem { func };
        solve(&mut problem, cfg, &mut self.out);
        self.valid = true;
    }

    /// Definitions reaching the end of `block`.
    pub fn out_of(&self, block: Block) -> &VarDefSet {
        &self.out[block]
    }
}

impl Default for ReachingDefs {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the definitions of `block` to `set`, in program order. This is the
/// local gen computation, shared between the boundary seeding and the
/// transfer function.
pub(crate) fn apply_block_defs(
    func: &Function,
    cfg: &ControlFlowGraph,
    block: Block,
    set: &mut VarDefSet,
) {
    for inst in cfg.block_insts(block, &func.layout) {
        if let Some(reg) = func.dfg[inst].def() {
            set.define(reg, inst, block);
        }
    }
}

struct ReachProblem<'a> {
    func: &'a Function,
}

impl<'a> DataflowProblem for ReachProblem<'a> {
    type Value = VarDefSet;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn init(&mut self, cfg: &ControlFlowGraph, out: &mut SecondaryMap<Block, VarDefSet>) {
        // Seed each block with its local gen set.
        for block in cfg.blocks() {
            let mut set = VarDefSet::new();
            apply_block_defs(self.func, cfg, block, &mut set);
            out[block] = set;
        }
    }

    fn meet(&self, inputs: &[VarDefSet], merged: &mut VarDefSet) {
        *merged = VarDefSet::new();
        for s in inputs {
            merged.union_with(s);
        }
    }

    fn transfer(
        &mut self,
        cfg: &ControlFlowGraph,
        block: Block,
        input: &VarDefSet,
        output: &mut VarDefSet,
    ) {
        *output = input.clone();
        apply_block_defs(self.func, cfg, block, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::ir::{Imm, InstructionData, Opcode, RegKind, Type};

    #[test]
    fn redefinition_kills() {
        let mut func = Function::new("p");
        let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let i1 = func.push(InstructionData::Ldc {
            dst: r,
            imm: Imm::Int(1),
        });
        let i2 = func.push(InstructionData::Ldc {
            dst: r,
            imm: Imm::Int(2),
        });
        func.push(InstructionData::Ret { value: Some(r) });

        let mut cfg = ControlFlowGraph::new();
        let mut diag = Diagnostics::new();
        cfg.compute(&mut func, &mut diag);

        let mut rd = ReachingDefs::new();
        rd.compute(&func, &cfg);

        let body = cfg.next_block(cfg.entry()).unwrap();
        let out = rd.out_of(body);
        assert_eq!(out.len(), 1);
        let def = out.defs_of(r).next().unwrap();
        assert_eq!(def.inst, i2);
        assert_ne!(def.inst, i1);
    }

    #[test]
    fn defs_merge_over_paths() {
        // A diamond where each arm defines r once; both reach the join.
        let mut func = Function::new("p");
        let then_l = func.dfg.make_label();
        let join_l = func.dfg.make_label();
        let c = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        func.push(InstructionData::Branch {
            opcode: Opcode::Btrue,
            cond: c,
            target: then_l,
        });
        func.push(InstructionData::Ldc {
            dst: r,
            imm: Imm::Int(1),
        });
        func.push(InstructionData::Jump { target: join_l });
        let then_i = func.dfg.make_inst(InstructionData::Label { label: then_l });
        func.layout.append(then_i);
        func.push(InstructionData::Ldc {
            dst: r,
            imm: Imm::Int(2),
        });
        let join_i = func.dfg.make_inst(InstructionData::Label { label: join_l });
        func.layout.append(join_i);
        func.push(InstructionData::Ret { value: Some(r) });

        let mut cfg = ControlFlowGraph::new();
        let mut diag = Diagnostics::new();
        cfg.compute(&mut func, &mut diag);
        let mut rd = ReachingDefs::new();
        rd.compute(&func, &cfg);

        let order: Vec<Block> = cfg.blocks().collect();
        let join = order[4];
        // Both arm definitions flow into the join's input; the join defines
        // nothing, so they both survive to its exit.
        assert_eq!(rd.out_of(join).defs_of(r).count(), 2);
    }
}
