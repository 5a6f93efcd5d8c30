//! UD and DU chains.
//!
//! The UD chain maps each instruction to the definitions that reach its
//! uses; the DU chain maps each defining instruction to the uses its value
//! reaches. Both are built per block from the per-block dataflow results:
//! UD by a forward walk seeded with the union of the predecessors' reaching
//! definitions, DU by a backward walk seeded with the union of the
//! successors' live uses.

use crate::cfg::ControlFlowGraph;
use crate::ir::{Function, Inst};
use crate::live_uses::{LiveUses, VarUse, VarUseSet};
use crate::reaching_defs::{ReachingDefs, VarDefSet};
use rustc_hash::FxHashMap;

/// Maps each instruction to the reaching definitions its uses consume.
pub struct UseDefChains {
    map: FxHashMap<Inst, VarDefSet>,
    empty: VarDefSet,
    valid: bool,
}

impl UseDefChains {
    /// Allocate an empty chain map.
    pub fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            empty: VarDefSet::new(),
            valid: false,
        }
    }

    /// Clear the chain map.
    pub fn clear(&mut self) {
        self.map.clear();
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Rebuild all UD chains.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, defs: &ReachingDefs) {
        self.map.clear();
        for block in cfg.blocks() {
            // Definitions reaching the block entry.
            let mut reaching = VarDefSet::new();
            for &pred in &cfg[block].predecessors {
                reaching.union_with(defs.out_of(pred));
            }

            for inst in cfg.block_insts(block, &func.layout) {
                let data = &func.dfg[inst];
                let mut used = VarDefSet::new();
                for reg in data.uses() {
                    for d in reaching.defs_of(reg) {
                        used.insert(*d);
                    }
                }
                self.map.insert(inst, used);

                if let Some(reg) = data.def() {
                    reaching.define(reg, inst, block);
                }
            }
        }
        self.valid = true;
    }

    /// The definitions reaching the uses of `inst`.
    pub fn defs_reaching(&self, inst: Inst) -> &VarDefSet {
        self.map.get(&inst).unwrap_or(&self.empty)
    }
}

impl Default for UseDefChains {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps each defining instruction to the uses its value reaches.
pub struct DefUseChains {
    map: FxHashMap<Inst, VarUseSet>,
    empty: VarUseSet,
    valid: bool,
}

impl DefUseChains {
    /// Allocate an empty chain map.
    pub fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            empty: VarUseSet::new(),
            valid: false,
        }
    }

    /// Clear the chain map.
    pub fn clear(&mut self) {
        self.map.clear();
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Rebuild all DU chains.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph, uses: &LiveUses) {
        self.map.clear();
        for block in cfg.blocks() {
            // Uses live out of the block.
            let mut reached = VarUseSet::new();
            for &succ in &cfg[block].successors {
                reached.union_with(uses.live_into(succ));
            }

            let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();
            for &inst in insts.iter().rev() {
                let data = &func.dfg[inst];
                if let Some(reg) = data.def() {
                    let mut set = VarUseSet::new();
                    for u in reached.uses_of(reg) {
                        set.insert(*u);
                    }
                    self.map.insert(inst, set);
                    reached.erase_reg(reg);
                }
                for (slot, reg) in data.uses().into_iter().enumerate() {
                    reached.insert(VarUse {
                        reg,
                        inst,
                        slot: slot as u16,
                        block,
                    });
                }
            }
        }
        self.valid = true;
    }

    /// The uses reached by the value `inst` defines.
    pub fn uses_reached(&self, inst: Inst) -> &VarUseSet {
        self.map.get(&inst).unwrap_or(&self.empty)
    }
}

impl Default for DefUseChains {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::ir::{Imm, InstructionData, Opcode, RegKind, Type};

    fn two_arm_merge() -> (Function, ControlFlowGraph, [Inst; 4]) {
        // r defined in both arms of a diamond, used at the join.
        let mut func = Function::new("p");
        let then_l = func.dfg.make_label();
        let join_l = func.dfg.make_label();
        let c = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let s = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let br = func.push(InstructionData::Branch {
            opcode: Opcode::Btrue,
            cond: c,
            target: then_l,
        });
        let d1 = func.push(InstructionData::Ldc {
            dst: r,
            imm: Imm::Int(1),
        });
        func.push(InstructionData::Jump { target: join_l });
        let then_i = func.dfg.make_inst(InstructionData::Label { label: then_l });
        func.layout.append(then_i);
        let d2 = func.push(InstructionData::Ldc {
            dst: r,
            imm: Imm::Int(2),
        });
        let join_i = func.dfg.make_inst(InstructionData::Label { label: join_l });
        func.layout.append(join_i);
        let use_i = func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: s,
            src1: r,
            src2: r,
        });
        func.push(InstructionData::Ret { value: Some(s) });

        let mut cfg = ControlFlowGraph::new();
        let mut diag = Diagnostics::new();
        cfg.compute(&mut func, &mut diag);
        (func, cfg, [br, d1, d2, use_i])
    }

    #[test]
    fn ud_sees_both_arm_defs() {
        let (func, cfg, [_, d1, d2, use_i]) = two_arm_merge();
        let mut rd = ReachingDefs::new();
        rd.compute(&func, &cfg);
        let mut ud = UseDefChains::new();
        ud.compute(&func, &cfg, &rd);

        let defs = ud.defs_reaching(use_i);
        let insts: Vec<Inst> = defs.iter().map(|d| d.inst).collect();
        assert!(insts.contains(&d1));
        assert!(insts.contains(&d2));
        assert_eq!(defs.len(), 2);
    }

    #[test]
    fn du_reaches_join_use() {
        let (func, cfg, [_, d1, d2, use_i]) = two_arm_merge();
        let mut lu = LiveUses::new();
        lu.compute(&func, &cfg);
        let mut du = DefUseChains::new();
        du.compute(&func, &cfg, &lu);

        for d in [d1, d2] {
            let uses = du.uses_reached(d);
            // Both operand slots of the add are reached.
            assert_eq!(uses.len(), 2);
            assert!(uses.iter().all(|u| u.inst == use_i));
            let slots: Vec<u16> = uses.iter().map(|u| u.slot).collect();
            assert_eq!(slots, vec![0, 1]);
        }
    }
}
