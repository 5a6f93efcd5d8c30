//! Dead-code elimination.
//!
//! Instructions in unreachable blocks become NOPs outright. For the rest,
//! an essentiality fixed point: returns, calls, stores, memory copies and
//! loads seed the essential set (labels are always essential), every
//! definition feeding an essential instruction is essential, and branches
//! that essential code is control-dependent on are essential too. Anything
//! not in the closure becomes a NOP, jumps to the immediately following
//! label collapse, and finally all NOPs are unlinked from the instruction
//! list.
//!
//! NOP removal dirties the CFG without reporting a change; otherwise CFG
//! normalization and NOP removal would feed each other forever.

use crate::context::{pass_disabled, Context};
use crate::ir::{Block, Inst, InstructionData, Opcode};
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;

/// Eliminate dead code. Registered as the DCE pass.
pub fn eliminate_dead_code(ctx: &mut Context) {
    if pass_disabled("ECE540_DISABLE_DCE") {
        return;
    }
    ctx.ensure_use_def();

    let mut changed_block = false;
    let mut removed_nop = false;
    {
        let Context {
            func, cfg, use_def, ..
        } = ctx;
        let blocks: Vec<Block> = cfg.blocks().collect();

        // Unreachable blocks contribute nothing; clear them to NOPs now so
        // their instructions cannot seed the essential set.
        for &block in &blocks {
            if cfg[block].entry_reachable || cfg[block].first.is_none() {
                continue;
            }
            let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();
            for inst in insts {
                func.dfg[inst] = InstructionData::Nop;
            }
            changed_block = true;
        }

        // Seed: labels are essential outright; side-effecting instructions
        // enter through the worklist.
        let mut essential: FxHashSet<Inst> = FxHashSet::default();
        let mut worklist: Vec<(Block, Inst)> = Vec::new();
        for &block in &blocks {
            for inst in cfg.block_insts(block, &func.layout) {
                let data = &func.dfg[inst];
                if crate::inst_predicates::is_label(data) {
                    essential.insert(inst);
                } else if crate::inst_predicates::has_side_effect(data) {
                    worklist.push((block, inst));
                }
            }
        }

        // Grow the closure. Each round marks the popped instructions and
        // their reaching definitions, then sweeps the blocks that newly
        // essential code is control-dependent on: a block ending in a branch
        // contributes that branch; a fall-through block passes the
        // dependency outward to its own predecessors.
        let mut swept: FxHashSet<Block> = FxHashSet::default();
        loop {
            let mut control_dep: BTreeSet<Block> = BTreeSet::new();
            while let Some((block, inst)) = worklist.pop() {
                if !essential.insert(inst) {
                    continue;
                }
                control_dep.extend(cfg[block].predecessors.iter().copied());
                for def in use_def.defs_reaching(inst).iter() {
                    worklist.push((def.block, def.inst));
                }
            }

            let mut updated = false;
            let mut queue: Vec<Block> = control_dep.into_iter().collect();
            while let Some(block) = queue.pop() {
                if !swept.insert(block) {
                    continue;
                }
                let Some(last) = cfg[block].last.expand() else {
                    continue;
                };
                match func.dfg[last].opcode() {
                    Opcode::Jmp | Opcode::Btrue | Opcode::Bfalse | Opcode::Mbr => {
                        if !essential.contains(&last) {
                            updated = true;
                            worklist.push((block, last));
                        }
                    }
                    _ => queue.extend(cfg[block].predecessors.iter().copied()),
                }
            }
            if !updated {
                break;
            }
        }

        // Sweep everything outside the closure.
        for &block in &blocks {
            let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();
            for inst in insts {
                if !essential.contains(&inst)
                    && !matches!(func.dfg[inst], InstructionData::Nop)
                {
                    func.dfg[inst] = InstructionData::Nop;
                }
            }
        }

        // A jump to the label right after it is a no-op.
        let in_order: Vec<Inst> = func.layout.insts().collect();
        for inst in in_order {
            let InstructionData::Jump { target } = func.dfg[inst] else {
                continue;
            };
            let Some(next) = func.layout.next(inst) else {
                continue;
            };
            if matches!(func.dfg[next], InstructionData::Label { label } if label == target) {
                func.dfg[inst] = InstructionData::Nop;
                changed_block = true;
            }
        }

        // Unlink every NOP.
        let in_order: Vec<Inst> = func.layout.insts().collect();
        for inst in in_order {
            if matches!(func.dfg[inst], InstructionData::Nop) {
                func.layout.remove(inst);
                removed_nop = true;
            }
        }
    }

    if changed_block {
        ctx.changed_block();
    }
    if removed_nop {
        ctx.removed_nop();
    }
}
