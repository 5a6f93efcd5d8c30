//! Loop-invariant code motion.
//!
//! Loops are processed innermost first (a nested loop strictly has fewer
//! blocks than its enclosing loop). Within a loop, an instruction is
//! invariant when it is the only definition of its register in the loop, it
//! is not a call or load, and everything it reads is invariant. Survivors
//! must sit in blocks dominating every loop exit and must dominate all
//! their in-loop uses; when the loop cannot be proved to execute at least
//! once, they must additionally dominate the procedure exit. What remains
//! is copied into the pre-header in control-flow order and the originals
//! are retired.

use crate::cfg::ControlFlowGraph;
use crate::context::{pass_disabled, Context};
use crate::diag::Diagnostics;
use crate::dominators::Dominators;
use crate::eval::{run_to_breakpoint, EvalOutcome};
use crate::ir::{Block, Function, Inst, InstructionData, Opcode, Reg, RegKind};
use crate::loop_analysis::Loop;
use crate::use_def::DefUseChains;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};

/// Hoist loop-invariant code. Registered as the LICM pass.
pub fn hoist_loop_invariant_code(ctx: &mut Context) {
    if pass_disabled("ECE540_DISABLE_LICM") {
        return;
    }
    ctx.ensure_loops();

    // Inner loops first: order by size, tie-break on the head block.
    let mut loops: Vec<Loop> = ctx.loops.loops().to_vec();
    loops.sort_by_key(|l| (l.body.len() + l.tails.len(), l.head));

    let mut hoisted_any = false;
    for lp in &loops {
        // Hoisting in an inner loop changes the chains the enclosing loop
        // sees, so they are rebuilt per loop.
        ctx.recompute_def_use();
        let hoisted = {
            let Context {
                func,
                cfg,
                doms,
                def_use,
                diag,
                ..
            } = ctx;
            hoist_code(func, cfg, doms, def_use, diag, lp)
        };
        if hoisted {
            ctx.changed_def();
            ctx.changed_use();
            hoisted_any = true;
        }
    }
    if hoisted_any {
        ctx.changed_block();
    }
}

fn hoist_code(
    func: &mut Function,
    cfg: &mut ControlFlowGraph,
    doms: &Dominators,
    def_use: &DefUseChains,
    diag: &mut Diagnostics,
    lp: &Loop,
) -> bool {
    // Blocks outside the loop that a branch inside it can escape to.
    let mut exits: Vec<Block> = Vec::new();
    for &bb in &lp.body {
        let Some(last) = cfg[bb].last.expand() else {
            continue;
        };
        if matches!(
            func.dfg[last].opcode(),
            Opcode::Btrue | Opcode::Bfalse | Opcode::Mbr
        ) {
            for &succ in &cfg[bb].successors {
                if !lp.body.contains(&succ) {
                    exits.push(succ);
                }
            }
        }
    }

    // Definition counts per register inside the loop; registers never
    // defined inside are invariant from the start.
    let mut num_defs: FxHashMap<Reg, u32> = FxHashMap::default();
    for &bb in &lp.body {
        for inst in cfg.block_insts(bb, &func.layout) {
            for reg in func.dfg[inst].uses() {
                num_defs.entry(reg).or_insert(0);
            }
        }
    }
    for &bb in &lp.body {
        for inst in cfg.block_insts(bb, &func.layout) {
            if let Some(reg) = func.dfg[inst].def() {
                *num_defs.entry(reg).or_insert(0) += 1;
            }
        }
    }
    let mut invariant_regs: FxHashSet<Reg> = num_defs
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&reg, _)| reg)
        .collect();

    // Grow the invariant instruction set to a fixed point.
    let mut invariant: BTreeMap<Inst, (Block, Reg)> = BTreeMap::new();
    loop {
        let before = (invariant.len(), invariant_regs.len());
        for &bb in &lp.body {
            let insts: Vec<Inst> = cfg.block_insts(bb, &func.layout).collect();
            for inst in insts {
                if invariant.contains_key(&inst) {
                    continue;
                }
                let data = &func.dfg[inst];
                // Calls can have side effects; a load can be shadowed by a
                // store elsewhere in the loop.
                if matches!(data.opcode(), Opcode::Call | Opcode::Load) {
                    continue;
                }
                let Some(reg) = data.def() else {
                    continue;
                };
                if num_defs.get(&reg).copied().unwrap_or(0) > 1 {
                    continue;
                }
                if !data.uses().iter().all(|u| invariant_regs.contains(u)) {
                    continue;
                }
                invariant_regs.insert(reg);
                invariant.insert(inst, (bb, reg));
            }
        }
        if (invariant.len(), invariant_regs.len()) == before {
            break;
        }
    }
    if invariant.is_empty() {
        return false;
    }

    // Keep only instructions whose block dominates every loop exit; their
    // registers stop being invariant otherwise.
    let dominating: BTreeSet<Block> = lp
        .body
        .iter()
        .copied()
        .filter(|&bb| exits.iter().all(|&e| doms.dominates(bb, e)))
        .collect();
    invariant.retain(|_, (bb, reg)| {
        if dominating.contains(bb) {
            true
        } else {
            invariant_regs.remove(reg);
            false
        }
    });
    if invariant.is_empty() {
        return false;
    }

    // A definition must dominate all its in-loop uses; a same-block use
    // must come after the definition.
    invariant.retain(|&inst, (bb, _)| {
        for u in def_use.uses_reached(inst).iter() {
            if u.block == *bb {
                // Walk forward from the use; finding the definition means
                // the use came first.
                let mut cur = Some(u.inst);
                let stop = cfg[*bb].last.expand();
                while let Some(c) = cur {
                    if c == inst {
                        return false;
                    }
                    if Some(c) == stop {
                        break;
                    }
                    cur = func.layout.next(c);
                }
            } else if lp.body.contains(&u.block) && !doms.dominates(*bb, u.block) {
                return false;
            }
        }
        true
    });
    if invariant.is_empty() {
        return false;
    }

    // Moving a definition above a loop that never runs would let its value
    // escape; unless the loop provably executes once, keep only definitions
    // already on every path to the procedure exit.
    if !prove_loop_will_run(func, cfg, diag, lp) {
        let exit = cfg.exit();
        invariant.retain(|_, (bb, _)| doms.dominates(*bb, exit));
        if invariant.is_empty() {
            return false;
        }
    }

    // The filters may have knocked out registers that other survivors read.
    invariant.retain(|&inst, _| {
        func.dfg[inst]
            .uses()
            .iter()
            .all(|u| invariant_regs.contains(u))
    });
    if invariant.is_empty() {
        return false;
    }

    // Copy the survivors into the pre-header, in control-flow order so
    // dependencies stay ahead of their users.
    let mut ordered: Vec<Inst> = Vec::new();
    let mut seen: FxHashSet<Block> = FxHashSet::default();
    order_by_dfs(
        func,
        cfg,
        &lp.body,
        lp.pre_header,
        &invariant,
        &mut seen,
        &mut ordered,
    );
    debug_assert_eq!(ordered.len(), invariant.len());

    let mut remap: FxHashMap<Reg, Reg> = FxHashMap::default();
    for &inst in &ordered {
        let (_, reg) = invariant[&inst];
        if func.dfg.reg_kind(reg) == RegKind::Temp {
            let kind = if func.dfg[inst].opcode() == Opcode::Ldc {
                RegKind::Temp
            } else {
                RegKind::Pseudo
            };
            let fresh = func.dfg.make_reg(func.dfg.reg_ty(reg), kind);
            remap.insert(reg, fresh);
        }

        let mut data = func.dfg[inst].clone();
        if let Some(dst) = data.def_mut() {
            if let Some(&fresh) = remap.get(dst) {
                *dst = fresh;
            }
        }
        for slot in data.uses_mut() {
            if let Some(&fresh) = remap.get(slot) {
                *slot = fresh;
            }
        }
        let copy = func.dfg.make_inst(data);
        let tail = cfg[lp.pre_header]
            .last
            .expand()
            .expect("pre-header holds at least its label");
        func.layout.insert_after(copy, tail);
        cfg[lp.pre_header].last = copy.into();
    }

    // Retire the originals: pseudo definitions vanish outright, temps whose
    // replacement went pseudo vanish too, and the remaining temp loads stay
    // behind for dead-code elimination to sweep.
    let pseudo_remap: FxHashMap<Reg, Reg> = remap
        .iter()
        .filter(|&(_, &fresh)| func.dfg.reg_kind(fresh) == RegKind::Pseudo)
        .map(|(&old, &fresh)| (old, fresh))
        .collect();
    for (&inst, &(_, reg)) in &invariant {
        if func.dfg.reg_kind(reg) != RegKind::Temp || pseudo_remap.contains_key(&reg) {
            func.dfg[inst] = InstructionData::Nop;
            continue;
        }
        // Reads of promoted temps follow the promotion.
        for slot in func.dfg[inst].uses_mut() {
            if let Some(&fresh) = pseudo_remap.get(slot) {
                *slot = fresh;
            }
        }
    }

    // Every in-loop read of a promoted temp now reads the pseudo.
    for &bb in &lp.body {
        let insts: Vec<Inst> = cfg.block_insts(bb, &func.layout).collect();
        for inst in insts {
            for slot in func.dfg[inst].uses_mut() {
                if let Some(&fresh) = pseudo_remap.get(slot) {
                    *slot = fresh;
                }
            }
        }
    }

    true
}

fn order_by_dfs(
    func: &Function,
    cfg: &ControlFlowGraph,
    body: &BTreeSet<Block>,
    block: Block,
    invariant: &BTreeMap<Inst, (Block, Reg)>,
    seen: &mut FxHashSet<Block>,
    ordered: &mut Vec<Inst>,
) {
    if !seen.insert(block) {
        return;
    }
    for inst in cfg.block_insts(block, &func.layout) {
        if invariant.contains_key(&inst) {
            ordered.push(inst);
        }
    }
    let succs: Vec<Block> = cfg[block].successors.iter().copied().collect();
    for succ in succs {
        if body.contains(&succ) && !seen.contains(&succ) {
            order_by_dfs(func, cfg, body, succ, invariant, seen, ordered);
        }
    }
}

/// Can the loop body be shown to execute at least once? Self-loops and
/// straight-line loops trivially do; otherwise symbolic interpretation must
/// carry a prefix of the procedure through the loop's first exit branch and
/// land back inside the loop.
fn prove_loop_will_run(
    func: &Function,
    cfg: &ControlFlowGraph,
    diag: &mut Diagnostics,
    lp: &Loop,
) -> bool {
    if lp.body.len() == 1 {
        return true;
    }

    // Chase single successors from the head to the first branching block.
    let mut seen: FxHashSet<Block> = FxHashSet::default();
    let mut bb = lp.head;
    let (branch_bb, walked) = loop {
        if !seen.insert(bb) {
            // A straight-line cycle: the whole body runs unconditionally.
            break (None, lp.body.len());
        }
        let Some(last) = cfg[bb].last.expand() else {
            break (None, seen.len());
        };
        if matches!(
            func.dfg[last].opcode(),
            Opcode::Btrue | Opcode::Bfalse | Opcode::Mbr
        ) {
            break (Some(bb), seen.len());
        }
        let succs = &cfg[bb].successors;
        if succs.len() != 1 {
            break (None, seen.len());
        }
        bb = *succs.iter().next().expect("one successor");
    };

    if walked == lp.body.len() {
        return true;
    }
    let Some(branch_bb) = branch_bb else {
        return false;
    };
    let branch = cfg[branch_bb].last.expand().expect("branch block has a terminator");
    if func.dfg[branch].opcode() == Opcode::Mbr {
        return false;
    }

    let succs: Vec<Block> = cfg[branch_bb].successors.iter().copied().collect();
    if succs.len() != 2 {
        return false;
    }
    let breakpoint_block = match (lp.body.contains(&succs[0]), lp.body.contains(&succs[1])) {
        (true, true) => return false,
        (true, false) => succs[0],
        _ => succs[1],
    };
    let Some(breakpoint) = cfg[breakpoint_block].first.expand() else {
        return false;
    };

    // Back up through the unique straight-line prefix leading to the head.
    let mut start_bb = lp.head;
    loop {
        let preds = &cfg[start_bb].predecessors;
        if preds.len() != 1 {
            break;
        }
        let p = *preds.iter().next().expect("one predecessor");
        if cfg[p].successors.len() > 1 {
            break;
        }
        start_bb = p;
    }
    let Some(start) = cfg[start_bb].first.expand() else {
        return false;
    };

    run_to_breakpoint(func, diag, start, breakpoint) == EvalOutcome::ReachedBreakpoint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Imm, Type};

    /// A self-loop computing x = 3 + 4 every iteration.
    fn invariant_loop() -> (Function, Reg, crate::ir::Label) {
        let mut func = Function::new("p");
        let head_l = func.dfg.make_label();
        let i = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let n = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let one = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let x = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let t1 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let t2 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let c = func.dfg.make_reg(Type::I32, RegKind::Temp);

        func.push(InstructionData::Ldc {
            dst: i,
            imm: Imm::Int(0),
        });
        let head_i = func.dfg.make_inst(InstructionData::Label { label: head_l });
        func.layout.append(head_i);
        func.push(InstructionData::Ldc {
            dst: t1,
            imm: Imm::Int(3),
        });
        func.push(InstructionData::Ldc {
            dst: t2,
            imm: Imm::Int(4),
        });
        func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: x,
            src1: t1,
            src2: t2,
        });
        func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: i,
            src1: i,
            src2: one,
        });
        func.push(InstructionData::Binary {
            opcode: Opcode::Sl,
            dst: c,
            src1: i,
            src2: n,
        });
        func.push(InstructionData::Branch {
            opcode: Opcode::Btrue,
            cond: c,
            target: head_l,
        });
        func.push(InstructionData::Ret { value: Some(x) });
        (func, x, head_l)
    }

    fn head_position(func: &Function, head_l: crate::ir::Label) -> usize {
        func.layout
            .insts()
            .position(|i| matches!(func.dfg[i], InstructionData::Label { label } if label == head_l))
            .expect("loop head label survives")
    }

    #[test]
    fn invariant_add_moves_to_pre_header() {
        let (func, x, head_l) = invariant_loop();
        let mut ctx = Context::new(func);
        hoist_loop_invariant_code(&mut ctx);
        assert!(ctx.take_changed());

        let func = &ctx.func;
        let head_pos = head_position(func, head_l);
        let order: Vec<Inst> = func.layout.insts().collect();

        // Exactly one add still defines x, and it now sits above the head.
        let add_positions: Vec<usize> = order
            .iter()
            .enumerate()
            .filter(|(_, &i)| {
                func.dfg[i].opcode() == Opcode::Add && func.dfg[i].def() == Some(x)
            })
            .map(|(pos, _)| pos)
            .collect();
        assert_eq!(add_positions.len(), 1);
        assert!(add_positions[0] < head_pos);
    }

    #[test]
    fn variant_computation_stays() {
        // i = i + one changes every iteration and must not move.
        let (func, x, head_l) = invariant_loop();
        let mut ctx = Context::new(func);
        hoist_loop_invariant_code(&mut ctx);

        let func = &ctx.func;
        let head_pos = head_position(func, head_l);
        // Exactly one add survives below the head: the induction update.
        let body_adds = func
            .layout
            .insts()
            .enumerate()
            .filter(|&(pos, i)| pos > head_pos && func.dfg[i].opcode() == Opcode::Add)
            .count();
        assert_eq!(body_adds, 1);
        // And it is not the invariant one.
        let body_add = func
            .layout
            .insts()
            .enumerate()
            .find(|&(pos, i)| pos > head_pos && func.dfg[i].opcode() == Opcode::Add)
            .map(|(_, i)| i)
            .unwrap();
        assert_ne!(func.dfg[body_add].def(), Some(x));
    }
}
