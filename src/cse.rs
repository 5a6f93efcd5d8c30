//! Common sub-expression elimination.
//!
//! Works off the available-expression sets at block exit. Within each block
//! the walk mirrors the AE transfer function: when the canonical form of
//! the current instruction is already available, the value is shared
//! through a fresh pseudo register copied out of every prior computation,
//! and the current instruction collapses to a copy. Temp registers cannot
//! carry values between blocks, so a temp destination involved in sharing
//! is first promoted to a fresh pseudo throughout its block.

use crate::avail_exprs::{AvailExpr, AvailExprSet, AvailableExpressions};
use crate::cfg::ControlFlowGraph;
use crate::context::{pass_disabled, Context};
use crate::inst_predicates::is_expression;
use crate::ir::{Block, Function, Inst, InstructionData, Opcode, Reg, RegKind};

/// Eliminate common sub-expressions. Registered as the CSE pass.
pub fn eliminate_common_sub_expressions(ctx: &mut Context) {
    if pass_disabled("ECE540_DISABLE_CSE") {
        return;
    }
    ctx.ensure_avail_exprs();

    let mut changed_def = false;
    let mut changed_use = false;
    {
        let Context { func, cfg, ae, .. } = ctx;
        let blocks: Vec<Block> = cfg.blocks().collect();

        // Expressions available on entry: the intersection of the
        // predecessors' exit sets, all taken before any rewriting starts.
        let entries: Vec<AvailExprSet> = blocks
            .iter()
            .map(|&block| entry_set(cfg, ae, block))
            .collect();

        for (&block, entry) in blocks.iter().zip(entries) {
            let mut working = entry;
            let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();

            for inst in insts {
                if is_expression(&func.dfg[inst]) {
                    if let Some(expr) = ae.lookup(func, inst) {
                        let prior: Vec<AvailExpr> = working.with_id(expr.id).copied().collect();
                        if prior.is_empty() {
                            working.insert(AvailExpr {
                                id: expr.id,
                                inst: Some(inst),
                                block: Some(block),
                            });
                        } else {
                            share_expression(
                                func, cfg, ae, block, inst, &prior, &mut changed_def,
                                &mut changed_use,
                            );
                        }
                    }
                }

                // Kill what the (possibly rewritten) instruction clobbers.
                if let Some(dst) = func.dfg[inst].def() {
                    working.erase_using(func, dst);
                }
            }

            // Sharing may have promoted temps, changing what the block makes
            // available; refresh its exit set.
            ae.set_out(block, working);
        }
    }
    if changed_def {
        ctx.changed_def();
    }
    if changed_use {
        ctx.changed_use();
    }
}

fn entry_set(cfg: &ControlFlowGraph, ae: &AvailableExpressions, block: Block) -> AvailExprSet {
    let preds: Vec<Block> = cfg[block].predecessors.iter().copied().collect();
    let mut it = preds.iter();
    let mut set = match it.next() {
        Some(&p) => ae.out_of(p).clone(),
        None => return AvailExprSet::new(),
    };
    for &p in it {
        set = set.intersect(ae.out_of(p));
    }
    set
}

/// Rewrite `inst` to reuse the value of the prior computations of the same
/// form: a fresh pseudo is copied out of each prior computation's
/// destination, and `inst` becomes a copy from it.
fn share_expression(
    func: &mut Function,
    cfg: &mut ControlFlowGraph,
    ae: &mut AvailableExpressions,
    block: Block,
    inst: Inst,
    prior: &[AvailExpr],
    changed_def: &mut bool,
    changed_use: &mut bool,
) {
    let mut dst = func.dfg[inst].def().expect("expressions define a register");
    let shared = func.dfg.make_reg(func.dfg.reg_ty(dst), RegKind::Pseudo);

    for entry in prior {
        let (Some(gen_inst), Some(gen_block)) = (entry.inst, entry.block) else {
            continue;
        };
        let mut gen_dst = func.dfg[gen_inst]
            .def()
            .expect("available expressions define a register");

        // A temp destination is local to its block; promote it so the copy
        // out of it stays meaningful.
        if func.dfg.reg_kind(gen_dst) == RegKind::Temp {
            gen_dst = promote_temp(func, cfg, ae, gen_block, gen_inst, gen_dst);
        }
        if func.dfg.reg_kind(dst) == RegKind::Temp {
            dst = promote_temp(func, cfg, ae, block, inst, dst);
        }

        let cpy = func.dfg.make_inst(InstructionData::Unary {
            opcode: Opcode::Cpy,
            dst: shared,
            src: gen_dst,
        });
        func.layout.insert_after(cpy, gen_inst);
        if cfg[gen_block].last.expand() == Some(gen_inst) {
            cfg[gen_block].last = cpy.into();
        }
        *changed_def = true;
    }

    func.dfg[inst] = InstructionData::Unary {
        opcode: Opcode::Cpy,
        dst,
        src: shared,
    };
    *changed_use = true;
}

/// Replace a temp register with a fresh pseudo at its definition and every
/// use inside `block`. Expression instructions keep their interned form id
/// across the rewrite.
fn promote_temp(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    ae: &mut AvailableExpressions,
    block: Block,
    def_inst: Inst,
    temp: Reg,
) -> Reg {
    let promoted = func.dfg.make_reg(func.dfg.reg_ty(temp), RegKind::Pseudo);

    let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();
    for walk in insts {
        let old_id = ae.lookup_id(func, walk);
        let mut rewrote = false;
        for slot in func.dfg[walk].uses_mut() {
            if *slot == temp {
                *slot = promoted;
                rewrote = true;
            }
        }
        if rewrote {
            if let Some(id) = old_id {
                ae.rebind(func, walk, id);
            }
        }
    }

    if let Some(dst) = func.dfg[def_inst].def_mut() {
        if *dst == temp {
            *dst = promoted;
        }
    }
    promoted
}
