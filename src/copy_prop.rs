//! Copy propagation.
//!
//! A use of a pseudo register `r` is rewritten to read `s` directly when
//! every definition of `r` reaching that use is the same copy `r <- s` (or
//! copies of the same `s`), and `s` is itself a pseudo register. The UD
//! chains provide the reaching definitions per use.

use crate::context::{pass_disabled, Context};
use crate::ir::{Inst, InstructionData, Opcode, Reg, RegKind};

/// Propagate copies. Registered as the CP pass.
pub fn propagate_copies(ctx: &mut Context) {
    if pass_disabled("ECE540_DISABLE_CP") {
        return;
    }
    ctx.ensure_use_def();

    let mut replaced = false;
    {
        let Context {
            func, cfg, use_def, ..
        } = ctx;

        let blocks: Vec<_> = cfg.blocks().collect();
        for block in blocks {
            let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();
            for inst in insts {
                let reaching = use_def.defs_reaching(inst);

                let mut rewrites: Vec<(usize, Reg)> = Vec::new();
                for (slot, reg) in func.dfg[inst].uses().into_iter().enumerate() {
                    if func.dfg.reg_kind(reg) != RegKind::Pseudo {
                        continue;
                    }

                    // Every reaching def must be a copy out of one register.
                    let mut copied: Option<Reg> = None;
                    let mut any = false;
                    let mut eligible = true;
                    for def in reaching.defs_of(reg) {
                        any = true;
                        match &func.dfg[def.inst] {
                            InstructionData::Unary {
                                opcode: Opcode::Cpy,
                                src,
                                ..
                            } => {
                                if copied.is_some() && copied != Some(*src) {
                                    eligible = false;
                                    break;
                                }
                                copied = Some(*src);
                            }
                            _ => {
                                eligible = false;
                                break;
                            }
                        }
                    }
                    // No reaching defs at all likely means a parameter;
                    // leave it alone.
                    if !any || !eligible {
                        continue;
                    }
                    let src = copied.expect("at least one reaching copy");
                    if func.dfg.reg_kind(src) != RegKind::Pseudo || src == reg {
                        continue;
                    }
                    rewrites.push((slot, src));
                }

                if rewrites.is_empty() {
                    continue;
                }
                for (i, slot) in func.dfg[inst].uses_mut().into_iter().enumerate() {
                    if let Some(&(_, src)) = rewrites.iter().find(|(j, _)| *j == i) {
                        *slot = src;
                    }
                }
                replaced = true;
            }
        }
    }
    if replaced {
        ctx.changed_use();
    }
}
