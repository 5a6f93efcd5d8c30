//! Constant folding.
//!
//! Two phases. The first combines repeated loads of the same constant
//! within a block into one load plus a shared pseudo register. The second
//! tracks which registers hold known integer constants (temp registers
//! globally, other registers through a per-block peephole overlay) and
//! folds expressions, conditional branches and multi-way branches whose
//! operands are all known.
//!
//! Division, remainder and modulo by a known zero are dynamically undefined:
//! they draw a warning and are left alone.

use crate::context::{pass_disabled, Context};
use crate::diag::Diagnostics;
use crate::inst_predicates::is_expression;
use crate::ir::{Block, Function, Imm, Inst, InstructionData, Opcode, Reg, RegKind, TypeKind};
use crate::operators;
use crate::cfg::ControlFlowGraph;
use rustc_hash::FxHashMap;

/// Fold constants. Registered as the CF pass.
pub fn fold_constants(ctx: &mut Context) {
    if pass_disabled("ECE540_DISABLE_CF") {
        return;
    }
    ctx.ensure_cfg();

    let mut changed_def = false;
    let mut changed_use = false;
    let mut changed_block = false;
    {
        let Context {
            func, cfg, diag, ..
        } = ctx;
        combine_constant_loads(func, cfg, &mut changed_def, &mut changed_use);
        fold(
            func,
            cfg,
            diag,
            &mut changed_def,
            &mut changed_use,
            &mut changed_block,
        );
    }
    if changed_def {
        ctx.changed_def();
    }
    if changed_use {
        ctx.changed_use();
    }
    if changed_block {
        ctx.changed_block();
    }
}

/// A hashable key for LDC immediates.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
enum ImmKey {
    Int(i32),
    FloatBits(u64),
}

impl ImmKey {
    fn of(imm: &Imm) -> Option<ImmKey> {
        match imm {
            Imm::Int(v) => Some(ImmKey::Int(*v)),
            Imm::Float(v) => Some(ImmKey::FloatBits(v.to_bits())),
            Imm::Symbol(_) => None,
        }
    }
}

/// Phase one: in each block, keep only the first load of every repeated
/// constant. The first load's value is copied into a fresh pseudo register,
/// the later loads become NOPs, and later uses of their destinations are
/// remapped to the shared register.
///
/// Only temp destinations with a single in-block definition take part; a
/// pseudo destination may be live across blocks, where remapping its uses
/// would not be sound.
fn combine_constant_loads(
    func: &mut Function,
    cfg: &mut ControlFlowGraph,
    changed_def: &mut bool,
    changed_use: &mut bool,
) {
    let blocks: Vec<Block> = cfg.blocks().collect();
    for block in blocks {
        let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();

        let mut def_counts: FxHashMap<Reg, u32> = FxHashMap::default();
        for &inst in &insts {
            if let Some(reg) = func.dfg[inst].def() {
                *def_counts.entry(reg).or_insert(0) += 1;
            }
        }

        let mut groups: FxHashMap<ImmKey, Vec<Inst>> = FxHashMap::default();
        let mut order: Vec<ImmKey> = Vec::new();
        for &inst in &insts {
            if let InstructionData::Ldc { dst, imm } = &func.dfg[inst] {
                if func.dfg.reg_kind(*dst) != RegKind::Temp {
                    continue;
                }
                if def_counts.get(dst).copied().unwrap_or(0) != 1 {
                    continue;
                }
                if let Some(key) = ImmKey::of(imm) {
                    let group = groups.entry(key).or_default();
                    if group.is_empty() {
                        order.push(key);
                    }
                    group.push(inst);
                }
            }
        }

        let mut remap: FxHashMap<Reg, Reg> = FxHashMap::default();
        for key in order {
            let group = &groups[&key];
            if group.len() < 2 {
                continue;
            }
            let first = group[0];
            let first_dst = func.dfg[first].def().expect("LDC defines its destination");
            let shared = func
                .dfg
                .make_reg(func.dfg.reg_ty(first_dst), RegKind::Pseudo);
            let cpy = func.dfg.make_inst(InstructionData::Unary {
                opcode: Opcode::Cpy,
                dst: shared,
                src: first_dst,
            });
            func.layout.insert_after(cpy, first);
            if cfg[block].last.expand() == Some(first) {
                cfg[block].last = cpy.into();
            }
            for &ldc in &group[1..] {
                let dst = func.dfg[ldc].def().expect("LDC defines its destination");
                remap.insert(dst, shared);
                func.dfg[ldc] = InstructionData::Nop;
            }
            *changed_def = true;
        }

        if remap.is_empty() {
            continue;
        }
        let walk: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();
        for inst in walk {
            for slot in func.dfg[inst].uses_mut() {
                if let Some(&shared) = remap.get(slot) {
                    *slot = shared;
                    *changed_use = true;
                }
            }
        }
    }
}

struct FoldState {
    /// Temp registers holding known integer constants, procedure wide.
    constants: FxHashMap<Reg, i32>,
    /// Non-temp registers holding known constants, within one block.
    peephole: FxHashMap<Reg, i32>,
}

impl FoldState {
    fn get(&self, reg: Reg) -> Option<i32> {
        self.peephole
            .get(&reg)
            .or_else(|| self.constants.get(&reg))
            .copied()
    }

    fn update(&mut self, func: &Function, reg: Reg, value: i32) {
        if func.dfg.reg_kind(reg) == RegKind::Temp {
            self.constants.insert(reg, value);
        } else {
            self.peephole.insert(reg, value);
        }
    }

    /// Local constant propagation feeding the folder: a copy forwards a
    /// known value; any other definition of a non-temp kills its entry.
    fn peek(&mut self, func: &Function, inst: Inst) {
        match &func.dfg[inst] {
            InstructionData::Unary {
                opcode: Opcode::Cpy,
                dst,
                src,
            } => {
                if let Some(&v) = self.peephole.get(src) {
                    if func.dfg.reg_kind(*dst) != RegKind::Temp {
                        self.peephole.insert(*dst, v);
                    }
                } else if let Some(&v) = self.constants.get(src) {
                    self.peephole.insert(*dst, v);
                }
            }
            data => {
                if let Some(dst) = data.def() {
                    self.peephole.remove(&dst);
                }
            }
        }
    }
}

/// Apply a binary integer operator to two known values. `None` when the
/// operation is dynamically undefined for these arguments.
fn fold_binary(
    opcode: Opcode,
    left: i32,
    right: i32,
    diag: &mut Diagnostics,
) -> Option<i32> {
    if matches!(opcode, Opcode::Div | Opcode::Rem | Opcode::Mod) && right == 0 {
        diag.warning("Denominator to DIV, REM or MOD must not be zero.");
        return None;
    }
    Some(match opcode {
        Opcode::Add => left.wrapping_add(right),
        Opcode::Sub => left.wrapping_sub(right),
        Opcode::Mul => left.wrapping_mul(right),
        Opcode::Div => left.wrapping_div(right),
        Opcode::Rem => left.wrapping_rem(right),
        Opcode::Mod => operators::modulo(left, right),
        Opcode::And => left & right,
        Opcode::Ior => left | right,
        Opcode::Xor => left ^ right,
        Opcode::Asr => operators::asr(left, right, diag),
        Opcode::Lsl => operators::lsl(left, right),
        Opcode::Lsr => operators::lsr(left, right, diag),
        Opcode::Rot => operators::rot(left, right),
        Opcode::Seq => (left == right) as i32,
        Opcode::Sne => (left != right) as i32,
        Opcode::Sl => (left < right) as i32,
        Opcode::Sle => (left <= right) as i32,
        _ => return None,
    })
}

/// Phase two: chase constants through temp copies, then fold.
fn fold(
    func: &mut Function,
    cfg: &ControlFlowGraph,
    diag: &mut Diagnostics,
    changed_def: &mut bool,
    changed_use: &mut bool,
    changed_block: &mut bool,
) {
    let mut state = FoldState {
        constants: FxHashMap::default(),
        peephole: FxHashMap::default(),
    };

    for inst in func.layout.insts() {
        if let InstructionData::Ldc {
            dst,
            imm: Imm::Int(v),
        } = &func.dfg[inst]
        {
            if func.dfg.reg_kind(*dst) == RegKind::Temp {
                state.constants.insert(*dst, *v);
            }
        }
    }
    if state.constants.is_empty() {
        return;
    }

    // Propagate known temps through temp-to-temp copies until stable.
    loop {
        let mut grown = false;
        for inst in func.layout.insts() {
            if let InstructionData::Unary {
                opcode: Opcode::Cpy,
                dst,
                src,
            } = &func.dfg[inst]
            {
                if func.dfg.reg_kind(*dst) == RegKind::Temp
                    && func.dfg.reg_kind(*src) == RegKind::Temp
                {
                    if let Some(&v) = state.constants.get(src) {
                        if state.constants.get(dst) != Some(&v) {
                            state.constants.insert(*dst, v);
                            grown = true;
                        }
                    }
                }
            }
        }
        if !grown {
            break;
        }
    }

    let blocks: Vec<Block> = cfg.blocks().collect();
    for block in blocks {
        state.peephole.clear();
        let insts: Vec<Inst> = cfg.block_insts(block, &func.layout).collect();
        for inst in insts {
            state.peek(func, inst);

            match func.dfg[inst].clone() {
                InstructionData::Branch {
                    opcode,
                    cond,
                    target,
                } => {
                    let Some(v) = state.get(cond) else { continue };
                    let taken = (v == 1) == (opcode == Opcode::Btrue);
                    func.dfg[inst] = if taken {
                        InstructionData::Jump { target }
                    } else {
                        InstructionData::Nop
                    };
                    *changed_block = true;
                }
                InstructionData::MultiBranch {
                    src,
                    offset,
                    default,
                    targets,
                } => {
                    let Some(v) = state.get(src) else { continue };
                    let v64 = if func.dfg.reg_ty(src).kind == TypeKind::Unsigned {
                        v as u32 as i64
                    } else {
                        v as i64
                    };
                    let idx = v64 - offset as i64;
                    let target = if idx < 0 || idx > targets.len() as i64 {
                        default
                    } else {
                        targets.get(idx as usize).copied().unwrap_or(default)
                    };
                    func.dfg[inst] = InstructionData::Jump { target };
                    *changed_block = true;
                }
                data if is_expression(&data) => {
                    let result = match &data {
                        InstructionData::Unary { opcode, src, .. } => {
                            let Some(v) = state.get(*src) else { continue };
                            match opcode {
                                // Between integer types no bits change.
                                Opcode::Cvt => Some(v),
                                Opcode::Neg => Some(v.wrapping_neg()),
                                Opcode::Not => Some(!v),
                                _ => None,
                            }
                        }
                        InstructionData::Binary {
                            opcode, src1, src2, ..
                        } => {
                            let (Some(l), Some(r)) = (state.get(*src1), state.get(*src2))
                            else {
                                continue;
                            };
                            fold_binary(*opcode, l, r, diag)
                        }
                        _ => None,
                    };
                    let Some(result) = result else { continue };
                    let dst = data.def().expect("expressions define a register");

                    if func.dfg.reg_kind(dst) == RegKind::Temp {
                        func.dfg[inst] = InstructionData::Ldc {
                            dst,
                            imm: Imm::Int(result),
                        };
                        state.update(func, dst, result);
                    } else {
                        let temp = func.dfg.make_reg(func.dfg.reg_ty(dst), RegKind::Temp);
                        let ldc = func.dfg.make_inst(InstructionData::Ldc {
                            dst: temp,
                            imm: Imm::Int(result),
                        });
                        func.layout.insert_before(ldc, inst);
                        func.dfg[inst] = InstructionData::Unary {
                            opcode: Opcode::Cpy,
                            dst,
                            src: temp,
                        };
                        state.update(func, temp, result);
                        state.update(func, dst, result);
                    }
                    *changed_def = true;
                    *changed_use = true;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::diag::Severity;
    use crate::ir::{Function, Type};

    fn fold_func(func: Function) -> (Context, bool) {
        let mut ctx = Context::new(func);
        fold_constants(&mut ctx);
        let changed = ctx.take_changed();
        (ctx, changed)
    }

    #[test]
    fn binary_fold_into_pseudo() {
        // t1 = ldc 3 ; t2 = ldc 4 ; r = add t1, t2  ==>  r holds 7 via a
        // fresh LDC and a copy.
        let mut func = Function::new("p");
        let t1 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let t2 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        func.push(InstructionData::Ldc {
            dst: t1,
            imm: Imm::Int(3),
        });
        func.push(InstructionData::Ldc {
            dst: t2,
            imm: Imm::Int(4),
        });
        let add = func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: r,
            src1: t1,
            src2: t2,
        });
        func.push(InstructionData::Ret { value: Some(r) });

        let (ctx, changed) = fold_func(func);
        assert!(changed);

        // The add became `cpy r <- t` with a preceding `ldc t, 7`.
        match &ctx.func.dfg[add] {
            InstructionData::Unary {
                opcode: Opcode::Cpy,
                dst,
                src,
            } => {
                assert_eq!(*dst, r);
                let ldc = ctx.func.layout.prev(add).unwrap();
                match &ctx.func.dfg[ldc] {
                    InstructionData::Ldc { dst: t, imm } => {
                        assert_eq!(t, src);
                        assert_eq!(*imm, Imm::Int(7));
                    }
                    other => panic!("expected ldc before the copy, got {other:?}"),
                }
            }
            other => panic!("expected the add to fold to a copy, got {other:?}"),
        }
    }

    #[test]
    fn binary_fold_into_temp_rewrites_in_place() {
        let mut func = Function::new("p");
        let t1 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let t2 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let t3 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        func.push(InstructionData::Ldc {
            dst: t1,
            imm: Imm::Int(6),
        });
        func.push(InstructionData::Ldc {
            dst: t2,
            imm: Imm::Int(7),
        });
        let mul = func.push(InstructionData::Binary {
            opcode: Opcode::Mul,
            dst: t3,
            src1: t1,
            src2: t2,
        });
        func.push(InstructionData::Ret { value: Some(t3) });

        let (ctx, _) = fold_func(func);
        assert_eq!(
            ctx.func.dfg[mul],
            InstructionData::Ldc {
                dst: t3,
                imm: Imm::Int(42)
            }
        );
    }

    #[test]
    fn division_by_zero_warns_and_leaves_ir() {
        let mut func = Function::new("p");
        let t1 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let t2 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        func.push(InstructionData::Ldc {
            dst: t1,
            imm: Imm::Int(10),
        });
        func.push(InstructionData::Ldc {
            dst: t2,
            imm: Imm::Int(0),
        });
        let div = func.push(InstructionData::Binary {
            opcode: Opcode::Div,
            dst: r,
            src1: t1,
            src2: t2,
        });
        func.push(InstructionData::Ret { value: Some(r) });

        let (ctx, _) = fold_func(func);
        assert_eq!(
            ctx.func.dfg[div],
            InstructionData::Binary {
                opcode: Opcode::Div,
                dst: r,
                src1: t1,
                src2: t2
            }
        );
        assert_eq!(ctx.diag.count(Severity::Warning), 1);
    }

    #[test]
    fn known_branch_becomes_jump_or_nop() {
        let mut func = Function::new("p");
        let skip_l = func.dfg.make_label();
        let t = func.dfg.make_reg(Type::I32, RegKind::Temp);
        func.push(InstructionData::Ldc {
            dst: t,
            imm: Imm::Int(1),
        });
        let br = func.push(InstructionData::Branch {
            opcode: Opcode::Btrue,
            cond: t,
            target: skip_l,
        });
        func.push(InstructionData::Ret { value: None });
        let skip_i = func.dfg.make_inst(InstructionData::Label { label: skip_l });
        func.layout.append(skip_i);
        func.push(InstructionData::Ret { value: None });

        let (ctx, _) = fold_func(func);
        assert_eq!(ctx.func.dfg[br], InstructionData::Jump { target: skip_l });
    }

    #[test]
    fn known_mbr_picks_indexed_target() {
        let mut func = Function::new("p");
        let a = func.dfg.make_label();
        let b = func.dfg.make_label();
        let dflt = func.dfg.make_label();
        let t = func.dfg.make_reg(Type::I32, RegKind::Temp);
        func.push(InstructionData::Ldc {
            dst: t,
            imm: Imm::Int(11),
        });
        let mbr = func.push(InstructionData::MultiBranch {
            src: t,
            offset: 10,
            default: dflt,
            targets: vec![a, b],
        });
        for l in [a, b, dflt] {
            let li = func.dfg.make_inst(InstructionData::Label { label: l });
            func.layout.append(li);
            func.push(InstructionData::Ret { value: None });
        }

        let (ctx, _) = fold_func(func);
        assert_eq!(ctx.func.dfg[mbr], InstructionData::Jump { target: b });
    }

    #[test]
    fn repeated_loads_are_combined() {
        let mut func = Function::new("p");
        let t1 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let t2 = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let r1 = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let r2 = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let s = func.dfg.make_reg(Type::ADDR, RegKind::Pseudo);
        func.push(InstructionData::Ldc {
            dst: t1,
            imm: Imm::Int(5),
        });
        // A store keeps the first use alive without being foldable.
        func.push(InstructionData::Store { addr: s, value: t1 });
        let second = func.push(InstructionData::Ldc {
            dst: t2,
            imm: Imm::Int(5),
        });
        func.push(InstructionData::Store { addr: s, value: t2 });
        func.push(InstructionData::Unary {
            opcode: Opcode::Cpy,
            dst: r1,
            src: t1,
        });
        func.push(InstructionData::Unary {
            opcode: Opcode::Cpy,
            dst: r2,
            src: t2,
        });
        func.push(InstructionData::Ret { value: Some(r1) });

        let (ctx, _) = fold_func(func);
        // The second load is gone and the later use of its temp now reads
        // the shared pseudo register.
        assert_eq!(ctx.func.dfg[second], InstructionData::Nop);
        let uses_t2: usize = ctx
            .func
            .layout
            .insts()
            .map(|i| {
                ctx.func.dfg[i]
                    .uses()
                    .iter()
                    .filter(|&&u| u == t2)
                    .count()
            })
            .sum();
        assert_eq!(uses_t2, 0);
    }
}
