//! Abstract evaluator.
//!
//! A symbolic interpreter over a small value lattice: concrete values with
//! known bits, symbolic registers unknown on entry, and expression nodes
//! forming a reference-counted DAG over the two. When a whole procedure
//! evaluates (no calls, loads, stores or symbol constants, and every branch
//! resolves), the body is rewritten to just materialize the returned value.
//! A breakpoint entry point drives the loop analysis' "does the loop body
//! run at least once" proof.
//!
//! The interpreter never unwinds; every abnormal condition is an explicit
//! [`Step`] result threaded through the loop. Cycles in the DAG are
//! impossible by construction: binding a register to a value that depends on
//! that register halts evaluation instead.

use crate::context::{pass_disabled, Context};
use crate::diag::Diagnostics;
use crate::ir::{
    Function, Imm, Inst, InstructionData, Label, Opcode, Reg, RegKind, Type, TypeKind,
};
use crate::operators;
use rustc_hash::{FxHashMap, FxHashSet};

/// Outcome of a breakpoint-mode run.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EvalOutcome {
    /// Interpretation executed a return.
    Returned,
    /// Interpretation reached the breakpoint instruction.
    ReachedBreakpoint,
    /// Interpretation halted without an answer.
    Unknown,
}

/// Expression depth bound; limits the amount of loop unrolling the
/// interpreter will simulate symbolically.
const MAX_DEPTH: u32 = 300;

type ValueId = usize;

#[derive(Copy, Clone, PartialEq, Debug)]
enum Concrete {
    Int(i32),
    Uint(u32),
    Float(f64),
}

#[derive(Copy, Clone, Debug)]
enum ValueKind {
    Concrete(Concrete),
    Symbol(Reg),
    Expr {
        opcode: Opcode,
        left: ValueId,
        right: Option<ValueId>,
    },
}

struct ValueNode {
    kind: ValueKind,
    refcount: u32,
    depth: u32,
    /// Symbolic registers this value transitively depends on.
    deps: FxHashSet<Reg>,
    /// Instruction that produced the value, used to recover types during
    /// emission.
    inst: Option<Inst>,
    /// Register holding the value once emitted.
    emitted: Option<Reg>,
}

/// Arena of reference-counted value nodes. Nodes are never reused; a zero
/// refcount only matters for the shared-subexpression test at emission.
#[derive(Default)]
struct Arena {
    nodes: Vec<ValueNode>,
}

impl Arena {
    fn concrete(&mut self, inst: Option<Inst>, value: Concrete) -> ValueId {
        self.nodes.push(ValueNode {
            kind: ValueKind::Concrete(value),
            refcount: 1,
            depth: 1,
            deps: FxHashSet::default(),
            inst,
            emitted: None,
        });
        self.nodes.len() - 1
    }

    fn symbol(&mut self, reg: Reg) -> ValueId {
        self.nodes.push(ValueNode {
            kind: ValueKind::Symbol(reg),
            refcount: 1,
            depth: 1,
            deps: FxHashSet::default(),
            inst: None,
            emitted: None,
        });
        self.nodes.len() - 1
    }

    fn expr(&mut self, inst: Inst, opcode: Opcode, left: ValueId, right: Option<ValueId>) -> ValueId {
        let mut deps = FxHashSet::default();
        self.collect_deps(left, &mut deps);
        let mut depth = self.nodes[left].depth;
        if let Some(r) = right {
            self.collect_deps(r, &mut deps);
            depth = depth.max(self.nodes[r].depth);
        }
        self.inc_ref(left);
        if let Some(r) = right {
            self.inc_ref(r);
        }
        self.nodes.push(ValueNode {
            kind: ValueKind::Expr {
                opcode,
                left,
                right,
            },
            refcount: 1,
            depth: depth + 1,
            deps,
            inst: Some(inst),
            emitted: None,
        });
        self.nodes.len() - 1
    }

    fn collect_deps(&self, v: ValueId, out: &mut FxHashSet<Reg>) {
        match &self.nodes[v].kind {
            ValueKind::Symbol(reg) => {
                out.insert(*reg);
            }
            ValueKind::Expr { .. } => out.extend(self.nodes[v].deps.iter().copied()),
            ValueKind::Concrete(_) => {}
        }
    }

    fn depends_on(&self, v: ValueId, reg: Reg) -> bool {
        match &self.nodes[v].kind {
            ValueKind::Symbol(r) => *r == reg,
            ValueKind::Expr { .. } => self.nodes[v].deps.contains(&reg),
            ValueKind::Concrete(_) => false,
        }
    }

    fn concrete_of(&self, v: ValueId) -> Option<Concrete> {
        match &self.nodes[v].kind {
            ValueKind::Concrete(c) => Some(*c),
            _ => None,
        }
    }

    fn inc_ref(&mut self, v: ValueId) {
        self.nodes[v].refcount += 1;
    }

    fn dec_ref(&mut self, v: ValueId) {
        let mut stack = vec![v];
        while let Some(v) = stack.pop() {
            let node = &mut self.nodes[v];
            debug_assert!(node.refcount > 0, "double release of a value node");
            node.refcount -= 1;
            if node.refcount == 0 {
                if let ValueKind::Expr { left, right, .. } = node.kind {
                    stack.push(left);
                    if let Some(r) = right {
                        stack.push(r);
                    }
                }
            }
        }
    }

    /// Give back the creation reference without releasing children; used
    /// when a freshly built node is immediately wrapped by another.
    fn forget_creation_ref(&mut self, v: ValueId) {
        self.nodes[v].refcount -= 1;
    }
}

enum Step {
    Continue,
    Return,
    Stop(StopKind),
}

enum StopKind {
    Breakpoint,
    SymbolicBranch,
    CallOrLoad(Inst),
    StoreSkip,
    Unsupported,
}

struct Interp {
    arena: Arena,
    regs: FxHashMap<Reg, ValueId>,
    branch_targets: FxHashMap<Label, Option<Inst>>,
    pc: Option<Inst>,
    bp: Option<Inst>,
    /// `Some` once a return executed; holds the returned value if any.
    returned: Option<Option<ValueId>>,
    /// False when the walked range contains something full-procedure
    /// evaluation cannot handle.
    evaluable: bool,
}

impl Interp {
    /// Bind every register in the range to a symbolic value, index the
    /// labels, and note anything that rules out full evaluation.
    fn setup(func: &Function, start: Inst, bp: Option<Inst>) -> Interp {
        let mut interp = Interp {
            arena: Arena::default(),
            regs: FxHashMap::default(),
            branch_targets: FxHashMap::default(),
            pc: Some(start),
            bp,
            returned: None,
            evaluable: true,
        };

        let mut cur = Some(start);
        while let Some(inst) = cur {
            let data = &func.dfg[inst];
            for reg in data.uses() {
                interp.bind_fresh_symbol(reg);
            }
            if let Some(reg) = data.def() {
                interp.bind_fresh_symbol(reg);
            }
            match data {
                InstructionData::Label { label } => {
                    interp
                        .branch_targets
                        .insert(*label, func.layout.next(inst));
                }
                InstructionData::Call { .. }
                | InstructionData::Store { .. }
                | InstructionData::MemCopy { .. } => interp.evaluable = false,
                InstructionData::Unary {
                    opcode: Opcode::Load,
                    ..
                } => interp.evaluable = false,
                InstructionData::Ldc {
                    imm: Imm::Symbol(_),
                    ..
                } => interp.evaluable = false,
                _ => {}
            }
            cur = func.layout.next(inst);
        }
        interp
    }

    fn bind_fresh_symbol(&mut self, reg: Reg) {
        if !self.regs.contains_key(&reg) {
            let v = self.arena.symbol(reg);
            self.regs.insert(reg, v);
        }
    }

    fn value_of(&self, reg: Reg) -> ValueId {
        *self
            .regs
            .get(&reg)
            .expect("setup bound every register in range")
    }

    /// Rebind `dst`, releasing the old value. Halts when the new value has
    /// grown past the depth bound.
    fn assign(&mut self, dst: Reg, value: ValueId) -> Step {
        let old = self.regs.insert(dst, value).expect("register bound at setup");
        self.arena.dec_ref(old);
        if self.arena.nodes[value].depth > MAX_DEPTH {
            return Step::Stop(StopKind::Unsupported);
        }
        Step::Continue
    }

    /// Read a concrete condition as an integer.
    fn concrete_int(&self, v: ValueId) -> Option<i32> {
        match self.arena.concrete_of(v)? {
            Concrete::Int(i) => Some(i),
            Concrete::Uint(u) => Some(u as i32),
            Concrete::Float(_) => None,
        }
    }

    /// Execute one instruction.
    fn step(&mut self, func: &Function, diag: &mut Diagnostics) -> Step {
        let Some(inst) = self.pc else {
            // Walked off the end without returning.
            return Step::Stop(StopKind::Unsupported);
        };
        if Some(inst) == self.bp {
            return Step::Stop(StopKind::Breakpoint);
        }
        self.pc = func.layout.next(inst);

        match func.dfg[inst].clone() {
            InstructionData::Nop | InstructionData::Label { .. } => Step::Continue,

            InstructionData::Ret { value } => {
                let val = value.map(|r| {
                    let v = self.value_of(r);
                    // Keep the returned value alive past cleanup.
                    self.arena.inc_ref(v);
                    v
                });
                self.returned = Some(val);
                Step::Return
            }

            InstructionData::Jump { target } => match self.branch_targets.get(&target) {
                Some(next) => {
                    self.pc = *next;
                    Step::Continue
                }
                None => Step::Stop(StopKind::Unsupported),
            },

            InstructionData::Branch {
                opcode,
                cond,
                target,
            } => {
                let v = self.value_of(cond);
                let Some(c) = self.concrete_int(v) else {
                    return Step::Stop(StopKind::SymbolicBranch);
                };
                let taken = (c == 1) == (opcode == Opcode::Btrue);
                if taken {
                    match self.branch_targets.get(&target) {
                        Some(next) => self.pc = *next,
                        None => return Step::Stop(StopKind::Unsupported),
                    }
                }
                Step::Continue
            }

            InstructionData::MultiBranch {
                src,
                offset,
                default,
                targets,
            } => {
                let v = self.value_of(src);
                let Some(c) = self.concrete_int(v) else {
                    return Step::Stop(StopKind::SymbolicBranch);
                };
                let wide = if func.dfg.reg_ty(src).kind == TypeKind::Unsigned {
                    c as u32 as i64
                } else {
                    c as i64
                };
                let idx = wide - offset as i64;
                let label = if idx < 0 || idx > targets.len() as i64 {
                    default
                } else {
                    targets.get(idx as usize).copied().unwrap_or(default)
                };
                match self.branch_targets.get(&label) {
                    Some(next) => {
                        self.pc = *next;
                        Step::Continue
                    }
                    None => Step::Stop(StopKind::Unsupported),
                }
            }

            InstructionData::Ldc { dst, imm } => {
                let value = match imm {
                    Imm::Int(v) => {
                        if func.dfg.reg_ty(dst).kind == TypeKind::Signed {
                            Concrete::Int(v)
                        } else {
                            Concrete::Uint(v as u32)
                        }
                    }
                    Imm::Float(f) => Concrete::Float(f),
                    Imm::Symbol(_) => return Step::Stop(StopKind::Unsupported),
                };
                let v = self.arena.concrete(Some(inst), value);
                self.assign(dst, v)
            }

            InstructionData::Unary {
                opcode: Opcode::Cpy,
                dst,
                src,
            } => {
                if src == dst {
                    return Step::Continue;
                }
                let v = self.value_of(src);
                self.arena.inc_ref(v);
                let old = self.regs.insert(dst, v).expect("register bound at setup");
                self.arena.dec_ref(old);
                Step::Continue
            }

            InstructionData::Unary {
                opcode: Opcode::Load,
                ..
            } => Step::Stop(StopKind::CallOrLoad(inst)),

            InstructionData::Unary { opcode, dst, src } => {
                self.apply_unary(func, inst, opcode, dst, src)
            }

            InstructionData::Call { .. } => Step::Stop(StopKind::CallOrLoad(inst)),

            InstructionData::Store { .. } | InstructionData::MemCopy { .. } => {
                Step::Stop(StopKind::StoreSkip)
            }

            InstructionData::Binary {
                opcode,
                dst,
                src1,
                src2,
            } => self.apply_binary(diag, inst, opcode, dst, src1, src2),
        }
    }

    fn apply_unary(
        &mut self,
        func: &Function,
        inst: Inst,
        opcode: Opcode,
        dst: Reg,
        src: Reg,
    ) -> Step {
        let a = self.value_of(src);
        if let Some(c) = self.arena.concrete_of(a) {
            let result = match opcode {
                Opcode::Cvt => match func.dfg.reg_ty(dst).kind {
                    TypeKind::Signed => Some(cast_int(c)),
                    TypeKind::Unsigned => Some(cast_uint(c)),
                    TypeKind::Float => Some(cast_float(c)),
                    _ => None,
                },
                Opcode::Neg => Some(match c {
                    Concrete::Int(v) => Concrete::Int(v.wrapping_neg()),
                    Concrete::Uint(v) => Concrete::Uint(v.wrapping_neg()),
                    Concrete::Float(v) => Concrete::Float(-v),
                }),
                Opcode::Not => Some(match c {
                    Concrete::Int(v) => Concrete::Int(!v),
                    Concrete::Uint(v) => Concrete::Uint(!v),
                    // Bitwise complement of a float is not a thing; produce
                    // a harmless zero like the rest of the float fallbacks.
                    Concrete::Float(_) => Concrete::Float(0.0),
                }),
                _ => None,
            };
            let Some(result) = result else {
                return Step::Stop(StopKind::Unsupported);
            };
            let v = self.arena.concrete(Some(inst), result);
            self.assign(dst, v)
        } else {
            if self.arena.depends_on(a, dst) {
                return Step::Stop(StopKind::Unsupported);
            }
            let v = self.arena.expr(inst, opcode, a, None);
            self.assign(dst, v)
        }
    }

    fn apply_binary(
        &mut self,
        diag: &mut Diagnostics,
        inst: Inst,
        opcode: Opcode,
        dst: Reg,
        src1: Reg,
        src2: Reg,
    ) -> Step {
        let a = self.value_of(src1);
        let b = self.value_of(src2);

        // A register compared against itself resolves even symbolically.
        if a == b {
            let shortcut = match opcode {
                Opcode::Seq | Opcode::Sle => Some(1),
                Opcode::Sl => Some(0),
                _ => None,
            };
            if let Some(result) = shortcut {
                let v = self.arena.concrete(Some(inst), Concrete::Int(result));
                return self.assign(dst, v);
            }
        }

        match (self.arena.concrete_of(a), self.arena.concrete_of(b)) {
            (Some(ca), Some(cb)) => {
                let Some(result) = concrete_binary(opcode, ca, cb, diag) else {
                    return Step::Stop(StopKind::Unsupported);
                };
                let v = self.arena.concrete(Some(inst), result);
                self.assign(dst, v)
            }
            _ => {
                if self.arena.depends_on(a, dst) || self.arena.depends_on(b, dst) {
                    return Step::Stop(StopKind::Unsupported);
                }
                let v = combine_constant_adds(&mut self.arena, inst, opcode, a, b)
                    .unwrap_or_else(|| self.arena.expr(inst, opcode, a, Some(b)));
                self.assign(dst, v)
            }
        }
    }

    /// Release every register binding.
    fn cleanup(&mut self) {
        let bound: Vec<ValueId> = self.regs.drain().map(|(_, v)| v).collect();
        for v in bound {
            self.arena.dec_ref(v);
        }
        self.branch_targets.clear();
    }
}

fn cast_int(c: Concrete) -> Concrete {
    Concrete::Int(match c {
        Concrete::Int(v) => v,
        Concrete::Uint(v) => v as i32,
        Concrete::Float(v) => v as i32,
    })
}

fn cast_uint(c: Concrete) -> Concrete {
    Concrete::Uint(match c {
        Concrete::Int(v) => v as u32,
        Concrete::Uint(v) => v,
        Concrete::Float(v) => v as u32,
    })
}

fn cast_float(c: Concrete) -> Concrete {
    Concrete::Float(match c {
        Concrete::Int(v) => v as f64,
        Concrete::Uint(v) => v as f64,
        Concrete::Float(v) => v,
    })
}

/// Apply a binary operator to two known values, dispatching on the left
/// operand's type (the right is coerced). `None` when the operation is
/// undefined for the arguments.
fn concrete_binary(
    opcode: Opcode,
    a: Concrete,
    b: Concrete,
    diag: &mut Diagnostics,
) -> Option<Concrete> {
    match a {
        Concrete::Int(x) => {
            let Concrete::Int(y) = cast_int(b) else {
                unreachable!()
            };
            int_binary(opcode, x, y, diag)
        }
        Concrete::Uint(x) => {
            let Concrete::Uint(y) = cast_uint(b) else {
                unreachable!()
            };
            uint_binary(opcode, x, y, diag)
        }
        Concrete::Float(x) => {
            let Concrete::Float(y) = cast_float(b) else {
                unreachable!()
            };
            float_binary(opcode, x, y)
        }
    }
}

fn int_binary(opcode: Opcode, x: i32, y: i32, diag: &mut Diagnostics) -> Option<Concrete> {
    if matches!(opcode, Opcode::Div | Opcode::Rem | Opcode::Mod) && y == 0 {
        return None;
    }
    Some(match opcode {
        Opcode::Add => Concrete::Int(x.wrapping_add(y)),
        Opcode::Sub => Concrete::Int(x.wrapping_sub(y)),
        Opcode::Mul => Concrete::Int(x.wrapping_mul(y)),
        Opcode::Div => Concrete::Int(x.wrapping_div(y)),
        Opcode::Rem => Concrete::Int(x.wrapping_rem(y)),
        Opcode::Mod => Concrete::Int(operators::modulo(x, y)),
        Opcode::And => Concrete::Int(x & y),
        Opcode::Ior => Concrete::Int(x | y),
        Opcode::Xor => Concrete::Int(x ^ y),
        Opcode::Asr => Concrete::Int(operators::asr(x, y, diag)),
        Opcode::Lsl => Concrete::Int(operators::lsl(x, y)),
        Opcode::Lsr => Concrete::Int(operators::lsr(x, y, diag)),
        Opcode::Rot => Concrete::Int(operators::rot(x, y)),
        Opcode::Seq => Concrete::Int((x == y) as i32),
        Opcode::Sne => Concrete::Int((x != y) as i32),
        Opcode::Sl => Concrete::Int((x < y) as i32),
        Opcode::Sle => Concrete::Int((x <= y) as i32),
        _ => return None,
    })
}

fn uint_binary(opcode: Opcode, x: u32, y: u32, diag: &mut Diagnostics) -> Option<Concrete> {
    if matches!(opcode, Opcode::Div | Opcode::Rem | Opcode::Mod) && y == 0 {
        return None;
    }
    Some(match opcode {
        Opcode::Add => Concrete::Uint(x.wrapping_add(y)),
        Opcode::Sub => Concrete::Uint(x.wrapping_sub(y)),
        Opcode::Mul => Concrete::Uint(x.wrapping_mul(y)),
        Opcode::Div => Concrete::Uint(x / y),
        Opcode::Rem => Concrete::Uint(x % y),
        Opcode::And => Concrete::Uint(x & y),
        Opcode::Ior => Concrete::Uint(x | y),
        Opcode::Xor => Concrete::Uint(x ^ y),
        // The shift/rotate/mod family is defined on the 32-bit pattern.
        Opcode::Mod => Concrete::Int(operators::modulo(x as i32, y as i32)),
        Opcode::Asr => Concrete::Int(operators::asr(x as i32, y as i32, diag)),
        Opcode::Lsl => Concrete::Int(operators::lsl(x as i32, y as i32)),
        Opcode::Lsr => Concrete::Int(operators::lsr(x as i32, y as i32, diag)),
        Opcode::Rot => Concrete::Int(operators::rot(x as i32, y as i32)),
        Opcode::Seq => Concrete::Int((x == y) as i32),
        Opcode::Sne => Concrete::Int((x != y) as i32),
        Opcode::Sl => Concrete::Int((x < y) as i32),
        Opcode::Sle => Concrete::Int((x <= y) as i32),
        _ => return None,
    })
}

fn float_binary(opcode: Opcode, x: f64, y: f64) -> Option<Concrete> {
    Some(match opcode {
        Opcode::Add => Concrete::Float(x + y),
        Opcode::Sub => Concrete::Float(x - y),
        Opcode::Mul => Concrete::Float(x * y),
        Opcode::Div => Concrete::Float(x / y),
        Opcode::Seq => Concrete::Int((x == y) as i32),
        Opcode::Sne => Concrete::Int((x != y) as i32),
        Opcode::Sl => Concrete::Int((x < y) as i32),
        Opcode::Sle => Concrete::Int((x <= y) as i32),
        // Bitwise and shift operators are not defined on floats.
        Opcode::Mod
        | Opcode::And
        | Opcode::Ior
        | Opcode::Xor
        | Opcode::Asr
        | Opcode::Lsl
        | Opcode::Lsr
        | Opcode::Rot => Concrete::Float(0.0),
        _ => return None,
    })
}

/// `C1 + (C2 + e)` flattens to `(C1 + C2) + e`, pooling constants near the
/// leaves so long symbolic sums stay shallow.
fn combine_constant_adds(
    arena: &mut Arena,
    inst: Inst,
    opcode: Opcode,
    a: ValueId,
    b: ValueId,
) -> Option<ValueId> {
    if opcode != Opcode::Add {
        return None;
    }
    let (val, expr) = if arena.concrete_of(a).is_some() {
        (a, b)
    } else if arena.concrete_of(b).is_some() {
        (b, a)
    } else {
        return None;
    };

    let ValueKind::Expr {
        opcode: Opcode::Add,
        left,
        right: Some(right),
    } = arena.nodes[expr].kind
    else {
        return None;
    };
    let (sub_val, sub_expr) = if arena.concrete_of(left).is_some() {
        (left, right)
    } else if arena.concrete_of(right).is_some() {
        (right, left)
    } else {
        return None;
    };

    let sum = match (arena.concrete_of(val)?, arena.concrete_of(sub_val)?) {
        (Concrete::Int(x), Concrete::Int(y)) => Concrete::Int(x.wrapping_add(y)),
        (Concrete::Uint(x), Concrete::Uint(y)) => Concrete::Uint(x.wrapping_add(y)),
        _ => return None,
    };

    let sub_inst = arena.nodes[sub_val].inst;
    let folded = arena.concrete(sub_inst, sum);
    let combined = arena.expr(inst, Opcode::Add, folded, Some(sub_expr));
    // The expression node now holds the only reference to the folded
    // constant.
    arena.forget_creation_ref(folded);
    Some(combined)
}

/// Emit instructions materializing `v` at the end of the layout, returning
/// the register that holds it. Shared subexpressions (refcount above one)
/// are materialized once into a pseudo register.
fn emit(func: &mut Function, arena: &mut Arena, v: ValueId) -> Option<Reg> {
    if let Some(reg) = arena.nodes[v].emitted {
        return Some(reg);
    }
    match arena.nodes[v].kind {
        ValueKind::Symbol(reg) => Some(reg),
        ValueKind::Concrete(c) => {
            let ty = arena.nodes[v]
                .inst
                .and_then(|i| func.dfg[i].def())
                .map(|d| func.dfg.reg_ty(d))
                .unwrap_or(match c {
                    Concrete::Int(_) => Type::I32,
                    Concrete::Uint(_) => Type::U32,
                    Concrete::Float(_) => Type::F64,
                });
            let imm = match c {
                Concrete::Int(i) => Imm::Int(i),
                Concrete::Uint(u) => Imm::Int(u as i32),
                Concrete::Float(f) => Imm::Float(f),
            };
            let temp = func.dfg.make_reg(ty, RegKind::Temp);
            func.push(InstructionData::Ldc { dst: temp, imm });
            let out = if arena.nodes[v].refcount > 1 {
                let shared = func.dfg.make_reg(ty, RegKind::Pseudo);
                func.push(InstructionData::Unary {
                    opcode: Opcode::Cpy,
                    dst: shared,
                    src: temp,
                });
                shared
            } else {
                temp
            };
            arena.nodes[v].emitted = Some(out);
            Some(out)
        }
        ValueKind::Expr {
            opcode,
            left,
            right,
        } => {
            let l = emit(func, arena, left)?;
            let r = match right {
                Some(r) => Some(emit(func, arena, r)?),
                None => None,
            };
            let orig = arena.nodes[v].inst?;
            let orig_dst = func.dfg[orig].def()?;
            let dst = func.dfg.make_reg(func.dfg.reg_ty(orig_dst), RegKind::Pseudo);
            let data = match r {
                Some(r) => InstructionData::Binary {
                    opcode,
                    dst,
                    src1: l,
                    src2: r,
                },
                None => InstructionData::Unary {
                    opcode,
                    dst,
                    src: l,
                },
            };
            func.push(data);
            arena.nodes[v].emitted = Some(dst);
            Some(dst)
        }
    }
}

/// Attempt whole-procedure evaluation. Registered as the EVAL pass.
pub fn abstract_evaluator(ctx: &mut Context) {
    if pass_disabled("ECE540_DISABLE_EVAL") {
        return;
    }

    let mut rewritten = false;
    {
        let Context { func, diag, .. } = ctx;
        let Some(start) = func.layout.first() else {
            return;
        };

        let mut interp = Interp::setup(func, start, None);
        if !interp.evaluable {
            return;
        }

        let finished = loop {
            match interp.step(func, diag) {
                Step::Continue => {}
                Step::Return => break true,
                Step::Stop(_) => break false,
            }
        };
        if !finished {
            interp.cleanup();
            return;
        }
        let returned = interp.returned.take().unwrap_or(None);
        interp.cleanup();

        log::debug!("procedure {} fully evaluated; rewriting", func.name);
        func.layout.clear();
        let value_reg = returned.and_then(|v| {
            let reg = emit(func, &mut interp.arena, v);
            interp.arena.dec_ref(v);
            reg
        });
        func.push(InstructionData::Ret { value: value_reg });
        rewritten = true;
    }

    if rewritten {
        ctx.changed_block();
        ctx.changed_def();
        ctx.changed_use();
    }
}

/// Interpret from `start` until a return, the breakpoint, or an unanswerable
/// condition. Calls and loads bind fresh symbols, stores are skipped; this
/// mode only answers whether control reaches the breakpoint.
pub(crate) fn run_to_breakpoint(
    func: &Function,
    diag: &mut Diagnostics,
    start: Inst,
    breakpoint: Inst,
) -> EvalOutcome {
    let mut interp = Interp::setup(func, start, Some(breakpoint));
    let outcome = loop {
        match interp.step(func, diag) {
            Step::Continue => {}
            Step::Return => break EvalOutcome::Returned,
            Step::Stop(StopKind::Breakpoint) => break EvalOutcome::ReachedBreakpoint,
            Step::Stop(StopKind::CallOrLoad(inst)) => {
                if let Some(dst) = func.dfg[inst].def() {
                    let fresh = interp.arena.symbol(dst);
                    if let Some(old) = interp.regs.insert(dst, fresh) {
                        interp.arena.dec_ref(old);
                    }
                }
            }
            Step::Stop(StopKind::StoreSkip) => {}
            Step::Stop(StopKind::SymbolicBranch) | Step::Stop(StopKind::Unsupported) => {
                break EvalOutcome::Unknown
            }
        }
    };
    interp.cleanup();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    /// s = 0; i = 1; while (i <= 10) { s += i; i += 1 } return s
    fn sum_1_to_10() -> Function {
        let mut func = Function::new("sum");
        let head_l = func.dfg.make_label();
        let done_l = func.dfg.make_label();
        let s = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let i = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let ten = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let one = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let c = func.dfg.make_reg(Type::I32, RegKind::Temp);

        func.push(InstructionData::Ldc {
            dst: s,
            imm: Imm::Int(0),
        });
        func.push(InstructionData::Ldc {
            dst: i,
            imm: Imm::Int(1),
        });
        func.push(InstructionData::Ldc {
            dst: ten,
            imm: Imm::Int(10),
        });
        func.push(InstructionData::Ldc {
            dst: one,
            imm: Imm::Int(1),
        });
        let head_i = func.dfg.make_inst(InstructionData::Label { label: head_l });
        func.layout.append(head_i);
        func.push(InstructionData::Binary {
            opcode: Opcode::Sle,
            dst: c,
            src1: i,
            src2: ten,
        });
        func.push(InstructionData::Branch {
            opcode: Opcode::Bfalse,
            cond: c,
            target: done_l,
        });
        func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: s,
            src1: s,
            src2: i,
        });
        func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: i,
            src1: i,
            src2: one,
        });
        func.push(InstructionData::Jump { target: head_l });
        let done_i = func.dfg.make_inst(InstructionData::Label { label: done_l });
        func.layout.append(done_i);
        func.push(InstructionData::Ret { value: Some(s) });
        func
    }

    #[test]
    fn sums_collapse_to_constant_return() {
        let mut ctx = Context::new(sum_1_to_10());
        abstract_evaluator(&mut ctx);
        assert!(ctx.take_changed());

        let insts: Vec<Inst> = ctx.func.layout.insts().collect();
        assert_eq!(insts.len(), 2);
        let InstructionData::Ldc { dst, imm } = &ctx.func.dfg[insts[0]] else {
            panic!("expected a constant load");
        };
        assert_eq!(*imm, Imm::Int(55));
        assert_eq!(
            ctx.func.dfg[insts[1]],
            InstructionData::Ret { value: Some(*dst) }
        );
    }

    #[test]
    fn symbolic_argument_emits_expression() {
        // r is unknown on entry: return r + 3 stays an add, but of the
        // pooled constant.
        let mut func = Function::new("p");
        let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let t = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let out = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        func.push(InstructionData::Ldc {
            dst: t,
            imm: Imm::Int(3),
        });
        func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: out,
            src1: r,
            src2: t,
        });
        func.push(InstructionData::Ret { value: Some(out) });

        let mut ctx = Context::new(func);
        abstract_evaluator(&mut ctx);

        let ops: Vec<Opcode> = ctx
            .func
            .layout
            .insts()
            .map(|i| ctx.func.dfg[i].opcode())
            .collect();
        assert_eq!(ops, vec![Opcode::Ldc, Opcode::Add, Opcode::Ret]);
        // The emitted add reads the original symbolic register.
        let add = ctx.func.layout.insts().nth(1).unwrap();
        assert!(ctx.func.dfg[add].uses().contains(&r));
    }

    #[test]
    fn call_blocks_full_evaluation() {
        let mut func = Function::new("p");
        let callee = func.dfg.make_reg(Type::ADDR, RegKind::Pseudo);
        let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let call = func.push(InstructionData::Call {
            dst: Some(r),
            callee,
            args: Default::default(),
        });
        func.push(InstructionData::Ret { value: Some(r) });

        let mut ctx = Context::new(func);
        abstract_evaluator(&mut ctx);
        assert!(!ctx.take_changed());
        assert!(ctx.func.layout.is_inserted(call));
    }

    #[test]
    fn breakpoint_mode_reaches_loop_body() {
        // i = 0 ; head: c = sl i, 10 ; bfalse c, done ; body... The body is
        // provably entered on the first iteration.
        let mut func = Function::new("p");
        let head_l = func.dfg.make_label();
        let done_l = func.dfg.make_label();
        let i = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let ten = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let c = func.dfg.make_reg(Type::I32, RegKind::Temp);
        let one = func.dfg.make_reg(Type::I32, RegKind::Pseudo);

        let first = func.push(InstructionData::Ldc {
            dst: i,
            imm: Imm::Int(0),
        });
        func.push(InstructionData::Ldc {
            dst: ten,
            imm: Imm::Int(10),
        });
        func.push(InstructionData::Ldc {
            dst: one,
            imm: Imm::Int(1),
        });
        let head_i = func.dfg.make_inst(InstructionData::Label { label: head_l });
        func.layout.append(head_i);
        func.push(InstructionData::Binary {
            opcode: Opcode::Sl,
            dst: c,
            src1: i,
            src2: ten,
        });
        func.push(InstructionData::Branch {
            opcode: Opcode::Bfalse,
            cond: c,
            target: done_l,
        });
        let body_first = func.push(InstructionData::Binary {
            opcode: Opcode::Add,
            dst: i,
            src1: i,
            src2: one,
        });
        func.push(InstructionData::Jump { target: head_l });
        let done_i = func.dfg.make_inst(InstructionData::Label { label: done_l });
        func.layout.append(done_i);
        func.push(InstructionData::Ret { value: Some(i) });

        let mut diag = Diagnostics::new();
        let outcome = run_to_breakpoint(&func, &mut diag, first, body_first);
        assert_eq!(outcome, EvalOutcome::ReachedBreakpoint);
    }

    #[test]
    fn symbolic_branch_is_unknown() {
        let mut func = Function::new("p");
        let done_l = func.dfg.make_label();
        let n = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        let first = func.push(InstructionData::Branch {
            opcode: Opcode::Btrue,
            cond: n,
            target: done_l,
        });
        let body = func.push(InstructionData::Ret { value: Some(n) });
        let done_i = func.dfg.make_inst(InstructionData::Label { label: done_l });
        func.layout.append(done_i);
        func.push(InstructionData::Ret { value: None });

        let mut diag = Diagnostics::new();
        let outcome = run_to_breakpoint(&func, &mut diag, first, body);
        assert_eq!(outcome, EvalOutcome::Unknown);
    }
}
