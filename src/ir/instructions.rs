//! Instruction formats and opcodes.
//!
//! An instruction is a tagged record: an [`Opcode`] together with the operand
//! format it uses. Formats are shared between opcodes with the same shape
//! (all binary arithmetic uses `Binary`, the unary register-to-register
//! operations share `Unary`), so the opcode is stored explicitly in shared
//! formats.
//!
//! Operand access goes through the slot model: `uses()` enumerates the used
//! registers in a fixed order, and `uses_mut()` returns the same slots
//! mutably so a single operand can be rewritten in place without disturbing
//! the others. The slot index of a use is its position in this order.

use crate::ir::entities::{Label, Reg};
use core::fmt;
use smallvec::SmallVec;

/// Instruction opcodes.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Opcode {
    Nop,
    Label,
    Jmp,
    Btrue,
    Bfalse,
    Mbr,
    Ret,
    Call,
    Ldc,
    Load,
    Str,
    Mcpy,
    Cpy,
    Cvt,
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Mod,
    And,
    Ior,
    Xor,
    Asr,
    Lsl,
    Lsr,
    Rot,
    Seq,
    Sne,
    Sl,
    Sle,
}

impl Opcode {
    /// True for the two-operand computational opcodes (the `Binary` format).
    pub fn is_binary(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Add | Sub | Mul | Div | Rem | Mod | And | Ior | Xor | Asr | Lsl | Lsr | Rot | Seq
                | Sne | Sl | Sle
        )
    }

    /// True for the comparison opcodes, which produce 0 or 1.
    pub fn is_compare(self) -> bool {
        use Opcode::*;
        matches!(self, Seq | Sne | Sl | Sle)
    }

    /// True for opcodes whose result is insensitive to operand order on
    /// integer operands.
    pub fn is_commutative(self) -> bool {
        use Opcode::*;
        matches!(self, Add | Mul | And | Ior | Xor)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Opcode::Nop => "nop",
            Opcode::Label => "label",
            Opcode::Jmp => "jmp",
            Opcode::Btrue => "btrue",
            Opcode::Bfalse => "bfalse",
            Opcode::Mbr => "mbr",
            Opcode::Ret => "ret",
            Opcode::Call => "call",
            Opcode::Ldc => "ldc",
            Opcode::Load => "load",
            Opcode::Str => "str",
            Opcode::Mcpy => "mcpy",
            Opcode::Cpy => "cpy",
            Opcode::Cvt => "cvt",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Rem => "rem",
            Opcode::Mod => "mod",
            Opcode::And => "and",
            Opcode::Ior => "ior",
            Opcode::Xor => "xor",
            Opcode::Asr => "asr",
            Opcode::Lsl => "lsl",
            Opcode::Lsr => "lsr",
            Opcode::Rot => "rot",
            Opcode::Seq => "seq",
            Opcode::Sne => "sne",
            Opcode::Sl => "sl",
            Opcode::Sle => "sle",
        };
        f.write_str(name)
    }
}

/// An immediate operand for `LDC`.
#[derive(Clone, Debug, PartialEq)]
pub enum Imm {
    /// Integer immediate; the bit pattern serves both signed and unsigned
    /// destinations.
    Int(i32),
    /// Floating point immediate.
    Float(f64),
    /// The address of a named symbol. Never foldable.
    Symbol(String),
}

/// The argument list of a `CALL`.
pub type CallArgs = SmallVec<[Reg; 4]>;

/// An instruction: opcode plus operands, in one of a small number of formats.
#[derive(Clone, Debug, PartialEq)]
pub enum InstructionData {
    /// No operation. Placeholder left behind by transforms until NOP removal.
    Nop,
    /// Marks a branch target. Leader of every non-empty basic block.
    Label { label: Label },
    /// Unconditional jump.
    Jump { target: Label },
    /// Conditional branch; `opcode` is `Btrue` or `Bfalse`. Falls through
    /// when not taken.
    Branch { opcode: Opcode, cond: Reg, target: Label },
    /// Multi-way branch on `src - offset` into `targets`, defaulting to
    /// `default` when out of range.
    MultiBranch {
        src: Reg,
        offset: i32,
        default: Label,
        targets: Vec<Label>,
    },
    /// Return, optionally with a value.
    Ret { value: Option<Reg> },
    /// Call through the procedure address in `callee`.
    Call {
        dst: Option<Reg>,
        callee: Reg,
        args: CallArgs,
    },
    /// Load constant.
    Ldc { dst: Reg, imm: Imm },
    /// Unary register-to-register operation; `opcode` is one of
    /// `Cpy`, `Cvt`, `Neg`, `Not`, `Load`.
    Unary { opcode: Opcode, dst: Reg, src: Reg },
    /// Binary operation; `opcode` satisfies [`Opcode::is_binary`].
    Binary {
        opcode: Opcode,
        dst: Reg,
        src1: Reg,
        src2: Reg,
    },
    /// Store `value` through the address in `addr`.
    Store { addr: Reg, value: Reg },
    /// Copy the object at `src_addr` to `dst_addr`.
    MemCopy { dst_addr: Reg, src_addr: Reg },
}

impl InstructionData {
    /// The opcode of this instruction.
    pub fn opcode(&self) -> Opcode {
        match self {
            InstructionData::Nop => Opcode::Nop,
            InstructionData::Label { .. } => Opcode::Label,
            InstructionData::Jump { .. } => Opcode::Jmp,
            InstructionData::Branch { opcode, .. } => *opcode,
            InstructionData::MultiBranch { .. } => Opcode::Mbr,
            InstructionData::Ret { .. } => Opcode::Ret,
            InstructionData::Call { .. } => Opcode::Call,
            InstructionData::Ldc { .. } => Opcode::Ldc,
            InstructionData::Unary { opcode, .. } => *opcode,
            InstructionData::Binary { opcode, .. } => *opcode,
            InstructionData::Store { .. } => Opcode::Str,
            InstructionData::MemCopy { .. } => Opcode::Mcpy,
        }
    }

    /// The register this instruction assigns, if any.
    ///
    /// Present for `CPY`, `CVT`, `NEG`, `NOT`, `LOAD`, the binary operations,
    /// `LDC`, and `CALL` with a destination.
    pub fn def(&self) -> Option<Reg> {
        match self {
            InstructionData::Unary { dst, .. } => Some(*dst),
            InstructionData::Binary { dst, .. } => Some(*dst),
            InstructionData::Ldc { dst, .. } => Some(*dst),
            InstructionData::Call { dst, .. } => *dst,
            _ => None,
        }
    }

    /// Mutable access to the destination slot.
    pub fn def_mut(&mut self) -> Option<&mut Reg> {
        match self {
            InstructionData::Unary { dst, .. } => Some(dst),
            InstructionData::Binary { dst, .. } => Some(dst),
            InstructionData::Ldc { dst, .. } => Some(dst),
            InstructionData::Call { dst, .. } => dst.as_mut(),
            _ => None,
        }
    }

    /// The registers this instruction reads, in slot order.
    pub fn uses(&self) -> SmallVec<[Reg; 4]> {
        let mut out = SmallVec::new();
        match self {
            InstructionData::Ret { value: Some(v) } => out.push(*v),
            InstructionData::Store { addr, value } => {
                out.push(*addr);
                out.push(*value);
            }
            InstructionData::MemCopy { dst_addr, src_addr } => {
                out.push(*dst_addr);
                out.push(*src_addr);
            }
            InstructionData::Unary { src, .. } => out.push(*src),
            InstructionData::Binary { src1, src2, .. } => {
                out.push(*src1);
                out.push(*src2);
            }
            InstructionData::Branch { cond, .. } => out.push(*cond),
            InstructionData::MultiBranch { src, .. } => out.push(*src),
            InstructionData::Call { callee, args, .. } => {
                out.push(*callee);
                out.extend(args.iter().copied());
            }
            _ => {}
        }
        out
    }

    /// Mutable references to the use slots, in the same order as `uses()`.
    pub fn uses_mut(&mut self) -> SmallVec<[&mut Reg; 4]> {
        let mut out: SmallVec<[&mut Reg; 4]> = SmallVec::new();
        match self {
            InstructionData::Ret { value: Some(v) } => out.push(v),
            InstructionData::Store { addr, value } => {
                out.push(addr);
                out.push(value);
            }
            InstructionData::MemCopy { dst_addr, src_addr } => {
                out.push(dst_addr);
                out.push(src_addr);
            }
            InstructionData::Unary { src, .. } => out.push(src),
            InstructionData::Binary { src1, src2, .. } => {
                out.push(src1);
                out.push(src2);
            }
            InstructionData::Branch { cond, .. } => out.push(cond),
            InstructionData::MultiBranch { src, .. } => out.push(src),
            InstructionData::Call { callee, args, .. } => {
                out.push(callee);
                out.extend(args.iter_mut());
            }
            _ => {}
        }
        out
    }

    /// Replace `old` with `new` wherever it appears as a branch or jump
    /// target. Labels themselves are left alone. Returns the number of slots
    /// rewritten.
    pub fn replace_target(&mut self, old: Label, new: Label) -> u32 {
        let mut n = 0;
        match self {
            InstructionData::Jump { target } | InstructionData::Branch { target, .. } => {
                if *target == old {
                    *target = new;
                    n += 1;
                }
            }
            InstructionData::MultiBranch {
                default, targets, ..
            } => {
                if *default == old {
                    *default = new;
                    n += 1;
                }
                for t in targets.iter_mut() {
                    if *t == old {
                        *t = new;
                        n += 1;
                    }
                }
            }
            _ => {}
        }
        n
    }

    /// Does this instruction jump or branch to `label`?
    pub fn jumps_to(&self, label: Label) -> bool {
        match self {
            InstructionData::Jump { target } | InstructionData::Branch { target, .. } => {
                *target == label
            }
            InstructionData::MultiBranch {
                default, targets, ..
            } => *default == label || targets.contains(&label),
            _ => false,
        }
    }
}
