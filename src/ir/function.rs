//! Procedure representation: instruction pool, registers, labels, layout.

use crate::ir::entities::{Inst, Label, Reg};
use crate::ir::instructions::{Imm, InstructionData};
use crate::ir::layout::Layout;
use crate::ir::types::Type;
use core::fmt;
use cranelift_entity::PrimaryMap;

/// The storage class of a register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RegKind {
    /// A fixed machine register.
    Machine,
    /// An expression temporary. Never live across a basic block boundary;
    /// transforms that would extend a temp's range must promote it to a
    /// fresh pseudo register.
    Temp,
    /// A virtual register that may be live across blocks.
    Pseudo,
}

/// Data associated with a register.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RegData {
    /// Storage class.
    pub kind: RegKind,
    /// Value type of the variable held in the register.
    pub ty: Type,
}

/// Data associated with a label symbol.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LabelData {
    /// Symbol name, used only for display and diagnostics.
    pub name: String,
}

/// Pools of instructions, registers and labels for one procedure.
///
/// Program order is tracked separately by the [`Layout`]; an instruction in
/// this pool that is not linked into the layout is simply dormant.
pub struct DataFlowGraph {
    insts: PrimaryMap<Inst, InstructionData>,
    /// Register pool.
    pub regs: PrimaryMap<Reg, RegData>,
    /// Label pool.
    pub labels: PrimaryMap<Label, LabelData>,
}

impl DataFlowGraph {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            insts: PrimaryMap::new(),
            regs: PrimaryMap::new(),
            labels: PrimaryMap::new(),
        }
    }

    /// Allocate a new instruction. It is not linked into the layout.
    pub fn make_inst(&mut self, data: InstructionData) -> Inst {
        self.insts.push(data)
    }

    /// Allocate a new register.
    pub fn make_reg(&mut self, ty: Type, kind: RegKind) -> Reg {
        self.regs.push(RegData { kind, ty })
    }

    /// Allocate a fresh label with a generated name.
    pub fn make_label(&mut self) -> Label {
        let n = self.labels.len();
        self.labels.push(LabelData {
            name: format!(".L{n}"),
        })
    }

    /// Number of instructions ever allocated.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Storage class of `reg`.
    pub fn reg_kind(&self, reg: Reg) -> RegKind {
        self.regs[reg].kind
    }

    /// Value type of `reg`.
    pub fn reg_ty(&self, reg: Reg) -> Type {
        self.regs[reg].ty
    }
}

impl Default for DataFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Index<Inst> for DataFlowGraph {
    type Output = InstructionData;

    fn index(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst]
    }
}

impl core::ops::IndexMut<Inst> for DataFlowGraph {
    fn index_mut(&mut self, inst: Inst) -> &mut InstructionData {
        &mut self.insts[inst]
    }
}

/// A procedure: its name, entity pools, and program order.
pub struct Function {
    /// Procedure name, for diagnostics.
    pub name: String,
    /// Instruction, register and label pools.
    pub dfg: DataFlowGraph,
    /// Program order.
    pub layout: Layout,
}

impl Function {
    /// Create an empty procedure.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dfg: DataFlowGraph::new(),
            layout: Layout::new(),
        }
    }

    /// Allocate an instruction and append it to the program.
    pub fn push(&mut self, data: InstructionData) -> Inst {
        let inst = self.dfg.make_inst(data);
        self.layout.append(inst);
        inst
    }

    /// Replace `inst` with a NOP, leaving it linked in place.
    pub fn make_nop(&mut self, inst: Inst) {
        self.dfg[inst] = InstructionData::Nop;
    }

    /// Format one instruction for display.
    fn write_inst(&self, f: &mut fmt::Formatter, inst: Inst) -> fmt::Result {
        let data = &self.dfg[inst];
        let reg = |r: Reg| {
            let kind = match self.dfg.reg_kind(r) {
                RegKind::Machine => "m",
                RegKind::Temp => "t",
                RegKind::Pseudo => "r",
            };
            format!("{}{}", kind, r.as_u32())
        };
        let lab = |l: Label| self.dfg.labels[l].name.clone();
        match data {
            InstructionData::Nop => write!(f, "    nop"),
            InstructionData::Label { label } => write!(f, "{}:", lab(*label)),
            InstructionData::Jump { target } => write!(f, "    jmp {}", lab(*target)),
            InstructionData::Branch {
                opcode,
                cond,
                target,
            } => write!(f, "    {} {}, {}", opcode, reg(*cond), lab(*target)),
            InstructionData::MultiBranch {
                src,
                offset,
                default,
                targets,
            } => {
                write!(f, "    mbr {}, {}, {} [", reg(*src), offset, lab(*default))?;
                for (i, t) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", lab(*t))?;
                }
                write!(f, "]")
            }
            InstructionData::Ret { value: Some(v) } => write!(f, "    ret {}", reg(*v)),
            InstructionData::Ret { value: None } => write!(f, "    ret"),
            InstructionData::Call { dst, callee, args } => {
                write!(f, "    ")?;
                if let Some(d) = dst {
                    write!(f, "{} = ", reg(*d))?;
                }
                write!(f, "call {}(", reg(*callee))?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", reg(*a))?;
                }
                write!(f, ")")
            }
            InstructionData::Ldc { dst, imm } => {
                write!(f, "    {} = ldc ", reg(*dst))?;
                match imm {
                    Imm::Int(v) => write!(f, "{v}"),
                    Imm::Float(v) => write!(f, "{v}"),
                    Imm::Symbol(s) => write!(f, "&{s}"),
                }
            }
            InstructionData::Unary { opcode, dst, src } => {
                write!(f, "    {} = {} {}", reg(*dst), opcode, reg(*src))
            }
            InstructionData::Binary {
                opcode,
                dst,
                src1,
                src2,
            } => write!(
                f,
                "    {} = {} {}, {}",
                reg(*dst),
                opcode,
                reg(*src1),
                reg(*src2)
            ),
            InstructionData::Store { addr, value } => {
                write!(f, "    str [{}] = {}", reg(*addr), reg(*value))
            }
            InstructionData::MemCopy { dst_addr, src_addr } => {
                write!(f, "    mcpy [{}] = [{}]", reg(*dst_addr), reg(*src_addr))
            }
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "proc {}:", self.name)?;
        for inst in self.layout.insts() {
            self.write_inst(f, inst)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
