//! Three-address linear intermediate representation.

pub mod entities;
pub mod function;
pub mod instructions;
pub mod layout;
pub mod types;

pub use crate::ir::entities::{Block, ExprId, Inst, Label, Reg};
pub use crate::ir::function::{DataFlowGraph, Function, LabelData, RegData, RegKind};
pub use crate::ir::instructions::{CallArgs, Imm, InstructionData, Opcode};
pub use crate::ir::layout::Layout;
pub use crate::ir::types::{Type, TypeKind};
