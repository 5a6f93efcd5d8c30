//! IR entity references.
//!
//! Instructions, registers, labels and basic blocks are referred to by small
//! `u32` index types rather than Rust references. The index is the stable
//! identity of the entity: unlinking an instruction from the layout does not
//! invalidate its `Inst`, so analyses may keep instruction references across
//! unrelated edits. Compact data structures use `PackedOption<T>`, function
//! signatures prefer `Option<T>`.

use cranelift_entity::entity_impl;

/// An opaque reference to an instruction in a procedure.
///
/// The reference stays valid for the lifetime of the [`Function`](super::Function),
/// even while the instruction is not linked into the layout.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a basic block in the control flow graph.
///
/// Block ids are assigned monotonically as blocks are formed; the id order
/// does not necessarily match the block layout order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a virtual register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(u32);
entity_impl!(Reg, "r");

/// An opaque reference to a label symbol.
///
/// Labels are targets of jumps and branches. Every non-empty basic block
/// starts with a `LABEL` instruction naming one of these.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);
entity_impl!(Label, "L");

/// An interned available-expression id.
///
/// Canonicalized expression forms receive monotonically assigned ids; sets of
/// available expressions are ordered by this id.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);
entity_impl!(ExprId, "expr");
