//! Available expressions.
//!
//! A forward, all-paths dataflow problem over canonicalized expression
//! forms. Two instructions computing the same canonical form share one
//! interned id; sets of available expressions are ordered by that id, with
//! the generating instruction as a tiebreak so the same form can appear with
//! several generating instructions during CSE.
//!
//! Canonicalization sorts the operands of commutative integer operations so
//! `add a, b` and `add b, a` collide; float ADD/MUL keep their operand order
//! (IEEE addition is not associative, and reordering is not licensed).
//! CVT keys on the destination *type* and the source register; a CALL is
//! never equal to anything but itself.

use crate::cfg::ControlFlowGraph;
use crate::dataflow::{solve, DataflowProblem, Direction};
use crate::inst_predicates::is_expression;
use crate::ir::{Block, ExprId, Function, Inst, InstructionData, Opcode, Reg, Type};
use cranelift_entity::{PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// One operand slot of a canonical expression form.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ExprOperand {
    /// Unused slot (unary operations).
    None,
    /// A register operand.
    Reg(Reg),
    /// A type stand-in (the destination type of a CVT).
    Ty(Type),
    /// An instruction identity (CALL; incomparable to any other form).
    Inst(Inst),
}

/// A canonicalized `(opcode, left, right)` expression form.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ExprKey {
    opcode: Opcode,
    left: ExprOperand,
    right: ExprOperand,
}

impl ExprKey {
    /// The canonical form of `inst`, or `None` if the instruction does not
    /// compute an expression.
    pub fn from_inst(func: &Function, inst: Inst) -> Option<ExprKey> {
        let data = &func.dfg[inst];
        match data {
            InstructionData::Binary {
                opcode,
                src1,
                src2,
                ..
            } => {
                let (mut left, mut right) = (*src1, *src2);
                let float_operand =
                    func.dfg.reg_ty(left).is_float() || func.dfg.reg_ty(right).is_float();
                if opcode.is_commutative() && !float_operand && right < left {
                    core::mem::swap(&mut left, &mut right);
                }
                Some(ExprKey {
                    opcode: *opcode,
                    left: ExprOperand::Reg(left),
                    right: ExprOperand::Reg(right),
                })
            }
            InstructionData::Unary {
                opcode: Opcode::Cvt,
                dst,
                src,
            } => Some(ExprKey {
                opcode: Opcode::Cvt,
                left: ExprOperand::Ty(func.dfg.reg_ty(*dst)),
                right: ExprOperand::Reg(*src),
            }),
            InstructionData::Unary {
                opcode: opcode @ (Opcode::Neg | Opcode::Not),
                src,
                ..
            } => Some(ExprKey {
                opcode: *opcode,
                left: ExprOperand::Reg(*src),
                right: ExprOperand::None,
            }),
            // Two calls are never the same expression; key on identity.
            InstructionData::Call { .. } => Some(ExprKey {
                opcode: Opcode::Call,
                left: ExprOperand::Inst(inst),
                right: ExprOperand::None,
            }),
            _ => None,
        }
    }
}

/// An available expression: interned id plus the generating instruction it
/// was seen at.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct AvailExpr {
    /// Interned form id. Primary sort key.
    pub id: ExprId,
    /// Generating instruction; `None` only for range-search bounds.
    pub inst: Option<Inst>,
    /// Block of the generating instruction.
    pub block: Option<Block>,
}

/// An ordered set of available expressions.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct AvailExprSet(BTreeSet<AvailExpr>);

impl AvailExprSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an expression instance.
    pub fn insert(&mut self, e: AvailExpr) -> bool {
        self.0.insert(e)
    }

    /// All instances of form `id`, ordered by generating instruction.
    pub fn with_id(&self, id: ExprId) -> impl Iterator<Item = &AvailExpr> {
        let lo = AvailExpr {
            id,
            inst: None,
            block: None,
        };
        self.0.range(lo..).take_while(move |e| e.id == id)
    }

    /// Is some instance of form `id` present?
    pub fn contains_id(&self, id: ExprId) -> bool {
        self.with_id(id).next().is_some()
    }

    /// Remove every expression whose generating instruction uses `reg`.
    pub fn erase_using(&mut self, func: &Function, reg: Reg) {
        let doomed: Vec<AvailExpr> = self
            .0
            .iter()
            .filter(|e| match e.inst {
                Some(inst) => func.dfg[inst].uses().contains(&reg),
                None => false,
            })
            .copied()
            .collect();
        for e in doomed {
            self.0.remove(&e);
        }
    }

    /// Intersect with another set.
    pub fn intersect(&self, other: &AvailExprSet) -> AvailExprSet {
        AvailExprSet(self.0.intersection(&other.0).cloned().collect())
    }

    /// All instances.
    pub fn iter(&self) -> impl Iterator<Item = &AvailExpr> {
        self.0.iter()
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Representative site of an interned expression form.
#[derive(Clone, Copy, Debug)]
struct ExprInfo {
    inst: Inst,
    block: Block,
}

/// The available-expression analysis: interned forms plus the per-block
/// available sets at block exit.
pub struct AvailableExpressions {
    ids: FxHashMap<ExprKey, ExprId>,
    info: PrimaryMap<ExprId, ExprInfo>,
    out: SecondaryMap<Block, AvailExprSet>,
    valid: bool,
}

impl AvailableExpressions {
    /// Allocate an empty analysis.
    pub fn new() -> Self {
        Self {
            ids: FxHashMap::default(),
            info: PrimaryMap::new(),
            out: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Clear the analysis.
    pub fn clear(&mut self) {
        self.ids.clear();
        self.info = PrimaryMap::new();
        self.out.clear();
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Recompute the interned forms and the per-block available sets.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.clear();

        // Intern every expression in the procedure; the first instruction
        // computing a form becomes its representative.
        for block in cfg.blocks() {
            for inst in cfg.block_insts(block, &func.layout) {
                if !is_expression(&func.dfg[inst]) {
                    continue;
                }
                if let Some(key) = ExprKey::from_inst(func, inst) {
                    if !self.ids.contains_key(&key) {
                        let id = self.info.push(ExprInfo { inst, block });
                        self.ids.insert(key, id);
                    }
                }
            }
        }

        let mut all = AvailExprSet::new();
        for (id, info) in self.info.iter() {
            all.insert(AvailExpr {
                id,
                inst: Some(info.inst),
                block: Some(info.block),
            });
        }

        let mut problem = AeProblem {
            func,
            ids: &self.ids,
            info: &self.info,
            all,
        };
        solve(&mut problem, cfg, &mut self.out);
        self.valid = true;
    }

    /// The representative instance of the canonical form of `inst`.
    pub fn lookup(&self, func: &Function, inst: Inst) -> Option<AvailExpr> {
        let key = ExprKey::from_inst(func, inst)?;
        let id = *self.ids.get(&key)?;
        let info = self.info[id];
        Some(AvailExpr {
            id,
            inst: Some(info.inst),
            block: Some(info.block),
        })
    }

    /// The interned id of the canonical form of `inst`.
    pub fn lookup_id(&self, func: &Function, inst: Inst) -> Option<ExprId> {
        let key = ExprKey::from_inst(func, inst)?;
        self.ids.get(&key).copied()
    }

    /// Bind the *current* canonical form of `inst` to an existing id. Used
    /// after a transform rewrites the instruction's operands in a way that
    /// does not change the value it computes (temp promotion during CSE).
    pub fn rebind(&mut self, func: &Function, inst: Inst, id: ExprId) {
        if let Some(key) = ExprKey::from_inst(func, inst) {
            self.ids.insert(key, id);
        }
    }

    /// Expressions available at the exit of `block`.
    pub fn out_of(&self, block: Block) -> &AvailExprSet {
        &self.out[block]
    }

    /// Overwrite a block's exit set. CSE refreshes the sets it invalidates.
    pub fn set_out(&mut self, block: Block, set: AvailExprSet) {
        self.out[block] = set;
    }
}

impl Default for AvailableExpressions {
    fn default() -> Self {
        Self::new()
    }
}

struct AeProblem<'a> {
    func: &'a Function,
    ids: &'a FxHashMap<ExprKey, ExprId>,
    info: &'a PrimaryMap<ExprId, ExprInfo>,
    all: AvailExprSet,
}

impl<'a> AeProblem<'a> {
    fn apply_block(&self, cfg: &ControlFlowGraph, block: Block, set: &mut AvailExprSet) {
        for inst in cfg.block_insts(block, &self.func.layout) {
            let data = &self.func.dfg[inst];
            if let Some(reg) = data.def() {
                set.erase_using(self.func, reg);
            }
            if !is_expression(data) {
                continue;
            }
            if let Some(key) = ExprKey::from_inst(self.func, inst) {
                if let Some(&id) = self.ids.get(&key) {
                    let info = self.info[id];
                    set.insert(AvailExpr {
                        id,
                        inst: Some(info.inst),
                        block: Some(info.block),
                    });
                }
            }
        }
    }
}

impl<'a> DataflowProblem for AeProblem<'a> {
    type Value = AvailExprSet;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn init(&mut self, cfg: &ControlFlowGraph, out: &mut SecondaryMap<Block, AvailExprSet>) {
        for block in cfg.blocks() {
            let mut set = AvailExprSet::new();
            self.apply_block(cfg, block, &mut set);
            out[block] = set;
        }
    }

    fn gate(&self, cfg: &ControlFlowGraph, block: Block, incoming: Block) -> bool {
        cfg[block].entry_reachable == cfg[incoming].entry_reachable
    }

    fn meet(&self, inputs: &[AvailExprSet], merged: &mut AvailExprSet) {
        let mut it = inputs.iter();
        *merged = match it.next() {
            Some(first) => {
                let mut acc = first.clone();
                for s in it {
                    acc = acc.intersect(s);
                }
                acc
            }
            None => AvailExprSet::new(),
        };
    }

    fn transfer(
        &mut self,
        cfg: &ControlFlowGraph,
        block: Block,
        input: &AvailExprSet,
        output: &mut AvailExprSet,
    ) {
        // Unreachable blocks see everything as available so they cannot
        // constrain reachable successors through the intersection.
        *output = if cfg[block].entry_reachable {
            input.clone()
        } else {
            self.all.clone()
        };
        self.apply_block(cfg, block, output);
    }
}
