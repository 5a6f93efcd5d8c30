//! Dominator analysis.
//!
//! A forward, all-paths dataflow problem over block sets: the entry block's
//! set is `{entry}`, every other block starts from the full block set (so
//! the intersection is bounded), except blocks with no predecessors whose
//! boundary is the empty set. The meet only merges predecessors whose
//! entry-reachability matches the block's, so an unreachable predecessor
//! cannot pollute the dominator sets of reachable code.

use crate::cfg::ControlFlowGraph;
use crate::dataflow::{solve, DataflowProblem, Direction};
use crate::ir::Block;
use crate::set;
use cranelift_entity::SecondaryMap;
use std::collections::BTreeSet;

type DomSet = BTreeSet<Block>;

/// Mapping from each block to the set of blocks that dominate it
/// (inclusive: every block dominates itself).
pub struct Dominators {
    doms: SecondaryMap<Block, DomSet>,
    valid: bool,
}

impl Dominators {
    /// Allocate an empty dominator map.
    pub fn new() -> Self {
        Self {
            doms: SecondaryMap::new(),
            valid: false,
        }
    }

    /// Clear the map.
    pub fn clear(&mut self) {
        self.doms.clear();
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Recompute all dominator sets for `cfg`.
    pub fn compute(&mut self, cfg: &ControlFlowGraph) {
        self.doms.clear();
        let mut problem = DomProblem;
        solve(&mut problem, cfg, &mut self.doms);
        self.valid = true;
    }

    /// The set of blocks dominating `block`.
    pub fn dominators(&self, block: Block) -> &DomSet {
        &self.doms[block]
    }

    /// Does `a` dominate `b`?
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        self.doms[b].contains(&a)
    }

    /// The unique closest strict dominator of `block`, found by pairwise
    /// elimination: of any two candidates, the one failing to dominate the
    /// other cannot be the immediate dominator. `None` for the entry block
    /// and for unreachable blocks that only dominate themselves.
    pub fn immediate_dominator(&self, block: Block) -> Option<Block> {
        let all = &self.doms[block];
        if all.len() <= 1 {
            return None;
        }

        let mut candidates: BTreeSet<Block> = all.clone();
        candidates.remove(&block);

        while candidates.len() > 1 {
            let mut it = candidates.iter();
            let first = *it.next().expect("non-empty candidate set");
            let second = *it.next().expect("len checked above");
            if !self.dominates(second, first) {
                candidates.remove(&first);
            } else {
                candidates.remove(&second);
            }
        }
        candidates.into_iter().next()
    }

}

impl Default for Dominators {
    fn default() -> Self {
        Self::new()
    }
}

struct DomProblem;

impl DataflowProblem for DomProblem {
    type Value = DomSet;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn init(&mut self, cfg: &ControlFlowGraph, out: &mut SecondaryMap<Block, DomSet>) {
        let all: DomSet = cfg.blocks().collect();
        for block in cfg.blocks() {
            if block == cfg.entry() {
                out[block] = DomSet::new();
            } else if cfg[block].predecessors.is_empty() {
                out[block] = DomSet::new();
            } else {
                out[block] = all.clone();
            }
        }
    }

    fn gate(&self, cfg: &ControlFlowGraph, block: Block, incoming: Block) -> bool {
        cfg[block].entry_reachable == cfg[incoming].entry_reachable
    }

    fn meet(&self, inputs: &[DomSet], merged: &mut DomSet) {
        *merged = set::intersect_all(inputs.iter());
    }

    fn transfer(&mut self, _cfg: &ControlFlowGraph, block: Block, input: &DomSet, output: &mut DomSet) {
        *output = input.clone();
        output.insert(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::ir::{Function, InstructionData, Opcode, RegKind, Type};

    fn diamond() -> (Function, ControlFlowGraph) {
        let mut func = Function::new("diamond");
        let then_l = func.dfg.make_label();
        let join_l = func.dfg.make_label();
        let cond = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
        func.push(InstructionData::Branch {
            opcode: Opcode::Btrue,
            cond,
            target: then_l,
        });
        func.push(InstructionData::Jump { target: join_l });
        let then_i = func.dfg.make_inst(InstructionData::Label { label: then_l });
        func.layout.append(then_i);
        let join_i = func.dfg.make_inst(InstructionData::Label { label: join_l });
        func.layout.append(join_i);
        func.push(InstructionData::Ret { value: None });

        let mut cfg = ControlFlowGraph::new();
        let mut diag = Diagnostics::new();
        cfg.compute(&mut func, &mut diag);
        (func, cfg)
    }

    #[test]
    fn diamond_dominators() {
        let (_func, cfg) = diamond();
        let order: Vec<Block> = cfg.blocks().collect();
        let (entry, b0, b1, b2, b3) = (order[0], order[1], order[2], order[3], order[4]);

        let mut doms = Dominators::new();
        doms.compute(&cfg);

        // Every block dominates itself; the entry dominates everything.
        for &b in &order {
            assert!(doms.dominates(b, b));
            assert!(doms.dominates(entry, b) || b == entry);
        }
        // The join is dominated by the branch block but by neither arm.
        assert!(doms.dominates(b0, b3));
        assert!(!doms.dominates(b1, b3));
        assert!(!doms.dominates(b2, b3));

        assert_eq!(doms.immediate_dominator(b3), Some(b0));
        assert_eq!(doms.immediate_dominator(b1), Some(b0));
        assert_eq!(doms.immediate_dominator(b0), Some(entry));
        assert_eq!(doms.immediate_dominator(entry), None);
    }
}
