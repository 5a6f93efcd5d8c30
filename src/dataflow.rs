//! Generic iterative dataflow solver.
//!
//! The same driver solves forward and backward problems; a backward problem
//! simply draws its incoming values from successors instead of predecessors
//! and sweeps the blocks in reverse layout order. The solver iterates to a
//! fixed point; see p. 627 of Aho, Lam, Sethi and Ullman, 2nd edition.
//!
//! A problem supplies a gate deciding whether a given neighbor's output
//! participates in the merge at all. The reachability gate (only merge
//! neighbors whose entry-reachability matches the current block) keeps
//! unreachable predecessors from constraining analyses of reachable code,
//! and vice versa.

use crate::cfg::ControlFlowGraph;
use crate::ir::Block;
use cranelift_entity::SecondaryMap;

/// Direction of information flow.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Direction {
    Forward,
    Backward,
}

/// A dataflow problem: domain, boundary conditions, meet and transfer.
pub trait DataflowProblem {
    /// The domain. One value is tracked per block: the block's *output*
    /// (at exit for forward problems, at entry for backward problems).
    type Value: Clone + PartialEq + Default;

    /// Which way information flows.
    fn direction(&self) -> Direction;

    /// Set boundary and initial values.
    fn init(&mut self, cfg: &ControlFlowGraph, out: &mut SecondaryMap<Block, Self::Value>);

    /// Should `incoming`'s output take part in the merge at `block`?
    fn gate(&self, _cfg: &ControlFlowGraph, _block: Block, _incoming: Block) -> bool {
        true
    }

    /// Combine the gated neighbor outputs into the merged incoming value.
    /// `merged` arrives holding the block's current output and must be
    /// overwritten.
    fn meet(&self, inputs: &[Self::Value], merged: &mut Self::Value);

    /// Compute the block's new output from the merged incoming value.
    /// `output` arrives holding the previous output.
    fn transfer(
        &mut self,
        cfg: &ControlFlowGraph,
        block: Block,
        input: &Self::Value,
        output: &mut Self::Value,
    );

    /// Optional post-pass over the final values.
    fn finalize(&mut self, _cfg: &ControlFlowGraph, _block: Block, _value: &mut Self::Value) {}
}

/// Run `problem` to a fixed point over `cfg`, leaving each block's output in
/// `out`.
pub fn solve<P: DataflowProblem>(
    problem: &mut P,
    cfg: &ControlFlowGraph,
    out: &mut SecondaryMap<Block, P::Value>,
) {
    problem.init(cfg, out);

    let mut order: Vec<Block> = cfg.blocks().collect();
    if problem.direction() == Direction::Backward {
        order.reverse();
    }

    let mut rounds = 0usize;
    loop {
        let mut changed = false;
        for &block in &order {
            let neighbors = match problem.direction() {
                Direction::Forward => cfg[block].predecessors.clone(),
                Direction::Backward => cfg[block].successors.clone(),
            };
            let inputs: Vec<P::Value> = neighbors
                .iter()
                .filter(|&&n| problem.gate(cfg, block, n))
                .map(|&n| out[n].clone())
                .collect();

            let mut merged = out[block].clone();
            problem.meet(&inputs, &mut merged);

            let old = out[block].clone();
            let mut new = old.clone();
            problem.transfer(cfg, block, &merged, &mut new);

            if new != old {
                changed = true;
                out[block] = new;
            }
        }
        rounds += 1;
        if !changed {
            break;
        }
    }
    log::trace!("dataflow fixed point after {} rounds", rounds);

    for &block in &order {
        let mut value = out[block].clone();
        problem.finalize(cfg, block, &mut value);
        out[block] = value;
    }
}
