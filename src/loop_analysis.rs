//! Natural loop identification and pre-header synthesis.
//!
//! A back edge is a CFG edge `tail -> head` where `head` dominates `tail`;
//! the loop body is everything backward-reachable from the tail without
//! passing the head. Discovering a loop also gives it a pre-header: a fresh
//! empty block spliced immediately before the head that becomes the sole
//! non-loop predecessor, with every jump to the head (except the back edges
//! themselves) retargeted at the pre-header's label.
//!
//! Two back edges sharing a head describe one loop: the second extends the
//! first's tail list and body.

use crate::cfg::ControlFlowGraph;
use crate::diag::Diagnostics;
use crate::dominators::Dominators;
use crate::inst_predicates::{can_default_fall_through, is_local_control_flow_transfer};
use crate::ir::{Block, Function, Inst, InstructionData};
use std::collections::{BTreeMap, BTreeSet};

/// One natural loop.
#[derive(Clone, Debug)]
pub struct Loop {
    /// The synthetic block preceding the head; sole non-loop predecessor.
    pub pre_header: Block,
    /// The loop header: target of the back edges, dominates the body.
    pub head: Block,
    /// All blocks in the loop, head included.
    pub body: BTreeSet<Block>,
    /// Sources of the back edges.
    pub tails: Vec<Block>,
}

/// Loop analysis results for one procedure.
pub struct LoopAnalysis {
    loops: Vec<Loop>,
    valid: bool,
}

impl LoopAnalysis {
    /// Allocate an empty analysis.
    pub fn new() -> Self {
        Self {
            loops: Vec::new(),
            valid: false,
        }
    }

    /// Clear the analysis.
    pub fn clear(&mut self) {
        self.loops.clear();
        self.valid = false;
    }

    /// Has `compute` run since the last `clear`?
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// All discovered loops.
    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// Find the loops of `func`, synthesizing pre-headers. This patches the
    /// instruction list and CFG (new blocks, retargeted jumps), then relinks
    /// the CFG and recomputes `doms` so both leave here fresh.
    pub fn compute(
        &mut self,
        func: &mut Function,
        cfg: &mut ControlFlowGraph,
        doms: &mut Dominators,
        diag: &mut Diagnostics,
    ) {
        self.loops.clear();

        // Back edges, grouped by head: a successor of `tail` that also
        // dominates it closes a loop.
        let mut back_edges: BTreeSet<(Block, Block)> = BTreeSet::new();
        for tail in cfg.blocks() {
            for &succ in &cfg[tail].successors {
                if doms.dominates(succ, tail) {
                    back_edges.insert((succ, tail));
                }
            }
        }

        // Validate each back edge by computing its body; edges whose body
        // escapes the head's dominance are discarded. The bodies themselves
        // are recomputed after the graph is patched.
        let mut tails: BTreeMap<Block, BTreeSet<Block>> = BTreeMap::new();
        for &(head, tail) in &back_edges {
            if get_loop_body(cfg, doms, head, tail).is_some() {
                tails.entry(head).or_default().insert(tail);
            }
        }

        // Patch fall-through tails, then splice in one pre-header per head.
        // The pre-header goes in only after every tail of that head has been
        // patched, so the back edges all target the head by label and none
        // of them can fall into the pre-header.
        for (&head, tail_set) in tails.iter_mut() {
            let mut patched = BTreeSet::new();
            for &tail in tail_set.iter() {
                patched.insert(patch_loop_tail(func, cfg, diag, head, tail));
            }
            *tail_set = patched;
            add_pre_header(func, cfg, diag, head, tail_set);
        }

        // The patches above changed the graph; bring the edges, reachability
        // and dominators back in sync before measuring the loop bodies.
        cfg.relink(func, diag);
        doms.compute(cfg);

        let mut by_head: BTreeMap<Block, Loop> = BTreeMap::new();
        for (head, tail_set) in tails {
            for tail in tail_set {
                let Some(body) = get_loop_body(cfg, doms, head, tail) else {
                    continue;
                };
                let entry = by_head.entry(head).or_insert_with(|| Loop {
                    pre_header: cfg
                        .prev_block(head)
                        .expect("loop head has a pre-header before it"),
                    head,
                    body: BTreeSet::new(),
                    tails: Vec::new(),
                });
                entry.tails.push(tail);
                entry.body.extend(body);
            }
        }
        self.loops = by_head.into_values().collect();
        self.valid = true;
        log::debug!("found {} loops in {}", self.loops.len(), func.name);
    }
}

impl Default for LoopAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything backward-reachable from `tail` without passing `head`, plus
/// the head itself. `None` when some body block is not dominated by the
/// head, meaning the candidate back edge does not bound a natural loop.
pub(crate) fn get_loop_body(
    cfg: &ControlFlowGraph,
    doms: &Dominators,
    head: Block,
    tail: Block,
) -> Option<BTreeSet<Block>> {
    let mut body: BTreeSet<Block> = BTreeSet::new();
    body.insert(head);
    let mut stack = vec![tail];
    while let Some(bb) = stack.pop() {
        if body.contains(&bb) {
            continue;
        }
        if !doms.dominates(head, bb) {
            return None;
        }
        body.insert(bb);
        stack.extend(cfg[bb].predecessors.iter().copied());
    }
    Some(body)
}

/// If the back edge `tail -> head` is (or includes) a fall-through, rewrite
/// it into an explicit jump so that splicing a pre-header between the two
/// blocks cannot change behavior. Returns the block that now carries the
/// back edge.
fn patch_loop_tail(
    func: &mut Function,
    cfg: &mut ControlFlowGraph,
    diag: &mut Diagnostics,
    head: Block,
    tail: Block,
) -> Block {
    if cfg.next_block(tail) != Some(head) {
        return tail;
    }
    let Some(tail_last) = cfg[tail].last.expand() else {
        return tail;
    };
    if !can_default_fall_through(&func.dfg[tail_last]) {
        return tail;
    }

    let Some(head_first) = cfg[head].first.expand() else {
        return tail;
    };
    let existing = match &func.dfg[head_first] {
        InstructionData::Label { label } => Some(*label),
        _ => None,
    };
    let head_label = match existing {
        Some(label) => label,
        // Blocks are normalized to lead with a label, but stay defensive
        // about hand-built graphs.
        None => {
            let label = func.dfg.make_label();
            let label_inst = func.dfg.make_inst(InstructionData::Label { label });
            func.layout.insert_before(label_inst, head_first);
            cfg[head].first = label_inst.into();
            label
        }
    };

    if is_local_control_flow_transfer(&func.dfg[tail_last]) {
        // The tail ends in a conditional branch whose not-taken side falls
        // into the head. Inject a relay block holding the explicit jump; if
        // the branch also targets the head, give the relay a label and send
        // the branch there instead.
        let mut insts: Vec<Inst> = Vec::new();
        if func.dfg[tail_last].jumps_to(head_label) {
            let relay_label = func.dfg.make_label();
            let label_inst = func.dfg.make_inst(InstructionData::Label { label: relay_label });
            func.dfg[tail_last].replace_target(head_label, relay_label);
            insts.push(label_inst);
        }
        let jmp = func.dfg.make_inst(InstructionData::Jump { target: head_label });
        insts.push(jmp);
        match cfg.unsafe_insert_block(func, diag, tail, head, &insts) {
            Some(relay) => relay,
            None => tail,
        }
    } else {
        // Plain fall-through: end the tail with a jump to the head.
        let jmp = func.dfg.make_inst(InstructionData::Jump { target: head_label });
        func.layout.insert_after(jmp, tail_last);
        cfg[tail].last = jmp.into();
        tail
    }
}

/// Splice an empty labelled block immediately before `head` and retarget
/// every jump to the head's label at it, except the back-edge jumps in the
/// tails.
fn add_pre_header(
    func: &mut Function,
    cfg: &mut ControlFlowGraph,
    diag: &mut Diagnostics,
    head: Block,
    ignore_tails: &BTreeSet<Block>,
) {
    let label = func.dfg.make_label();
    let label_inst = func.dfg.make_inst(InstructionData::Label { label });
    let Some(prev) = cfg.prev_block(head) else {
        return;
    };
    if cfg
        .unsafe_insert_block(func, diag, prev, head, &[label_inst])
        .is_none()
    {
        return;
    }

    let head_label = match cfg[head].first.expand().map(|i| &func.dfg[i]) {
        Some(InstructionData::Label { label }) => *label,
        _ => return,
    };

    let order: Vec<Block> = cfg.blocks().collect();
    for b in order {
        let Some(last) = cfg[b].last.expand() else {
            continue;
        };
        let ignore: Option<Inst> = if ignore_tails.contains(&b) {
            Some(last)
        } else {
            None
        };
        let insts: Vec<Inst> = cfg.block_insts(b, &func.layout).collect();
        for inst in insts {
            if Some(inst) == ignore {
                continue;
            }
            func.dfg[inst].replace_target(head_label, label);
        }
    }
}
