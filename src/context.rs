//! Pass manager: analysis cache, change tracking, cascading pass driver.
//!
//! The context owns the procedure and every analysis. Analyses are
//! recomputed lazily: each `ensure_*` accessor first refreshes what it
//! depends on, then rebuilds its own result if a transform has dirtied it.
//! Passes report what they touched through the `changed_*` API, which flips
//! the right dirty bits and records that the pass did something; the driver
//! uses that flag to pick which cascade edges to follow.
//!
//! `removed_nop` is the one exception: it dirties the CFG without counting
//! as a change, so NOP cleanup and CFG normalization cannot cascade into
//! each other forever. The driver itself puts no bound on the number of
//! pass invocations; termination is a property of the cascade graph.

use crate::avail_exprs::AvailableExpressions;
use crate::cfg::ControlFlowGraph;
use crate::diag::Diagnostics;
use crate::dominators::Dominators;
use crate::ir::Function;
use crate::live_uses::LiveUses;
use crate::loop_analysis::LoopAnalysis;
use crate::reaching_defs::ReachingDefs;
use crate::use_def::{DefUseChains, UseDefChains};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Is the given pass-disable environment variable set to a non-empty value?
pub fn pass_disabled(var: &str) -> bool {
    std::env::var_os(var).is_some_and(|v| !v.is_empty())
}

/// Handle to a registered pass.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PassId(usize);

/// A pass: a function over the context. Passes fetch the analyses they need
/// through the `ensure_*` accessors and report edits through the
/// `changed_*` API.
pub type PassFn = fn(&mut Context);

#[derive(Clone, Copy)]
struct Dirty {
    cfg: bool,
    doms: bool,
    ae: bool,
    var_def: bool,
    var_use: bool,
    ud: bool,
    du: bool,
    loops: bool,
}

impl Dirty {
    fn all() -> Self {
        Dirty {
            cfg: true,
            doms: true,
            ae: true,
            var_def: true,
            var_use: true,
            ud: true,
            du: true,
            loops: true,
        }
    }
}

/// Procedure-level optimization context.
pub struct Context {
    /// The procedure being optimized.
    pub func: Function,
    /// Diagnostics reported so far.
    pub diag: Diagnostics,
    pub(crate) cfg: ControlFlowGraph,
    pub(crate) doms: Dominators,
    pub(crate) ae: AvailableExpressions,
    pub(crate) reaching: ReachingDefs,
    pub(crate) live: LiveUses,
    pub(crate) use_def: UseDefChains,
    pub(crate) def_use: DefUseChains,
    pub(crate) loops: LoopAnalysis,
    dirty: Dirty,
    changed: bool,
    passes: Vec<PassFn>,
    /// `cascades[0]` fires when the source pass changed nothing,
    /// `cascades[1]` when it changed something.
    cascades: [FxHashMap<PassId, BTreeSet<PassId>>; 2],
}

impl Context {
    /// Take ownership of a procedure and set up an empty pipeline.
    pub fn new(func: Function) -> Self {
        Context {
            func,
            diag: Diagnostics::new(),
            cfg: ControlFlowGraph::new(),
            doms: Dominators::new(),
            ae: AvailableExpressions::new(),
            reaching: ReachingDefs::new(),
            live: LiveUses::new(),
            use_def: UseDefChains::new(),
            def_use: DefUseChains::new(),
            loops: LoopAnalysis::new(),
            dirty: Dirty::all(),
            changed: false,
            passes: Vec::new(),
            cascades: [FxHashMap::default(), FxHashMap::default()],
        }
    }

    /// Give the (possibly rewritten) procedure back.
    pub fn into_function(self) -> Function {
        self.func
    }

    // -- change reporting -------------------------------------------------

    /// A register definition was added, removed or rewritten.
    pub fn changed_def(&mut self) {
        self.dirty.ae = true;
        self.dirty.var_def = true;
        self.changed = true;
    }

    /// A register use was added, removed or rewritten.
    pub fn changed_use(&mut self) {
        self.dirty.ae = true;
        self.dirty.ud = true;
        self.dirty.var_use = true;
        self.changed = true;
    }

    /// Control flow changed: blocks, edges or terminators.
    pub fn changed_block(&mut self) {
        self.dirty.cfg = true;
        self.changed = true;
    }

    /// A NOP was unlinked. Dirties the CFG without counting as a change.
    pub fn removed_nop(&mut self) {
        self.dirty.cfg = true;
    }

    /// Read and reset the per-pass change flag.
    pub fn take_changed(&mut self) -> bool {
        core::mem::take(&mut self.changed)
    }

    // -- analyses ---------------------------------------------------------

    /// Make sure the CFG matches the instruction list.
    pub fn ensure_cfg(&mut self) {
        if !self.dirty.cfg {
            return;
        }
        let Context {
            func, diag, cfg, ..
        } = self;
        cfg.compute(func, diag);
        self.dirty.cfg = false;
        self.dirty.doms = true;
        self.dirty.ae = true;
        self.dirty.var_def = true;
        self.dirty.var_use = true;
        self.dirty.loops = true;
    }

    /// Make sure the dominator sets are fresh.
    pub fn ensure_dominators(&mut self) {
        self.ensure_cfg();
        if self.dirty.doms {
            self.doms.compute(&self.cfg);
            self.dirty.doms = false;
            self.dirty.loops = true;
        }
    }

    /// Make sure the available-expression sets are fresh.
    pub fn ensure_avail_exprs(&mut self) {
        self.ensure_cfg();
        if self.dirty.ae {
            self.ae.compute(&self.func, &self.cfg);
            self.dirty.ae = false;
        }
    }

    /// Make sure the reaching-definition sets are fresh.
    pub fn ensure_reaching_defs(&mut self) {
        self.ensure_cfg();
        if self.dirty.var_def {
            self.reaching.compute(&self.func, &self.cfg);
            self.dirty.var_def = false;
            self.dirty.ud = true;
            self.dirty.du = true;
        }
    }

    /// Make sure the live-use sets are fresh.
    pub fn ensure_live_uses(&mut self) {
        self.ensure_cfg();
        if self.dirty.var_use {
            self.live.compute(&self.func, &self.cfg);
            self.dirty.var_use = false;
            self.dirty.ud = true;
            self.dirty.du = true;
        }
    }

    /// Make sure the UD chains are fresh.
    pub fn ensure_use_def(&mut self) {
        self.ensure_reaching_defs();
        if self.dirty.ud {
            self.use_def.compute(&self.func, &self.cfg, &self.reaching);
            self.dirty.ud = false;
        }
    }

    /// Make sure the DU chains are fresh.
    pub fn ensure_def_use(&mut self) {
        self.ensure_live_uses();
        if self.dirty.du {
            self.def_use.compute(&self.func, &self.cfg, &self.live);
            self.dirty.du = false;
        }
    }

    /// Make sure the loop analysis is fresh. This may patch the procedure
    /// (pre-headers) and refreshes the CFG and dominators along the way.
    pub fn ensure_loops(&mut self) {
        self.ensure_dominators();
        if self.dirty.loops {
            let Context {
                func,
                cfg,
                doms,
                loops,
                diag,
                ..
            } = self;
            loops.compute(func, cfg, doms, diag);
            self.dirty.loops = false;
        }
    }

    /// Rebuild the DU chains unconditionally. Used by LICM, which edits the
    /// procedure between loops without going through a pass boundary.
    pub(crate) fn recompute_def_use(&mut self) {
        self.ensure_live_uses();
        if self.dirty.var_use {
            self.live.compute(&self.func, &self.cfg);
            self.dirty.var_use = false;
        }
        self.def_use.compute(&self.func, &self.cfg, &self.live);
        self.dirty.du = false;
    }

    // -- pipeline ---------------------------------------------------------

    /// Register a pass; returns its handle for cascade wiring.
    pub fn add_pass(&mut self, pass: PassFn) -> PassId {
        let id = PassId(self.passes.len());
        self.passes.push(pass);
        id
    }

    /// After `first` runs, queue `second` regardless of the outcome.
    pub fn cascade(&mut self, first: PassId, second: PassId) {
        self.cascade_if(first, second, true);
        self.cascade_if(first, second, false);
    }

    /// After `first` runs, queue `second` when `first`'s change flag equals
    /// `when_changed`.
    pub fn cascade_if(&mut self, first: PassId, second: PassId, when_changed: bool) {
        self.cascades[when_changed as usize]
            .entry(first)
            .or_default()
            .insert(second);
    }

    /// Run from `start`, following cascades until the worklist drains.
    /// Returns true iff any pass reported a change.
    pub fn run(&mut self, start: PassId) -> bool {
        let mut work = vec![start];
        let mut did_anything = false;

        while let Some(pass) = work.pop() {
            self.changed = false;
            let f = self.passes[pass.0];
            log::trace!("running pass #{}", pass.0);
            f(self);
            did_anything |= self.changed;

            if let Some(next) = self.cascades[self.changed as usize].get(&pass) {
                work.extend(next.iter().copied());
            }
        }
        did_anything
    }
}
