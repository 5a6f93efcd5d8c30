//! Mezzo: a procedure-level mid-end optimizer for a three-address linear IR.
//!
//! A procedure enters as a linear instruction list, the pass manager
//! materializes a control flow graph and classical dataflow analyses on
//! demand, and a pipeline of cascading passes rewrites the list in place:
//! constant folding, copy propagation, dead-code elimination, common
//! sub-expression elimination, loop-invariant code motion, and an abstract
//! evaluator that collapses fully computable procedures into their result.
//!
//! The entry point is [`do_procedure`]; [`Context`] is public so embedders
//! can assemble their own pipelines out of the same passes.
//!
//! Each pass can be disabled for A/B testing and bisection through an
//! environment variable read at pass entry: `ECE540_DISABLE_CF`,
//! `ECE540_DISABLE_CP`, `ECE540_DISABLE_DCE`, `ECE540_DISABLE_CSE`,
//! `ECE540_DISABLE_LICM` and `ECE540_DISABLE_EVAL`; any non-empty value
//! skips the pass.

pub mod avail_exprs;
pub mod cfg;
pub mod const_fold;
pub mod context;
pub mod copy_prop;
pub mod cse;
pub mod dataflow;
pub mod dce;
pub mod diag;
pub mod dominators;
pub mod eval;
pub mod inst_predicates;
pub mod ir;
pub mod licm;
pub mod live_uses;
pub mod loop_analysis;
pub mod operators;
pub mod reaching_defs;
pub mod set;
pub mod use_def;

pub use crate::context::{Context, PassId};
pub use crate::ir::Function;

/// Register the standard pipeline on `ctx` and return the pass to start
/// from.
///
/// The cascade graph, phase one:
///
/// ```text
///    1 .--------<---------.-<--.                 10
///  .-<-.   2      4       |    |              .--->---.
/// -`-> CP ->- CF ->- DCE -'->- CSE ->- LICM -'- DCE ---`>-- EVAL
///       `--<--'             6       8        9         11
///          3
/// ```
///
/// and phase two, the post-EVAL cleanup:
///
/// ```text
///  -.                      17          19
///   | 10,11    13 .--------<--------.--<--.
///   |        .-<-.  14              |     |
/// EVAL -->---`-> CP ->- CF ->- DCE -'->- CSE -->-- done
///       12        `--<--'  16        18
///                   15
/// ```
pub fn register_default_pipeline(ctx: &mut Context) -> PassId {
    let cp = ctx.add_pass(copy_prop::propagate_copies);
    let cf = ctx.add_pass(const_fold::fold_constants);
    let dce = ctx.add_pass(dce::eliminate_dead_code);
    let cse = ctx.add_pass(cse::eliminate_common_sub_expressions);
    let licm = ctx.add_pass(licm::hoist_loop_invariant_code);
    let eval = ctx.add_pass(eval::abstract_evaluator);

    ctx.cascade_if(cp, cp, true); // 1
    ctx.cascade_if(cp, cf, false); // 2
    ctx.cascade_if(cf, cp, true); // 3
    ctx.cascade_if(cf, dce, false); // 4
    ctx.cascade_if(dce, cp, true); // 5
    ctx.cascade_if(dce, cse, false); // 6
    ctx.cascade_if(cse, cp, true); // 7
    ctx.cascade_if(cse, licm, false); // 8

    let dce_post_licm = ctx.add_pass(dce::eliminate_dead_code);
    ctx.cascade_if(licm, dce_post_licm, true); // 9
    ctx.cascade_if(licm, eval, false); // 10
    ctx.cascade(dce_post_licm, eval); // 11

    let cp2 = ctx.add_pass(copy_prop::propagate_copies);
    let cf2 = ctx.add_pass(const_fold::fold_constants);
    let dce2 = ctx.add_pass(dce::eliminate_dead_code);
    let cse2 = ctx.add_pass(cse::eliminate_common_sub_expressions);

    ctx.cascade(eval, cp2); // 12
    ctx.cascade_if(cp2, cp2, true); // 13
    ctx.cascade_if(cp2, cf2, false); // 14
    ctx.cascade_if(cf2, cp2, true); // 15
    ctx.cascade_if(cf2, dce2, false); // 16
    ctx.cascade_if(dce2, cp2, true); // 17
    ctx.cascade_if(dce2, cse2, false); // 18
    ctx.cascade_if(cse2, cp2, true); // 19

    cp
}

/// Optimize one procedure: run the standard pipeline over its instruction
/// list and hand the rewritten procedure back.
pub fn do_procedure(func: Function) -> Function {
    log::debug!("optimizing procedure {}", func.name);
    let mut ctx = Context::new(func);
    let start = register_default_pipeline(&mut ctx);
    let changed = ctx.run(start);
    log::debug!(
        "finished {}: {}",
        ctx.func.name,
        if changed { "changed" } else { "unchanged" }
    );
    ctx.into_function()
}
