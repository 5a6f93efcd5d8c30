//! End-to-end pipeline scenarios for `do_procedure`.

use mezzo::ir::{Function, Imm, InstructionData, Opcode, RegKind, Type};
use mezzo::do_procedure;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn opcodes(func: &Function) -> Vec<Opcode> {
    func.layout.insts().map(|i| func.dfg[i].opcode()).collect()
}

/// s = 0; i = 1; while (i <= 10) { s += i; i += 1 } return s
fn sum_1_to_10() -> Function {
    let mut func = Function::new("sum");
    let head_l = func.dfg.make_label();
    let done_l = func.dfg.make_label();
    let s = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let i = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let ten = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let one = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let c = func.dfg.make_reg(Type::I32, RegKind::Temp);

    func.push(InstructionData::Ldc {
        dst: s,
        imm: Imm::Int(0),
    });
    func.push(InstructionData::Ldc {
        dst: i,
        imm: Imm::Int(1),
    });
    func.push(InstructionData::Ldc {
        dst: ten,
        imm: Imm::Int(10),
    });
    func.push(InstructionData::Ldc {
        dst: one,
        imm: Imm::Int(1),
    });
    let head_i = func.dfg.make_inst(InstructionData::Label { label: head_l });
    func.layout.append(head_i);
    func.push(InstructionData::Binary {
        opcode: Opcode::Sle,
        dst: c,
        src1: i,
        src2: ten,
    });
    func.push(InstructionData::Branch {
        opcode: Opcode::Bfalse,
        cond: c,
        target: done_l,
    });
    func.push(InstructionData::Binary {
        opcode: Opcode::Add,
        dst: s,
        src1: s,
        src2: i,
    });
    func.push(InstructionData::Binary {
        opcode: Opcode::Add,
        dst: i,
        src1: i,
        src2: one,
    });
    func.push(InstructionData::Jump { target: head_l });
    let done_i = func.dfg.make_inst(InstructionData::Label { label: done_l });
    func.layout.append(done_i);
    func.push(InstructionData::Ret { value: Some(s) });
    func
}

#[test]
fn summing_loop_collapses_to_constant() {
    init_logging();
    let out = do_procedure(sum_1_to_10());

    // The whole procedure reduces to materializing 55 and returning it
    // (labels synthesized by block normalization may precede it).
    let mut constants: Vec<i32> = Vec::new();
    let mut ret_seen = false;
    for inst in out.layout.insts() {
        match &out.dfg[inst] {
            InstructionData::Ldc {
                imm: Imm::Int(v), ..
            } => constants.push(*v),
            InstructionData::Ret { value } => {
                ret_seen = true;
                assert!(value.is_some());
            }
            InstructionData::Label { .. } | InstructionData::Unary { .. } => {}
            other => panic!("unexpected instruction survived: {other:?}"),
        }
    }
    assert!(ret_seen);
    assert_eq!(constants, vec![55]);
    assert!(!opcodes(&out).contains(&Opcode::Bfalse));
}

/// Straight-line arithmetic with a dead computation: folding, propagation
/// and DCE cooperate.
#[test]
fn folds_and_removes_dead_code() {
    init_logging();
    let mut func = Function::new("p");
    let t1 = func.dfg.make_reg(Type::I32, RegKind::Temp);
    let t2 = func.dfg.make_reg(Type::I32, RegKind::Temp);
    let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let dead = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    func.push(InstructionData::Ldc {
        dst: t1,
        imm: Imm::Int(3),
    });
    func.push(InstructionData::Ldc {
        dst: t2,
        imm: Imm::Int(4),
    });
    func.push(InstructionData::Binary {
        opcode: Opcode::Add,
        dst: r,
        src1: t1,
        src2: t2,
    });
    func.push(InstructionData::Unary {
        opcode: Opcode::Cpy,
        dst: dead,
        src: r,
    });
    func.push(InstructionData::Ret { value: Some(r) });

    let out = do_procedure(func);
    let ops = opcodes(&out);
    // The add itself is gone; the result is a materialized 7.
    assert!(!ops.contains(&Opcode::Add));
    let values: Vec<i32> = out
        .layout
        .insts()
        .filter_map(|i| match &out.dfg[i] {
            InstructionData::Ldc {
                imm: Imm::Int(v), ..
            } => Some(*v),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![7]);
}

/// A procedure the evaluator cannot touch (it calls out) still gets its
/// common sub-expressions shared and copies propagated.
#[test]
fn impure_procedure_still_optimizes_locally() {
    init_logging();
    let mut func = Function::new("p");
    let callee = func.dfg.make_reg(Type::ADDR, RegKind::Pseudo);
    let a = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let b = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let x = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let y = func.dfg.make_reg(Type::I32, RegKind::Pseudo);

    func.push(InstructionData::Call {
        dst: Some(a),
        callee,
        args: Default::default(),
    });
    func.push(InstructionData::Call {
        dst: Some(b),
        callee,
        args: Default::default(),
    });
    func.push(InstructionData::Binary {
        opcode: Opcode::Add,
        dst: x,
        src1: a,
        src2: b,
    });
    func.push(InstructionData::Binary {
        opcode: Opcode::Add,
        dst: y,
        src1: a,
        src2: b,
    });
    func.push(InstructionData::Call {
        dst: None,
        callee,
        args: [x, y].into_iter().collect(),
    });
    func.push(InstructionData::Ret { value: None });

    let out = do_procedure(func);
    let adds = opcodes(&out)
        .into_iter()
        .filter(|&op| op == Opcode::Add)
        .count();
    assert_eq!(adds, 1, "duplicate add should be shared:\n{out}");
    // Calls are untouchable.
    let calls = opcodes(&out)
        .into_iter()
        .filter(|&op| op == Opcode::Call)
        .count();
    assert_eq!(calls, 3);
}

#[test]
fn unreachable_code_is_dropped() {
    init_logging();
    let mut func = Function::new("p");
    let r = func.dfg.make_reg(Type::I32, RegKind::Pseudo);
    let t = func.dfg.make_reg(Type::I32, RegKind::Temp);
    func.push(InstructionData::Ldc {
        dst: r,
        imm: Imm::Int(1),
    });
    func.push(InstructionData::Ret { value: Some(r) });
    // Everything below the return is unreachable.
    let ghost = func.dfg.make_label();
    let ghost_i = func.dfg.make_inst(InstructionData::Label { label: ghost });
    func.layout.append(ghost_i);
    func.push(InstructionData::Ldc {
        dst: t,
        imm: Imm::Int(2),
    });
    func.push(InstructionData::Jump { target: ghost });

    let out = do_procedure(func);
    assert!(!opcodes(&out).contains(&Opcode::Jmp));
    let constants: Vec<i32> = out
        .layout
        .insts()
        .filter_map(|i| match &out.dfg[i] {
            InstructionData::Ldc {
                imm: Imm::Int(v), ..
            } => Some(*v),
            _ => None,
        })
        .collect();
    assert_eq!(constants, vec![1]);
}

#[test]
fn pipeline_is_deterministic() {
    init_logging();
    let first = do_procedure(sum_1_to_10());
    let second = do_procedure(sum_1_to_10());
    assert_eq!(opcodes(&first), opcodes(&second));
}

#[test]
fn do_procedure_is_idempotent_on_its_result() {
    init_logging();
    let once = do_procedure(sum_1_to_10());
    let ops_once = opcodes(&once);
    let twice = do_procedure(once);
    // Same shape modulo fresh register numbering.
    assert_eq!(ops_once, opcodes(&twice));
}
