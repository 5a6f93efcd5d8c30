//! Pass-disable environment variables, in their own test binary so the
//! process-global environment cannot race with the other pipeline tests.

use mezzo::do_procedure;
use mezzo::ir::{Function, Imm, InstructionData, Opcode, RegKind, Type};

fn counting_loop() -> Function {
    let mut func = Function::new("count");
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
fn disabling_eval_keeps_the_loop() {
    std::env::set_var("ECE540_DISABLE_EVAL", "1");
    let out = do_procedure(counting_loop());
    std::env::remove_var("ECE540_DISABLE_EVAL");

    // Without the evaluator the loop structure survives.
    let ops: Vec<Opcode> = out.layout.insts().map(|i| out.dfg[i].opcode()).collect();
    assert!(ops.contains(&Opcode::Bfalse));
    assert!(ops.contains(&Opcode::Add));
}
