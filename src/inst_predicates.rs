//! Instruction predicates/properties, shared by various analyses.

use crate::ir::{InstructionData, Opcode};

/// Is this one of the in-procedure control transfers (JMP, BTRUE, BFALSE,
/// MBR)?
pub fn is_local_control_flow_transfer(data: &InstructionData) -> bool {
    matches!(
        data.opcode(),
        Opcode::Jmp | Opcode::Btrue | Opcode::Bfalse | Opcode::Mbr
    )
}

/// Is this a label?
pub fn is_label(data: &InstructionData) -> bool {
    matches!(data, InstructionData::Label { .. })
}

/// Is this a return?
pub fn is_return(data: &InstructionData) -> bool {
    matches!(data, InstructionData::Ret { .. })
}

/// Can default execution (no taken branch) continue at the next instruction?
pub fn can_default_fall_through(data: &InstructionData) -> bool {
    if !is_local_control_flow_transfer(data) {
        return !is_return(data);
    }
    matches!(data.opcode(), Opcode::Btrue | Opcode::Bfalse)
}

/// Does this instruction assign a register?
pub fn is_var_def(data: &InstructionData) -> bool {
    data.def().is_some()
}

/// Is this instruction a pure computation over scalar registers, eligible to
/// be an available expression? Copies, loads, calls and constants are not.
pub fn is_expression(data: &InstructionData) -> bool {
    match data {
        InstructionData::Binary { .. } => true,
        InstructionData::Unary { opcode, .. } => {
            matches!(opcode, Opcode::Cvt | Opcode::Neg | Opcode::Not)
        }
        _ => false,
    }
}

/// Does this instruction let a value escape the procedure (or touch memory),
/// so that dead-code elimination must treat it as essential?
pub fn has_side_effect(data: &InstructionData) -> bool {
    match data {
        InstructionData::Ret { .. }
        | InstructionData::Call { .. }
        | InstructionData::Store { .. }
        | InstructionData::MemCopy { .. } => true,
        InstructionData::Unary { opcode, .. } => *opcode == Opcode::Load,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Reg;
    use cranelift_entity::EntityRef;

    #[test]
    fn classification() {
        let r = |n| Reg::new(n);
        let add = InstructionData::Binary {
            opcode: Opcode::Add,
            dst: r(0),
            src1: r(1),
            src2: r(2),
        };
        let cpy = InstructionData::Unary {
            opcode: Opcode::Cpy,
            dst: r(0),
            src: r(1),
        };
        let load = InstructionData::Unary {
            opcode: Opcode::Load,
            dst: r(0),
            src: r(1),
        };
        assert!(is_expression(&add));
        assert!(!is_expression(&cpy));
        assert!(!is_expression(&load));
        assert!(has_side_effect(&load));
        assert!(is_var_def(&cpy));

        let jmp = InstructionData::Jump {
            target: crate::ir::Label::new(0),
        };
        assert!(is_local_control_flow_transfer(&jmp));
        assert!(!can_default_fall_through(&jmp));
        let br = InstructionData::Branch {
            opcode: Opcode::Bfalse,
            cond: r(1),
            target: crate::ir::Label::new(0),
        };
        assert!(can_default_fall_through(&br));
        assert!(!can_default_fall_through(&InstructionData::Ret {
            value: None
        }));
    }
}
