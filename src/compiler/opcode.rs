/// Instruction set of the Silt stack VM.
///
/// Every instruction is one opcode byte followed by a fixed-width operand:
/// either nothing or one big-endian u16. Jump operands are absolute byte
/// offsets or deltas relative to the byte after the operand, depending on the
/// opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Stack shuffling
    Pop,
    DupTop,
    RotTwo,

    // Constants and variables
    LoadConst,
    LoadName,
    StoreName,
    LoadFast,
    StoreFast,
    LoadGlobal,
    StoreGlobal,
    LoadDeref,
    StoreDeref,
    LoadAttr,
    StoreAttr,

    // Arithmetic
    BinaryAdd,
    BinarySubtract,
    BinaryMultiply,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryModulo,
    BinaryPower,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryOr,
    BinaryXor,
    BinarySubscr,
    StoreSubscr,

    // In-place variants for augmented assignment
    InplaceAdd,
    InplaceSubtract,
    InplaceMultiply,
    InplaceTrueDivide,
    InplaceFloorDivide,
    InplaceModulo,
    InplacePower,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceOr,
    InplaceXor,

    // Unary
    UnaryNegative,
    UnaryNot,
    UnaryInvert,

    // Comparison; the operand selects a CompareOp
    CompareOp,

    // Jumps
    JumpForward,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,

    // Loops and blocks
    SetupLoop,
    PopBlock,
    BreakLoop,
    GetIter,
    ForIter,
    UnpackSequence,

    // Exceptions
    SetupExcept,
    SetupFinally,
    EndFinally,
    RaiseVarargs,

    // Functions and classes
    MakeFunction,
    CallFunction,
    CallFunctionKw,
    ReturnValue,
    BuildClass,

    // Collections
    BuildTuple,
    BuildList,
    BuildMap,
    BuildSet,
    BuildSlice,
    ListAppend,

    // REPL support
    PrintExpr,
}

impl OpCode {
    /// Width of the operand in bytes: 0 or 2.
    pub fn operand_width(&self) -> usize {
        match self {
            OpCode::LoadConst
            | OpCode::LoadName
            | OpCode::StoreName
            | OpCode::LoadFast
            | OpCode::StoreFast
            | OpCode::LoadGlobal
            | OpCode::StoreGlobal
            | OpCode::LoadDeref
            | OpCode::StoreDeref
            | OpCode::LoadAttr
            | OpCode::StoreAttr
            | OpCode::CompareOp
            | OpCode::JumpForward
            | OpCode::JumpAbsolute
            | OpCode::PopJumpIfFalse
            | OpCode::PopJumpIfTrue
            | OpCode::JumpIfFalseOrPop
            | OpCode::JumpIfTrueOrPop
            | OpCode::SetupLoop
            | OpCode::ForIter
            | OpCode::UnpackSequence
            | OpCode::SetupExcept
            | OpCode::SetupFinally
            | OpCode::RaiseVarargs
            | OpCode::MakeFunction
            | OpCode::CallFunction
            | OpCode::CallFunctionKw
            | OpCode::BuildTuple
            | OpCode::BuildList
            | OpCode::BuildMap
            | OpCode::BuildSet
            | OpCode::BuildSlice
            | OpCode::ListAppend => 2,

            _ => 0,
        }
    }

    /// True when the operand is patched against a jump target. Relative jumps
    /// store a delta from the byte after the operand; the rest are absolute.
    pub fn is_relative_jump(&self) -> bool {
        matches!(
            self,
            OpCode::JumpForward
                | OpCode::SetupLoop
                | OpCode::ForIter
                | OpCode::SetupExcept
                | OpCode::SetupFinally
        )
    }
}

const OPCODE_COUNT: u8 = OpCode::PrintExpr as u8 + 1;

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        assert!(byte < OPCODE_COUNT, "invalid opcode byte {byte:#04x}");
        // Safety: repr(u8), contiguous discriminants, bounds checked above.
        unsafe { std::mem::transmute(byte) }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

/// Operand values for [`OpCode::CompareOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CompareOp {
    Eq = 0,
    Ne = 1,
    Lt = 3,
    Gt = 4,
    Le = 5,
    Ge = 6,
    In = 7,
    Is = 8,
    IsNot = 9,
    NotIn = 10,
    /// Used by except-clause type tests; never produced by user comparisons.
    ExceptionMatch = 12,
}

impl CompareOp {
    pub fn from_operand(operand: u16) -> Option<Self> {
        Some(match operand {
            0 => CompareOp::Eq,
            1 => CompareOp::Ne,
            3 => CompareOp::Lt,
            4 => CompareOp::Gt,
            5 => CompareOp::Le,
            6 => CompareOp::Ge,
            7 => CompareOp::In,
            8 => CompareOp::Is,
            9 => CompareOp::IsNot,
            10 => CompareOp::NotIn,
            12 => CompareOp::ExceptionMatch,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_byte_round_trip() {
        for byte in 0..OPCODE_COUNT {
            let op = OpCode::from(byte);
            assert_eq!(u8::from(op), byte);
        }
    }

    #[test]
    fn jump_opcodes_take_operands() {
        assert_eq!(OpCode::JumpAbsolute.operand_width(), 2);
        assert_eq!(OpCode::PopBlock.operand_width(), 0);
        assert!(OpCode::ForIter.is_relative_jump());
        assert!(!OpCode::JumpAbsolute.is_relative_jump());
    }
}
