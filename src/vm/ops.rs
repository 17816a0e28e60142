use std::fmt;

use serde::Serialize;

/// Instruction set of the strand VM.
///
/// Instructions never carry values, only offsets and sizes. Everything a
/// program computes flows through host operations; the interpreter itself
/// only builds addresses on the per-context address stack, moves bytes and
/// transfers control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Instruction {
    // ========================================
    // Address construction
    // ========================================
    /// Push `data_base + offset`.
    DataAddress(u32),
    /// Push the current frame's `params_base + offset`.
    ParamsAddress(u32),
    /// Push the current frame's result slot.
    ResultAddress,
    /// Push the current frame's `locals_base + offset`.
    LocalsAddress(u32),
    /// Push `globals_base + offset`.
    GlobalsAddress(u32),
    /// Pop an address and push it displaced by `offset`.
    Offset(u32),
    /// Pop an address, store it in a fresh 8-byte stack cell and push the
    /// cell's address.
    Reference,
    /// Pop an address and push the address stored in the cell it names.
    Dereference,
    /// Pop one address per size and copy each value into one fresh stack
    /// block laid out in declaration order.
    Tuple(Vec<u32>),

    // ========================================
    // Data movement
    // ========================================
    /// Pop destination, pop source, copy `size` bytes.
    Copy(u32),

    // ========================================
    // Operations
    // ========================================
    OpBegin,
    Param,
    Target,
    /// Dispatch `ops[op]`. A non-zero `result` makes it an expression
    /// operation with a result slot of that many bytes.
    OpEnd { op: u32, result: u32 },

    // ========================================
    // Control flow
    // ========================================
    Call(u32),
    Jump(u32),
    BranchIf(u32),
    Return,
}

impl Instruction {
    pub const DATA_ADDRESS: u8 = 0x01;
    pub const PARAMS_ADDRESS: u8 = 0x02;
    pub const RESULT_ADDRESS: u8 = 0x03;
    pub const LOCALS_ADDRESS: u8 = 0x04;
    pub const GLOBALS_ADDRESS: u8 = 0x05;
    pub const OFFSET: u8 = 0x06;
    pub const REFERENCE: u8 = 0x07;
    pub const DEREFERENCE: u8 = 0x08;
    pub const TUPLE: u8 = 0x09;
    pub const COPY: u8 = 0x10;
    pub const OP_BEGIN: u8 = 0x20;
    pub const PARAM: u8 = 0x21;
    pub const TARGET: u8 = 0x22;
    pub const OP_END: u8 = 0x23;
    pub const CALL: u8 = 0x30;
    pub const JUMP: u8 = 0x31;
    pub const BRANCH_IF: u8 = 0x32;
    pub const RETURN: u8 = 0x33;

    pub fn opcode(&self) -> u8 {
        match self {
            Instruction::DataAddress(_) => Self::DATA_ADDRESS,
            Instruction::ParamsAddress(_) => Self::PARAMS_ADDRESS,
            Instruction::ResultAddress => Self::RESULT_ADDRESS,
            Instruction::LocalsAddress(_) => Self::LOCALS_ADDRESS,
            Instruction::GlobalsAddress(_) => Self::GLOBALS_ADDRESS,
            Instruction::Offset(_) => Self::OFFSET,
            Instruction::Reference => Self::REFERENCE,
            Instruction::Dereference => Self::DEREFERENCE,
            Instruction::Tuple(_) => Self::TUPLE,
            Instruction::Copy(_) => Self::COPY,
            Instruction::OpBegin => Self::OP_BEGIN,
            Instruction::Param => Self::PARAM,
            Instruction::Target => Self::TARGET,
            Instruction::OpEnd { .. } => Self::OP_END,
            Instruction::Call(_) => Self::CALL,
            Instruction::Jump(_) => Self::JUMP,
            Instruction::BranchIf(_) => Self::BRANCH_IF,
            Instruction::Return => Self::RETURN,
        }
    }

    /// Jump target, if this instruction transfers control within a function.
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Instruction::Jump(pc) | Instruction::BranchIf(pc) => Some(*pc),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::DataAddress(o) => write!(f, "data_address {}", o),
            Instruction::ParamsAddress(o) => write!(f, "params_address {}", o),
            Instruction::ResultAddress => write!(f, "result_address"),
            Instruction::LocalsAddress(o) => write!(f, "locals_address {}", o),
            Instruction::GlobalsAddress(o) => write!(f, "globals_address {}", o),
            Instruction::Offset(o) => write!(f, "offset {}", o),
            Instruction::Reference => write!(f, "reference"),
            Instruction::Dereference => write!(f, "dereference"),
            Instruction::Tuple(sizes) => {
                write!(f, "tuple [")?;
                for (i, size) in sizes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", size)?;
                }
                write!(f, "]")
            }
            Instruction::Copy(size) => write!(f, "copy {}", size),
            Instruction::OpBegin => write!(f, "op_begin"),
            Instruction::Param => write!(f, "param"),
            Instruction::Target => write!(f, "target"),
            Instruction::OpEnd { op, result } => write!(f, "op_end {} result={}", op, result),
            Instruction::Call(func) => write!(f, "call {}", func),
            Instruction::Jump(pc) => write!(f, "jump {}", pc),
            Instruction::BranchIf(pc) => write!(f, "branch_if {}", pc),
            Instruction::Return => write!(f, "return"),
        }
    }
}
