//! Raw-instruction builders.
//!
//! Small constructors for hand-assembling programs, used by the unit tests
//! and the node binary's built-in demo program. These build [`Instruction`]
//! values; [`assemble`] turns a sequence into the byte form a VM image loads.

use crate::vm::isa::{
    AluOp, Instruction, JumpCond, MemWidth, CLS_ALU, CLS_ALU64, CLS_JMP, CLS_LD, CLS_LDX, CLS_ST,
    CLS_STX, END_TO_BE, END_TO_LE, ALU_END, ALU_NEG, JMP_CALL, JMP_EXIT, JMP_JA, MODE_IMM,
    MODE_MEM, MODE_XADD, PSEUDO_CALL, SIZE_DW, SRC_IMM, SRC_REG,
};

/// ALU operation with an immediate operand.
pub fn alu64_imm(op: AluOp, dst: u8, imm: i32) -> Instruction {
    Instruction::new(CLS_ALU64 | op.bits() | SRC_IMM, dst, 0, 0, imm)
}

/// ALU operation with a register operand.
pub fn alu64_reg(op: AluOp, dst: u8, src: u8) -> Instruction {
    Instruction::new(CLS_ALU64 | op.bits() | SRC_REG, dst, src, 0, 0)
}

/// `dst = imm` (sign-extended to 64 bits).
pub fn mov64_imm(dst: u8, imm: i32) -> Instruction {
    alu64_imm(AluOp::Mov, dst, imm)
}

/// `dst = src`.
pub fn mov64_reg(dst: u8, src: u8) -> Instruction {
    alu64_reg(AluOp::Mov, dst, src)
}

/// `dst = -dst`.
pub fn neg64(dst: u8) -> Instruction {
    Instruction::new(CLS_ALU64 | ALU_NEG, dst, 0, 0, 0)
}

/// Byte-order conversion; `width` is 16, 32 or 64.
pub fn endian(dst: u8, to_be: bool, width: i32) -> Instruction {
    let order = if to_be { END_TO_BE } else { END_TO_LE };
    Instruction::new(CLS_ALU | ALU_END | order, dst, 0, 0, width)
}

/// Unconditional relative jump.
pub fn ja(offset: i16) -> Instruction {
    Instruction::new(CLS_JMP | JMP_JA, 0, 0, offset, 0)
}

/// Conditional jump comparing `dst` against an immediate.
pub fn jump_imm(cond: JumpCond, dst: u8, imm: i32, offset: i16) -> Instruction {
    Instruction::new(CLS_JMP | cond.bits() | SRC_IMM, dst, 0, offset, imm)
}

/// Conditional jump comparing `dst` against `src`.
pub fn jump_reg(cond: JumpCond, dst: u8, src: u8, offset: i16) -> Instruction {
    Instruction::new(CLS_JMP | cond.bits() | SRC_REG, dst, src, offset, 0)
}

/// Call a program-local function at the given relative instruction offset.
pub fn call_local(rel: i32) -> Instruction {
    Instruction::new(CLS_JMP | JMP_CALL, 0, PSEUDO_CALL, 0, rel)
}

/// Call a host function by table index.
pub fn call_ext(index: i32) -> Instruction {
    Instruction::new(CLS_JMP | JMP_CALL, 0, 0, 0, index)
}

/// Subroutine return / program exit.
pub fn exit() -> Instruction {
    Instruction::new(CLS_JMP | JMP_EXIT, 0, 0, 0, 0)
}

/// Two-slot 64-bit immediate load.
pub fn load_imm64(dst: u8, value: u64) -> [Instruction; 2] {
    [
        Instruction::new(CLS_LD | MODE_IMM | SIZE_DW, dst, 0, 0, value as u32 as i32),
        Instruction::new(0, 0, 0, 0, (value >> 32) as u32 as i32),
    ]
}

/// `dst = *(width *)(src + off)`.
pub fn load_mem(width: MemWidth, dst: u8, src: u8, off: i16) -> Instruction {
    Instruction::new(CLS_LDX | MODE_MEM | width.bits(), dst, src, off, 0)
}

/// `*(width *)(dst + off) = imm`.
pub fn store_imm(width: MemWidth, dst: u8, off: i16, imm: i32) -> Instruction {
    Instruction::new(CLS_ST | MODE_MEM | width.bits(), dst, 0, off, imm)
}

/// `*(width *)(dst + off) = src`.
pub fn store_reg(width: MemWidth, dst: u8, src: u8, off: i16) -> Instruction {
    Instruction::new(CLS_STX | MODE_MEM | width.bits(), dst, src, off, 0)
}

/// Atomic `*(width *)(dst + off) += src`; word and double word only.
pub fn atomic_add(width: MemWidth, dst: u8, src: u8, off: i16) -> Instruction {
    Instruction::new(CLS_STX | MODE_XADD | width.bits(), dst, src, off, 0)
}

/// Encodes a sequence of instructions into loadable code bytes.
pub fn assemble(program: &[Instruction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(program.len() * crate::vm::isa::INSTRUCTION_SIZE);
    for ins in program {
        out.extend_from_slice(&ins.encode());
    }
    out
}
