//! The execution engine: fetch, decode, execute.
//!
//! [`run`] drives one image from its current program counter until it leaves
//! the running state: program exit, a host call that suspends or migrates it
//! (a yield point), or a fault. Faults are fatal to the image only: they
//! are logged, the image is forced to the exited state, and the engine
//! returns 0; the host process never aborts on guest behavior.
//!
//! Local calls keep their frames inside the image's own stack region
//! (registers `r6`-`r9` plus the link register, saved at the frame pointer
//! through the MMU), so an image paused inside a nested call migrates
//! intact. The engine itself is one iterative loop with a hard call-depth
//! limit; nothing about a call lives on the host stack.

use crate::error;
use crate::host::{HostCall, HostContext};
use crate::vm::errors::VmError;
use crate::vm::image::{
    VmImage, VmState, REG_FP, STACK_DEPTH_MAX, STACK_FRAME_SIZE, USER_REG_NUM,
};
use crate::vm::isa::{AluOp, Instruction, JumpCond, MemWidth, Opcode, Operand, PSEUDO_CALL};

/// Runs the image until it leaves the running state, returning the value of
/// `r0` at program exit (0 on faults and yield points).
pub fn run(image: &mut VmImage, ctx: &mut HostContext<'_>) -> u64 {
    match execute(image, ctx) {
        Ok(exit_code) => exit_code,
        Err(fault) => {
            error!("vm {}: {}", image.id(), fault);
            image.set_state(VmState::Exited);
            0
        }
    }
}

fn execute(image: &mut VmImage, ctx: &mut HostContext<'_>) -> Result<u64, VmError> {
    let mut pc = image.pc() as i64;

    loop {
        let ins = fetch(image, pc)?;
        let opcode = Opcode::decode(ins.opcode).ok_or(VmError::InvalidOpcode {
            opcode: ins.opcode,
            pc: pc as u64,
        })?;

        match opcode {
            Opcode::Alu64 { op, src } => {
                exec_alu64(image, &ins, op, src, pc)?;
                pc += 1;
            }
            Opcode::ByteSwap { to_be } => {
                let dst = check_reg(ins.dst)?;
                image.set_reg(dst, byte_swap(image.reg(dst), ins.imm, to_be));
                pc += 1;
            }
            Opcode::Ja => {
                pc += 1 + ins.offset as i64;
            }
            Opcode::Jump { cond, src } => {
                let taken = eval_jump(image, &ins, cond, src)?;
                pc += 1 + if taken { ins.offset as i64 } else { 0 };
            }
            Opcode::LoadImm64 => {
                let dst = check_reg(ins.dst)?;
                let hi = fetch(image, pc + 1)?;
                let value = (ins.imm as u32 as u64) | ((hi.imm as u32 as u64) << 32);
                image.set_reg(dst, value);
                pc += 2;
            }
            Opcode::MemLoad { width } => {
                let dst = check_reg(ins.dst)?;
                let src = check_reg(ins.src)?;
                let va = image.reg(src).wrapping_add(ins.offset as i64 as u64);
                let offset = image.translate_checked(va)?;
                let value = image.read_uint(offset, width_bytes(width))?;
                image.set_reg(dst, value);
                pc += 1;
            }
            Opcode::MemStoreImm { width } => {
                let dst = check_reg(ins.dst)?;
                let va = image.reg(dst).wrapping_add(ins.offset as i64 as u64);
                let offset = image.translate_checked(va)?;
                image.write_uint(offset, width_bytes(width), ins.imm as i64 as u64)?;
                pc += 1;
            }
            Opcode::MemStoreReg { width } => {
                let dst = check_reg(ins.dst)?;
                let src = check_reg(ins.src)?;
                let va = image.reg(dst).wrapping_add(ins.offset as i64 as u64);
                let offset = image.translate_checked(va)?;
                image.write_uint(offset, width_bytes(width), image.reg(src))?;
                pc += 1;
            }
            Opcode::AtomicAdd { width } => {
                let dst = check_reg(ins.dst)?;
                let src = check_reg(ins.src)?;
                let va = image.reg(dst).wrapping_add(ins.offset as i64 as u64);
                let offset = image.translate_checked(va)?;
                let width = width_bytes(width);
                let current = image.read_uint(offset, width)?;
                image.write_uint(offset, width, current.wrapping_add(image.reg(src)))?;
                pc += 1;
            }
            Opcode::Call => {
                if ins.src == PSEUDO_CALL {
                    enter_local_call(image, &ins, &mut pc)?;
                } else {
                    image.set_pc(pc as u64);
                    if let Some(call) = HostCall::from_index(ins.imm) {
                        let ret = call.invoke(image, ctx)?;
                        image.set_reg(0, ret);
                        if image.state() != VmState::Running {
                            return Ok(0);
                        }
                    }
                    pc += 1;
                }
            }
            Opcode::Exit => {
                let depth = image.call_depth();
                if depth > 0 {
                    pc = image.lr() as i64;
                    image.set_pc(pc as u64);
                    image.set_reg(REG_FP, image.reg(REG_FP).wrapping_add(STACK_FRAME_SIZE));
                    image.set_call_depth(depth - 1);
                    restore_frame(image)?;
                } else {
                    image.set_pc(pc as u64);
                    image.set_state(VmState::Exited);
                    return Ok(image.reg(0));
                }
            }
        }
    }
}

fn fetch(image: &VmImage, pc: i64) -> Result<Instruction, VmError> {
    u64::try_from(pc)
        .ok()
        .and_then(|index| image.instruction(index))
        .ok_or(VmError::InvalidPc { pc })
}

fn check_reg(index: u8) -> Result<u8, VmError> {
    if index < USER_REG_NUM {
        Ok(index)
    } else {
        Err(VmError::InvalidRegister(index))
    }
}

fn width_bytes(width: MemWidth) -> usize {
    match width {
        MemWidth::B => 1,
        MemWidth::H => 2,
        MemWidth::W => 4,
        MemWidth::Dw => 8,
    }
}

fn operand_value(image: &VmImage, ins: &Instruction, src: Operand) -> Result<u64, VmError> {
    match src {
        Operand::Imm => Ok(ins.imm as i64 as u64),
        Operand::Reg => Ok(image.reg(check_reg(ins.src)?)),
    }
}

fn exec_alu64(
    image: &mut VmImage,
    ins: &Instruction,
    op: AluOp,
    src: Operand,
    pc: i64,
) -> Result<(), VmError> {
    let dst = check_reg(ins.dst)?;
    let lhs = image.reg(dst);
    let rhs = operand_value(image, ins, src)?;

    let value = match op {
        AluOp::Add => lhs.wrapping_add(rhs),
        AluOp::Sub => lhs.wrapping_sub(rhs),
        AluOp::Mul => lhs.wrapping_mul(rhs),
        AluOp::Div => {
            if rhs == 0 {
                return Err(VmError::DivisionByZero { pc });
            }
            lhs / rhs
        }
        AluOp::Or => lhs | rhs,
        AluOp::And => lhs & rhs,
        AluOp::Lsh => lhs.wrapping_shl(rhs as u32),
        AluOp::Rsh => lhs.wrapping_shr(rhs as u32),
        AluOp::Neg => lhs.wrapping_neg(),
        AluOp::Mod => {
            if rhs == 0 {
                return Err(VmError::DivisionByZero { pc });
            }
            lhs % rhs
        }
        AluOp::Xor => lhs ^ rhs,
        AluOp::Mov => rhs,
        AluOp::Arsh => ((lhs as i64).wrapping_shr(rhs as u32)) as u64,
    };

    image.set_reg(dst, value);
    Ok(())
}

fn eval_jump(
    image: &VmImage,
    ins: &Instruction,
    cond: JumpCond,
    src: Operand,
) -> Result<bool, VmError> {
    let lhs = image.reg(check_reg(ins.dst)?);
    let rhs = operand_value(image, ins, src)?;

    Ok(match cond {
        JumpCond::Eq => lhs == rhs,
        JumpCond::Gt => lhs > rhs,
        JumpCond::Ge => lhs >= rhs,
        JumpCond::Set => lhs & rhs != 0,
        JumpCond::Ne => lhs != rhs,
        JumpCond::Sgt => (lhs as i64) > (rhs as i64),
        JumpCond::Sge => (lhs as i64) >= (rhs as i64),
        JumpCond::Lt => lhs < rhs,
        JumpCond::Le => lhs <= rhs,
        JumpCond::Slt => (lhs as i64) < (rhs as i64),
        JumpCond::Sle => (lhs as i64) <= (rhs as i64),
    })
}

fn byte_swap(value: u64, width: i32, to_be: bool) -> u64 {
    match (width, to_be) {
        (16, false) => value as u16 as u64,
        (32, false) => value as u32 as u64,
        (16, true) => (value as u16).swap_bytes() as u64,
        (32, true) => (value as u32).swap_bytes() as u64,
        (_, true) => value.swap_bytes(),
        (_, false) => value,
    }
}

/// Saves the caller's context into the current stack frame and redirects
/// execution to the call target.
fn enter_local_call(
    image: &mut VmImage,
    ins: &Instruction,
    pc: &mut i64,
) -> Result<(), VmError> {
    let depth = image.call_depth();
    if depth >= STACK_DEPTH_MAX {
        return Err(VmError::CallDepthExceeded {
            max: STACK_DEPTH_MAX,
        });
    }

    save_frame(image)?;
    image.set_call_depth(depth + 1);
    image.set_reg(REG_FP, image.reg(REG_FP).wrapping_sub(STACK_FRAME_SIZE));

    let lr = (*pc + 1) as u64;
    image.set_lr(lr);
    *pc = *pc + 1 + ins.imm as i64;
    image.set_pc(*pc as u64);
    Ok(())
}

fn save_frame(image: &mut VmImage) -> Result<(), VmError> {
    let base = image.translate_checked(image.reg(REG_FP))?;
    for k in 0..4u64 {
        image.write_uint(base + k * 8, 8, image.reg(6 + k as u8))?;
    }
    image.write_uint(base + 32, 8, image.lr())
}

fn restore_frame(image: &mut VmImage) -> Result<(), VmError> {
    let base = image.translate_checked(image.reg(REG_FP))?;
    for k in 0..4u64 {
        let value = image.read_uint(base + k * 8, 8)?;
        image.set_reg(6 + k as u8, value);
    }
    let lr = image.read_uint(base + 32, 8)?;
    image.set_lr(lr);
    Ok(())
}
