//! Fault types raised while driving a VM image.
//!
//! Every variant is fatal to the faulting image only: the execution engine
//! logs the fault, forces the image into the exited state and returns control
//! to the scheduler. The host process never aborts on guest behavior.

/// Errors that can occur while executing or reconstructing a VM image.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Unknown opcode encountered in the code section.
    #[error("invalid opcode {opcode:#04x} at pc {pc}")]
    InvalidOpcode { opcode: u8, pc: u64 },

    /// Program counter left the code section.
    #[error("program counter {pc} outside the code section")]
    InvalidPc { pc: i64 },

    /// Register operand outside the register file.
    #[error("register index {0} out of bounds")]
    InvalidRegister(u8),

    /// Local call nesting exceeded the hard limit.
    #[error("call depth exceeded (max {max})")]
    CallDepthExceeded { max: u8 },

    /// A virtual address did not translate to a committed mapping.
    #[error("memory fault at virtual address {va:#x}")]
    MemoryFault { va: u64 },

    /// A translated access fell outside the image buffer.
    #[error("access at image offset {0:#x} out of range")]
    OutOfImage(u64),

    /// Division or modulo by zero.
    #[error("division by zero at pc {pc}")]
    DivisionByZero { pc: i64 },

    /// A received byte image failed validation during reconstruction.
    #[error("malformed image: {0}")]
    MalformedImage(&'static str),
}
