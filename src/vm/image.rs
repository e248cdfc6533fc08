//! The VM image: one flat, migratable memory arena.
//!
//! An image owns a single contiguous byte buffer laid out as
//! `header | code | data | stack`. Every field the machine needs (registers,
//! state word, section table, page tables) lives at a fixed little-endian
//! offset inside the header, and every internal reference is an offset into
//! the buffer, never a host pointer. That is what makes migration trivial:
//! the buffer is the wire format, copied verbatim, and the receiving node
//! only has to rebuild the default page-table mapping and runtime-local
//! bookkeeping.
//!
//! # Header layout (all fields little-endian)
//!
//! ```text
//! offset  size  field
//! 0       88    general registers r0..r10 (r10 = frame pointer)
//! 88      8     link register
//! 96      8     program counter (instruction units)
//! 104     8     active address-space index
//! 112     4     state word
//! 116     1     call depth
//! 117     1     reserved
//! 118     2     data-load cursor
//! 120     4     code offset        132     4     code size
//! 124     4     data offset        136     4     data size
//! 128     4     stack offset       140     4     stack size
//! 144     128   page tables: 2 spaces x 4 entries x {base u64, size u64}
//! 272           header end; code section begins here
//! ```
//!
//! Guest virtual address 0 maps to the start of the data region; the stack
//! grows down from the end of the combined data+stack window.

use crate::host::monitor::MonitorList;
use crate::vm::errors::VmError;
use crate::vm::isa::{Instruction, INSTRUCTION_SIZE};

/// Number of general registers; `r10` is the frame pointer.
pub const USER_REG_NUM: u8 = 11;

/// Frame pointer register index.
pub const REG_FP: u8 = 10;

/// Bytes reserved per local call frame.
pub const STACK_FRAME_SIZE: u64 = 64;

/// Hard limit on local call nesting.
pub const STACK_DEPTH_MAX: u8 = 3;

/// Default stack budget for a freshly created image.
pub const DEFAULT_STACK_SIZE: u32 = 128;

/// Default data budget for a freshly created image.
pub const DEFAULT_DATA_SIZE: u32 = 64;

/// Number of selectable address spaces.
pub const ADDRESS_SPACE_NUM: usize = 2;

/// Page-table entries per address space; slot 0 of space 0 always covers
/// the data+stack window.
pub const PAGE_ENTRIES_PER_SPACE: usize = 4;

/// Byte size of the image header.
pub const HEADER_SIZE: u32 = 272;

const OFF_REG: usize = 0;
const OFF_LR: usize = 88;
const OFF_PC: usize = 96;
const OFF_ASID: usize = 104;
const OFF_STATE: usize = 112;
const OFF_CALL_DEPTH: usize = 116;
const OFF_DATA_CURSOR: usize = 118;
const OFF_CODE: usize = 120;
const OFF_DATA: usize = 124;
const OFF_STACK: usize = 128;
const OFF_CODE_SIZE: usize = 132;
const OFF_DATA_SIZE: usize = 136;
const OFF_STACK_SIZE: usize = 140;
const OFF_PAGE_TABLE: usize = 144;
const PTE_SIZE: usize = 16;

/// Scheduling state of an image.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VmState {
    Running = 0,
    Exited = 1,
    WaitForAddress = 2,
    MigrateTo = 3,
    CloneTo = 4,
}

impl VmState {
    fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(VmState::Running),
            1 => Some(VmState::Exited),
            2 => Some(VmState::WaitForAddress),
            3 => Some(VmState::MigrateTo),
            4 => Some(VmState::CloneTo),
            _ => None,
        }
    }
}

/// One page-table mapping: a base offset into the image buffer and the byte
/// size of the window. An entry is committed iff `base != 0`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageTableEntry {
    pub base: u64,
    pub size: u64,
}

/// A complete virtual machine instance.
///
/// The byte buffer is the migratable state; `monitors` and `id` are
/// runtime-local and intentionally absent from the wire format.
pub struct VmImage {
    buf: Vec<u8>,
    monitors: MonitorList,
    id: u64,
}

impl VmImage {
    /// Creates an image around `code` with the default data/stack budgets.
    pub fn new(code: &[u8]) -> Self {
        Self::with_layout(code, DEFAULT_DATA_SIZE, DEFAULT_STACK_SIZE)
    }

    /// Creates an image with explicit data/stack budgets.
    ///
    /// The stack must hold at least one call frame.
    pub fn with_layout(code: &[u8], data_size: u32, stack_size: u32) -> Self {
        assert!(code.len() <= u32::MAX as usize);
        assert!(stack_size as u64 >= STACK_FRAME_SIZE);
        let code_size = code.len() as u32;
        let total = HEADER_SIZE as usize + code.len() + data_size as usize + stack_size as usize;

        let mut image = VmImage {
            buf: vec![0; total],
            monitors: MonitorList::new(),
            id: 0,
        };

        let code_off = HEADER_SIZE;
        let data_off = code_off + code_size;
        let stack_off = data_off + data_size;
        image.put_u32(OFF_CODE, code_off);
        image.put_u32(OFF_DATA, data_off);
        image.put_u32(OFF_STACK, stack_off);
        image.put_u32(OFF_CODE_SIZE, code_size);
        image.put_u32(OFF_DATA_SIZE, data_size);
        image.put_u32(OFF_STACK_SIZE, stack_size);

        image.buf[code_off as usize..data_off as usize].copy_from_slice(code);

        image.set_reg(REG_FP, (data_size + stack_size) as u64 - STACK_FRAME_SIZE);
        image.install_default_mapping();
        image
    }

    /// Reconstructs an image from a received byte image.
    ///
    /// The transmitted default page-table entry and list bookkeeping are not
    /// trusted: the default mapping is rebuilt, the monitor list starts
    /// empty, the program counter advances past the instruction that
    /// triggered the transfer, and the image is set running.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmError> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(VmError::MalformedImage("shorter than the image header"));
        }

        let mut image = VmImage {
            buf: bytes.to_vec(),
            monitors: MonitorList::new(),
            id: 0,
        };

        let code_size = image.code_size() as u64;
        let data_size = image.data_size() as u64;
        let stack_size = image.stack_size() as u64;
        let expected = HEADER_SIZE as u64 + code_size + data_size + stack_size;
        if image.buf.len() as u64 != expected
            || image.code_off() != HEADER_SIZE as u64
            || image.data_off() != HEADER_SIZE as u64 + code_size
            || image.stack_off() != image.data_off() + data_size
        {
            return Err(VmError::MalformedImage("section layout mismatch"));
        }
        if VmState::from_u32(image.get_u32(OFF_STATE)).is_none() {
            return Err(VmError::MalformedImage("invalid state word"));
        }

        image.install_default_mapping();
        image.set_pc(image.pc() + 1);
        image.set_state(VmState::Running);
        Ok(image)
    }

    /// The exact byte range transmitted during migration.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Total image size in bytes.
    pub fn image_size(&self) -> usize {
        self.buf.len()
    }

    /// Locally-scoped image identifier, assigned at admission.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn install_default_mapping(&mut self) {
        let entry = PageTableEntry {
            base: self.data_off(),
            size: self.data_size() as u64 + self.stack_size() as u64,
        };
        self.set_pte(0, 0, entry);
    }

    // ---------- registers and system registers ----------

    /// Reads general register `index`.
    pub fn reg(&self, index: u8) -> u64 {
        debug_assert!(index < USER_REG_NUM);
        self.get_u64(OFF_REG + index as usize * 8)
    }

    /// Writes general register `index`.
    pub fn set_reg(&mut self, index: u8, value: u64) {
        debug_assert!(index < USER_REG_NUM);
        self.put_u64(OFF_REG + index as usize * 8, value);
    }

    pub fn lr(&self) -> u64 {
        self.get_u64(OFF_LR)
    }

    pub fn set_lr(&mut self, value: u64) {
        self.put_u64(OFF_LR, value);
    }

    pub fn pc(&self) -> u64 {
        self.get_u64(OFF_PC)
    }

    pub fn set_pc(&mut self, value: u64) {
        self.put_u64(OFF_PC, value);
    }

    pub fn asid(&self) -> u64 {
        self.get_u64(OFF_ASID)
    }

    pub fn set_asid(&mut self, value: u64) {
        self.put_u64(OFF_ASID, value);
    }

    pub fn state(&self) -> VmState {
        VmState::from_u32(self.get_u32(OFF_STATE)).unwrap_or(VmState::Exited)
    }

    pub fn set_state(&mut self, state: VmState) {
        self.put_u32(OFF_STATE, state as u32);
    }

    pub fn call_depth(&self) -> u8 {
        self.buf[OFF_CALL_DEPTH]
    }

    pub fn set_call_depth(&mut self, depth: u8) {
        self.buf[OFF_CALL_DEPTH] = depth;
    }

    // ---------- section table ----------

    pub fn code_off(&self) -> u64 {
        self.get_u32(OFF_CODE) as u64
    }

    pub fn data_off(&self) -> u64 {
        self.get_u32(OFF_DATA) as u64
    }

    pub fn stack_off(&self) -> u64 {
        self.get_u32(OFF_STACK) as u64
    }

    pub fn code_size(&self) -> u32 {
        self.get_u32(OFF_CODE_SIZE)
    }

    pub fn data_size(&self) -> u32 {
        self.get_u32(OFF_DATA_SIZE)
    }

    pub fn stack_size(&self) -> u32 {
        self.get_u32(OFF_STACK_SIZE)
    }

    // ---------- page tables ----------

    /// Reads the page-table entry at (`space`, `slot`).
    pub fn pte(&self, space: usize, slot: usize) -> PageTableEntry {
        debug_assert!(space < ADDRESS_SPACE_NUM && slot < PAGE_ENTRIES_PER_SPACE);
        let off = OFF_PAGE_TABLE + (space * PAGE_ENTRIES_PER_SPACE + slot) * PTE_SIZE;
        PageTableEntry {
            base: self.get_u64(off),
            size: self.get_u64(off + 8),
        }
    }

    /// Writes the page-table entry at (`space`, `slot`).
    pub fn set_pte(&mut self, space: usize, slot: usize, entry: PageTableEntry) {
        debug_assert!(space < ADDRESS_SPACE_NUM && slot < PAGE_ENTRIES_PER_SPACE);
        let off = OFF_PAGE_TABLE + (space * PAGE_ENTRIES_PER_SPACE + slot) * PTE_SIZE;
        self.put_u64(off, entry.base);
        self.put_u64(off + 8, entry.size);
    }

    // ---------- code access ----------

    /// Fetches the instruction at slot `index`, if inside the code section.
    pub fn instruction(&self, index: u64) -> Option<Instruction> {
        let count = self.code_size() as u64 / INSTRUCTION_SIZE as u64;
        if index >= count {
            return None;
        }
        let start = self.code_off() as usize + index as usize * INSTRUCTION_SIZE;
        let bytes: &[u8; INSTRUCTION_SIZE] = self.buf[start..start + INSTRUCTION_SIZE]
            .try_into()
            .ok()?;
        Some(Instruction::decode(bytes))
    }

    /// Patches the immediate of the instruction at slot `index`.
    ///
    /// Loader-only: relocation is the single writer of loaded code.
    pub(crate) fn patch_immediate(&mut self, index: u64, imm: i32) {
        let start = self.code_off() as usize + index as usize * INSTRUCTION_SIZE + 4;
        self.buf[start..start + 4].copy_from_slice(&imm.to_le_bytes());
    }

    // ---------- data loading ----------

    /// Appends caller-supplied bytes into the data region at the data-load
    /// cursor, clamped to the remaining space. Returns the number of bytes
    /// copied.
    pub fn load_data(&mut self, data: &[u8]) -> usize {
        let cursor = self.get_u16(OFF_DATA_CURSOR) as usize;
        let remain = self.data_size() as usize - cursor.min(self.data_size() as usize);
        let copy_len = data.len().min(remain);
        if copy_len != 0 {
            let start = self.data_off() as usize + cursor;
            self.buf[start..start + copy_len].copy_from_slice(&data[..copy_len]);
            self.put_u16(OFF_DATA_CURSOR, (cursor + copy_len) as u16);
        }
        copy_len
    }

    // ---------- guest memory access (translated offsets) ----------

    /// Reads an unsigned value of `width` bytes at a translated buffer
    /// offset, zero-extended to 64 bits.
    pub fn read_uint(&self, offset: u64, width: usize) -> Result<u64, VmError> {
        let range = self.check_range(offset, width)?;
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(&self.buf[range]);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Writes the low `width` bytes of `value` at a translated buffer offset.
    pub fn write_uint(&mut self, offset: u64, width: usize, value: u64) -> Result<(), VmError> {
        let range = self.check_range(offset, width)?;
        self.buf[range].copy_from_slice(&value.to_le_bytes()[..width]);
        Ok(())
    }

    fn check_range(&self, offset: u64, width: usize) -> Result<std::ops::Range<usize>, VmError> {
        let start = usize::try_from(offset).map_err(|_| VmError::OutOfImage(offset))?;
        let end = start
            .checked_add(width)
            .ok_or(VmError::OutOfImage(offset))?;
        if end > self.buf.len() {
            return Err(VmError::OutOfImage(offset));
        }
        Ok(start..end)
    }

    // ---------- monitor list ----------

    pub fn monitors(&self) -> &MonitorList {
        &self.monitors
    }

    pub fn monitors_mut(&mut self) -> &mut MonitorList {
        &mut self.monitors
    }

    // ---------- raw header accessors ----------

    fn get_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.buf[off], self.buf[off + 1]])
    }

    fn put_u16(&mut self, off: usize, v: u16) {
        self.buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn get_u32(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        self.buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn get_u64(&self, off: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[off..off + 8]);
        u64::from_le_bytes(bytes)
    }

    fn put_u64(&mut self, off: usize, v: u64) {
        self.buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}

/// Overwrites register 0 in a raw image byte buffer.
///
/// Used when sending per-destination clone copies: each copy carries its own
/// destination index in `r0` without touching the live image.
pub(crate) fn patch_reg0(bytes: &mut [u8], value: u64) {
    bytes[OFF_REG..OFF_REG + 8].copy_from_slice(&value.to_le_bytes());
}
