//! Object loading and call-site relocation.
//!
//! Parses a relocatable ELF object, builds a VM image around its code
//! section, and resolves every call relocation either to a program-local
//! instruction offset or to a Host Function Table index. The entry point is
//! the function symbol `vm_main`, defined inside the code section; its byte
//! value divided by the instruction size becomes the initial program
//! counter.
//!
//! Linking is best-effort: a relocation whose symbol is neither a local
//! function nor a host symbol is left unpatched with a warning, and the
//! call site is skipped at run time.

use crate::host::HostCall;
use crate::vm::image::VmImage;
use crate::vm::isa::INSTRUCTION_SIZE;
use crate::warn;
use object::read::{Object, ObjectSection, ObjectSymbol, ObjectSymbolTable};
use object::{File, RelocationTarget, SectionIndex, SectionKind, SymbolKind};

/// Name of the entry function every loadable program must define.
pub const ENTRY_SYMBOL: &str = "vm_main";

/// Errors that can occur while loading a program object.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The container itself could not be parsed.
    #[error("failed to parse object: {0}")]
    Object(#[from] object::read::Error),

    /// No `.text` section.
    #[error("missing code section `.text`")]
    MissingCodeSection,

    /// `.text` exists but is not an allocatable+executable program-bits
    /// section.
    #[error("`.text` is not an executable program-bits section")]
    BadCodeSection,

    /// No symbol table section.
    #[error("missing symbol table")]
    MissingSymbolTable,

    /// No `vm_main` function defined in the code section.
    #[error("entry symbol `vm_main` not found in the code section")]
    MissingEntry,

    /// The code section exceeds what an image can address.
    #[error("code section too large ({0} bytes)")]
    OversizedCode(u64),
}

/// Loads a program object into a fresh VM image with the default data and
/// stack budgets.
pub fn load_object(bytes: &[u8]) -> Result<VmImage, LoadError> {
    let obj = File::parse(bytes)?;

    let text = obj
        .section_by_name(".text")
        .ok_or(LoadError::MissingCodeSection)?;
    if text.kind() != SectionKind::Text {
        return Err(LoadError::BadCodeSection);
    }
    let code = text.data()?;
    if code.len() > u32::MAX as usize {
        return Err(LoadError::OversizedCode(code.len() as u64));
    }

    let symtab = obj.symbol_table().ok_or(LoadError::MissingSymbolTable)?;
    let entry = symtab
        .symbols()
        .find(|sym| {
            sym.name().is_ok_and(|name| name == ENTRY_SYMBOL)
                && is_code_function(sym, text.index())
        })
        .ok_or(LoadError::MissingEntry)?;

    let mut image = VmImage::new(code);
    image.set_pc(entry.address() / INSTRUCTION_SIZE as u64);

    let slot_count = code.len() as u64 / INSTRUCTION_SIZE as u64;
    for (offset, relocation) in text.relocations() {
        let ins_index = offset / INSTRUCTION_SIZE as u64;
        if ins_index >= slot_count {
            warn!("relocation at {:#x} outside the code section, skipped", offset);
            continue;
        }
        let RelocationTarget::Symbol(sym_index) = relocation.target() else {
            continue;
        };
        let sym = obj.symbol_by_index(sym_index)?;
        let name = sym.name()?;

        if is_code_function(&sym, text.index()) {
            // local function calls take priority over host symbols
            let target = sym.address() / INSTRUCTION_SIZE as u64;
            image.patch_immediate(ins_index, (target as i64 - ins_index as i64 - 1) as i32);
        } else if let Some(index) = HostCall::index_of(name) {
            image.patch_immediate(ins_index, index as i32);
        } else {
            warn!("unresolved call to `{}` at instruction {}", name, ins_index);
        }
    }

    Ok(image)
}

fn is_code_function<'a>(sym: &impl ObjectSymbol<'a>, text: SectionIndex) -> bool {
    sym.kind() == SymbolKind::Text && sym.section_index() == Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;
    use crate::transport::{LocalTransport, NodeAddr};
    use crate::vm::asm::*;
    use crate::vm::image::VmState;
    use crate::vm::interpreter;
    use crate::vm::isa::{AluOp, Instruction, MemWidth};

    // ---------- minimal ELF64 builder ----------

    const EHDR_SIZE: usize = 64;
    const SHDR_SIZE: usize = 64;
    const SHNUM: usize = 6;
    const DATA_START: usize = EHDR_SIZE + SHNUM * SHDR_SIZE;

    /// A symbol for the test object: a function defined at a byte offset in
    /// `.text`, or an undefined import.
    enum Sym {
        Func(&'static str, u64),
        Undef(&'static str),
    }

    #[allow(clippy::too_many_arguments)]
    fn shdr(
        out: &mut Vec<u8>,
        name: u32,
        sh_type: u32,
        flags: u64,
        offset: u64,
        size: u64,
        link: u32,
        info: u32,
        entsize: u64,
    ) {
        out.extend(name.to_le_bytes());
        out.extend(sh_type.to_le_bytes());
        out.extend(flags.to_le_bytes());
        out.extend(0u64.to_le_bytes()); // sh_addr
        out.extend(offset.to_le_bytes());
        out.extend(size.to_le_bytes());
        out.extend(link.to_le_bytes());
        out.extend(info.to_le_bytes());
        out.extend(8u64.to_le_bytes()); // sh_addralign
        out.extend(entsize.to_le_bytes());
    }

    /// Builds a relocatable ELF64 object with `.text`, `.rel.text`,
    /// `.symtab`, `.strtab` and `.shstrtab`. Relocations name symbols by
    /// their position in `symbols`.
    fn build_elf(code: &[u8], symbols: &[Sym], relocs: &[(u64, usize)]) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for sym in symbols {
            let name = match sym {
                Sym::Func(name, _) | Sym::Undef(name) => name,
            };
            name_offsets.push(strtab.len() as u32);
            strtab.extend(name.as_bytes());
            strtab.push(0);
        }

        let mut shstrtab = vec![0u8];
        let mut sh_names = vec![0u32];
        for name in [".text", ".rel.text", ".symtab", ".strtab", ".shstrtab"] {
            sh_names.push(shstrtab.len() as u32);
            shstrtab.extend(name.as_bytes());
            shstrtab.push(0);
        }

        let mut symtab = vec![0u8; 24];
        for (i, sym) in symbols.iter().enumerate() {
            symtab.extend(name_offsets[i].to_le_bytes());
            match sym {
                Sym::Func(_, value) => {
                    symtab.push(0x12); // GLOBAL | FUNC
                    symtab.push(0);
                    symtab.extend(1u16.to_le_bytes()); // defined in .text
                    symtab.extend(value.to_le_bytes());
                }
                Sym::Undef(_) => {
                    symtab.push(0x10); // GLOBAL | NOTYPE
                    symtab.push(0);
                    symtab.extend(0u16.to_le_bytes()); // SHN_UNDEF
                    symtab.extend(0u64.to_le_bytes());
                }
            }
            symtab.extend(0u64.to_le_bytes()); // st_size
        }

        let mut rel = Vec::new();
        for (offset, sym_slot) in relocs {
            rel.extend(offset.to_le_bytes());
            let info = ((*sym_slot as u64 + 1) << 32) | 10; // R_BPF_64_32
            rel.extend(info.to_le_bytes());
        }

        let text_off = DATA_START as u64;
        let rel_off = text_off + code.len() as u64;
        let symtab_off = rel_off + rel.len() as u64;
        let strtab_off = symtab_off + symtab.len() as u64;
        let shstrtab_off = strtab_off + strtab.len() as u64;

        let mut out = Vec::new();
        // ELF header
        out.extend([0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend([0u8; 8]);
        out.extend(1u16.to_le_bytes()); // ET_REL
        out.extend(247u16.to_le_bytes()); // EM_BPF
        out.extend(1u32.to_le_bytes());
        out.extend(0u64.to_le_bytes()); // e_entry
        out.extend(0u64.to_le_bytes()); // e_phoff
        out.extend((EHDR_SIZE as u64).to_le_bytes()); // e_shoff
        out.extend(0u32.to_le_bytes());
        out.extend((EHDR_SIZE as u16).to_le_bytes());
        out.extend(0u16.to_le_bytes());
        out.extend(0u16.to_le_bytes());
        out.extend((SHDR_SIZE as u16).to_le_bytes());
        out.extend((SHNUM as u16).to_le_bytes());
        out.extend(5u16.to_le_bytes()); // e_shstrndx

        // section headers
        out.extend([0u8; SHDR_SIZE]); // null section
        shdr(&mut out, sh_names[1], 1, 6, text_off, code.len() as u64, 0, 0, 0);
        shdr(&mut out, sh_names[2], 9, 0, rel_off, rel.len() as u64, 3, 1, 16);
        shdr(&mut out, sh_names[3], 2, 0, symtab_off, symtab.len() as u64, 4, 1, 24);
        shdr(&mut out, sh_names[4], 3, 0, strtab_off, strtab.len() as u64, 0, 0, 0);
        shdr(
            &mut out,
            sh_names[5],
            3,
            0,
            shstrtab_off,
            shstrtab.len() as u64,
            0,
            0,
            0,
        );

        out.extend(code);
        out.extend(rel);
        out.extend(symtab);
        out.extend(strtab);
        out.extend(shstrtab);
        out
    }

    // ---------- the end-to-end program from the original test suite ----------

    /// `test(a, b, c, d, e)` sums its four scalars with `*(e+8)` and
    /// `*(e+16)`; `vm_main` calls it with 1..4 and a pointer to the data
    /// region, then reports the sum.
    fn sum_program() -> Vec<u8> {
        assemble(&[
            // test at slot 0
            alu64_reg(AluOp::Add, 1, 2),
            alu64_reg(AluOp::Add, 1, 3),
            alu64_reg(AluOp::Add, 1, 4),
            load_mem(MemWidth::Dw, 2, 5, 8),
            alu64_reg(AluOp::Add, 1, 2),
            load_mem(MemWidth::Dw, 2, 5, 16),
            alu64_reg(AluOp::Add, 1, 2),
            mov64_reg(0, 1),
            exit(),
            // vm_main at slot 9
            mov64_imm(1, 1),
            mov64_imm(2, 2),
            mov64_imm(3, 3),
            mov64_imm(4, 4),
            mov64_imm(5, 0),
            call_local(-1), // slot 14: relocated to `test`
            mov64_reg(1, 0),
            call_ext(-1), // slot 16: relocated to `debug_print`
            exit(),
        ])
    }

    fn sum_object() -> Vec<u8> {
        build_elf(
            &sum_program(),
            &[
                Sym::Func("test", 0),
                Sym::Func("vm_main", 72),
                Sym::Undef("debug_print"),
            ],
            &[(14 * 8, 0), (16 * 8, 2)],
        )
    }

    #[test]
    fn entry_point_sets_initial_pc() {
        let image = load_object(&sum_object()).unwrap();
        assert_eq!(image.pc(), 9);
    }

    #[test]
    fn local_call_patched_to_relative_offset() {
        let image = load_object(&sum_object()).unwrap();
        let call = image.instruction(14).unwrap();
        // target 0, call site 14: 0 - 14 - 1
        assert_eq!(call.imm, -15);
    }

    #[test]
    fn host_call_patched_to_table_index() {
        let image = load_object(&sum_object()).unwrap();
        let call = image.instruction(16).unwrap();
        assert_eq!(call.imm, HostCall::index_of("debug_print").unwrap() as i32);
    }

    #[test]
    fn unresolved_symbol_left_unpatched() {
        let object = build_elf(
            &sum_program(),
            &[
                Sym::Func("test", 0),
                Sym::Func("vm_main", 72),
                Sym::Undef("no_such_symbol"),
            ],
            &[(14 * 8, 0), (16 * 8, 2)],
        );
        let image = load_object(&object).unwrap();
        assert_eq!(image.instruction(16).unwrap().imm, -1);
    }

    #[test]
    fn missing_entry_symbol_fails() {
        let object = build_elf(
            &sum_program(),
            &[Sym::Func("test", 0), Sym::Undef("debug_print")],
            &[],
        );
        assert!(matches!(
            load_object(&object),
            Err(LoadError::MissingEntry)
        ));
    }

    #[test]
    fn entry_symbol_must_be_a_defined_function() {
        let object = build_elf(&sum_program(), &[Sym::Undef("vm_main")], &[]);
        assert!(matches!(
            load_object(&object),
            Err(LoadError::MissingEntry)
        ));
    }

    #[test]
    fn garbage_bytes_fail_to_parse() {
        assert!(matches!(
            load_object(b"not an object"),
            Err(LoadError::Object(_))
        ));
    }

    #[test]
    fn non_executable_text_section_fails() {
        let mut object = sum_object();
        // clear SHF_EXECINSTR in the .text header
        let flags_off = EHDR_SIZE + SHDR_SIZE + 8;
        object[flags_off] = 0x2; // SHF_ALLOC only
        assert!(matches!(
            load_object(&object),
            Err(LoadError::BadCodeSection)
        ));
    }

    #[test]
    fn missing_symbol_table_fails() {
        let mut object = sum_object();
        // turn .symtab into a null section
        let type_off = EHDR_SIZE + 3 * SHDR_SIZE + 4;
        object[type_off..type_off + 4].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            load_object(&object),
            Err(LoadError::MissingSymbolTable)
        ));
    }

    #[test]
    fn loaded_program_runs_end_to_end() {
        let mut image = load_object(&sum_object()).unwrap();
        // two values read through pointer arithmetic land at +8 and +16
        let mut data = Vec::new();
        for value in [7u64, 8, 9] {
            data.extend(value.to_le_bytes());
        }
        assert_eq!(image.load_data(&data), 24);

        let mut transport = LocalTransport::new(NodeAddr {
            ip: 0x7f00_0001,
            port: 1,
        });
        let mut log = Vec::new();
        let mut ctx = HostContext {
            transport: &mut transport,
            debug_log: &mut log,
        };
        interpreter::run(&mut image, &mut ctx);

        assert_eq!(image.state(), VmState::Exited);
        assert_eq!(log, vec![1 + 2 + 3 + 4 + 8 + 9]);
    }

    #[test]
    fn relocation_outside_code_is_skipped() {
        let object = build_elf(
            &sum_program(),
            &[
                Sym::Func("test", 0),
                Sym::Func("vm_main", 72),
                Sym::Undef("debug_print"),
            ],
            &[(14 * 8, 0), (16 * 8, 2), (1000 * 8, 2)],
        );
        let image = load_object(&object).unwrap();
        assert_eq!(image.instruction(14).unwrap().imm, -15);
    }

    #[test]
    fn builder_emits_decodable_code() {
        // guards the test fixture itself
        let code = sum_program();
        assert_eq!(code.len() % 8, 0);
        let call = Instruction::decode(code[14 * 8..15 * 8].try_into().unwrap());
        assert_eq!(call.src, crate::vm::isa::PSEUDO_CALL);
    }
}
