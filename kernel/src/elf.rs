//! Format of an ELF executable file.

use bitflags::bitflags;

pub const ELF_MAGIC: u32 = 0x464C457F; // "\x7FELF" in little endian

/// File header.
#[repr(C)]
pub struct ElfHeader {
    pub magic: u32, // must equal ELF_MAGIC
    pub elf: [u8; 12],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl ElfHeader {
    pub fn zeroed() -> Self {
        // plain integer fields; the zero pattern is a valid (if useless)
        // header that fails the magic check.
        unsafe { core::mem::zeroed() }
    }
}

/// Program section header.
#[repr(C)]
pub struct ProgramHeader {
    pub typ: u32,
    pub flags: u32,
    pub off: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    pub fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

// Values for ProgramHeader typ
pub const ELF_PROG_LOAD: u32 = 1;

bitflags! {
    /// Flag bits for ProgramHeader flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProgFlags: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}
