//! Relocations and relocation types.

use std::fmt;

use crate::obj::SymId;

/// A relocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Reloc {
    /// The address where this relocation is applied.
    ///
    /// This is an absolute address within some section. Hence, to compute
    /// the offset of the relocation within a section, use
    /// `addr - section.addr`, and within a [`Data`](crate::obj::Data), use
    /// `addr - data.addr`.
    pub addr: u64,
    /// The relocation type. This determines how to calculate the value that
    /// would be stored at `addr`.
    pub ty: RelocType,
    /// The target of this relocation, or [`SymId::NONE`] if the type does
    /// not take a symbol as an input.
    pub symbol: SymId,
    /// The addend input to the relocation, if any.
    ///
    /// If the file format uses addends smaller than 64 bits, they are sign
    /// extended. Object formats store addends either explicitly in the
    /// relocation table or implicitly at the target of the relocation; this
    /// crate hides the difference and populates the addend in either case.
    pub addend: i64,
}

/// The type of a relocation. Relocations vary widely by architecture and
/// operating system, so the interface to this is fairly opaque.
///
/// The type is encoded as a relocation class in the top 8 bits and a
/// format-specific code in the remaining 24 bits. We do this rather than
/// using trait objects to keep [`Reloc`] compact and pointer-free, since
/// entire relocation sections are decoded into memory.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RelocType(u32);

impl RelocType {
    pub(crate) fn new(class: RelocClass, code: u32) -> RelocType {
        if code & ((1 << 24) - 1) != code {
            panic!("relocation value {code} too large to represent as a RelocType");
        }
        RelocType((class as u32) << 24 | code)
    }

    fn split(self) -> (RelocClass, u32) {
        let class = match self.0 >> 24 {
            1 => RelocClass::ElfX86_64,
            2 => RelocClass::Elf386,
            _ => RelocClass::Unknown,
        };
        (class, self.0 & ((1 << 24) - 1))
    }

    /// Returns the size of the relocation target in bytes, or `None` if
    /// unknown.
    pub fn size(self) -> Option<u8> {
        let (class, code) = self.split();
        match class {
            RelocClass::Unknown => None,
            RelocClass::ElfX86_64 => elf_x86_64_info(code).map(|(_, size)| size),
            RelocClass::Elf386 => elf_386_info(code).map(|(_, size)| size),
        }
    }
}

impl fmt::Display for RelocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, code) = self.split();
        let name = match class {
            RelocClass::Unknown => None,
            RelocClass::ElfX86_64 => elf_x86_64_info(code).map(|(name, _)| name),
            RelocClass::Elf386 => elf_386_info(code).map(|(name, _)| name),
        };
        match name {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown ({code:#x})"),
        }
    }
}

impl fmt::Debug for RelocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelocType({self})")
    }
}

/// Relocation classes. The class tags the format-specific code space a
/// relocation type lives in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum RelocClass {
    Unknown = 0,
    ElfX86_64 = 1,
    Elf386 = 2,
}

/// Name and target size in bytes of each known x86-64 relocation type.
fn elf_x86_64_info(code: u32) -> Option<(&'static str, u8)> {
    use object::elf::*;
    Some(match code {
        R_X86_64_NONE => ("R_X86_64_NONE", 0),
        R_X86_64_64 => ("R_X86_64_64", 8),
        R_X86_64_PC32 => ("R_X86_64_PC32", 4),
        R_X86_64_GOT32 => ("R_X86_64_GOT32", 4),
        R_X86_64_PLT32 => ("R_X86_64_PLT32", 4),
        R_X86_64_COPY => ("R_X86_64_COPY", 0),
        R_X86_64_GLOB_DAT => ("R_X86_64_GLOB_DAT", 8),
        R_X86_64_JUMP_SLOT => ("R_X86_64_JUMP_SLOT", 8),
        R_X86_64_RELATIVE => ("R_X86_64_RELATIVE", 8),
        R_X86_64_GOTPCREL => ("R_X86_64_GOTPCREL", 4),
        R_X86_64_32 => ("R_X86_64_32", 4),
        R_X86_64_32S => ("R_X86_64_32S", 4),
        R_X86_64_16 => ("R_X86_64_16", 2),
        R_X86_64_PC16 => ("R_X86_64_PC16", 2),
        R_X86_64_8 => ("R_X86_64_8", 1),
        R_X86_64_PC8 => ("R_X86_64_PC8", 1),
        R_X86_64_DTPMOD64 => ("R_X86_64_DTPMOD64", 8),
        R_X86_64_DTPOFF64 => ("R_X86_64_DTPOFF64", 8),
        R_X86_64_TPOFF64 => ("R_X86_64_TPOFF64", 8),
        R_X86_64_TLSGD => ("R_X86_64_TLSGD", 4),
        R_X86_64_TLSLD => ("R_X86_64_TLSLD", 4),
        R_X86_64_DTPOFF32 => ("R_X86_64_DTPOFF32", 4),
        R_X86_64_GOTTPOFF => ("R_X86_64_GOTTPOFF", 4),
        R_X86_64_TPOFF32 => ("R_X86_64_TPOFF32", 4),
        R_X86_64_PC64 => ("R_X86_64_PC64", 8),
        R_X86_64_GOTOFF64 => ("R_X86_64_GOTOFF64", 8),
        R_X86_64_GOTPC32 => ("R_X86_64_GOTPC32", 4),
        R_X86_64_GOT64 => ("R_X86_64_GOT64", 8),
        R_X86_64_GOTPCREL64 => ("R_X86_64_GOTPCREL64", 8),
        R_X86_64_GOTPC64 => ("R_X86_64_GOTPC64", 8),
        R_X86_64_GOTPLT64 => ("R_X86_64_GOTPLT64", 8),
        R_X86_64_PLTOFF64 => ("R_X86_64_PLTOFF64", 8),
        R_X86_64_SIZE32 => ("R_X86_64_SIZE32", 4),
        R_X86_64_SIZE64 => ("R_X86_64_SIZE64", 8),
        R_X86_64_GOTPC32_TLSDESC => ("R_X86_64_GOTPC32_TLSDESC", 4),
        R_X86_64_TLSDESC_CALL => ("R_X86_64_TLSDESC_CALL", 0),
        R_X86_64_TLSDESC => ("R_X86_64_TLSDESC", 16),
        R_X86_64_IRELATIVE => ("R_X86_64_IRELATIVE", 8),
        // See https://github.com/hjl-tools/x86-psABI/wiki/X86-psABI
        R_X86_64_RELATIVE64 => ("R_X86_64_RELATIVE64", 8), // For x32
        39 => ("R_X86_64_PC32_BND", 4), // For x32; deprecated
        40 => ("R_X86_64_PLT32_BND", 4), // For x32; deprecated
        R_X86_64_GOTPCRELX => ("R_X86_64_GOTPCRELX", 4),
        R_X86_64_REX_GOTPCRELX => ("R_X86_64_REX_GOTPCRELX", 4),
        _ => return None,
    })
}

/// Name and target size in bytes of each known i386 relocation type.
fn elf_386_info(code: u32) -> Option<(&'static str, u8)> {
    use object::elf::*;
    Some(match code {
        R_386_NONE => ("R_386_NONE", 0),
        R_386_32 => ("R_386_32", 4),
        R_386_PC32 => ("R_386_PC32", 4),
        R_386_GOT32 => ("R_386_GOT32", 4),
        R_386_PLT32 => ("R_386_PLT32", 4),
        R_386_COPY => ("R_386_COPY", 0),
        R_386_GLOB_DAT => ("R_386_GLOB_DAT", 4),
        R_386_JMP_SLOT => ("R_386_JMP_SLOT", 4),
        R_386_RELATIVE => ("R_386_RELATIVE", 4),
        R_386_GOTOFF => ("R_386_GOTOFF", 4),
        R_386_GOTPC => ("R_386_GOTPC", 4),
        R_386_TLS_TPOFF => ("R_386_TLS_TPOFF", 4),
        R_386_TLS_IE => ("R_386_TLS_IE", 4),
        R_386_TLS_GOTIE => ("R_386_TLS_GOTIE", 4),
        R_386_TLS_LE => ("R_386_TLS_LE", 4),
        R_386_TLS_GD => ("R_386_TLS_GD", 4),
        R_386_TLS_LDM => ("R_386_TLS_LDM", 4),
        R_386_16 => ("R_386_16", 2),
        R_386_PC16 => ("R_386_PC16", 2),
        R_386_8 => ("R_386_8", 1),
        R_386_PC8 => ("R_386_PC8", 1),
        R_386_TLS_GD_32 => ("R_386_TLS_GD_32", 4),
        R_386_TLS_GD_PUSH => ("R_386_TLS_GD_PUSH", 4),
        R_386_TLS_GD_CALL => ("R_386_TLS_GD_CALL", 4),
        R_386_TLS_GD_POP => ("R_386_TLS_GD_POP", 4),
        R_386_TLS_LDM_32 => ("R_386_TLS_LDM_32", 4),
        R_386_TLS_LDM_PUSH => ("R_386_TLS_LDM_PUSH", 4),
        R_386_TLS_LDM_CALL => ("R_386_TLS_LDM_CALL", 4),
        R_386_TLS_LDM_POP => ("R_386_TLS_LDM_POP", 4),
        R_386_TLS_LDO_32 => ("R_386_TLS_LDO_32", 4),
        R_386_TLS_IE_32 => ("R_386_TLS_IE_32", 4),
        R_386_TLS_LE_32 => ("R_386_TLS_LE_32", 4),
        R_386_TLS_DTPMOD32 => ("R_386_TLS_DTPMOD32", 4),
        R_386_TLS_DTPOFF32 => ("R_386_TLS_DTPOFF32", 4),
        R_386_TLS_TPOFF32 => ("R_386_TLS_TPOFF32", 4),
        R_386_SIZE32 => ("R_386_SIZE32", 4),
        R_386_TLS_GOTDESC => ("R_386_TLS_GOTDESC", 4),
        R_386_TLS_DESC_CALL => ("R_386_TLS_DESC_CALL", 0),
        R_386_TLS_DESC => ("R_386_TLS_DESC", 4),
        R_386_IRELATIVE => ("R_386_IRELATIVE", 4),
        R_386_GOT32X => ("R_386_GOT32X", 4),
        _ => return None,
    })
}
