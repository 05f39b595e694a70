//! The ELF object file backend.
//!
//! This decodes the ELF container with the crate's own [`Layout`]-driven
//! readers and resolves the cross-references between relocation sections,
//! symbol tables, string tables, and loadable sections. Section contents are
//! acquired on first use, memory-mapped when the file and section allow it.
//!
//! Two layouts are in play throughout: `elf_layout` describes the ELF file's
//! own metadata (its class and byte order) and is used to decode headers,
//! symbol tables, and relocation records; the architecture layout describes
//! the *target* of the file and is used for section contents. The two often
//! agree but don't have to, so they are kept in separate fields.

use std::sync::{Arc, OnceLock};

use memmap2::{Mmap, MmapMut, MmapOptions};
use object::elf::*;
use object::read::{CompressedData, CompressionFormat};
use thiserror::Error;
use tracing::{trace, warn};

use crate::arch::{self, Arch, ByteOrder, Layout};
use crate::obj::reloc::RelocClass;
use crate::obj::{
    round_down2, round_up2, Data, FileInfo, Reader, Reloc, RelocType, Section, SectionFlags,
    SectionId, Source, Sym, SymFlags, SymId, SymKind,
};

/// An ELF parsing or data-access error.
#[derive(Clone, Debug, Error)]
pub enum ElfError {
    #[error("unknown ELF class {0:#x}")]
    UnknownClass(u8),
    #[error("unknown ELF data encoding {0:#x}")]
    UnknownEncoding(u8),
    #[error("truncated ELF file: {0}")]
    Truncated(&'static str),
    #[error("section {section}: unsupported compression type {ty:#x}")]
    UnsupportedCompression { section: String, ty: u32 },
    #[error("decompressing section {section}: {detail}")]
    Decompress { section: String, detail: String },
    #[error("relocation section {section} references bad symbol section {link}")]
    BadSymtabLink { section: String, link: u32 },
    #[error("relocation section {section} references non-symbol section {target}")]
    NotASymtab { section: String, target: String },
    #[error("relocation section {section} uses section offsets, but has no target section")]
    GlobalRelocInRelocatable { section: String },
    #[error("relocation section {section} references missing target section {target}")]
    BadRelocTarget { section: String, target: u32 },
    #[error("symbol table {section} references bad string section {link}")]
    BadStrtabLink { section: String, link: u32 },
    #[error("reading symbol table {section}: {detail}")]
    SymtabData { section: String, detail: String },
    #[error("relocation {index} in section {section}: address overflow")]
    RelocAddrOverflow { index: usize, section: String },
    #[error(
        "relocation {index} in section {section}: can't read addend for unknown relocation type {ty}"
    )]
    UnknownRelocType {
        index: usize,
        section: String,
        ty: String,
    },
    #[error("relocation {index} in section {section}: address {addr:#x} is not in any section")]
    RelocNotInSection {
        index: usize,
        section: String,
        addr: u64,
    },
    #[error(
        "relocation {index} in section {section}: address {addr:#x} out of section bounds [{low:#x},{high:#x})"
    )]
    RelocOutOfBounds {
        index: usize,
        section: String,
        addr: u64,
        low: u64,
        high: u64,
    },
    #[error("relocation {index} in section {section}: bad implicit addend size {size}")]
    BadAddendSize {
        index: usize,
        section: String,
        size: u8,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Class {
    Elf32,
    Elf64,
}

/// Which symbol table a relocation section draws its symbols from.
#[derive(Copy, Clone, Debug)]
enum SymTabRef {
    /// Index into `ElfFile::sym_tabs`.
    Table(usize),
    /// The sentinel empty table, used when a relocation section has no
    /// symbol table link (legal when none of its relocations reference
    /// symbols).
    Empty,
}

/// Extra state for a relocation (REL/RELA) section.
#[derive(Debug)]
struct RelInfo {
    sym_tab: SymTabRef,
    /// The section the relocations apply to, or `None` for a global
    /// relocation section that applies to every relocatable section.
    target: Option<SectionId>,
    /// Decoded relocations, sorted by address.
    relocs: OnceLock<Result<Vec<Reloc>, ElfError>>,
}

/// How a compressed section's payload is stored.
#[derive(Clone, Debug)]
struct Compression {
    format: CompressionFormat,
    /// Offset of the compressed payload past the compression header,
    /// relative to the section's file offset.
    payload_offset: u64,
    uncompressed_size: u64,
}

/// The lazily-acquired bytes backing a section.
enum Backing {
    /// A page-aligned read-only window of the file; the section's bytes are
    /// `map[off..off + len]`.
    Mapped { map: Mmap, off: usize, len: usize },
    /// An anonymous zero-filled mapping for NOBITS sections.
    Anon { map: MmapMut, len: usize },
    Heap(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped { map, off, len } => &map[*off..*off + *len],
            Backing::Anon { map, len } => &map[..*len],
            Backing::Heap(v) => v,
        }
    }

    fn kind(&self) -> BackingKind {
        match self {
            Backing::Mapped { .. } | Backing::Anon { .. } => BackingKind::Mapped,
            Backing::Heap(_) => BackingKind::Heap,
        }
    }
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Backing::{:?}({} bytes)", self.kind(), self.bytes().len())
    }
}

/// How a section's bytes ended up being backed. Primarily interesting to
/// tests and diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackingKind {
    /// The section is backed by a memory mapping (a window of the file, or
    /// an anonymous zero mapping for NOBITS sections).
    Mapped,
    /// The section was read (and possibly decompressed) onto the heap.
    Heap,
}

#[derive(Debug)]
struct SectionExtra {
    sh_type: u32,
    sh_flags: u64,
    sh_link: u32,
    sh_info: u32,
    sh_offset: u64,
    /// On-disk size; differs from the public size for compressed sections.
    file_size: u64,
    compression: Option<Compression>,
    backing: OnceLock<Result<Backing, ElfError>>,
    /// Relocation sections that modify this section.
    reloc_secs: Vec<SectionId>,
    /// Set if this is itself a relocation section.
    rel: Option<RelInfo>,
    /// Merged relocations, used only when more than one relocation section
    /// applies to this section.
    merged: OnceLock<Result<Vec<Reloc>, ElfError>>,
}

/// One of the (up to) two ELF symbol tables: static and dynamic.
///
/// The `start..end` range is this table's slice of the combined global
/// symbol index space. It excludes ELF symbol index 0, so `start` maps to
/// ELF symbol 1.
#[derive(Clone, Copy, Debug, Default)]
struct SymTab {
    section: Option<SectionId>,
    strings: Option<SectionId>,
    start: u32,
    end: u32,
}

/// An ELF object file.
pub struct ElfFile {
    source: Source,
    class: Class,
    arch: Option<&'static Arch>,
    reloc_class: RelocClass,
    /// Layout of the ELF metadata itself, as opposed to the architecture's.
    elf_layout: Layout,
    /// True for REL-type files: no meaningful mapped address space, and
    /// relocations store section-relative offsets instead of addresses.
    relocatable: bool,
    sym_size: u64,
    rel_size: u64,
    rela_size: u64,
    page_size: u64,
    sections: Vec<Section>,
    extras: Vec<SectionExtra>,
    /// Maps ELF section numbers to dense ids, tolerating gaps.
    shn_map: Vec<Option<SectionId>>,
    /// The static (index 0) and dynamic (index 1) symbol tables.
    sym_tabs: [SymTab; 2],
}

/// A decoded ELF section header, before sections are assigned dense ids.
struct RawShdr {
    name_off: u32,
    sh_type: u32,
    flags: u64,
    addr: u64,
    size: u64,
    offset: u64,
    link: u32,
    info: u32,
}

pub(crate) fn open_elf(source: Source) -> Result<ElfFile, ElfError> {
    let data = source.data();
    if data.len() < 6 {
        return Err(ElfError::Truncated("ELF identification"));
    }
    let class = match data[4] {
        ELFCLASS32 => Class::Elf32,
        ELFCLASS64 => Class::Elf64,
        c => return Err(ElfError::UnknownClass(c)),
    };
    let order = match data[5] {
        ELFDATA2LSB => ByteOrder::Little,
        ELFDATA2MSB => ByteOrder::Big,
        d => return Err(ElfError::UnknownEncoding(d)),
    };

    // Per-class constants.
    let (elf_word_size, ehdr_size, shdr_size, sym_size) = match class {
        Class::Elf32 => (4u64, 52usize, 40u64, 16u64),
        Class::Elf64 => (8u64, 64usize, 64u64, 24u64),
    };
    let elf_layout = Layout::new(order, elf_word_size as usize);
    let rel_size = 2 * elf_word_size;
    let rela_size = 3 * elf_word_size;

    if data.len() < ehdr_size {
        return Err(ElfError::Truncated("ELF header"));
    }
    let d = Data {
        addr: 0,
        b: data,
        relocs: &[],
        layout: elf_layout,
    };
    let mut r = Reader::new(&d);
    r.set_offset(16);
    let e_type = r.uint16();
    let e_machine = r.uint16();
    let _e_version = r.uint32();
    let _e_entry = r.word();
    let _e_phoff = r.word();
    let e_shoff = r.word();
    let _e_flags = r.uint32();
    let _e_ehsize = r.uint16();
    let _e_phentsize = r.uint16();
    let _e_phnum = r.uint16();
    let e_shentsize = r.uint16() as u64;
    let mut e_shnum = r.uint16() as u64;
    let mut e_shstrndx = r.uint16() as u64;

    let (arch, reloc_class) = match e_machine {
        EM_X86_64 => (Some(&arch::AMD64), RelocClass::ElfX86_64),
        EM_386 => (Some(&arch::I386), RelocClass::Elf386),
        m => {
            warn!(machine = m, "unknown ELF machine; architecture-dependent decoding disabled");
            (None, RelocClass::Unknown)
        }
    };
    let relocatable = e_type == ET_REL;

    // Read the section header table. A header entry covers e_shentsize
    // bytes, which may exceed the fields we know about.
    let read_shdr = |i: u64| -> Result<RawShdr, ElfError> {
        let off = i
            .checked_mul(e_shentsize)
            .and_then(|o| o.checked_add(e_shoff))
            .filter(|o| e_shentsize >= shdr_size && o + shdr_size <= data.len() as u64)
            .ok_or(ElfError::Truncated("section header table"))?;
        let mut r = Reader::new(&d);
        r.set_offset(off as usize);
        Ok(RawShdr {
            name_off: r.uint32(),
            sh_type: r.uint32(),
            flags: r.word(),
            addr: r.word(),
            offset: r.word(),
            size: r.word(),
            link: r.uint32(),
            info: r.uint32(),
        })
    };

    let mut raw = Vec::new();
    if e_shoff != 0 {
        // With extended section numbering, the real section count and
        // string table index live in section header 0.
        if e_shnum == 0 || e_shstrndx == SHN_XINDEX as u64 {
            let shdr0 = read_shdr(0)?;
            if e_shnum == 0 {
                e_shnum = shdr0.size;
            }
            if e_shstrndx == SHN_XINDEX as u64 {
                e_shstrndx = shdr0.link as u64;
            }
        }
        let in_bounds = e_shnum
            .checked_mul(e_shentsize)
            .and_then(|t| e_shoff.checked_add(t))
            .map_or(false, |end| end <= data.len() as u64);
        if !in_bounds {
            return Err(ElfError::Truncated("section header table"));
        }
        for i in 0..e_shnum {
            raw.push(read_shdr(i)?);
        }
    }

    // Resolve section names from the section header string table.
    let shstrtab: &[u8] = match raw.get(e_shstrndx as usize) {
        Some(sh) if e_shstrndx != 0 => {
            let lo = sh.offset as usize;
            let hi = lo.checked_add(sh.size as usize);
            match hi {
                Some(hi) if hi <= data.len() => &data[lo..hi],
                _ => return Err(ElfError::Truncated("section name string table")),
            }
        }
        _ => &[],
    };
    let section_name = |off: u32| -> String {
        let tail = match shstrtab.get(off as usize..) {
            Some(t) => t,
            None => return String::new(),
        };
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..end]).into_owned()
    };

    // Process the section table: assign dense ids, classify flags, and track
    // the sections the rest of initialization cares about.
    let mut sections = Vec::new();
    let mut extras: Vec<SectionExtra> = Vec::new();
    let mut shn_map = vec![None; raw.len()];
    let mut sym_tabs = [SymTab::default(); 2];
    let mut rel_sections = Vec::new();
    let mut relocatable_sections = Vec::new();
    for (elf_id, sh) in raw.iter().enumerate() {
        if sh.sh_type == SHT_NULL {
            continue;
        }

        let id = SectionId(sections.len());
        let mut flags = SectionFlags::default();
        if !relocatable && sh.flags & SHF_ALLOC as u64 != 0 {
            // Allocatable sections in relocatable objects get mapped *after
            // linking* but don't have meaningful addresses right now, so
            // they are not marked.
            flags.set_mapped(true);
        }
        if sh.flags & SHF_WRITE as u64 == 0 {
            flags.set_read_only(true);
        }
        if sh.sh_type == SHT_NOBITS {
            flags.set_zero_initialized(true);
        }

        // A compressed section's header gives the uncompressed size, which
        // is the size the section model reports.
        let mut size = sh.size;
        let mut compression = None;
        if sh.flags & SHF_COMPRESSED as u64 != 0 {
            let c = parse_chdr(&d, sh, class, &section_name(sh.name_off))?;
            size = c.uncompressed_size;
            compression = Some(c);
        }

        sections.push(Section {
            name: section_name(sh.name_off),
            id,
            raw_id: elf_id,
            addr: sh.addr,
            size,
            flags,
        });
        extras.push(SectionExtra {
            sh_type: sh.sh_type,
            sh_flags: sh.flags,
            sh_link: sh.link,
            sh_info: sh.info,
            sh_offset: sh.offset,
            file_size: sh.size,
            compression,
            backing: OnceLock::new(),
            reloc_secs: Vec::new(),
            rel: None,
            merged: OnceLock::new(),
        });
        shn_map[elf_id] = Some(id);

        match sh.sh_type {
            SHT_SYMTAB => sym_tabs[0].section = Some(id),
            SHT_DYNSYM => sym_tabs[1].section = Some(id),
            SHT_REL | SHT_RELA => rel_sections.push(id),
            _ => {}
        }
        if sh.flags & SHF_ALLOC as u64 != 0 && can_have_relocs(sh.sh_type) {
            // Track the sections to which section-less relocations apply.
            // Section-less relocations only get applied to sections that are
            // actually loaded ("allocatable"). This matters because
            // non-allocatable sections may overlap the loadable address
            // space but have relocations of their own (e.g., DWARF
            // sections).
            relocatable_sections.push(id);
        }
    }

    let mut f = ElfFile {
        source,
        class,
        arch,
        reloc_class,
        elf_layout,
        relocatable,
        sym_size,
        rel_size,
        rela_size,
        page_size: page_size(),
        sections,
        extras,
        shn_map,
        sym_tabs,
    };
    f.wire_relocations(&rel_sections, &relocatable_sections)?;
    f.init_symtabs()?;
    Ok(f)
}

/// Parses the compression header at the front of a compressed section.
fn parse_chdr(
    d: &Data<'_>,
    sh: &RawShdr,
    class: Class,
    name: &str,
) -> Result<Compression, ElfError> {
    let chdr_size = match class {
        Class::Elf32 => 12u64,
        Class::Elf64 => 24u64,
    };
    let past_header = sh.offset.checked_add(chdr_size);
    if sh.size < chdr_size || past_header.map_or(true, |p| p > d.b.len() as u64) {
        return Err(ElfError::Truncated("compression header"));
    }
    let mut r = Reader::new(d);
    r.set_offset(sh.offset as usize);
    let ch_type = r.uint32();
    let uncompressed_size = match class {
        Class::Elf32 => r.uint32() as u64,
        Class::Elf64 => {
            let _reserved = r.uint32();
            r.uint64()
        }
    };
    let format = match ch_type {
        ELFCOMPRESS_ZLIB => CompressionFormat::Zlib,
        ELFCOMPRESS_ZSTD => CompressionFormat::Zstandard,
        ty => {
            return Err(ElfError::UnsupportedCompression {
                section: name.to_string(),
                ty,
            })
        }
    };
    Ok(Compression {
        format,
        payload_offset: chdr_size,
        uncompressed_size,
    })
}

/// Returns whether a section of this type can have relocations applied.
///
/// We narrow this down because otherwise it's common to see, e.g., a
/// relocation section that applies to itself (because it applies to all
/// loadable sections), which tends to lead to infinite loops. ELF metadata
/// sections are kept out of relocation propagation entirely.
fn can_have_relocs(sh_type: u32) -> bool {
    sh_type == SHT_PROGBITS || sh_type == SHT_NOBITS || sh_type >= SHT_LOPROC
}

/// Returns the system page size. Map offsets must be page-aligned, so the
/// real value is needed rather than an assumed one.
fn page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as u64
    } else {
        4096
    }
}

impl ElfFile {
    /// Resolves each relocation section's symbol table and attaches it to
    /// its target section (or to every relocatable section, for global
    /// relocation sections).
    fn wire_relocations(
        &mut self,
        rel_sections: &[SectionId],
        relocatable_sections: &[SectionId],
    ) -> Result<(), ElfError> {
        for &rs in rel_sections {
            // Find this section's symbol table. The link may be zero if none
            // of the relocations reference symbols, as seen in some .rel.plt
            // sections.
            let link = self.extras[rs.0].sh_link;
            let sym_tab = if link == 0 {
                SymTabRef::Empty
            } else {
                let sym_section = self.lookup_shn(link).ok_or_else(|| ElfError::BadSymtabLink {
                    section: self.sections[rs.0].to_string(),
                    link,
                })?;
                let idx = self
                    .sym_tabs
                    .iter()
                    .position(|t| t.section == Some(sym_section))
                    .ok_or_else(|| ElfError::NotASymtab {
                        section: self.sections[rs.0].to_string(),
                        target: self.sections[sym_section.0].to_string(),
                    })?;
                SymTabRef::Table(idx)
            };
            let mut rel = RelInfo {
                sym_tab,
                target: None,
                relocs: OnceLock::new(),
            };

            // Relocation sections indicate which section they apply to.
            // Reverse this mapping so we can quickly find the relocations
            // that apply to a given section.
            let info = self.extras[rs.0].sh_info;
            if info == 0 {
                // This relocation section applies to all loadable sections.
                // This is common in non-relocatable objects, and only makes
                // sense there, because the relocations must be virtually
                // indexed (in relocatable objects they are
                // section-relative).
                if self.relocatable {
                    return Err(ElfError::GlobalRelocInRelocatable {
                        section: self.sections[rs.0].to_string(),
                    });
                }
                for &ls in relocatable_sections {
                    self.extras[ls.0].reloc_secs.push(rs);
                }
            } else {
                let target = self.lookup_shn(info).ok_or_else(|| ElfError::BadRelocTarget {
                    section: self.sections[rs.0].to_string(),
                    target: info,
                })?;
                if can_have_relocs(self.extras[target.0].sh_type) {
                    self.extras[target.0].reloc_secs.push(rs);
                    rel.target = Some(target);
                }
            }
            self.extras[rs.0].rel = Some(rel);
        }
        Ok(())
    }

    /// Computes each symbol table's slice of the global index space and
    /// validates and loads its string table.
    fn init_symtabs(&mut self) -> Result<(), ElfError> {
        let mut n_syms = 0u32;
        for i in 0..self.sym_tabs.len() {
            let Some(sec) = self.sym_tabs[i].section else {
                // This file doesn't have this type of symbol table.
                self.sym_tabs[i].start = n_syms;
                self.sym_tabs[i].end = n_syms;
                continue;
            };

            // The global index space excludes each table's NULL symbol.
            let count = (self.sections[sec.0].size / self.sym_size).saturating_sub(1) as u32;
            self.sym_tabs[i].start = n_syms;
            self.sym_tabs[i].end = n_syms + count;
            n_syms += count;

            let link = self.extras[sec.0].sh_link;
            let strings = self.lookup_shn(link).filter(|s| self.extras[s.0].sh_type == SHT_STRTAB);
            let strings = strings.ok_or_else(|| ElfError::BadStrtabLink {
                section: self.sections[sec.0].to_string(),
                link,
            })?;
            self.sym_tabs[i].strings = Some(strings);

            // Load both sections now so later symbol reads can't fail.
            for s in [sec, strings] {
                self.section_bytes(s).map_err(|e| ElfError::SymtabData {
                    section: self.sections[s.0].to_string(),
                    detail: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Returns the dense section id for a raw ELF section number, if the
    /// section exists.
    fn lookup_shn(&self, shn: u32) -> Option<SectionId> {
        self.shn_map.get(shn as usize).copied().flatten()
    }

    pub(crate) fn info(&self) -> FileInfo {
        FileInfo { arch: self.arch }
    }

    pub(crate) fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub(crate) fn resolve_addr(&self, addr: u64) -> Option<&Section> {
        if self.relocatable {
            // Relocatable object files don't have meaningful load addresses,
            // even though sections can be marked allocatable.
            return None;
        }
        self.sections
            .iter()
            .find(|s| s.flags.mapped() && s.addr <= addr && addr - s.addr < s.size)
    }

    pub(crate) fn num_syms(&self) -> u32 {
        self.sym_tabs[self.sym_tabs.len() - 1].end
    }

    /// The layout used for section and symbol contents. Falls back to the
    /// ELF file's own layout when the machine is unrecognized.
    fn data_layout(&self) -> Layout {
        match self.arch {
            Some(a) => a.layout,
            None => self.elf_layout,
        }
    }

    pub(crate) fn section_data(
        &self,
        id: SectionId,
        addr: u64,
        size: u64,
    ) -> Result<Data<'_>, ElfError> {
        let s = &self.sections[id.0];
        let end = addr.checked_add(size).unwrap_or_else(|| {
            panic!("address overflow in requested range [{addr:#x}, {addr:#x}+{size:#x})")
        });
        if addr < s.addr || end > s.addr + s.size {
            panic!(
                "requested data [{:#x}, {:#x}) is outside section [{:#x}, {:#x})",
                addr,
                end,
                s.addr,
                s.addr + s.size
            );
        }
        let bytes = self.section_bytes(id)?;
        let relocs = self.section_relocs(id)?;
        Ok(Data {
            addr,
            b: &bytes[(addr - s.addr) as usize..][..size as usize],
            relocs,
            layout: self.data_layout(),
        })
    }

    /// Returns the bytes backing section `id`, acquiring them on first use.
    fn section_bytes(&self, id: SectionId) -> Result<&[u8], ElfError> {
        let r = self.extras[id.0]
            .backing
            .get_or_init(|| self.section_backing_uncached(id));
        match r {
            Ok(b) => Ok(b.bytes()),
            Err(e) => Err(e.clone()),
        }
    }

    /// Reports how section `id`'s bytes are backed, or `None` if the section
    /// has not been read yet (or failed to read). Primarily for tests and
    /// diagnostics.
    pub fn section_backing(&self, id: SectionId) -> Option<BackingKind> {
        match self.extras[id.0].backing.get() {
            Some(Ok(b)) => Some(b.kind()),
            _ => None,
        }
    }

    fn section_backing_uncached(&self, id: SectionId) -> Result<Backing, ElfError> {
        let s = &self.sections[id.0];
        let x = &self.extras[id.0];

        if x.sh_type == SHT_NOBITS {
            // There's no data to map from the file. Use an anonymous zeroed
            // mapping to keep large BSS sections off the heap.
            let map_size = round_up2(s.size, self.page_size);
            if map_size > 0 {
                if let Ok(map) = MmapOptions::new().len(map_size as usize).map_anon() {
                    trace!(section = %s, "backed NOBITS section with anonymous mapping");
                    return Ok(Backing::Anon {
                        map,
                        len: s.size as usize,
                    });
                }
            }
            trace!(section = %s, "backed NOBITS section on the heap");
            return Ok(Backing::Heap(vec![0u8; s.size as usize]));
        }

        // Memory-map the section when possible.
        if let Some(file) = &self.source.file {
            if x.compression.is_none() && s.size > 0 {
                let start = round_down2(x.sh_offset, self.page_size);
                let end = round_up2(x.sh_offset + s.size, self.page_size);
                let mapped = unsafe {
                    MmapOptions::new()
                        .offset(start)
                        .len((end - start) as usize)
                        .map(file)
                };
                if let Ok(map) = mapped {
                    trace!(section = %s, "mapped section from file");
                    return Ok(Backing::Mapped {
                        map,
                        off: (x.sh_offset - start) as usize,
                        len: s.size as usize,
                    });
                }
            }
        }

        // Mapping failed or wasn't possible. Read onto the heap,
        // decompressing if necessary.
        let data = self.source.data();
        let lo = x.sh_offset as usize;
        let hi = lo
            .checked_add(x.file_size as usize)
            .filter(|&hi| hi <= data.len())
            .ok_or(ElfError::Truncated("section contents"))?;
        let raw = &data[lo..hi];
        trace!(section = %s, "read section onto the heap");
        match &x.compression {
            None => Ok(Backing::Heap(raw.to_vec())),
            Some(c) => {
                let compressed = CompressedData {
                    format: c.format,
                    data: &raw[c.payload_offset as usize..],
                    uncompressed_size: c.uncompressed_size,
                };
                let out = compressed.decompress().map_err(|e| ElfError::Decompress {
                    section: s.to_string(),
                    detail: e.to_string(),
                })?;
                Ok(Backing::Heap(out.into_owned()))
            }
        }
    }

    /// Returns the relocations that apply to section `id`, in address order.
    fn section_relocs(&self, id: SectionId) -> Result<&[Reloc], ElfError> {
        let x = &self.extras[id.0];
        match x.reloc_secs.len() {
            0 => Ok(&[]),
            // Most of the time a single relocation section applies, and its
            // own cache is enough.
            1 => self.read_section_rel(x.reloc_secs[0]),
            _ => {
                // Multiple relocation sections apply. This isn't common, but
                // happens in practice when a global relocation section and a
                // targeted one both cover a section (e.g., .got.plt with
                // some linkers). Merge the subsets whose address ranges
                // intersect this section and cache the union.
                let s = &self.sections[id.0];
                let r = x.merged.get_or_init(|| {
                    let mut todo = Vec::with_capacity(1);
                    for &rs in &x.reloc_secs {
                        let r = self.read_section_rel(rs)?;
                        if r.is_empty() {
                            continue;
                        }
                        if r[0].addr <= s.addr + s.size && r[r.len() - 1].addr > s.addr {
                            todo.push(r);
                        }
                    }
                    let mut relocs: Vec<Reloc> = Vec::new();
                    if todo.len() == 1 {
                        relocs = todo[0].to_vec();
                    } else {
                        for t in todo {
                            relocs.extend_from_slice(t);
                        }
                        relocs.sort_by_key(|r| r.addr);
                    }
                    Ok(relocs)
                });
                match r {
                    Ok(v) => Ok(v),
                    Err(e) => Err(e.clone()),
                }
            }
        }
    }

    /// Parses a relocation (REL or RELA) section and caches the result.
    fn read_section_rel(&self, rs: SectionId) -> Result<&[Reloc], ElfError> {
        let rel = self.extras[rs.0]
            .rel
            .as_ref()
            .expect("section was not wired as a relocation section");
        let r = rel
            .relocs
            .get_or_init(|| self.read_section_rel_uncached(rs));
        match r {
            Ok(v) => Ok(v),
            Err(e) => Err(e.clone()),
        }
    }

    fn read_section_rel_uncached(&self, rs: SectionId) -> Result<Vec<Reloc>, ElfError> {
        let s = &self.sections[rs.0];
        let x = &self.extras[rs.0];
        let rel = x.rel.as_ref().expect("not a relocation section");
        let is_rela = x.sh_type == SHT_RELA;
        let entry_size = if is_rela { self.rela_size } else { self.rel_size };

        let bytes = self.section_bytes(rs)?;
        let d = Data {
            addr: s.addr,
            b: bytes,
            relocs: &[],
            layout: self.elf_layout,
        };
        let mut r = Reader::new(&d);
        let mut relocs = Vec::with_capacity((s.size / entry_size) as usize);

        match (is_rela, self.class) {
            (false, Class::Elf32) => {
                while r.avail() >= 8 {
                    let off = r.uint32() as u64;
                    let info = r.uint32();
                    relocs.push(Reloc {
                        addr: off,
                        ty: RelocType::new(self.reloc_class, info & 0xff),
                        symbol: self.lookup_rel_sym(rel.sym_tab, info >> 8),
                        addend: 0,
                    });
                }
            }
            (false, Class::Elf64) => {
                while r.avail() >= 16 {
                    let off = r.uint64();
                    let info = r.uint64();
                    relocs.push(Reloc {
                        addr: off,
                        ty: RelocType::new(self.reloc_class, info as u32),
                        symbol: self.lookup_rel_sym(rel.sym_tab, (info >> 32) as u32),
                        addend: 0,
                    });
                }
            }
            (true, Class::Elf32) => {
                while r.avail() >= 12 {
                    let off = r.uint32() as u64;
                    let info = r.uint32();
                    let addend = r.int32() as i64;
                    relocs.push(Reloc {
                        addr: off,
                        ty: RelocType::new(self.reloc_class, info & 0xff),
                        symbol: self.lookup_rel_sym(rel.sym_tab, info >> 8),
                        addend,
                    });
                }
            }
            (true, Class::Elf64) => {
                while r.avail() >= 24 {
                    let off = r.uint64();
                    let info = r.uint64();
                    let addend = r.int64();
                    relocs.push(Reloc {
                        addr: off,
                        ty: RelocType::new(self.reloc_class, info as u32),
                        symbol: self.lookup_rel_sym(rel.sym_tab, (info >> 32) as u32),
                        addend,
                    });
                }
            }
        }

        relocs.sort_by_key(|r| r.addr);

        if self.relocatable && s.addr != 0 {
            // In relocatable files, relocations store section offsets, but
            // we always want absolute addresses. Often such sections have an
            // address of 0 anyway, in which case this is a no-op.
            for (i, rl) in relocs.iter_mut().enumerate() {
                rl.addr = rl.addr.checked_add(s.addr).ok_or_else(|| {
                    ElfError::RelocAddrOverflow {
                        index: i,
                        section: s.to_string(),
                    }
                })?;
            }
        }

        if !is_rela {
            self.populate_addends(rs, &mut relocs)?;
        }
        Ok(relocs)
    }

    /// Populates the addend fields for a REL section, whose addends are
    /// stored implicitly in the target section's data.
    fn populate_addends(&self, rs: SectionId, relocs: &mut [Reloc]) -> Result<(), ElfError> {
        let s = &self.sections[rs.0];
        let layout = self.data_layout();
        let rel = self.extras[rs.0].rel.as_ref().expect("not a relocation section");
        let global = rel.target.is_none();
        // For a global relocation section, start from an empty pseudo-target
        // so the bounds check below fails immediately and we look up the
        // real target for the first relocation.
        let mut target = rel.target;
        let (mut t_addr, mut t_size) = match target {
            Some(t) => self.sections[t.0].bounds(),
            None => (0, 0),
        };
        let mut bytes: Option<&[u8]> = None;

        for i in 0..relocs.len() {
            let size = relocs[i].ty.size().ok_or_else(|| ElfError::UnknownRelocType {
                index: i,
                section: s.to_string(),
                ty: relocs[i].ty.to_string(),
            })?;
            let mut off = relocs[i].addr.wrapping_sub(t_addr);
            if (size != 0 && off >= t_size) || off + size as u64 > t_size {
                if !global {
                    return Err(ElfError::RelocOutOfBounds {
                        index: i,
                        section: s.to_string(),
                        addr: relocs[i].addr,
                        low: t_addr,
                        high: t_addr + t_size,
                    });
                }
                // A global relocation section; we've moved on to a different
                // target section.
                let t = self
                    .resolve_addr(relocs[i].addr)
                    .ok_or_else(|| ElfError::RelocNotInSection {
                        index: i,
                        section: s.to_string(),
                        addr: relocs[i].addr,
                    })?;
                (t_addr, t_size) = t.bounds();
                target = Some(t.id);
                bytes = None;
                off = relocs[i].addr - t_addr;
                if (size != 0 && off >= t_size) || off + size as u64 > t_size {
                    return Err(ElfError::RelocOutOfBounds {
                        index: i,
                        section: s.to_string(),
                        addr: relocs[i].addr,
                        low: t_addr,
                        high: t_addr + t_size,
                    });
                }
            }

            // Load the target's data once we've established the target.
            let b = match bytes {
                Some(b) => b,
                None => {
                    let b = self.section_bytes(target.expect("target resolved above"))?;
                    bytes = Some(b);
                    b
                }
            };

            let off = off as usize;
            relocs[i].addend = match size {
                0 => 0,
                1 => b[off] as i8 as i64,
                2 => layout.int16(&b[off..]) as i64,
                4 => layout.int32(&b[off..]) as i64,
                8 => layout.int64(&b[off..]),
                _ => {
                    return Err(ElfError::BadAddendSize {
                        index: i,
                        section: s.to_string(),
                        size,
                    })
                }
            };
        }
        Ok(())
    }

    /// Maps an ELF symbol index from a relocation to the combined global
    /// index space. ELF index 0 is the null symbol and maps to
    /// [`SymId::NONE`], as does any out-of-range index.
    fn lookup_rel_sym(&self, tab: SymTabRef, elf_sym: u32) -> SymId {
        let SymTabRef::Table(t) = tab else {
            return SymId::NONE;
        };
        let tab = &self.sym_tabs[t];
        if elf_sym == 0 {
            return SymId::NONE;
        }
        let id = elf_sym - 1 + tab.start;
        if tab.start <= id && id < tab.end {
            SymId(id)
        } else {
            SymId::NONE
        }
    }

    pub(crate) fn sym(&self, i: SymId) -> Sym {
        let mut tab = &self.sym_tabs[0];
        if i.0 >= tab.end {
            tab = &self.sym_tabs[1];
            if i.0 >= tab.end {
                panic!("symbol index {} out of range [0,{})", i, self.num_syms());
            }
        }
        let sec = tab.section.expect("non-empty symbol table has a section");
        let strings = tab.strings.expect("symbol table strings were loaded at open");
        let bytes = self
            .section_bytes(sec)
            .expect("symbol table data was loaded at open");
        let str_bytes = self
            .section_bytes(strings)
            .expect("string table data was loaded at open");

        let d = Data {
            addr: self.sections[sec.0].addr,
            b: bytes,
            relocs: &[],
            layout: self.elf_layout,
        };
        let mut r = Reader::new(&d);
        r.set_offset((self.sym_size * (i.0 - tab.start + 1) as u64) as usize);

        let name_off;
        let info;
        let shn;
        let mut sym = Sym {
            name: String::new(),
            section: None,
            value: 0,
            size: 0,
            kind: SymKind::Unknown,
            flags: SymFlags::default(),
        };
        match self.class {
            Class::Elf32 => {
                name_off = r.uint32();
                sym.value = r.uint32() as u64;
                sym.size = r.uint32() as u64;
                info = r.uint8();
                let _st_other = r.uint8();
                shn = r.uint16() as u32;
            }
            Class::Elf64 => {
                name_off = r.uint32();
                info = r.uint8();
                let _st_other = r.uint8();
                shn = r.uint16() as u32;
                sym.value = r.uint64();
                sym.size = r.uint64();
            }
        }

        let es = self.lookup_shn(shn);
        sym.section = es;

        let st_type = info & 0xf;
        if st_type == STT_SECTION && es.is_some() {
            // Section symbols don't have their own name, but tools
            // conventionally show the name of the section.
            sym.name = self.sections[es.unwrap().0].name.clone();
        } else {
            let sd = Data {
                addr: 0,
                b: str_bytes,
                relocs: &[],
                layout: self.elf_layout,
            };
            let mut sr = Reader::new(&sd);
            sr.set_offset(name_off as usize);
            sym.name = String::from_utf8_lossy(sr.cstring()).into_owned();
        }

        sym.kind = if st_type == STT_SECTION {
            SymKind::Section
        } else {
            match shn as u16 {
                SHN_UNDEF => SymKind::Undef,
                SHN_COMMON => SymKind::Bss,
                SHN_ABS => SymKind::Absolute,
                _ => match es {
                    // Leave unknown.
                    None => SymKind::Unknown,
                    Some(sid) => {
                        // Determine the kind from the section's flags.
                        let x = &self.extras[sid.0];
                        let mask = (SHF_WRITE | SHF_ALLOC | SHF_EXECINSTR) as u64;
                        match (x.sh_flags & mask) as u32 {
                            f if f == SHF_ALLOC | SHF_EXECINSTR => SymKind::Text,
                            SHF_ALLOC => SymKind::ROData,
                            f if f == SHF_ALLOC | SHF_WRITE => {
                                if x.sh_type == SHT_NOBITS {
                                    SymKind::Bss
                                } else {
                                    SymKind::Data
                                }
                            }
                            _ => SymKind::Unknown,
                        }
                    }
                },
            }
        };

        sym.flags.set_local(info >> 4 == STB_LOCAL);
        sym
    }

    /// Finds a section by name. Linear, but section tables are short.
    pub fn section_by_name(&self, name: &str) -> Option<SectionId> {
        self.sections.iter().find(|s| s.name == name).map(|s| s.id)
    }

    /// Loads the DWARF debug sections of this file into a
    /// [`gimli::Dwarf`]. This is the escape hatch the [`crate::dbg`] module
    /// uses; sections that are absent read as empty.
    pub fn dwarf(&self) -> Result<gimli::Dwarf<crate::dbg::DwarfReader>, ElfError> {
        let endian = match self.elf_layout.order() {
            ByteOrder::Little => gimli::RunTimeEndian::Little,
            ByteOrder::Big => gimli::RunTimeEndian::Big,
        };
        gimli::Dwarf::load(|id| -> Result<crate::dbg::DwarfReader, ElfError> {
            let bytes: Arc<[u8]> = match self.section_by_name(id.name()) {
                Some(sid) => Arc::from(self.section_bytes(sid)?),
                None => Arc::from(&[][..]),
            };
            Ok(gimli::EndianReader::new(bytes, endian))
        })
    }
}

