//! A common abstraction for working with object files: sections, symbols,
//! relocations, and their raw bytes.
//!
//! [`File::open`] sniffs the format of an object file and hands back a
//! uniform [`File`] over it. All data in an object file lives in sections;
//! section and symbol contents are acquired lazily (memory-mapped when
//! possible) and borrowed out as [`Data`] windows.

mod data;
mod elf;
mod reloc;
mod size;
mod sym;

pub use data::{Data, Reader};
pub use elf::{BackingKind, ElfError, ElfFile};
pub use reloc::{Reloc, RelocType};
pub use size::synthesize_sizes;
pub use sym::{NoData, Sym, SymFlags, SymId, SymKind};

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::arch::Arch;

/// An error from opening an object file.
#[derive(Clone, Debug, Error)]
pub enum OpenError {
    /// No supported format's magic number matched. Failures after a magic
    /// has matched are attributed to that format instead.
    #[error("unrecognized object file format")]
    UnrecognizedFormat,
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("reading object file: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

/// An error from reading the data of a symbol.
#[derive(Clone, Debug, Error)]
pub enum SymDataError {
    #[error(transparent)]
    NoData(#[from] NoData),
    #[error(transparent)]
    Section(#[from] ElfError),
}

/// An object file.
///
/// Dropping a `File` releases any OS resources (file handles, memory
/// mappings) it holds; [`Data`] windows borrow from the file and cannot
/// outlive it.
pub struct File {
    backend: Backend,
}

enum Backend {
    Elf(ElfFile),
}

impl File {
    /// Opens the object file at `path`.
    ///
    /// The file handle is retained so that section contents can be
    /// memory-mapped on demand.
    pub fn open(path: impl AsRef<Path>) -> Result<File, OpenError> {
        let file = fs::File::open(path).map_err(|e| OpenError::Io(Arc::new(e)))?;
        // Map the whole file for header parsing when we can; large sections
        // get their own page-aligned windows later.
        let bytes = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(m) => WholeBytes::Mapped(m),
            Err(_) => {
                let mut buf = Vec::new();
                (&file)
                    .read_to_end(&mut buf)
                    .map_err(|e| OpenError::Io(Arc::new(e)))?;
                WholeBytes::Heap(buf)
            }
        };
        Self::from_source(Source {
            file: Some(file),
            bytes,
        })
    }

    /// Parses an object file that has already been loaded into memory.
    ///
    /// Section data acquisition always takes the heap path for files opened
    /// this way; use [`File::open`] to allow memory mapping.
    pub fn from_bytes(data: Vec<u8>) -> Result<File, OpenError> {
        Self::from_source(Source {
            file: None,
            bytes: WholeBytes::Heap(data),
        })
    }

    fn from_source(source: Source) -> Result<File, OpenError> {
        let data = source.data();
        if data.len() >= 4 && data[..4] == [0x7f, b'E', b'L', b'F'] {
            // If there are errors past this point, we know it's ELF and
            // report the error as such.
            let f = elf::open_elf(source)?;
            debug!(
                sections = f.sections().len(),
                arch = f.info().arch.map(|a| a.name),
                "opened ELF object"
            );
            return Ok(File {
                backend: Backend::Elf(f),
            });
        }
        Err(OpenError::UnrecognizedFormat)
    }

    /// Returns metadata about the whole object file.
    pub fn info(&self) -> FileInfo {
        match &self.backend {
            Backend::Elf(f) => f.info(),
        }
    }

    /// Returns the sections in this object file, indexed by [`SectionId`].
    ///
    /// All data in the object file (code, program data, etc.) is stored in
    /// sections, and often many metadata tables (e.g., symbol tables) are as
    /// well.
    pub fn sections(&self) -> &[Section] {
        match &self.backend {
            Backend::Elf(f) => f.sections(),
        }
    }

    /// Returns the `i`th section.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    pub fn section(&self, i: SectionId) -> &Section {
        &self.sections()[i.0]
    }

    /// Reads `size` bytes of data from section `i`, starting at the given
    /// address. The returned [`Data`] borrows the section's backing bytes
    /// and carries the relocations that apply to the section.
    ///
    /// # Panics
    ///
    /// Panics if the requested byte range is out of range for the section.
    pub fn section_data(&self, i: SectionId, addr: u64, size: u64) -> Result<Data<'_>, ElfError> {
        match &self.backend {
            Backend::Elf(f) => f.section_data(i, addr, size),
        }
    }

    /// Finds the section containing the given address in the "loaded"
    /// address space, or `None` if `addr` is not in the loaded address
    /// space. Not all sections are loaded, and some object files don't have
    /// a loaded address space at all (for example, ELF relocatable objects).
    pub fn resolve_addr(&self, addr: u64) -> Option<&Section> {
        match &self.backend {
            Backend::Elf(f) => f.resolve_addr(addr),
        }
    }

    /// Returns the `i`th symbol.
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    pub fn sym(&self, i: SymId) -> Sym {
        match &self.backend {
            Backend::Elf(f) => f.sym(i),
        }
    }

    /// Returns the number of symbols.
    ///
    /// If an object file has more than one symbol table, they are
    /// concatenated into one index space, so the "same" symbol may appear
    /// more than once.
    pub fn num_syms(&self) -> u32 {
        match &self.backend {
            Backend::Elf(f) => f.num_syms(),
        }
    }

    /// Reads `size` bytes of data from `sym`, starting at the given address.
    /// If `sym` is undefined or otherwise not backed by data, this returns a
    /// [`NoData`] error.
    ///
    /// # Panics
    ///
    /// Panics if the requested byte range is out of range for the symbol.
    pub fn sym_data(&self, sym: &Sym, addr: u64, size: u64) -> Result<Data<'_>, SymDataError> {
        let Some(section) = sym.section else {
            // An error rather than a panic so that this is useful as a
            // general-purpose interface.
            let detail = match sym.kind {
                SymKind::Undef => "undefined symbol",
                SymKind::Absolute => "absolute symbol",
                _ => "unknown reason",
            };
            return Err(NoData { detail }.into());
        };
        if addr < sym.value || addr + size > sym.value + sym.size {
            panic!(
                "requested data [{:#x}, {:#x}) is outside symbol [{:#x}, {:#x})",
                addr,
                addr + size,
                sym.value,
                sym.value + sym.size
            );
        }
        Ok(self.section_data(section, addr, size)?)
    }

    /// Returns the underlying ELF backend for format-specific access, such
    /// as loading DWARF debug sections, or `None` for non-ELF files.
    pub fn as_elf(&self) -> Option<&ElfFile> {
        match &self.backend {
            Backend::Elf(f) => Some(f),
        }
    }
}

/// Metadata about a whole object file.
#[derive(Clone, Copy, Debug)]
pub struct FileInfo {
    /// The machine architecture of this object file, or `None` if unknown.
    pub arch: Option<&'static Arch>,
}

/// An index for a section in an object file. These indexes are dense and
/// start at 0.
///
/// They may not correspond to the section numbering used by the object
/// format itself; see [`Section::raw_id`] for that. For example, ELF section
/// number 0 is reserved, so ELF sections start at raw index 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(pub usize);

/// A contiguous region of address space in an object file.
///
/// An object file may have multiple sections whose addresses are not
/// meaningfully related, so addresses within an object file must always be
/// specified with respect to a given section.
#[derive(Clone, Debug, PartialEq)]
pub struct Section {
    /// The name of this section. This typically follows platform
    /// conventions, such as ".text" or ".data", but isn't necessarily
    /// meaningful.
    pub name: String,
    /// The dense index of this section.
    pub id: SectionId,
    /// The index of this section in the underlying format's representation.
    pub raw_id: usize,
    /// The virtual address at which this section begins in memory, or 0 if
    /// this section should not be loaded into memory or has not yet been
    /// assigned a meaningful address.
    pub addr: u64,
    /// The size of this section in memory, in bytes.
    ///
    /// This may not be the size of the section on disk; a section that is
    /// all zeros may not be stored at all, and a compressed section is
    /// larger in memory than on disk.
    pub size: u64,
    /// Flags for this section.
    pub flags: SectionFlags,
}

impl Section {
    /// Returns the starting address and size in bytes of this section.
    pub fn bounds(&self) -> (u64, u64) {
        (self.addr, self.size)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.raw_id)
    }
}

/// A set of section flags.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionFlags(u8);

const SECTION_FLAG_READ_ONLY: u8 = 1 << 0;
const SECTION_FLAG_ZERO_INITIALIZED: u8 = 1 << 1;
const SECTION_FLAG_MAPPED: u8 = 1 << 2;

impl SectionFlags {
    /// Reports whether this section's data is read-only.
    pub fn read_only(self) -> bool {
        self.0 & SECTION_FLAG_READ_ONLY != 0
    }

    pub fn set_read_only(&mut self, v: bool) {
        if v {
            self.0 |= SECTION_FLAG_READ_ONLY;
        } else {
            self.0 &= !SECTION_FLAG_READ_ONLY;
        }
    }

    /// Reports whether this section is zero-initialized (its contents are
    /// not stored in the file).
    ///
    /// TODO: this tests the read-only bit rather than the zero-initialized
    /// bit. Whether that aliasing is intentional for the formats at hand is
    /// unresolved; decide before changing it, since downstream users may
    /// depend on the current answer.
    pub fn zero_initialized(self) -> bool {
        self.0 & SECTION_FLAG_READ_ONLY != 0
    }

    pub fn set_zero_initialized(&mut self, v: bool) {
        if v {
            self.0 |= SECTION_FLAG_ZERO_INITIALIZED;
        } else {
            self.0 &= !SECTION_FLAG_ZERO_INITIALIZED;
        }
    }

    /// Reports whether this section occupies addressable memory in a loaded
    /// image of the object.
    pub fn mapped(self) -> bool {
        self.0 & SECTION_FLAG_MAPPED != 0
    }

    pub fn set_mapped(&mut self, v: bool) {
        if v {
            self.0 |= SECTION_FLAG_MAPPED;
        } else {
            self.0 &= !SECTION_FLAG_MAPPED;
        }
    }
}

/// The bytes backing a whole object file.
enum WholeBytes {
    Mapped(memmap2::Mmap),
    Heap(Vec<u8>),
}

/// An opened object file's raw contents, plus the OS file handle when one
/// exists so backends can map sections directly.
pub(crate) struct Source {
    pub(crate) file: Option<fs::File>,
    bytes: WholeBytes,
}

impl Source {
    pub(crate) fn data(&self) -> &[u8] {
        match &self.bytes {
            WholeBytes::Mapped(m) => m,
            WholeBytes::Heap(v) => v,
        }
    }
}

/// Rounds `x` down to a multiple of `y`, which must be a power of 2.
pub(crate) fn round_down2(x: u64, y: u64) -> u64 {
    debug_assert_eq!(y & (y - 1), 0);
    x & !(y - 1)
}

/// Rounds `x` up to a multiple of `y`, which must be a power of 2.
pub(crate) fn round_up2(x: u64, y: u64) -> u64 {
    debug_assert_eq!(y & (y - 1), 0);
    (x + y - 1) & !(y - 1)
}
