//! Tools for interpreting DWARF debug info: address-to-unit and
//! address-to-function lookups, inline stacks, and a scoped line-table
//! reader. Lookups are backed by caches built lazily per compilation unit.

mod inline;
mod lines;
mod ranges;

use gimli::Reader as _;

pub use inline::InlineSite;
pub use lines::{LineEntry, LineReader};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

use crate::imap::Imap;

/// The concrete gimli reader type used throughout the debug layer.
pub type DwarfReader = gimli::EndianReader<gimli::RunTimeEndian, Arc<[u8]>>;

/// The offset of a DIE within its compilation unit.
pub type DieOffset = gimli::UnitOffset<usize>;

/// A map from PCs to the innermost [`InlineSite`] covering each PC.
pub type InlineMap = Imap<Arc<InlineSite>>;

/// An error from reading or indexing DWARF data.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The requested PC has no coverage in the reader's scope. This is an
    /// expected outcome of seeking, distinct from end-of-iteration.
    #[error("unknown PC")]
    UnknownPc,
    /// The compilation unit has no line table.
    #[error("compilation unit has no line table")]
    NoLineTable,
    #[error("reading DWARF: {0}")]
    Dwarf(#[from] gimli::Error),
}

/// A handle to a program's DWARF debug information.
///
/// Construction eagerly indexes the PC ranges of every compilation unit;
/// everything else (per-CU subprogram indexes, line tables, inline maps) is
/// built on first use and cached for the lifetime of the handle. The caches
/// tolerate concurrent readers: each fills under a once-guard, and the
/// per-subprogram inline maps use a first-writer-wins store so racing
/// builders converge on one map.
pub struct Data {
    pub(crate) dwarf: gimli::Dwarf<DwarfReader>,
    /// PC ranges of every compilation unit.
    pub(crate) cu_ranges: Imap<Cu>,
    pub(crate) cus: Vec<CuRecord>,
    pub(crate) inline_cache: Mutex<HashMap<(Cu, DieOffset), Arc<InlineMap>>>,
}

pub(crate) struct CuRecord {
    pub(crate) unit: gimli::Unit<DwarfReader>,
    pub(crate) name: Option<String>,
    /// PC ranges of the CU's immediate subprogram children.
    pub(crate) subprograms: OnceLock<Imap<DieOffset>>,
    pub(crate) lines: OnceLock<Result<lines::LineCache, Error>>,
}

/// Identifies a compilation unit within a [`Data`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cu(pub(crate) usize);

/// A subprogram entry: a top-level function within a compilation unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Subprogram {
    /// The compilation unit containing the subprogram.
    pub cu: Cu,
    /// The subprogram's DIE.
    pub entry: DieOffset,
}

impl Data {
    /// Builds a new `Data` over `dwarf`.
    ///
    /// The CU ranges are indexed eagerly: it's cheap, almost everything else
    /// depends on it, and it catches basic encoding errors right away.
    pub fn new(dwarf: gimli::Dwarf<DwarfReader>) -> Result<Data, Error> {
        let (cu_ranges, cus) = ranges::index_units(&dwarf)?;
        Ok(Data {
            dwarf,
            cu_ranges,
            cus,
            inline_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the underlying DWARF sections for direct access.
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfReader> {
        &self.dwarf
    }

    /// Returns the name of the compilation unit, if it has one.
    pub fn cu_name(&self, cu: Cu) -> Option<&str> {
        self.cus[cu.0].name.as_deref()
    }

    /// Returns the name of the subprogram, if it has one.
    pub fn subprogram_name(&self, sub: Subprogram) -> Option<String> {
        self.die_name(sub.cu, sub.entry)
    }

    /// Returns the name of the DIE at `die`, following abstract-origin and
    /// specification references when the entry itself carries no name (as is
    /// the case for concrete inlined instances).
    pub fn die_name(&self, cu: Cu, die: DieOffset) -> Option<String> {
        self.die_name_limited(cu, die, 2)
    }

    fn die_name_limited(&self, cu: Cu, die: DieOffset, depth: u8) -> Option<String> {
        let unit = &self.cus[cu.0].unit;
        let entry = unit.entry(die).ok()?;
        if let Ok(Some(v)) = entry.attr_value(gimli::DW_AT_name) {
            let s = self.dwarf.attr_string(unit, v).ok()?;
            return s.to_string_lossy().ok().map(|c| c.into_owned());
        }
        if depth == 0 {
            return None;
        }
        for at in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
            if let Ok(Some(gimli::AttributeValue::UnitRef(off))) = entry.attr_value(at) {
                if let Some(name) = self.die_name_limited(cu, off, depth - 1) {
                    return Some(name);
                }
            }
        }
        None
    }

    /// Returns the line cache for `cu`, building it on first use. Build
    /// errors are memoized and returned on every subsequent access.
    pub(crate) fn line_cache(&self, cu: Cu) -> Result<&lines::LineCache, Error> {
        let rec = &self.cus[cu.0];
        match rec
            .lines
            .get_or_init(|| lines::LineCache::build(&self.dwarf, &rec.unit))
        {
            Ok(lc) => Ok(lc),
            Err(e) => Err(e.clone()),
        }
    }
}
