//! PC-range indexes for compilation units and subprograms.

use gimli::Reader;
use tracing::warn;

use crate::dbg::{Cu, CuRecord, Data, DieOffset, DwarfReader, Error, Subprogram};
use crate::imap::{Imap, Interval};

/// Walks the top level of every unit, collecting each compilation unit's PC
/// ranges and a record for its lazily-built caches.
pub(crate) fn index_units(
    dwarf: &gimli::Dwarf<DwarfReader>,
) -> Result<(Imap<Cu>, Vec<CuRecord>), Error> {
    let mut cu_ranges = Imap::new();
    let mut cus = Vec::new();
    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        let unit = dwarf.unit(header)?;
        {
            let mut cursor = unit.entries();
            let Some((_, root)) = cursor.next_dfs()? else {
                continue;
            };
            if root.tag() != gimli::DW_TAG_compile_unit {
                continue;
            }
        }
        let id = Cu(cus.len());
        let mut ranges = dwarf.unit_ranges(&unit)?;
        while let Some(r) = ranges.next()? {
            cu_ranges.insert(
                Interval {
                    low: r.begin,
                    high: r.end,
                },
                id,
            );
        }
        let name = unit
            .name
            .as_ref()
            .and_then(|r| r.to_string_lossy().ok().map(|c| c.into_owned()));
        cus.push(CuRecord {
            unit,
            name,
            subprograms: Default::default(),
            lines: Default::default(),
        });
    }
    Ok((cu_ranges, cus))
}

impl Data {
    /// Returns the compilation unit containing address `addr`, or `None` if
    /// no CU covers it.
    pub fn addr_to_cu(&self, addr: u64) -> Option<Cu> {
        self.cu_ranges.find(addr).map(|(_, &cu)| cu)
    }

    /// Returns the subprogram entry containing address `addr`. `cu` may be
    /// `None` or the CU containing `addr`.
    pub fn addr_to_subprogram(&self, addr: u64, cu: Option<Cu>) -> Option<Subprogram> {
        let cu = match cu {
            Some(cu) => cu,
            None => self.addr_to_cu(addr)?,
        };
        let rec = &self.cus[cu.0];
        let map = rec.subprograms.get_or_init(|| {
            let mut m = Imap::new();
            if let Err(e) = index_subprograms(&self.dwarf, &rec.unit, &mut m) {
                warn!(cu = cu.0, error = %e, "indexing subprogram ranges failed");
            }
            m
        });
        let (_, &entry) = map.find(addr)?;
        Some(Subprogram { cu, entry })
    }
}

/// Indexes the PC ranges of the CU's immediate `DW_TAG_subprogram` children.
fn index_subprograms(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    m: &mut Imap<DieOffset>,
) -> Result<(), Error> {
    let mut tree = unit.entries_tree(None)?;
    let root = tree.root()?;
    let mut children = root.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        if entry.tag() != gimli::DW_TAG_subprogram {
            continue;
        }
        let offset = entry.offset();
        let mut rs = dwarf.die_ranges(unit, entry)?;
        while let Some(r) = rs.next()? {
            m.insert(
                Interval {
                    low: r.begin,
                    high: r.end,
                },
                offset,
            );
        }
    }
    Ok(())
}
