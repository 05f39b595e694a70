//! Inline-site trees and the PC-to-inline-stack range maps built from them.

use std::sync::Arc;

use tracing::warn;

use crate::dbg::{Data, DieOffset, DwarfReader, Error, InlineMap, Subprogram};
use crate::imap::{Imap, Interval};

/// Describes a call site at which a function is inlined.
///
/// Inline sites form a tree within a given top-level function, shared
/// through reference counting, and are immutable once created.
#[derive(Debug)]
pub struct InlineSite {
    /// The `DW_TAG_subprogram` or `DW_TAG_inlined_subroutine` DIE of the
    /// function that was inlined at this site.
    pub entry: DieOffset,
    /// The frame this inlined function was called from, or `None` if this is
    /// the top of the inlining stack.
    pub caller: Option<Arc<InlineSite>>,
    /// The source location at which `entry` was inlined into `caller`. Zero
    /// or `None` when `caller` is `None` or the call site is unknown.
    pub call_line: u64,
    pub call_column: u64,
    pub call_file: Option<Arc<str>>,
}

/// Two sites are the same site exactly when they describe the same DIE.
impl PartialEq for InlineSite {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry
    }
}
impl Eq for InlineSite {}

impl Data {
    /// Returns a map from PCs within `sub` to the inlining hierarchy at each
    /// PC. The map's value at a PC is the innermost inline site covering it.
    ///
    /// Results are cached per subprogram; if two threads race to build the
    /// same map, the first store wins and the loser adopts it.
    pub fn inline_ranges(&self, sub: Subprogram) -> Arc<InlineMap> {
        let key = (sub.cu, sub.entry);
        if let Some(m) = self.inline_cache.lock().unwrap().get(&key) {
            return m.clone();
        }

        let m = Arc::new(self.build_inline_ranges(sub).unwrap_or_else(|e| {
            warn!(error = %e, "building inline ranges failed");
            Imap::new()
        }));
        self.inline_cache
            .lock()
            .unwrap()
            .entry(key)
            .or_insert(m)
            .clone()
    }

    fn build_inline_ranges(&self, sub: Subprogram) -> Result<InlineMap, Error> {
        // Call-site file attributes index the CU's line-table file list.
        let files: Vec<Option<Arc<str>>> = match self.line_cache(sub.cu) {
            Ok(lc) => lc.files.clone(),
            Err(_) => return Ok(Imap::new()),
        };

        let rec = &self.cus[sub.cu.0];
        let mut m = Imap::new();
        let mut tree = rec.unit.entries_tree(Some(sub.entry))?;
        let root = tree.root()?;
        self.walk_inline(&rec.unit, root, None, &files, &mut m)?;
        Ok(m)
    }

    /// Walks the subtree at `node`, creating an [`InlineSite`] for the
    /// top-level subprogram and every inlined subroutine, and recording
    /// each site's address ranges in `m`.
    ///
    /// Every other entry is entered too, because inlined subroutines can
    /// appear in surprising places; for example, nested in a
    /// `DW_TAG_lexical_block`. Nested subprogram definitions, on the other
    /// hand, are opaque functions in their own right and are not descended
    /// into.
    fn walk_inline(
        &self,
        unit: &gimli::Unit<DwarfReader>,
        node: gimli::EntriesTreeNode<'_, '_, '_, DwarfReader>,
        outer: Option<Arc<InlineSite>>,
        files: &[Option<Arc<str>>],
        m: &mut InlineMap,
    ) -> Result<(), Error> {
        let entry = node.entry();
        let tag = entry.tag();

        let site = if (outer.is_none() && tag == gimli::DW_TAG_subprogram)
            || tag == gimli::DW_TAG_inlined_subroutine
        {
            let call_file_index = match entry.attr_value(gimli::DW_AT_call_file) {
                Ok(Some(gimli::AttributeValue::FileIndex(i))) => Some(i),
                Ok(Some(v)) => v.udata_value(),
                _ => None,
            };
            let site = Arc::new(InlineSite {
                entry: entry.offset(),
                caller: outer.clone(),
                call_line: attr_udata(entry, gimli::DW_AT_call_line),
                call_column: attr_udata(entry, gimli::DW_AT_call_column),
                call_file: call_file_index
                    .and_then(|i| files.get(i as usize).cloned().flatten()),
            });
            // Record the site's ranges. Decode problems in one site's range
            // list don't invalidate the rest of the map.
            if let Ok(mut rs) = self.dwarf.die_ranges(unit, entry) {
                while let Ok(Some(r)) = rs.next() {
                    m.insert(
                        Interval {
                            low: r.begin,
                            high: r.end,
                        },
                        site.clone(),
                    );
                }
            }
            Some(site)
        } else if outer.is_some() && tag == gimli::DW_TAG_subprogram {
            return Ok(());
        } else {
            None
        };

        let next_outer = site.or(outer);
        let mut children = node.children();
        while let Some(child) = children.next()? {
            self.walk_inline(unit, child, next_outer.clone(), files, m)?;
        }
        Ok(())
    }
}

fn attr_udata(entry: &gimli::DebuggingInformationEntry<'_, '_, DwarfReader>, at: gimli::DwAt) -> u64 {
    match entry.attr_value(at) {
        Ok(Some(v)) => v.udata_value().unwrap_or(0),
        _ => 0,
    }
}
