//! Symbol table lookup by name and address.

use std::collections::HashMap;

use crate::obj::{Section, SectionId, Sym, SymId};

/// `Table` facilitates fast symbol lookup by name and address.
pub struct Table {
    /// The original symbol slice, indexed by [`SymId`].
    syms: Vec<Sym>,
    /// The address-to-symbol index for each section. Mapped sections are all
    /// indexed under the `None` key, since they share one address space.
    sections: HashMap<Option<SectionId>, SectionTable>,
    /// Non-local symbols by name.
    names: HashMap<String, SymId>,
    /// Whether each section is mapped, indexed by section id.
    mapped: Vec<bool>,
}

struct SectionTable {
    /// Boundaries of symbols in `Table::syms`, ordered by address. The
    /// boundary from a symbol to no-symbol is not explicitly represented,
    /// since lookup can check the size of the symbol.
    ///
    /// If symbols overlap, the same symbol may appear multiple times; given
    /// one symbol strictly nested in another, the outer symbol appears both
    /// at its own beginning and at the end address of the inner symbol.
    addr: Vec<SymAddr>,
}

#[derive(Copy, Clone)]
struct SymAddr {
    /// The address of this symbol boundary. Usually the beginning of the
    /// symbol, except in the case of overlapping symbols.
    addr: u64,
    id: SymId,
}

impl Table {
    /// Creates a new table for `syms`, which must be indexable by [`SymId`].
    /// `sections` must be indexable by the symbols' section ids.
    ///
    /// The table uses sizes as they appear in `syms`, so the caller may wish
    /// to first apply [`synthesize_sizes`](crate::obj::synthesize_sizes).
    pub fn new(syms: Vec<Sym>, sections: &[Section]) -> Table {
        let mapped: Vec<bool> = sections.iter().map(|s| s.flags.mapped()).collect();

        // Index symbols by name and break them up by section for address
        // indexing.
        let mut names = HashMap::new();
        let mut section_syms: HashMap<Option<SectionId>, Vec<SymId>> = HashMap::new();
        section_syms.insert(None, Vec::new());
        for (i, s) in syms.iter().enumerate() {
            let i = SymId(i as u32);
            if !s.flags.local() {
                names.insert(s.name.clone(), i);
            }
            // Add symbols that have data to the address index. Symbols of
            // size 0 are omitted because they can't be the result of a
            // lookup and mess up the boundary computation.
            if let Some(section) = s.section {
                if s.size != 0 {
                    let key = if mapped.get(section.0).copied().unwrap_or(false) {
                        // All mapped sections are indexed together.
                        None
                    } else {
                        Some(section)
                    };
                    section_syms.entry(key).or_default().push(i);
                }
            }
        }

        let sections = section_syms
            .into_iter()
            .map(|(key, ids)| {
                (
                    key,
                    SectionTable {
                        addr: make_addr_index(&syms, ids),
                    },
                )
            })
            .collect();

        Table {
            syms,
            sections,
            names,
            mapped,
        }
    }

    /// Returns all symbols in the table, indexable by [`SymId`].
    pub fn syms(&self) -> &[Sym] {
        &self.syms
    }

    /// Returns the (global) symbol with the given name, or [`SymId::NONE`].
    /// The name may not be unique, in which case one of its symbols is
    /// returned.
    pub fn name(&self, name: &str) -> SymId {
        self.names.get(name).copied().unwrap_or(SymId::NONE)
    }

    /// Returns the symbol containing `addr` in `section`, or
    /// [`SymId::NONE`].
    ///
    /// If `section` is `None` or a mapped section, this considers symbols in
    /// all mapped sections.
    ///
    /// The symbol may not be unique, in which case `addr` prioritizes the
    /// symbol with the latest starting address, followed by the symbol with
    /// the smallest size.
    pub fn addr(&self, section: Option<SectionId>, addr: u64) -> SymId {
        let key = match section {
            Some(s) if self.mapped.get(s.0).copied().unwrap_or(false) => None,
            key => key,
        };
        let Some(tab) = self.sections.get(&key) else {
            return SymId::NONE;
        };
        let Some(i) = tab.addr.partition_point(|sa| sa.addr <= addr).checked_sub(1) else {
            return SymId::NONE;
        };
        let id = tab.addr[i].id;
        let sym = &self.syms[id.0 as usize];
        if sym.value + sym.size <= addr {
            // The symbol ends before addr.
            return SymId::NONE;
        }
        id
    }
}

fn make_addr_index(syms: &[Sym], mut ids: Vec<SymId>) -> Vec<SymAddr> {
    // Sort by starting address then priority, with low-priority symbols
    // before higher priority ones, so the higher priority symbols override
    // the lower as the loop below sweeps the slice.
    ids.sort_by(|&a, &b| {
        let (sa, sb) = (&syms[a.0 as usize], &syms[b.0 as usize]);
        // By address; then by size, preferring smaller symbols; then by
        // index, which is unique. Index order matters when there are
        // multiple symbol tables, such as ELF files with both static and
        // dynamic tables: it prefers the static symbols.
        sa.value
            .cmp(&sb.value)
            .then(sb.size.cmp(&sa.size))
            .then(b.cmp(&a))
    });

    // Create the address index. This would be trivial except that symbols
    // can and do overlap. We iterate through each symbol *boundary*
    // (beginning and end) and keep a stack of the symbols live at the
    // current address, lowest end address on top. The stack is typically
    // very shallow, so nothing more sophisticated is warranted.
    let mut out: Vec<SymAddr> = Vec::new();
    // The addr of a stack entry is the symbol's *end* address.
    let mut stack: Vec<SymAddr> = Vec::with_capacity(8);

    fn drain_stack(stack: &mut Vec<SymAddr>, out: &mut Vec<SymAddr>, addr: u64) {
        while let Some(&top) = stack.last() {
            // Do any symbols end before addr?
            let end_addr = top.addr;
            if end_addr > addr {
                // No, nothing to do.
                return;
            }
            // Pop all of the symbols that end at the next boundary. There
            // may be more than one.
            while stack.last().map_or(false, |sa| sa.addr == end_addr) {
                stack.pop();
            }
            // At end_addr, we drop to the symbol at the top of the stack. If
            // the stack is now empty, we drop to no-symbol, which has no
            // explicit marker.
            if let Some(&next) = stack.last() {
                out.push(SymAddr {
                    addr: end_addr,
                    id: next.id,
                });
            }
        }
    }

    for &id in &ids {
        // Drain symbols that end before this symbol starts. Usually there's
        // just one symbol in the stack and it ends before this symbol, so
        // that case is fast-pathed.
        let sym = &syms[id.0 as usize];
        if stack.len() == 1 {
            if stack[0].addr <= sym.value {
                // Pop the symbol. No boundary, because we're returning to
                // no-symbol.
                stack.clear();
            }
        } else if !stack.is_empty() {
            drain_stack(&mut stack, &mut out, sym.value);
        }
        // Transition to this symbol at its value.
        let start = SymAddr {
            addr: sym.value,
            id,
        };
        match out.last_mut() {
            Some(last) if last.addr == sym.value => *last = start,
            _ => out.push(start),
        }
        // Add the symbol to the stack, keeping it ordered by end address.
        stack.push(SymAddr {
            addr: sym.value + sym.size,
            id,
        });
        // Insertion sort from the back; usually this takes no steps.
        let mut i = stack.len() - 1;
        while i >= 1 && stack[i].addr > stack[i - 1].addr {
            stack.swap(i, i - 1);
            i -= 1;
        }
    }
    // Drain anything left in the stack.
    drain_stack(&mut stack, &mut out, u64::MAX);

    out
}
