//! Heuristic size synthesis for symbols without explicit sizes.

use crate::obj::{Section, Sym, SymKind};

/// Assigns sizes to symbols that don't have sizes, using heuristics.
///
/// `sections` must be indexable by the symbols' section ids (as returned by
/// [`File::sections`](crate::obj::File::sections)). Symbols that receive a
/// size are flagged [`size_synthesized`](crate::obj::SymFlags::size_synthesized);
/// symbols that already have a size are left untouched.
pub fn synthesize_sizes(syms: &mut [Sym], sections: &[Section]) {
    // Gather symbols with data and sort by section then address (without
    // destroying the caller's order).
    let mut todo = Vec::new();
    for i in 0..syms.len() {
        let Some(sid) = syms[i].section else {
            // Only assign sizes to symbols with data.
            continue;
        };
        let section = &sections[sid.0];
        if syms[i].kind == SymKind::Section {
            if syms[i].value == section.addr && syms[i].size == 0 {
                syms[i].size = section.size;
                syms[i].flags.set_size_synthesized(true);
            }
            continue;
        }
        // If the symbol is past the end of its section, leave it out because
        // we can't give it a meaningful size and it may throw off earlier
        // symbols in the section.
        if syms[i].value > section.addr + section.size {
            continue;
        }
        todo.push(i);
    }
    todo.sort_by(|&i, &j| {
        let (si, sj) = (&syms[i], &syms[j]);
        si.section
            .cmp(&sj.section)
            .then(si.value.cmp(&sj.value))
    });

    // Assign sizes to zero-sized symbols within each section.
    let mut todo = &todo[..];
    while !todo.is_empty() {
        // Collect symbols that have the same value and section. Most of the
        // time we'll get groups of 1, but sometimes there are multiple names
        // for the same address (especially in shared objects).
        let s1 = &syms[todo[0]];
        let (s1_value, s1_section) = (s1.value, s1.section);
        let mut group = 1;
        let mut any_zero = s1.size == 0;
        while group < todo.len() {
            let s2 = &syms[todo[group]];
            if s1_value != s2.value || s1_section != s2.section {
                break;
            }
            if s2.size == 0 {
                any_zero = true;
            }
            group += 1;
        }
        if !any_zero {
            // They all have sizes. Move on.
            todo = &todo[group..];
            continue;
        }

        // Compute the size of these symbols, capping them at the end of the
        // section.
        let section = &sections[s1_section.unwrap().0];
        let size = if group == todo.len() || s1_section != syms[todo[group]].section {
            section.addr + section.size - s1_value
        } else {
            syms[todo[group]].value - s1_value
        };

        // Apply this size to all zero-sized symbols in this group.
        for &symi in &todo[..group] {
            if syms[symi].size == 0 {
                syms[symi].size = size;
                syms[symi].flags.set_size_synthesized(true);
            }
        }
        todo = &todo[group..];
    }
}
