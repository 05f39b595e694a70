//! Line-table caching and the scoped line reader.
//!
//! Line tables are attached to compilation units. Each CU can cover multiple
//! discontiguous address ranges, each line table consists of multiple
//! sequences, and while rows within a sequence are in increasing address
//! order, the sequences themselves don't have to be. The whole table
//! therefore has to be read once before it can answer address queries; the
//! per-CU [`LineCache`] does that single read, keeps the decoded rows
//! grouped by sequence and sorted by sequence start, and captures the CU's
//! final file table as a side effect. Seeking is then two binary searches,
//! and every cache is validated before use.

use std::sync::Arc;

use gimli::Reader;

use crate::dbg::{Cu, Data, DwarfReader, Error, InlineMap, InlineSite, Subprogram};
use crate::imap::{Imap, Interval};

/// The set of PC ranges a [`LineReader`] iterates over.
enum LineReaderScope {
    /// Every compilation unit in the binary.
    All,
    /// A single subprogram's ranges, each mapped to its CU.
    Subprogram(Imap<Cu>),
}

/// One row of line metadata, as reported by [`LineReader`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineEntry {
    /// The program counter of this row.
    pub address: u64,
    /// The source file, or `None` for end-of-sequence rows and rows whose
    /// file is unknown.
    pub file: Option<Arc<str>>,
    /// The source line, or 0 when unknown.
    pub line: u64,
    /// The source column, or 0 for the left edge.
    pub column: u64,
    /// An end-of-sequence row closes the previous row's address interval; it
    /// may repeat an address but does not cover it.
    pub end_sequence: bool,
}

#[derive(Copy, Clone, Debug)]
struct Row {
    addr: u64,
    file: u64,
    line: u64,
    column: u64,
    end_sequence: bool,
}

/// The rows of one line-table sequence, covering `[start, end)`.
struct Sequence {
    start: u64,
    end: u64,
    rows: Vec<Row>,
}

/// A compilation unit's fully-decoded line table.
pub(crate) struct LineCache {
    /// Sequences in increasing `start` order.
    seqs: Vec<Sequence>,
    /// Resolved file paths, indexed by DWARF file number.
    pub(crate) files: Vec<Option<Arc<str>>>,
}

impl LineCache {
    pub(crate) fn build(
        dwarf: &gimli::Dwarf<DwarfReader>,
        unit: &gimli::Unit<DwarfReader>,
    ) -> Result<LineCache, Error> {
        let program = unit.line_program.clone().ok_or(Error::NoLineTable)?;
        let mut rows_iter = program.rows();
        let mut seqs = Vec::new();
        let mut cur: Vec<Row> = Vec::new();
        while let Some((_, row)) = rows_iter.next_row()? {
            let r = Row {
                addr: row.address(),
                file: row.file_index(),
                line: row.line().map(|l| l.get()).unwrap_or(0),
                column: match row.column() {
                    gimli::ColumnType::LeftEdge => 0,
                    gimli::ColumnType::Column(c) => c.get(),
                },
                end_sequence: row.end_sequence(),
            };
            if r.end_sequence {
                if !cur.is_empty() {
                    let start = cur[0].addr;
                    let end = r.addr;
                    cur.push(r);
                    seqs.push(Sequence {
                        start,
                        end,
                        rows: std::mem::take(&mut cur),
                    });
                }
            } else {
                cur.push(r);
            }
        }
        seqs.sort_by_key(|s| s.start);

        // The whole table has been read, so the header's file table is
        // complete. DWARF 5 numbers files from 0, earlier versions from 1;
        // covering one extra index handles both without special cases.
        let header = rows_iter.header();
        let mut files = Vec::new();
        for i in 0..header.file_names().len() as u64 + 1 {
            files.push(
                header
                    .file(i)
                    .and_then(|f| resolve_file(dwarf, unit, header, f)),
            );
        }
        Ok(LineCache { seqs, files })
    }

    /// Returns the position and contents of the row covering `pc`: the last
    /// row at or before `pc` within the sequence containing `pc`.
    fn seek_row(&self, pc: u64) -> Option<(usize, usize, Row)> {
        let si = self.seqs.partition_point(|s| s.start <= pc).checked_sub(1)?;
        let seq = &self.seqs[si];
        if pc >= seq.end {
            return None;
        }
        let ri = seq.rows.partition_point(|r| r.addr <= pc).checked_sub(1)?;
        Some((si, ri, seq.rows[ri]))
    }

    fn entry(&self, row: &Row) -> LineEntry {
        if row.end_sequence {
            return LineEntry {
                address: row.addr,
                file: None,
                line: 0,
                column: 0,
                end_sequence: true,
            };
        }
        LineEntry {
            address: row.addr,
            file: self.files.get(row.file as usize).cloned().flatten(),
            line: row.line,
            column: row.column,
            end_sequence: false,
        }
    }
}

/// Joins a file entry's directory and name the way tools print them.
fn resolve_file(
    dwarf: &gimli::Dwarf<DwarfReader>,
    unit: &gimli::Unit<DwarfReader>,
    header: &gimli::LineProgramHeader<DwarfReader>,
    file: &gimli::FileEntry<DwarfReader>,
) -> Option<Arc<str>> {
    let name = dwarf.attr_string(unit, file.path_name()).ok()?;
    let name = name.to_string_lossy().ok()?.into_owned();
    let mut path = String::new();
    if !name.starts_with('/') {
        if let Some(dir) = file.directory(header) {
            if let Ok(dir) = dwarf.attr_string(unit, dir) {
                if let Ok(dir) = dir.to_string_lossy() {
                    path.push_str(&dir);
                    if !path.is_empty() && !path.ends_with('/') {
                        path.push('/');
                    }
                }
            }
        }
    }
    path.push_str(&name);
    Some(Arc::from(path))
}

/// Maps PCs to source line information, including stacks of inlined
/// functions.
///
/// The reader is efficient both for single-PC lookups (via [`seek_pc`] or
/// [`seek_subprogram`]) and for iterating over address ranges (a seek
/// followed by [`next`]). Iteration is always in increasing address order.
/// The reader can be scoped to the entire binary, hopping between
/// compilation units as necessary, or to a single subprogram, iterating only
/// over that function's (possibly discontiguous) addresses.
///
/// [`seek_pc`]: LineReader::seek_pc
/// [`seek_subprogram`]: LineReader::seek_subprogram
/// [`next`]: LineReader::next
pub struct LineReader<'d> {
    d: &'d Data,

    /// The PC ranges this reader is scoped to.
    scope: LineReaderScope,
    /// The subprogram this reader is scoped to, if any.
    subprogram: Option<Subprogram>,
    /// The scope range the reader is currently inside and its CU, or `None`
    /// before the first successful seek.
    cur_range: Option<(Interval, Cu)>,
    /// The CU whose line cache the reader is positioned in.
    cu: Option<Cu>,
    /// Position in the current CU's line cache, or `None` when `line` is a
    /// synthesized end-of-sequence row.
    pos: Option<(usize, usize)>,

    /// The line metadata for the current position. If the current PC is
    /// inside an inlined function, this is the metadata of the innermost
    /// frame.
    pub line: LineEntry,
    /// The inline call stack at `line.address`, starting with the innermost
    /// frame, or `None` if the stack cannot be determined.
    pub stack: Option<Arc<InlineSite>>,

    /// Inline map of the subprogram `stack` came from.
    inline_map: Option<Arc<InlineMap>>,
    /// The interval of `inline_map` for which `stack` is valid.
    stack_valid: Interval,
}

impl Data {
    /// Returns a new unpositioned line reader. Call one of the seek methods
    /// to position it before use.
    pub fn line_reader(&self) -> LineReader<'_> {
        LineReader {
            d: self,
            scope: LineReaderScope::All,
            subprogram: None,
            cur_range: None,
            cu: None,
            pos: None,
            line: LineEntry {
                address: 0,
                file: None,
                line: 0,
                column: 0,
                end_sequence: true,
            },
            stack: None,
            inline_map: None,
            stack_valid: Interval::default(),
        }
    }
}

impl<'d> LineReader<'d> {
    /// Positions the reader at the line entry containing `pc`, or the first
    /// entry after `pc`, and scopes iteration to all code in all compilation
    /// units. If there are no valid addresses at or after `pc`, returns
    /// [`Error::UnknownPc`].
    ///
    /// Each line entry covers the addresses from `line.address` up to but
    /// not including the address of the next entry. End-of-sequence entries
    /// cover no addresses; they close the previous entry's interval.
    pub fn seek_pc(&mut self, pc: u64) -> Result<(), Error> {
        if self.subprogram.is_some() {
            self.scope = LineReaderScope::All;
            self.subprogram = None;
            self.cur_range = None;
        }
        self.seek(pc)
    }

    /// Positions the reader at the line entry containing `pc` within
    /// `subprogram`, or the first entry in the subprogram after `pc`, and
    /// scopes iteration to the subprogram's (possibly discontiguous)
    /// ranges. To seek to the beginning of the subprogram, pass 0 for `pc`.
    /// If the subprogram has no valid addresses at or after `pc`, returns
    /// [`Error::UnknownPc`].
    pub fn seek_subprogram(&mut self, subprogram: Subprogram, pc: u64) -> Result<(), Error> {
        if self.subprogram != Some(subprogram) {
            // Map each of the subprogram's ranges to its CU. Since the
            // values are all equal this also merges adjacent ranges.
            let rec = &self.d.cus[subprogram.cu.0];
            let entry = rec.unit.entry(subprogram.entry)?;
            let mut m = Imap::new();
            let mut rs = self.d.dwarf.die_ranges(&rec.unit, &entry)?;
            while let Some(r) = rs.next()? {
                m.insert(
                    Interval {
                        low: r.begin,
                        high: r.end,
                    },
                    subprogram.cu,
                );
            }
            self.scope = LineReaderScope::Subprogram(m);
            self.subprogram = Some(subprogram);
            self.cur_range = None;
        }
        self.seek(pc)
    }

    /// Advances to the next line entry in the reader's scope, updating
    /// [`line`](Self::line) and [`stack`](Self::stack). Returns `Ok(false)`
    /// when there are no more entries.
    ///
    /// Entries are produced in non-decreasing address order even across
    /// compilation units; line numbers may go forward or backward, and
    /// consecutive entries may repeat an address.
    pub fn next(&mut self) -> Result<bool, Error> {
        if self.line.end_sequence {
            // Advancing the table past an end-of-sequence row would leave
            // address order behind (sequences aren't sorted), so re-seek at
            // its address instead.
            let addr = self.line.address;
            let mut r = self.seek(addr);
            if r.is_ok() && self.line.end_sequence {
                // Seeking to the end row's own address should reach the next
                // sequence, but seek one more byte if needed to guarantee
                // forward progress.
                r = self.seek(addr + 1);
            }
            return match r {
                Ok(()) => Ok(true),
                // Went past the end of the scope: iteration is over.
                Err(Error::UnknownPc) => Ok(false),
                Err(e) => Err(e),
            };
        }

        let (range, cu) = self.cur_range.expect("positioned reader has a range");
        let (si, ri) = self.pos.expect("positioned reader has a row");
        let cache = self.d.line_cache(cu)?;
        // A non-end row is always followed by another row in its sequence.
        let next = cache.seqs[si].rows[ri + 1];
        if next.addr < range.high {
            self.pos = Some((si, ri + 1));
            self.line = cache.entry(&next);
            self.update_stack();
            return Ok(true);
        }

        // The next row falls outside the reader's scope. Synthesize an
        // end-of-sequence row at the end of the scope range; the next call
        // will seek past it into the following range or end the iteration.
        self.pos = None;
        self.line = LineEntry {
            address: range.high,
            file: None,
            line: 0,
            column: 0,
            end_sequence: true,
        };
        self.update_stack();
        Ok(true)
    }

    fn seek(&mut self, mut pc: u64) -> Result<(), Error> {
        if !self
            .cur_range
            .map_or(false, |(range, _)| range.contains(pc))
        {
            // Find the scope range containing or following pc.
            let ranges = match &self.scope {
                LineReaderScope::All => &self.d.cu_ranges,
                LineReaderScope::Subprogram(m) => m,
            };
            let Some((range, &cu)) = ranges.iter(pc).next() else {
                return Err(Error::UnknownPc);
            };
            self.cur_range = Some((range, cu));
            // pc may be before the range we found; round it up.
            if pc < range.low {
                pc = range.low;
            }
        }

        let (_, cu) = self.cur_range.expect("range was just established");
        self.cu = Some(cu);
        let cache = self.d.line_cache(cu)?;
        let Some((si, ri, row)) = cache.seek_row(pc) else {
            return Err(Error::UnknownPc);
        };
        self.pos = Some((si, ri));
        self.line = cache.entry(&row);
        self.update_stack();
        Ok(())
    }

    /// Refreshes [`stack`](Self::stack) after the reader has moved. Cheap
    /// when the new address is still inside the interval the current stack
    /// is known to be valid for.
    fn update_stack(&mut self) {
        if self.line.end_sequence {
            // The row's address isn't logically in a function.
            self.clear_stack();
            return;
        }
        let addr = self.line.address;
        if self.stack_valid.contains(addr) {
            return;
        }

        // Try looking up the PC in the current inline map.
        if let Some(m) = &self.inline_map {
            if let Some((valid, site)) = m.find(addr) {
                self.stack_valid = valid;
                self.stack = Some(site.clone());
                return;
            }
        }

        // We must have moved out of the current map's subprogram. Find the
        // current subprogram and fetch its inline ranges.
        let sub = match self.subprogram {
            Some(sub) => sub,
            None => match self.d.addr_to_subprogram(addr, self.cu) {
                Some(sub) => sub,
                None => {
                    self.clear_stack();
                    return;
                }
            },
        };
        let m = self.d.inline_ranges(sub);
        match m.find(addr) {
            Some((valid, site)) => {
                self.stack_valid = valid;
                self.stack = Some(site.clone());
            }
            // No coverage even in the right subprogram's map.
            None => self.clear_stack(),
        }
        self.inline_map = Some(m);
    }

    fn clear_stack(&mut self) {
        self.stack = None;
        self.stack_valid = Interval::default();
    }
}
