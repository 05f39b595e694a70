//! Reads binary object files and their embedded debug information into a
//! uniform, queryable model.
//!
//! The crate is organized as a small stack of layers:
//!
//! - [`arch`] describes data layouts (byte order and word size) and provides
//!   the value decoders everything else is built on.
//! - [`imap`] is an ordered map keyed by half-open address intervals, with
//!   automatic splitting and merging. It backs every "address to X" lookup.
//! - [`obj`] is the object-file model: [`obj::File::open`] sniffs a file's
//!   format and exposes its sections, symbols, and relocations uniformly.
//!   Section contents are acquired lazily and memory-mapped when possible.
//! - [`dbg`] interprets DWARF debug information: compilation-unit and
//!   subprogram lookup by address, inline stacks, and a line-table reader
//!   that iterates in address order across compilation units.
//! - [`symtab`] indexes a file's symbols for fast lookup by name or address.
//!
//! Higher-level tools (disassemblers, profilers, size analyzers) can consume
//! any supported format through this one abstraction; ELF is the fully
//! featured backend.

pub mod arch;
pub mod dbg;
pub mod imap;
pub mod obj;
pub mod symtab;
