//! ELF backend tests over synthetic object images.

mod common;

use std::io::Write;

use common::*;
use objview::obj::{BackingKind, File, OpenError, SectionId, SymDataError, SymId, SymKind};

/// Builds an ELF64 dynamic executable with static and dynamic symbol tables,
/// a targeted relocation section, and a global one.
fn build_exec64() -> Vec<u8> {
    // Raw section indices, fixed by insertion order below.
    const TEXT: u16 = 1;
    const DATA: u16 = 4;
    const BSS: u16 = 5;
    const SYMTAB: u32 = 6;
    const STRTAB: u32 = 7;
    const DYNSTR: u32 = 11;

    let text_bytes: Vec<u8> = (0..32u8).map(|i| 0x10 + i).collect();

    let mut strtab = StrTab::new();
    let main_off = strtab.add("main");
    let data_start_off = strtab.add("data_start");
    let completed_off = strtab.add("completed.0");
    let puts_off = strtab.add("puts");
    let absval_off = strtab.add("absval");

    let mut symtab = Vec::new();
    symtab.extend(sym64(0, 0, 0, 0, 0, 0)); // null symbol
    symtab.extend(sym64(0, STB_LOCAL, STT_SECTION, TEXT, 0x401000, 0));
    symtab.extend(sym64(main_off, STB_GLOBAL, STT_FUNC, TEXT, 0x401010, 16));
    symtab.extend(sym64(data_start_off, STB_GLOBAL, STT_OBJECT, DATA, 0x404000, 0));
    symtab.extend(sym64(completed_off, STB_LOCAL, STT_OBJECT, BSS, 0x404100, 1));
    symtab.extend(sym64(puts_off, STB_GLOBAL, 0, 0, 0, 0));
    symtab.extend(sym64(absval_off, STB_GLOBAL, STT_OBJECT, SHN_ABS, 42, 0));

    let mut dynstr = StrTab::new();
    let dyn_puts_off = dynstr.add("puts");
    let mut dynsym = Vec::new();
    dynsym.extend(sym64(0, 0, 0, 0, 0, 0));
    dynsym.extend(sym64(dyn_puts_off, STB_GLOBAL, 0, 0, 0, 0));

    // Stored out of address order; the reader sorts.
    let mut rela_text = Vec::new();
    rela_text.extend(rela64(0x401014, 4 /* R_X86_64_PLT32 */, 5, -4));
    rela_text.extend(rela64(0x401008, 2 /* R_X86_64_PC32 */, 1, -4));

    let mut rela_dyn = Vec::new();
    rela_dyn.extend(rela64(0x403ff0, 6 /* R_X86_64_GLOB_DAT */, 5, 0));
    rela_dyn.extend(rela64(0x403ff8, 1 /* R_X86_64_64 */, 0, 0x42));

    let mut b = ElfBuilder::new(true, ET_DYN, EM_X86_64);
    b.add(Sec::new(
        ".text",
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        0x401000,
        text_bytes,
    ));
    b.add(Sec::new(".rodata", SHT_PROGBITS, SHF_ALLOC, 0x402000, vec![0xaa; 16]));
    b.add(Sec::new(
        ".got",
        SHT_PROGBITS,
        SHF_ALLOC | SHF_WRITE,
        0x403ff0,
        vec![0; 16],
    ));
    b.add(Sec::new(
        ".data",
        SHT_PROGBITS,
        SHF_ALLOC | SHF_WRITE,
        0x404000,
        vec![0xbb; 16],
    ));
    let mut bss = Sec::new(".bss", SHT_NOBITS, SHF_ALLOC | SHF_WRITE, 0x404100, vec![]);
    bss.nobits_size = 16;
    b.add(bss);
    b.add(Sec::new(".symtab", SHT_SYMTAB, 0, 0, symtab).link(STRTAB).entsize(24));
    b.add(Sec::new(".strtab", SHT_STRTAB, 0, 0, strtab.data));
    b.add(
        Sec::new(".rela.text", SHT_RELA, 0, 0, rela_text)
            .link(SYMTAB)
            .info(TEXT as u32)
            .entsize(24),
    );
    b.add(Sec::new(".rela.dyn", SHT_RELA, 0, 0, rela_dyn).link(SYMTAB).entsize(24));
    b.add(Sec::new(".dynsym", SHT_DYNSYM, 0, 0, dynsym).link(DYNSTR).entsize(24));
    b.add(Sec::new(".dynstr", SHT_STRTAB, 0, 0, dynstr.data));
    b.build()
}

#[test]
fn open_non_object() {
    let err = File::from_bytes(b"AAA".to_vec()).err().expect("open succeeded");
    assert_eq!(err.to_string(), "unrecognized object file format");
    assert!(matches!(err, OpenError::UnrecognizedFormat));
}

#[test]
fn open_corrupted() {
    // A corrupted ELF file is still detected as ELF rather than being
    // rejected as an unknown format.
    let mut ident = vec![0u8; 16];
    ident[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    ident[4] = 42;
    let err = File::from_bytes(ident).err().expect("open succeeded");
    assert!(
        err.to_string().starts_with("unknown ELF class"),
        "unexpected error: {err}"
    );
}

#[test]
fn exec64_sections() {
    let f = File::from_bytes(build_exec64()).unwrap();
    assert_eq!(f.info().arch.map(|a| a.name), Some("amd64"));

    let sections = f.sections();
    assert_eq!(sections.len(), 12); // 11 built + .shstrtab
    let names: Vec<&str> = sections.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names[0], ".text");
    assert_eq!(names[11], ".shstrtab");
    for (i, s) in sections.iter().enumerate() {
        assert_eq!(s.id, SectionId(i));
        assert_eq!(s.raw_id, i + 1); // the NULL section is skipped
        assert!(std::ptr::eq(f.section(s.id), s));
    }

    let text = &sections[0];
    assert_eq!(text.bounds(), (0x401000, 32));
    assert!(text.flags.mapped());
    assert!(text.flags.read_only());
    let data = f.sections().iter().find(|s| s.name == ".data").unwrap();
    assert!(!data.flags.read_only());
    assert!(data.flags.mapped());
    let symtab = f.sections().iter().find(|s| s.name == ".symtab").unwrap();
    assert!(!symtab.flags.mapped());

    // Address resolution only sees mapped sections.
    assert_eq!(f.resolve_addr(0x401010).map(|s| s.name.as_str()), Some(".text"));
    assert_eq!(f.resolve_addr(0x404108).map(|s| s.name.as_str()), Some(".bss"));
    assert_eq!(f.resolve_addr(0x10), None);

    // Whole-section and sub-range data.
    let d = f.section_data(text.id, 0x401000, 32).unwrap();
    let want: Vec<u8> = (0..32u8).map(|i| 0x10 + i).collect();
    assert_eq!(d.b, &want[..]);
    assert_eq!(d.addr, 0x401000);
    let d = f.section_data(text.id, 0x401001, 8).unwrap();
    assert_eq!(d.b, &want[1..9]);

    // NOBITS sections read as zeros.
    let bss = f.sections().iter().find(|s| s.name == ".bss").unwrap();
    let d = f.section_data(bss.id, bss.addr, bss.size).unwrap();
    assert_eq!(d.b, &[0u8; 16][..]);
}

#[test]
fn exec64_syms() {
    let f = File::from_bytes(build_exec64()).unwrap();
    // Six static symbols plus one dynamic, excluding each table's null.
    assert_eq!(f.num_syms(), 7);

    let text_sym = f.sym(SymId(0));
    assert_eq!(text_sym.name, ".text"); // section symbols borrow their section's name
    assert_eq!(text_sym.kind, SymKind::Section);
    assert!(text_sym.flags.local());

    let main = f.sym(SymId(1));
    assert_eq!(main.name, "main");
    assert_eq!(main.kind, SymKind::Text);
    assert_eq!((main.value, main.size), (0x401010, 16));
    assert_eq!(main.section.map(|s| f.section(s).name.as_str()), Some(".text"));
    assert!(!main.flags.local());
    assert_eq!(main.bounds(), (0x401010, 16));

    let data_start = f.sym(SymId(2));
    assert_eq!((data_start.name.as_str(), data_start.kind), ("data_start", SymKind::Data));

    let completed = f.sym(SymId(3));
    assert_eq!((completed.name.as_str(), completed.kind), ("completed.0", SymKind::Bss));
    assert!(completed.flags.local());

    let puts = f.sym(SymId(4));
    assert_eq!((puts.name.as_str(), puts.kind), ("puts", SymKind::Undef));
    assert_eq!(puts.section, None);
    assert_eq!(puts.bounds(), (0, 0));

    let absval = f.sym(SymId(5));
    assert_eq!((absval.name.as_str(), absval.kind), ("absval", SymKind::Absolute));
    assert_eq!(absval.value, 42);

    // The dynamic table is concatenated after the static one.
    let dyn_puts = f.sym(SymId(6));
    assert_eq!((dyn_puts.name.as_str(), dyn_puts.kind), ("puts", SymKind::Undef));

    // Symbol data access.
    let d = f.sym_data(&main, 0x401010, 16).unwrap();
    let want: Vec<u8> = (0x10..0x20u8).map(|i| 0x10 + i).collect();
    assert_eq!(d.b, &want[..]);

    match f.sym_data(&puts, 0, 0) {
        Err(SymDataError::NoData(e)) => assert_eq!(e.to_string(), "no data: undefined symbol"),
        other => panic!("want NoData, got {other:?}"),
    }
    match f.sym_data(&absval, 0, 0) {
        Err(SymDataError::NoData(e)) => assert_eq!(e.to_string(), "no data: absolute symbol"),
        other => panic!("want NoData, got {other:?}"),
    }
}

#[test]
fn exec64_relocs() {
    let f = File::from_bytes(build_exec64()).unwrap();

    // .text has both a targeted and a global relocation section, but the
    // global one contributes nothing in range.
    let text = f.sections().iter().find(|s| s.name == ".text").unwrap();
    let d = f.section_data(text.id, text.addr, text.size).unwrap();
    let got: Vec<(u64, String, SymId, i64)> = d
        .relocs
        .iter()
        .map(|r| (r.addr, r.ty.to_string(), r.symbol, r.addend))
        .collect();
    assert_eq!(
        got,
        vec![
            (0x401008, "R_X86_64_PC32".to_string(), SymId(0), -4),
            (0x401014, "R_X86_64_PLT32".to_string(), SymId(4), -4),
        ]
    );
    assert_eq!(f.sym(d.relocs[1].symbol).name, "puts");

    // .got is covered only by the global relocation section.
    let got_sec = f.sections().iter().find(|s| s.name == ".got").unwrap();
    let d = f.section_data(got_sec.id, got_sec.addr, got_sec.size).unwrap();
    assert_eq!(d.relocs.len(), 2);
    assert_eq!(d.relocs[0].addr, 0x403ff0);
    assert_eq!(d.relocs[0].ty.to_string(), "R_X86_64_GLOB_DAT");
    assert_eq!(f.sym(d.relocs[0].symbol).name, "puts");
    // ELF symbol 0 is the null symbol.
    assert_eq!(d.relocs[1].symbol, SymId::NONE);
    assert_eq!(d.relocs[1].addend, 0x42);
    assert_eq!(d.relocs[0].ty.size(), Some(8));
}

#[test]
#[should_panic(expected = "outside section")]
fn section_data_out_of_range() {
    let f = File::from_bytes(build_exec64()).unwrap();
    let text = f.sections().iter().find(|s| s.name == ".text").unwrap();
    let _ = f.section_data(text.id, text.addr, text.size + 1);
}

/// Builds an i386 relocatable object whose .text carries REL relocations
/// with implicit addends stored in the section bytes.
fn build_rel32(rel_info: u32, bad_type: bool) -> Vec<u8> {
    const RODATA: u16 = 2;
    const SYMTAB: u32 = 3;
    const STRTAB: u32 = 4;

    let mut text = vec![0u8; 0x30];
    text[0x14..0x18].copy_from_slice(&(-4i32).to_le_bytes());
    text[0x19..0x1d].copy_from_slice(&1i32.to_le_bytes());
    text[0x22..0x26].copy_from_slice(&0i32.to_le_bytes());
    text[0x2a..0x2e].copy_from_slice(&(-4i32).to_le_bytes());

    let mut strtab = StrTab::new();
    let thunk_off = strtab.add("__x86.get_pc_thunk.ax");
    let got_off = strtab.add("_GLOBAL_OFFSET_TABLE_");
    let puts_off = strtab.add("puts");

    let mut symtab = Vec::new();
    symtab.extend(sym32(0, 0, 0, 0, 0, 0));
    symtab.extend(sym32(0, STB_LOCAL, STT_SECTION, RODATA, 0, 0));
    symtab.extend(sym32(thunk_off, STB_GLOBAL, STT_FUNC, 0, 0, 0));
    symtab.extend(sym32(got_off, STB_GLOBAL, STT_OBJECT, 0, 0, 0));
    symtab.extend(sym32(puts_off, STB_GLOBAL, STT_FUNC, 0, 0, 0));

    let mut rel_text = Vec::new();
    rel_text.extend(rel32(0x14, 2 /* R_386_PC32 */, 2));
    rel_text.extend(rel32(
        0x19,
        if bad_type { 0x7f } else { 10 /* R_386_GOTPC */ },
        3,
    ));
    rel_text.extend(rel32(0x22, 9 /* R_386_GOTOFF */, 1));
    rel_text.extend(rel32(0x2a, 4 /* R_386_PLT32 */, 4));

    let mut b = ElfBuilder::new(false, ET_REL, EM_386);
    b.add(Sec::new(".text", SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, 0, text));
    b.add(Sec::new(".rodata", SHT_PROGBITS, SHF_ALLOC, 0, vec![0xcc; 8]));
    b.add(Sec::new(".symtab", SHT_SYMTAB, 0, 0, symtab).link(STRTAB).entsize(16));
    b.add(Sec::new(".strtab", SHT_STRTAB, 0, 0, strtab.data));
    b.add(
        Sec::new(".rel.text", SHT_REL, 0, 0, rel_text)
            .link(SYMTAB)
            .info(rel_info)
            .entsize(8),
    );
    b.build()
}

#[test]
fn rel32_implicit_addends() {
    let f = File::from_bytes(build_rel32(1, false)).unwrap();
    assert_eq!(f.info().arch.map(|a| a.name), Some("i386"));

    // Relocatable objects have no mapped address space.
    assert_eq!(f.resolve_addr(0), None);
    let text = f.sections().iter().find(|s| s.name == ".text").unwrap();
    assert!(!text.flags.mapped());

    let d = f.section_data(text.id, text.addr, text.size).unwrap();
    let got: Vec<(u64, String, String, i64)> = d
        .relocs
        .iter()
        .map(|r| (r.addr, r.ty.to_string(), f.sym(r.symbol).name, r.addend))
        .collect();
    assert_eq!(
        got,
        vec![
            (0x14, "R_386_PC32".into(), "__x86.get_pc_thunk.ax".into(), -4),
            (0x19, "R_386_GOTPC".into(), "_GLOBAL_OFFSET_TABLE_".into(), 1),
            (0x22, "R_386_GOTOFF".into(), ".rodata".into(), 0),
            (0x2a, "R_386_PLT32".into(), "puts".into(), -4),
        ]
    );
}

#[test]
fn rel32_global_reloc_section_rejected() {
    // A global relocation section makes no sense in a relocatable object,
    // where relocation addresses are section-relative.
    let err = File::from_bytes(build_rel32(0, false)).err().expect("open succeeded");
    assert!(
        err.to_string().contains("has no target section"),
        "unexpected error: {err}"
    );
}

#[test]
fn rel32_unknown_type_fails_addend_read() {
    let f = File::from_bytes(build_rel32(1, true)).unwrap();
    let text = f.sections().iter().find(|s| s.name == ".text").unwrap();
    let err = f
        .section_data(text.id, text.addr, text.size)
        .err()
        .expect("relocation decode succeeded");
    assert!(
        err.to_string().contains("can't read addend"),
        "unexpected error: {err}"
    );
}

#[test]
fn unknown_machine_still_usable() {
    const EM_MIPS: u16 = 8;
    let mut b = ElfBuilder::new(true, ET_EXEC, EM_MIPS);
    b.add(Sec::new(".text", SHT_PROGBITS, SHF_ALLOC, 0x1000, vec![1, 2, 3, 4]));
    let f = File::from_bytes(b.build()).unwrap();
    assert!(f.info().arch.is_none());
    let text = f.sections().iter().find(|s| s.name == ".text").unwrap();
    let d = f.section_data(text.id, 0x1000, 4).unwrap();
    assert_eq!(d.b, &[1, 2, 3, 4]);
}

/// ELF64 compression header followed by a zlib stream.
fn chdr64_zlib(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(1u32.to_le_bytes()); // ELFCOMPRESS_ZLIB
    out.extend(0u32.to_le_bytes());
    out.extend((payload.len() as u64).to_le_bytes());
    out.extend(8u64.to_le_bytes());
    let mut enc = flate2::write::ZlibEncoder::new(out, flate2::Compression::default());
    enc.write_all(payload).unwrap();
    enc.finish().unwrap()
}

#[test]
fn section_backing_choices() {
    let payload: Vec<u8> = (0..200u8).collect();
    let mut b = ElfBuilder::new(true, ET_DYN, EM_X86_64);
    b.add(Sec::new(
        ".text",
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        0x1000,
        vec![0x90; 64],
    ));
    b.add(Sec::new(".empty", SHT_PROGBITS, 0, 0, vec![]));
    let mut bss = Sec::new(".bss", SHT_NOBITS, SHF_ALLOC | SHF_WRITE, 0x2000, vec![]);
    bss.nobits_size = 32;
    b.add(bss);
    let bss0 = Sec::new(".tbss", SHT_NOBITS, SHF_ALLOC | SHF_WRITE, 0x3000, vec![]);
    b.add(bss0);
    b.add(Sec::new(
        ".debug_info",
        SHT_PROGBITS,
        SHF_COMPRESSED,
        0,
        chdr64_zlib(&payload),
    ));
    let image = b.build();

    // Opened from a real file, uncompressed non-empty sections are mapped
    // and the rest land on the heap.
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&image).unwrap();
    tmp.flush().unwrap();
    let f = File::open(tmp.path()).unwrap();
    let elf = f.as_elf().unwrap();

    let mut kinds = Vec::new();
    for s in f.sections() {
        let d = f.section_data(s.id, s.addr, s.size).unwrap();
        if s.name == ".debug_info" {
            assert_eq!(d.b, &payload[..], "decompressed contents differ");
        }
        if s.name == ".bss" {
            assert_eq!(d.b, &[0u8; 32][..]);
        }
        kinds.push((s.name.clone(), elf.section_backing(s.id).unwrap()));
    }
    let want = vec![
        (".text".to_string(), BackingKind::Mapped),
        (".empty".to_string(), BackingKind::Heap),
        (".bss".to_string(), BackingKind::Mapped),
        (".tbss".to_string(), BackingKind::Heap),
        (".debug_info".to_string(), BackingKind::Heap),
        (".shstrtab".to_string(), BackingKind::Mapped),
    ];
    assert_eq!(kinds, want);

    // Opened from memory, everything lands on the heap except NOBITS.
    let f = File::from_bytes(image).unwrap();
    let elf = f.as_elf().unwrap();
    for s in f.sections() {
        f.section_data(s.id, s.addr, s.size).unwrap();
        let want = if s.name == ".bss" {
            BackingKind::Mapped // anonymous zero mapping
        } else {
            BackingKind::Heap
        };
        assert_eq!(elf.section_backing(s.id), Some(want), "section {}", s.name);
    }
}
