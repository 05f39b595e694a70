//! A small ELF image builder for tests.
//!
//! Produces little-endian ELF32/ELF64 images with arbitrary section
//! contents, enough to exercise the object model without shipping binary
//! fixtures.

#![allow(dead_code)]

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;
pub const SHT_DYNSYM: u32 = 11;

pub const SHF_WRITE: u64 = 1 << 0;
pub const SHF_ALLOC: u64 = 1 << 1;
pub const SHF_EXECINSTR: u64 = 1 << 2;
pub const SHF_COMPRESSED: u64 = 1 << 11;

pub const ET_REL: u16 = 1;
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const EM_386: u16 = 3;
pub const EM_X86_64: u16 = 62;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_SECTION: u8 = 3;

pub const SHN_ABS: u16 = 0xfff1;

/// A section to be placed in the image.
#[derive(Clone)]
pub struct Sec {
    pub name: String,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub data: Vec<u8>,
    /// Size reported for NOBITS sections, which carry no data.
    pub nobits_size: u64,
    pub link: u32,
    pub info: u32,
    pub entsize: u64,
}

impl Sec {
    pub fn new(name: &str, sh_type: u32, flags: u64, addr: u64, data: Vec<u8>) -> Sec {
        Sec {
            name: name.to_string(),
            sh_type,
            flags,
            addr,
            data,
            nobits_size: 0,
            link: 0,
            info: 0,
            entsize: 0,
        }
    }

    pub fn link(mut self, link: u32) -> Sec {
        self.link = link;
        self
    }

    pub fn info(mut self, info: u32) -> Sec {
        self.info = info;
        self
    }

    pub fn entsize(mut self, entsize: u64) -> Sec {
        self.entsize = entsize;
        self
    }
}

/// Builds little-endian ELF images. Section raw indices are assigned in
/// insertion order starting at 1 (index 0 is the NULL section); the section
/// name string table is appended last.
pub struct ElfBuilder {
    is64: bool,
    e_type: u16,
    machine: u16,
    secs: Vec<Sec>,
}

impl ElfBuilder {
    pub fn new(is64: bool, e_type: u16, machine: u16) -> ElfBuilder {
        ElfBuilder {
            is64,
            e_type,
            machine,
            secs: Vec::new(),
        }
    }

    /// Adds a section and returns its raw ELF section index.
    pub fn add(&mut self, sec: Sec) -> u32 {
        self.secs.push(sec);
        self.secs.len() as u32
    }

    pub fn build(&self) -> Vec<u8> {
        let (ehdr_size, shdr_size) = if self.is64 { (64, 64) } else { (52, 40) };

        // Section name string table, always appended as the last section.
        let mut shstr = vec![0u8];
        let mut name_offs = Vec::new();
        for s in &self.secs {
            name_offs.push(shstr.len() as u32);
            shstr.extend(s.name.as_bytes());
            shstr.push(0);
        }
        let shstrtab_name = shstr.len() as u32;
        shstr.extend(b".shstrtab");
        shstr.push(0);

        let mut out = vec![0u8; ehdr_size];

        // Section contents.
        let mut offsets = Vec::new();
        for s in &self.secs {
            align(&mut out, 8);
            offsets.push(out.len() as u64);
            if s.sh_type != SHT_NOBITS {
                out.extend(&s.data);
            }
        }
        align(&mut out, 8);
        let shstr_off = out.len() as u64;
        out.extend(&shstr);
        align(&mut out, 8);
        let shoff = out.len() as u64;

        // Section header table: NULL, user sections, .shstrtab.
        let shnum = self.secs.len() as u16 + 2;
        out.extend(std::iter::repeat(0u8).take(shdr_size));
        for (i, s) in self.secs.iter().enumerate() {
            let size = if s.sh_type == SHT_NOBITS {
                s.nobits_size
            } else {
                s.data.len() as u64
            };
            self.shdr(
                &mut out, name_offs[i], s.sh_type, s.flags, s.addr, offsets[i], size, s.link,
                s.info, s.entsize,
            );
        }
        self.shdr(
            &mut out,
            shstrtab_name,
            SHT_STRTAB,
            0,
            0,
            shstr_off,
            shstr.len() as u64,
            0,
            0,
            0,
        );

        // ELF header.
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = if self.is64 { 2 } else { 1 };
        out[5] = 1; // little-endian
        out[6] = 1; // EV_CURRENT
        w16(&mut out[16..], self.e_type);
        w16(&mut out[18..], self.machine);
        w32(&mut out[20..], 1);
        if self.is64 {
            w64(&mut out[40..], shoff);
            w16(&mut out[52..], ehdr_size as u16);
            w16(&mut out[58..], shdr_size as u16);
            w16(&mut out[60..], shnum);
            w16(&mut out[62..], shnum - 1);
        } else {
            w32(&mut out[32..], shoff as u32);
            w16(&mut out[40..], ehdr_size as u16);
            w16(&mut out[46..], shdr_size as u16);
            w16(&mut out[48..], shnum);
            w16(&mut out[50..], shnum - 1);
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn shdr(
        &self,
        out: &mut Vec<u8>,
        name: u32,
        sh_type: u32,
        flags: u64,
        addr: u64,
        offset: u64,
        size: u64,
        link: u32,
        info: u32,
        entsize: u64,
    ) {
        p32(out, name);
        p32(out, sh_type);
        if self.is64 {
            p64(out, flags);
            p64(out, addr);
            p64(out, offset);
            p64(out, size);
            p32(out, link);
            p32(out, info);
            p64(out, 8); // addralign
            p64(out, entsize);
        } else {
            p32(out, flags as u32);
            p32(out, addr as u32);
            p32(out, offset as u32);
            p32(out, size as u32);
            p32(out, link);
            p32(out, info);
            p32(out, 8);
            p32(out, entsize as u32);
        }
    }
}

/// Accumulates a string table, returning the offset of each added string.
pub struct StrTab {
    pub data: Vec<u8>,
}

impl StrTab {
    pub fn new() -> StrTab {
        StrTab { data: vec![0] }
    }

    pub fn add(&mut self, s: &str) -> u32 {
        let off = self.data.len() as u32;
        self.data.extend(s.as_bytes());
        self.data.push(0);
        off
    }
}

/// Encodes one ELF64 symbol table entry.
pub fn sym64(name: u32, bind: u8, ty: u8, shndx: u16, value: u64, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    p32(&mut out, name);
    out.push(bind << 4 | ty);
    out.push(0); // st_other
    p16(&mut out, shndx);
    p64(&mut out, value);
    p64(&mut out, size);
    out
}

/// Encodes one ELF32 symbol table entry.
pub fn sym32(name: u32, bind: u8, ty: u8, shndx: u16, value: u32, size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    p32(&mut out, name);
    p32(&mut out, value);
    p32(&mut out, size);
    out.push(bind << 4 | ty);
    out.push(0);
    p16(&mut out, shndx);
    out
}

/// Encodes one ELF64 RELA entry.
pub fn rela64(offset: u64, ty: u32, sym: u32, addend: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    p64(&mut out, offset);
    p64(&mut out, (sym as u64) << 32 | ty as u64);
    p64(&mut out, addend as u64);
    out
}

/// Encodes one ELF32 REL entry.
pub fn rel32(offset: u32, ty: u8, sym: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    p32(&mut out, offset);
    p32(&mut out, sym << 8 | ty as u32);
    out
}

fn align(out: &mut Vec<u8>, to: usize) {
    while out.len() % to != 0 {
        out.push(0);
    }
}

fn p16(out: &mut Vec<u8>, v: u16) {
    out.extend(v.to_le_bytes());
}

fn p32(out: &mut Vec<u8>, v: u32) {
    out.extend(v.to_le_bytes());
}

fn p64(out: &mut Vec<u8>, v: u64) {
    out.extend(v.to_le_bytes());
}

fn w16(out: &mut [u8], v: u16) {
    out[..2].copy_from_slice(&v.to_le_bytes());
}

fn w32(out: &mut [u8], v: u32) {
    out[..4].copy_from_slice(&v.to_le_bytes());
}

fn w64(out: &mut [u8], v: u64) {
    out[..8].copy_from_slice(&v.to_le_bytes());
}
