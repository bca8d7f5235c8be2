//! Minimal ELF reader.
//!
//! Only the parts needed to locate Go build info are decoded: the file header,
//! program headers and section headers (with names). All reads are positioned
//! reads against an open file so large binaries are never loaded whole.

use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt as _;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const PT_LOAD: u32 = 1;
pub const PF_X: u32 = 0x1;
pub const PF_W: u32 = 0x2;

const EI_NIDENT: usize = 16;
const ELF64_EHDR_SIZE: usize = 64;
const ELF32_EHDR_SIZE: usize = 52;
const MAX_PHNUM: usize = 1024;
const MAX_SHNUM: usize = 4096;
const MAX_SHSTRTAB: u64 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    #[error("not an ELF file")]
    NotElf,
    #[error("truncated ELF file")]
    Truncated,
    #[error("malformed ELF: {0}")]
    Malformed(&'static str),
    #[error("read ELF: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    pub fn word_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn u16(self, b: &[u8]) -> u16 {
        let a = [b[0], b[1]];
        match self {
            ByteOrder::Little => u16::from_le_bytes(a),
            ByteOrder::Big => u16::from_be_bytes(a),
        }
    }

    pub fn u32(self, b: &[u8]) -> u32 {
        let a = [b[0], b[1], b[2], b[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(a),
            ByteOrder::Big => u32::from_be_bytes(a),
        }
    }

    pub fn u64(self, b: &[u8]) -> u64 {
        let a = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        match self {
            ByteOrder::Little => u64::from_le_bytes(a),
            ByteOrder::Big => u64::from_be_bytes(a),
        }
    }

    /// Reads a pointer-sized unsigned integer (4 or 8 bytes).
    pub fn word(self, b: &[u8], size: usize) -> u64 {
        if size == 8 {
            self.u64(b)
        } else {
            u64::from(self.u32(b))
        }
    }
}

/// ELF `e_machine` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Machine(pub u16);

impl Machine {
    pub const X86: Machine = Machine(3);
    pub const MIPS: Machine = Machine(8);
    pub const PPC: Machine = Machine(20);
    pub const PPC64: Machine = Machine(21);
    pub const S390: Machine = Machine(22);
    pub const ARM: Machine = Machine(40);
    pub const X86_64: Machine = Machine(62);
    pub const AARCH64: Machine = Machine(183);
    pub const RISCV: Machine = Machine(243);
    pub const LOONGARCH: Machine = Machine(258);

    /// Machine of the running process, or `None` on targets this tool has no ELF id for.
    pub fn host() -> Option<Machine> {
        if cfg!(target_arch = "x86_64") {
            Some(Machine::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Machine::AARCH64)
        } else if cfg!(target_arch = "x86") {
            Some(Machine::X86)
        } else if cfg!(target_arch = "arm") {
            Some(Machine::ARM)
        } else if cfg!(target_arch = "riscv64") {
            Some(Machine::RISCV)
        } else if cfg!(target_arch = "powerpc64") {
            Some(Machine::PPC64)
        } else if cfg!(target_arch = "s390x") {
            Some(Machine::S390)
        } else if cfg!(target_arch = "loongarch64") {
            Some(Machine::LOONGARCH)
        } else if cfg!(any(target_arch = "mips", target_arch = "mips64")) {
            Some(Machine::MIPS)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Machine::X86 => "386",
            Machine::MIPS => "mips",
            Machine::PPC => "ppc",
            Machine::PPC64 => "ppc64",
            Machine::S390 => "s390x",
            Machine::ARM => "arm",
            Machine::X86_64 => "amd64",
            Machine::AARCH64 => "arm64",
            Machine::RISCV => "riscv64",
            Machine::LOONGARCH => "loong64",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (e_machine {})", self.name(), self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ElfFile {
    pub class: ElfClass,
    pub order: ByteOrder,
    pub e_type: u16,
    pub machine: Machine,
    pub segments: Vec<Segment>,
    pub sections: Vec<Section>,
    pub file_len: u64,
}

/// Cheap check of the first bytes of a file.
pub fn has_elf_magic(prefix: &[u8]) -> bool {
    prefix.len() >= ELF_MAGIC.len() && prefix[..ELF_MAGIC.len()] == ELF_MAGIC
}

pub fn read_exact_at(file: &File, offset: u64, len: usize) -> Result<Vec<u8>, ElfError> {
    let mut buf = vec![0u8; len];
    match file.read_exact_at(&mut buf, offset) {
        Ok(()) => Ok(buf),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(ElfError::Truncated),
        Err(err) => Err(ElfError::Io(err)),
    }
}

fn table_bytes(count: usize, entsize: usize) -> Result<usize, ElfError> {
    count
        .checked_mul(entsize)
        .ok_or(ElfError::Malformed("header table size overflow"))
}

/// Rejects a range that does not lie inside the file, before anything is allocated for it.
fn check_in_file(offset: u64, len: usize, file_len: u64) -> Result<(), ElfError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= file_len => Ok(()),
        _ => Err(ElfError::Truncated),
    }
}

impl ElfFile {
    pub fn parse(file: &File) -> Result<ElfFile, ElfError> {
        let file_len = file.metadata()?.len();
        if file_len < EI_NIDENT as u64 {
            return Err(ElfError::NotElf);
        }
        let ident = read_exact_at(file, 0, EI_NIDENT)?;
        if !has_elf_magic(&ident) {
            return Err(ElfError::NotElf);
        }
        let class = match ident[4] {
            1 => ElfClass::Elf32,
            2 => ElfClass::Elf64,
            _ => return Err(ElfError::Malformed("unknown EI_CLASS")),
        };
        let order = match ident[5] {
            1 => ByteOrder::Little,
            2 => ByteOrder::Big,
            _ => return Err(ElfError::Malformed("unknown EI_DATA")),
        };

        let ehdr_size = match class {
            ElfClass::Elf32 => ELF32_EHDR_SIZE,
            ElfClass::Elf64 => ELF64_EHDR_SIZE,
        };
        let h = read_exact_at(file, 0, ehdr_size)?;

        let e_type = order.u16(&h[16..]);
        let machine = Machine(order.u16(&h[18..]));
        let (phoff, shoff, phentsize, phnum, shentsize, shnum, shstrndx) = match class {
            ElfClass::Elf64 => (
                order.u64(&h[32..]),
                order.u64(&h[40..]),
                order.u16(&h[54..]) as usize,
                order.u16(&h[56..]) as usize,
                order.u16(&h[58..]) as usize,
                order.u16(&h[60..]) as usize,
                order.u16(&h[62..]) as usize,
            ),
            ElfClass::Elf32 => (
                u64::from(order.u32(&h[28..])),
                u64::from(order.u32(&h[32..])),
                order.u16(&h[42..]) as usize,
                order.u16(&h[44..]) as usize,
                order.u16(&h[46..]) as usize,
                order.u16(&h[48..]) as usize,
                order.u16(&h[50..]) as usize,
            ),
        };

        let mut elf = ElfFile {
            class,
            order,
            e_type,
            machine,
            segments: Vec::new(),
            sections: Vec::new(),
            file_len,
        };

        if phoff != 0 && phnum != 0 {
            if phnum > MAX_PHNUM {
                return Err(ElfError::Malformed("too many program headers"));
            }
            let min_entsize = match class {
                ElfClass::Elf32 => 32,
                ElfClass::Elf64 => 56,
            };
            if phentsize < min_entsize {
                return Err(ElfError::Malformed("program header entry too small"));
            }
            let bytes = table_bytes(phnum, phentsize)?;
            check_in_file(phoff, bytes, file_len)?;
            let table = read_exact_at(file, phoff, bytes)?;
            for ent in table.chunks_exact(phentsize) {
                elf.segments.push(elf.decode_segment(ent));
            }
        }

        if shoff != 0 && shnum != 0 {
            if shnum > MAX_SHNUM {
                return Err(ElfError::Malformed("too many section headers"));
            }
            let min_entsize = match class {
                ElfClass::Elf32 => 40,
                ElfClass::Elf64 => 64,
            };
            if shentsize < min_entsize {
                return Err(ElfError::Malformed("section header entry too small"));
            }
            let bytes = table_bytes(shnum, shentsize)?;
            check_in_file(shoff, bytes, file_len)?;
            let table = read_exact_at(file, shoff, bytes)?;
            let raw: Vec<(u32, Section)> = table
                .chunks_exact(shentsize)
                .map(|ent| elf.decode_section(ent))
                .collect();

            let names = match raw.get(shstrndx) {
                Some((_, strtab)) if strtab.size > 0 && strtab.size <= MAX_SHSTRTAB => {
                    check_in_file(strtab.offset, strtab.size as usize, file_len)?;
                    read_exact_at(file, strtab.offset, strtab.size as usize)?
                }
                _ => Vec::new(),
            };
            for (name_off, mut sec) in raw {
                sec.name = section_name(&names, name_off as usize);
                elf.sections.push(sec);
            }
        }

        Ok(elf)
    }

    pub fn is_executable_type(&self) -> bool {
        self.e_type == ET_EXEC || self.e_type == ET_DYN
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// First loadable segment that is writable but not executable (the data segment).
    pub fn data_segment(&self) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|p| p.p_type == PT_LOAD && p.flags & (PF_X | PF_W) == PF_W)
    }

    /// Maps a virtual address to `(file offset, bytes available in the file from there)`.
    /// `None` when no load segment maps it or the segment's file offset is out of range.
    pub fn offset_for_vaddr(&self, vaddr: u64) -> Option<(u64, u64)> {
        let p = self
            .segments
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .find(|p| vaddr >= p.vaddr && vaddr - p.vaddr < p.filesz)?;
        let delta = vaddr - p.vaddr;
        Some((p.offset.checked_add(delta)?, p.filesz - delta))
    }

    fn decode_segment(&self, ent: &[u8]) -> Segment {
        let o = self.order;
        match self.class {
            ElfClass::Elf64 => Segment {
                p_type: o.u32(&ent[0..]),
                flags: o.u32(&ent[4..]),
                offset: o.u64(&ent[8..]),
                vaddr: o.u64(&ent[16..]),
                filesz: o.u64(&ent[32..]),
                memsz: o.u64(&ent[40..]),
            },
            ElfClass::Elf32 => Segment {
                p_type: o.u32(&ent[0..]),
                offset: u64::from(o.u32(&ent[4..])),
                vaddr: u64::from(o.u32(&ent[8..])),
                filesz: u64::from(o.u32(&ent[16..])),
                memsz: u64::from(o.u32(&ent[20..])),
                flags: o.u32(&ent[24..]),
            },
        }
    }

    fn decode_section(&self, ent: &[u8]) -> (u32, Section) {
        let o = self.order;
        let name_off = o.u32(&ent[0..]);
        let sec = match self.class {
            ElfClass::Elf64 => Section {
                name: String::new(),
                sh_type: o.u32(&ent[4..]),
                addr: o.u64(&ent[16..]),
                offset: o.u64(&ent[24..]),
                size: o.u64(&ent[32..]),
            },
            ElfClass::Elf32 => Section {
                name: String::new(),
                sh_type: o.u32(&ent[4..]),
                addr: u64::from(o.u32(&ent[12..])),
                offset: u64::from(o.u32(&ent[16..])),
                size: u64::from(o.u32(&ent[20..])),
            },
        };
        (name_off, sec)
    }
}

fn section_name(strtab: &[u8], off: usize) -> String {
    let Some(tail) = strtab.get(off..) else {
        return String::new();
    };
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).into_owned()
}
