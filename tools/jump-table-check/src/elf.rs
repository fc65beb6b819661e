use core::mem::size_of;
use core::ptr::read_unaligned;
use kernel_jump_label::{CodeAddress, CodeRead, ImageLayout, TextError};

pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;
pub const EM_RISCV: u16 = 243;

const SHT_NOBITS: u32 = 8;
const SHF_WRITE: u64 = 0x1;
const SHF_ALLOC: u64 = 0x2;
const SHF_EXECINSTR: u64 = 0x4;

// Minimal ELF64 definitions
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code, clippy::struct_field_names)]
pub(crate) struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code, clippy::struct_field_names)]
pub(crate) struct Elf64Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("file is too short for an ELF header")]
    TooShort,
    #[error("not an ELF file")]
    BadMagic,
    #[error("not a little-endian ELF64 file")]
    UnsupportedClass,
    #[error("section header table is malformed or out of bounds")]
    BadSectionTable,
    #[error("section {0} lies outside the file")]
    SectionOutOfBounds(String),
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub flags: u64,
    pub nobits: bool,
}

impl Section {
    const fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_sub(self.addr) {
            Some(off) => off <= self.size && len <= self.size - off,
            None => false,
        }
    }

    const fn is_text(&self) -> bool {
        self.flags & (SHF_ALLOC | SHF_EXECINSTR) == SHF_ALLOC | SHF_EXECINSTR
    }

    const fn is_data(&self) -> bool {
        self.flags & (SHF_ALLOC | SHF_WRITE) == SHF_ALLOC | SHF_WRITE
    }
}

/// A linked image: its machine and its allocated sections.
#[derive(Debug)]
pub struct ElfImage<'a> {
    pub machine: u16,
    pub sections: Vec<Section>,
    bytes: &'a [u8],
}

impl<'a> ElfImage<'a> {
    const EI_MAGIC_BYTES: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    /// Parses the section header table of a 64-bit little-endian ELF image.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.len() < size_of::<Elf64Ehdr>() {
            return Err(ElfError::TooShort);
        }

        // SAFETY: bounds checked above; read_unaligned makes no alignment assumptions.
        let ehdr = unsafe { read_unaligned(bytes.as_ptr().cast::<Elf64Ehdr>()) };

        if ehdr.e_ident[0..4] != Self::EI_MAGIC_BYTES {
            return Err(ElfError::BadMagic);
        }
        // Class = 2 (ELF64), Data = 1 (little-endian)
        if ehdr.e_ident[4] != 2 || ehdr.e_ident[5] != 1 {
            return Err(ElfError::UnsupportedClass);
        }
        if ehdr.e_shnum != 0 && ehdr.e_shentsize as usize != size_of::<Elf64Shdr>() {
            return Err(ElfError::BadSectionTable);
        }

        let shoff = usize::try_from(ehdr.e_shoff).map_err(|_| ElfError::BadSectionTable)?;
        let shnum = ehdr.e_shnum as usize;
        let table_size = size_of::<Elf64Shdr>()
            .checked_mul(shnum)
            .ok_or(ElfError::BadSectionTable)?;
        let end = shoff
            .checked_add(table_size)
            .ok_or(ElfError::BadSectionTable)?;
        if end > bytes.len() {
            return Err(ElfError::BadSectionTable);
        }

        let headers: Vec<Elf64Shdr> = (0..shnum)
            .map(|i| {
                let off = shoff + i * size_of::<Elf64Shdr>();
                // SAFETY: off + sizeof(Shdr) is within bytes by the bound check above.
                unsafe { read_unaligned(bytes.as_ptr().add(off).cast::<Elf64Shdr>()) }
            })
            .collect();

        let strtab = headers
            .get(ehdr.e_shstrndx as usize)
            .map(|sh| file_range(bytes, sh.sh_offset, sh.sh_size))
            .transpose()?
            .ok_or(ElfError::BadSectionTable)?;

        let mut sections = Vec::with_capacity(shnum);
        for sh in &headers {
            let name = section_name(strtab, sh.sh_name)?;
            let nobits = sh.sh_type == SHT_NOBITS;
            if !nobits && file_range(bytes, sh.sh_offset, sh.sh_size).is_err() {
                return Err(ElfError::SectionOutOfBounds(name));
            }
            sections.push(Section {
                name,
                addr: sh.sh_addr,
                offset: sh.sh_offset,
                size: sh.sh_size,
                flags: sh.sh_flags,
                nobits,
            });
        }

        Ok(Self {
            machine: ehdr.e_machine,
            sections,
            bytes,
        })
    }

    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// The file contents of `section`; empty for `NOBITS` sections.
    #[must_use]
    pub fn contents(&self, section: &Section) -> &'a [u8] {
        if section.nobits {
            return &[];
        }
        file_range(self.bytes, section.offset, section.size).unwrap_or(&[])
    }
}

impl ImageLayout for ElfImage<'_> {
    fn is_text(&self, addr: CodeAddress, len: u64) -> bool {
        self.sections
            .iter()
            .any(|s| s.is_text() && s.contains(addr.as_u64(), len))
    }

    fn is_data(&self, addr: CodeAddress) -> bool {
        self.sections
            .iter()
            .any(|s| s.is_data() && s.contains(addr.as_u64(), 4))
    }
}

impl CodeRead for ElfImage<'_> {
    fn read(&self, addr: CodeAddress, buf: &mut [u8]) -> Result<(), TextError> {
        let oob = TextError::OutOfBounds {
            addr,
            len: buf.len(),
        };
        let section = self
            .sections
            .iter()
            .find(|s| s.is_text() && !s.nobits && s.contains(addr.as_u64(), buf.len() as u64))
            .ok_or(oob)?;
        let start = usize::try_from(addr.as_u64() - section.addr).map_err(|_| oob)?;
        let src = self
            .contents(section)
            .get(start..start + buf.len())
            .ok_or(oob)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

fn file_range(bytes: &[u8], offset: u64, size: u64) -> Result<&[u8], ElfError> {
    let start = usize::try_from(offset).map_err(|_| ElfError::BadSectionTable)?;
    let len = usize::try_from(size).map_err(|_| ElfError::BadSectionTable)?;
    start
        .checked_add(len)
        .and_then(|end| bytes.get(start..end))
        .ok_or(ElfError::BadSectionTable)
}

fn section_name(strtab: &[u8], offset: u32) -> Result<String, ElfError> {
    let tail = strtab
        .get(offset as usize..)
        .ok_or(ElfError::BadSectionTable)?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ElfError::BadSectionTable)?;
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}
