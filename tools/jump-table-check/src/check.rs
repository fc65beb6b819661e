use crate::elf::{EM_AARCH64, EM_RISCV, EM_X86_64, ElfError, ElfImage};
use kernel_jump_label::{Aarch64, Arch, CodeAddress, JumpTable, Riscv64, TableError, X86_64};
use log::{debug, info};
use std::path::PathBuf;

pub const JUMP_TABLE_SECTION: &str = "__jump_table";

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("cannot read {path}: {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("unsupported machine type {0}")]
    UnsupportedMachine(u16),
    #[error("section {JUMP_TABLE_SECTION} is not loaded at a fixed address")]
    Unallocated,
    #[error(transparent)]
    Table(#[from] TableError),
}

/// What a successful check found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub arch: &'static str,
    pub sites: usize,
    /// Sites currently holding their jump.
    pub taken: usize,
    pub keys: usize,
}

/// Validates the jump table of the linked image in `bytes`.
///
/// An image without a jump table has no sites and passes.
pub fn check_image(bytes: &[u8]) -> Result<Report, CheckError> {
    let image = ElfImage::parse(bytes)?;
    match image.machine {
        EM_X86_64 => check::<X86_64>(&image),
        EM_AARCH64 => check::<Aarch64>(&image),
        EM_RISCV => check::<Riscv64>(&image),
        other => Err(CheckError::UnsupportedMachine(other)),
    }
}

fn check<A: Arch>(image: &ElfImage<'_>) -> Result<Report, CheckError> {
    let Some(section) = image.section(JUMP_TABLE_SECTION) else {
        info!("no {JUMP_TABLE_SECTION} section");
        return Ok(Report {
            arch: A::NAME,
            sites: 0,
            taken: 0,
            keys: 0,
        });
    };
    if section.addr == 0 {
        return Err(CheckError::Unallocated);
    }

    let base = CodeAddress::new(section.addr);
    let entries = JumpTable::parse(base, image.contents(section))?;
    let table = JumpTable::new(base, &entries);
    debug!("{} record(s) at {base}", table.len());

    table.validate(image)?;
    let taken = table.check_sites::<A>(image)?;

    let mut keys: Vec<_> = table.iter().map(|s| s.key()).collect();
    keys.sort_unstable();
    keys.dedup();

    Ok(Report {
        arch: A::NAME,
        sites: table.len(),
        taken,
        keys: keys.len(),
    })
}
