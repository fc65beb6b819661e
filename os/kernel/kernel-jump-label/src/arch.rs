//! # Branch site encodings
//!
//! Every guarded branch site is a fixed-width slot that holds one of two
//! interchangeable instructions of the same length: a no-op (fall through) or a
//! relative jump to the taken label. Patching is therefore a byte-for-byte
//! overwrite; nothing after the site ever moves.
//!
//! | Arch | Site | No-op | Jump | Breakpoint |
//! |------|------|-------|------|------------|
//! | [`X86_64`] | 5 or 2 bytes | `0f 1f 44 00 00` / `66 90` | `e9 rel32` / `eb rel8` | `cc` |
//! | [`Aarch64`] | 4 bytes | `nop` | `b imm26` | `brk #0x004` |
//! | [`Riscv64`] | 4 bytes | `addi x0, x0, 0` | `jal x0, imm21` | `ebreak` |

use crate::{CodeAddress, JumpType};
use core::fmt;
use core::ops::Deref;

pub mod aarch64;
pub mod riscv64;
pub mod x86_64;

pub use aarch64::Aarch64;
pub use riscv64::Riscv64;
pub use x86_64::X86_64;

#[cfg(target_arch = "x86_64")]
pub type NativeArch = X86_64;

#[cfg(target_arch = "aarch64")]
pub type NativeArch = Aarch64;

#[cfg(target_arch = "riscv64")]
pub type NativeArch = Riscv64;

/// Longest encoding any supported architecture writes into a site.
pub const MAX_INSN_LEN: usize = 8;

/// Instruction-set specifics of branch sites.
pub trait Arch {
    const NAME: &'static str;

    /// Number of leading bytes [`site_len`](Self::site_len) needs to see.
    const PROBE_LEN: usize;

    /// Width the table builder uses for new sites.
    const SITE_LEN: usize;

    /// Trap instruction written over the head of a site while it is rewritten.
    const BREAKPOINT: &'static [u8];

    /// Determines the width of the site whose first bytes are `probe`.
    ///
    /// # Errors
    /// [`EncodeError::UnknownSite`] if the bytes are neither a no-op nor a jump
    /// of a supported width.
    fn site_len(probe: &[u8]) -> Result<usize, EncodeError>;

    /// Encodes `ty` for a site of `len` bytes at `code` jumping to `target`.
    ///
    /// # Errors
    /// The target is out of range or misaligned for the jump encoding, or
    /// `len` is not a supported site width.
    fn encode(
        ty: JumpType,
        code: CodeAddress,
        target: CodeAddress,
        len: usize,
    ) -> Result<Insn, EncodeError>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("jump displacement {disp:#x} does not fit a {len}-byte site")]
    DisplacementOverflow { disp: i64, len: usize },
    #[error("jump displacement {disp:#x} is not instruction aligned")]
    MisalignedTarget { disp: i64 },
    #[error("unsupported site width {0}")]
    UnsupportedWidth(usize),
    #[error("site holds neither a no-op nor a jump")]
    UnknownSite,
}

/// A fully encoded site instruction.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Insn {
    bytes: [u8; MAX_INSN_LEN],
    len: u8,
}

impl Insn {
    /// # Panics
    /// If `src` is longer than [`MAX_INSN_LEN`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_slice(src: &[u8]) -> Self {
        assert!(src.len() <= MAX_INSN_LEN);
        let mut bytes = [0u8; MAX_INSN_LEN];
        let mut i = 0;
        while i < src.len() {
            bytes[i] = src[i];
            i += 1;
        }
        Self {
            bytes,
            len: src.len() as u8,
        }
    }

    #[must_use]
    pub const fn from_word(word: u32) -> Self {
        Self::from_slice(&word.to_le_bytes())
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

impl Deref for Insn {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Insn[")?;
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        f.write_str("]")
    }
}

/// Reads a little-endian instruction word from the first four bytes of `probe`.
fn le_word(probe: &[u8]) -> Option<u32> {
    let head: [u8; 4] = probe.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(head))
}
