//! # Jump table records
//!
//! Each branch site contributes one record to the `__jump_table` section:
//!
//! ```text
//! offset  size  field
//! 0       4     code    .long 1b - .          site, relative to this field
//! 4       4     target  .long l_yes - .       taken label, relative to this field
//! 8       8     key     .quad key + flags - . key cell | flags, relative to this field
//! ```
//!
//! Every displacement is relative to the address of the field that holds it,
//! so the table needs no relocation when the image is loaded.

use crate::CodeAddress;
use bitfield_struct::bitfield;

/// Size of one record in the jump table.
pub const JUMP_ENTRY_SIZE: usize = 16;

/// Required alignment of the table and of every record.
pub const JUMP_ENTRY_ALIGN: usize = 8;

const KEY_FLAGS_MASK: i64 = 0b11;

/// One Branch Site Record as emitted by the assembler.
///
/// Records are never modified after the image is linked; only the
/// instruction bytes they point at are.
#[repr(C, align(8))]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct JumpEntry {
    code: i32,
    target: i32,
    key: i64,
}

const _: () = assert!(size_of::<JumpEntry>() == JUMP_ENTRY_SIZE);

/// Low bits of the `key` field.
#[bitfield(u8)]
pub struct KeyFlags {
    /// Bit 0: the site was compiled for the "likely" side: it jumps when
    /// the key is **disabled**.
    pub branch: bool,

    /// Bit 1: the site was emitted as a jump that a build-time pass still has
    /// to turn into a no-op. Never set in a finished image.
    pub hack: bool,

    #[bits(6)]
    __: u8,
}

/// Which of the two interchangeable encodings a site holds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JumpType {
    /// Fall through.
    Nop,
    /// Jump to the site's label.
    Jmp,
}

impl JumpType {
    /// The encoding a site needs for a key state.
    ///
    /// A site jumps exactly when the key state differs from the site's
    /// compiled-in `branch` polarity.
    #[inline]
    #[must_use]
    pub const fn for_state(enabled: bool, branch: bool) -> Self {
        if enabled ^ branch { Self::Jmp } else { Self::Nop }
    }

    #[inline]
    #[must_use]
    pub const fn is_taken(self) -> bool {
        matches!(self, Self::Jmp)
    }
}

impl JumpEntry {
    /// Builds the record that lives at `at` for the given absolute addresses.
    ///
    /// Returns `None` if the site or the label is more than ±2 GiB away from
    /// the record.
    #[must_use]
    pub fn locate(
        at: CodeAddress,
        code: CodeAddress,
        target: CodeAddress,
        key: CodeAddress,
        flags: KeyFlags,
    ) -> Option<Self> {
        let code = i32::try_from(code.displacement_from(at)).ok()?;
        let target = i32::try_from(target.displacement_from(at + 4)).ok()?;
        let key = key.displacement_from(at + 8) | i64::from(flags.into_bits()) & KEY_FLAGS_MASK;
        Some(Self { code, target, key })
    }

    /// Decodes a little-endian record.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; JUMP_ENTRY_SIZE]) -> Self {
        let [c0, c1, c2, c3, t0, t1, t2, t3, k @ ..] = *bytes;
        Self {
            code: i32::from_le_bytes([c0, c1, c2, c3]),
            target: i32::from_le_bytes([t0, t1, t2, t3]),
            key: i64::from_le_bytes(k),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; JUMP_ENTRY_SIZE] {
        let mut out = [0u8; JUMP_ENTRY_SIZE];
        out[..4].copy_from_slice(&self.code.to_le_bytes());
        out[4..8].copy_from_slice(&self.target.to_le_bytes());
        out[8..].copy_from_slice(&self.key.to_le_bytes());
        out
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub const fn flags(&self) -> KeyFlags {
        KeyFlags::from_bits((self.key & KEY_FLAGS_MASK) as u8)
    }

    /// The record placed at `at`.
    #[inline]
    #[must_use]
    pub const fn at(self, at: CodeAddress) -> BranchSite {
        BranchSite { at, entry: self }
    }
}

/// A record together with the address it lives at.
///
/// All addresses of a record are only meaningful relative to its own
/// position, so the pair is what the patcher works with.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BranchSite {
    at: CodeAddress,
    entry: JumpEntry,
}

impl BranchSite {
    #[inline]
    #[must_use]
    pub const fn record_address(&self) -> CodeAddress {
        self.at
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self) -> &JumpEntry {
        &self.entry
    }

    /// Address of the patchable instruction.
    #[inline]
    #[must_use]
    pub const fn code(&self) -> CodeAddress {
        self.at.offset_by(self.entry.code as i64)
    }

    /// Address of the label the site jumps to when taken.
    #[inline]
    #[must_use]
    pub const fn target(&self) -> CodeAddress {
        self.at.offset_by(4 + self.entry.target as i64)
    }

    /// Address of the key cell, flag bits stripped.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> CodeAddress {
        self.at.offset_by(8 + (self.entry.key & !KEY_FLAGS_MASK))
    }

    #[inline]
    #[must_use]
    pub const fn branch(&self) -> bool {
        self.entry.flags().branch()
    }

    #[inline]
    #[must_use]
    pub const fn is_hack(&self) -> bool {
        self.entry.flags().hack()
    }

    /// The encoding this site needs when its key is in state `enabled`.
    #[inline]
    #[must_use]
    pub const fn desired(&self, enabled: bool) -> JumpType {
        JumpType::for_state(enabled, self.branch())
    }
}
