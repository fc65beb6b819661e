//! # Laying out sites and records
//!
//! The host-side counterpart of the emission macros: places branch sites into
//! a code image and produces the matching jump table, exactly as the assembler
//! and linker would. Used to construct images for tests and tooling.

extern crate alloc;

use crate::arch::Arch;
use crate::entry::{JUMP_ENTRY_ALIGN, JUMP_ENTRY_SIZE, JumpEntry, JumpType, KeyFlags};
use crate::key::StaticKey;
use crate::strategy::{PatchStrategy, within_word};
use crate::table::{JumpTable, SiteField, TableError};
use crate::text::TextBuffer;
use crate::CodeAddress;
use alloc::vec::Vec;
use core::marker::PhantomData;

/// Builds a [`TextBuffer`] with branch sites and their jump table.
///
/// ```rust
/// # use kernel_jump_label::*;
/// static KEY: StaticKey = StaticKey::new_false();
///
/// let text = CodeAddress::new(0xFFFF_FFFF_8100_0000);
/// let mut builder =
///     TableBuilder::<X86_64, DirectOverwrite>::new(text, 0x1000, CodeAddress::new(0xFFFF_FFFF_8200_0000));
/// let site = builder.site(&KEY, false, text + 0x800).unwrap();
/// let image = builder.finish();
///
/// assert_eq!(image.table().len(), 1);
/// assert_eq!(image.table().get(0).unwrap().code(), site);
/// ```
pub struct TableBuilder<A, S> {
    text: TextBuffer,
    cursor: CodeAddress,
    table_base: CodeAddress,
    entries: Vec<JumpEntry>,
    _arch: PhantomData<(A, S)>,
}

/// A code image and the jump table describing its sites.
pub struct BuiltImage {
    pub text: TextBuffer,
    pub entries: Vec<JumpEntry>,
    pub table_base: CodeAddress,
}

impl BuiltImage {
    #[must_use]
    pub fn table(&self) -> JumpTable<'_> {
        JumpTable::new(self.table_base, &self.entries)
    }
}

impl<A: Arch, S: PatchStrategy> TableBuilder<A, S> {
    /// An empty image of `text_len` bytes at `text_base`; the table will be
    /// placed at `table_base`.
    ///
    /// # Panics
    /// If `table_base` is not aligned for jump table records.
    #[must_use]
    pub fn new(text_base: CodeAddress, text_len: usize, table_base: CodeAddress) -> Self {
        assert!(
            table_base.is_aligned(JUMP_ENTRY_ALIGN as u64),
            "misaligned jump table"
        );
        Self {
            text: TextBuffer::new(text_base, text_len),
            cursor: text_base,
            table_base,
            entries: Vec::new(),
            _arch: PhantomData,
        }
    }

    /// Emits a site of the default width at the next free address.
    ///
    /// Strategies that replace a site with one store get the site moved up to
    /// the next 8-byte boundary if it would straddle one, as the emission
    /// macros do.
    ///
    /// # Errors
    /// See [`site_at`](Self::site_at).
    pub fn site(
        &mut self,
        key: &StaticKey,
        branch: bool,
        label: CodeAddress,
    ) -> Result<CodeAddress, TableError> {
        let mut code = self.cursor;
        if S::SINGLE_WORD_SITES && !within_word(code, A::SITE_LEN) {
            code = code.align_up(8);
        }
        self.site_at(code, A::SITE_LEN, key, branch, label)?;
        Ok(code)
    }

    /// Emits a `len`-byte site at `code` for `key`, taking `label` when it
    /// jumps. `branch` selects the "likely" polarity.
    ///
    /// The site is emitted in the form the strategy compiles to: a jump for
    /// trap-assisted builds, otherwise whatever the key's declared default
    /// requires.
    ///
    /// # Errors
    /// The site does not fit the image, the label is out of jump range, or
    /// the record cannot reach the site or label.
    pub fn site_at(
        &mut self,
        code: CodeAddress,
        len: usize,
        key: &StaticKey,
        branch: bool,
        label: CodeAddress,
    ) -> Result<(), TableError> {
        let encode = |ty| {
            A::encode(ty, code, label, len).map_err(|source| TableError::Encode {
                code,
                target: label,
                source,
            })
        };
        let jmp = encode(JumpType::Jmp)?;
        let compiled = if S::COMPILED_AS_JUMP {
            jmp
        } else {
            encode(JumpType::for_state(key.default_enabled(), branch))?
        };

        let index = self.entries.len();
        let record = self.record_address(index);
        let entry = JumpEntry::locate(
            record,
            code,
            label,
            key.address(),
            KeyFlags::new().with_branch(branch),
        )
        .ok_or(TableError::OutOfReach { record, addr: code })?;

        self.text
            .load(code, &compiled)
            .map_err(|_| TableError::Dangling {
                index,
                record,
                field: SiteField::Code,
                addr: code,
            })?;
        self.cursor = self.cursor.max(code + len as u64);
        self.entries.push(entry);
        Ok(())
    }

    /// Fills `[addr, addr + bytes.len())` with ordinary code.
    ///
    /// # Errors
    /// The range is outside the image.
    pub fn fill(&mut self, addr: CodeAddress, bytes: &[u8]) -> Result<(), TableError> {
        self.text
            .load(addr, bytes)
            .map_err(|_| TableError::Unreadable { code: addr })
    }

    /// Hands out the image and its records.
    #[must_use]
    pub fn finish(self) -> BuiltImage {
        BuiltImage {
            text: self.text,
            entries: self.entries,
            table_base: self.table_base,
        }
    }

    fn record_address(&self, index: usize) -> CodeAddress {
        self.table_base + (index * JUMP_ENTRY_SIZE) as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::{Aarch64, X86_64};
    use crate::strategy::{DirectOverwrite, TrapAssisted};

    const TEXT: CodeAddress = CodeAddress::new(0xFFFF_FFFF_8100_0000);
    const TABLE: CodeAddress = CodeAddress::new(0xFFFF_FFFF_8200_0000);

    #[test]
    fn records_resolve_to_their_sites() {
        static KEY: StaticKey = StaticKey::new_false();
        let mut b = TableBuilder::<Aarch64, DirectOverwrite>::new(TEXT, 0x100, TABLE);
        let a = b.site(&KEY, false, TEXT + 0x40).unwrap();
        let c = b.site(&KEY, true, TEXT + 0x80).unwrap();
        assert_eq!(c, a + 4);

        let image = b.finish();
        let table = image.table();
        let second = table.get(1).unwrap();
        assert_eq!(second.record_address(), TABLE + 16);
        assert_eq!(second.code(), c);
        assert_eq!(second.target(), TEXT + 0x80);
        assert_eq!(second.key(), KEY.address());
        assert!(second.branch());

        // likely site of a disabled key starts out as the branch
        assert_eq!(image.text.bytes_at(c, 4), Some(&0x1400_001f_u32.to_le_bytes()[..]));
    }

    #[test]
    fn trap_assisted_sites_start_as_jumps() {
        static KEY: StaticKey = StaticKey::new_false();
        let mut b = TableBuilder::<X86_64, TrapAssisted>::new(TEXT, 0x100, TABLE);
        let site = b.site(&KEY, false, TEXT + 0x45).unwrap();
        b.fill(TEXT + 0x45, &[0xc3]).unwrap();
        assert!(b.fill(TEXT + 0xff, &[0x90, 0x90]).is_err());
        let image = b.finish();
        assert_eq!(image.text.bytes_at(site, 5), Some(&[0xe9, 0x40, 0, 0, 0][..]));
        assert_eq!(image.text.bytes_at(TEXT + 0x45, 1), Some(&[0xc3][..]));
    }

    #[test]
    fn direct_sites_stay_within_one_word() {
        static KEY: StaticKey = StaticKey::new_false();
        let mut b = TableBuilder::<X86_64, DirectOverwrite>::new(TEXT, 0x100, TABLE);
        let sites: Vec<_> = (0..4).map(|_| b.site(&KEY, false, TEXT + 0x80).unwrap()).collect();
        assert_eq!(sites, [TEXT, TEXT + 8, TEXT + 16, TEXT + 24]);

        let mut b = TableBuilder::<X86_64, TrapAssisted>::new(TEXT, 0x100, TABLE);
        b.site(&KEY, false, TEXT + 0x80).unwrap();
        assert_eq!(b.site(&KEY, false, TEXT + 0x80).unwrap(), TEXT + 5);
    }

    #[test]
    fn far_records_are_rejected() {
        static KEY: StaticKey = StaticKey::new_false();
        let far = CodeAddress::new(0xFFFF_FFFF_0000_0000);
        let mut b = TableBuilder::<X86_64, DirectOverwrite>::new(TEXT, 0x100, far);
        assert_eq!(
            b.site(&KEY, false, TEXT + 0x45),
            Err(TableError::OutOfReach {
                record: far,
                addr: TEXT
            })
        );

        let mut b = TableBuilder::<X86_64, DirectOverwrite>::new(TEXT, 0x100, TABLE);
        assert!(matches!(
            b.site_at(TEXT + 0xfe, 5, &KEY, false, TEXT),
            Err(TableError::Dangling {
                field: SiteField::Code,
                ..
            })
        ));
    }
}
