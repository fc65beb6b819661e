//! # The jump table
//!
//! A [`JumpTable`] is the linker-collected array of [`JumpEntry`] records plus
//! the address it is loaded at. The records themselves are only meaningful
//! relative to their own position, so the table never hands out a bare record:
//! iteration yields [`BranchSite`]s.

extern crate alloc;

use crate::arch::{Arch, EncodeError, Insn};
use crate::entry::{BranchSite, JUMP_ENTRY_ALIGN, JUMP_ENTRY_SIZE, JumpEntry, JumpType};
use crate::text::CodeRead;
use crate::CodeAddress;
use alloc::vec::Vec;

/// Where code and key cells may live in an image.
pub trait ImageLayout {
    /// Whether `[addr, addr + len)` is executable text.
    fn is_text(&self, addr: CodeAddress, len: u64) -> bool;

    /// Whether a key cell may live at `addr`.
    fn is_data(&self, addr: CodeAddress) -> bool;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SiteField {
    Code,
    Target,
    Key,
}

impl core::fmt::Display for SiteField {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Self::Code => "code",
            Self::Target => "target",
            Self::Key => "key",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("jump table at {0} is not {JUMP_ENTRY_ALIGN}-byte aligned")]
    Misaligned(CodeAddress),
    #[error("jump table size {0} is not a multiple of {JUMP_ENTRY_SIZE}")]
    Truncated(usize),
    #[error("record {index} at {record}: {field} points outside the image ({addr})")]
    Dangling {
        index: usize,
        record: CodeAddress,
        field: SiteField,
        addr: CodeAddress,
    },
    #[error("record at {record} cannot reach {addr} with a 32-bit displacement")]
    OutOfReach {
        record: CodeAddress,
        addr: CodeAddress,
    },
    #[error("site {code} cannot jump to {target}: {source}")]
    Encode {
        code: CodeAddress,
        target: CodeAddress,
        #[source]
        source: EncodeError,
    },
    #[error("site {code} holds {found:?}, which is neither its no-op nor its jump")]
    BadSite { code: CodeAddress, found: Insn },
    #[error("site {code} is still marked for build-time rewriting")]
    Unfinalized { code: CodeAddress },
    #[error("site {code} cannot be read")]
    Unreadable { code: CodeAddress },
}

/// Records and their load address.
#[derive(Copy, Clone, Debug)]
pub struct JumpTable<'a> {
    base: CodeAddress,
    entries: &'a [JumpEntry],
}

impl<'a> JumpTable<'a> {
    /// A table whose first record lives at `base`.
    ///
    /// Use this when the records are a copy of the loaded table, e.g. when
    /// inspecting an image file.
    #[must_use]
    pub const fn new(base: CodeAddress, entries: &'a [JumpEntry]) -> Self {
        Self { base, entries }
    }

    /// A table over records that live where they are.
    #[must_use]
    pub fn in_place(entries: &'a [JumpEntry]) -> Self {
        Self::new(CodeAddress::from_ptr(entries.as_ptr()), entries)
    }

    /// The table the linker collected between `__start___jump_table` and
    /// `__stop___jump_table`.
    ///
    /// # Safety
    /// The running image must have been linked with a `__jump_table` output
    /// section bracketed by those symbols.
    #[cfg(feature = "asm")]
    #[must_use]
    pub unsafe fn from_linker_section() -> JumpTable<'static> {
        unsafe extern "C" {
            static __start___jump_table: JumpEntry;
            static __stop___jump_table: JumpEntry;
        }

        #[allow(unused_unsafe)]
        let (start, stop) = unsafe { (&raw const __start___jump_table, &raw const __stop___jump_table) };
        let len = (stop as usize - start as usize) / JUMP_ENTRY_SIZE;
        // SAFETY: the linker places the records contiguously between the two symbols.
        JumpTable::in_place(unsafe { core::slice::from_raw_parts(start, len) })
    }

    /// Decodes the raw bytes of a `__jump_table` section loaded at `base`.
    ///
    /// # Errors
    /// The section is misaligned or not a whole number of records.
    pub fn parse(base: CodeAddress, bytes: &[u8]) -> Result<Vec<JumpEntry>, TableError> {
        if !base.is_aligned(JUMP_ENTRY_ALIGN as u64) {
            return Err(TableError::Misaligned(base));
        }
        let (records, rest) = bytes.as_chunks::<JUMP_ENTRY_SIZE>();
        if !rest.is_empty() {
            return Err(TableError::Truncated(bytes.len()));
        }
        Ok(records.iter().map(JumpEntry::from_bytes).collect())
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> CodeAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<BranchSite> {
        let entry = *self.entries.get(index)?;
        Some(entry.at(self.base + (index * JUMP_ENTRY_SIZE) as u64))
    }

    pub fn iter(&self) -> impl Iterator<Item = BranchSite> + '_ {
        (0..self.entries.len()).filter_map(|i| self.get(i))
    }

    /// Every site guarded by the key cell at `key`.
    pub fn sites_for(&self, key: CodeAddress) -> impl Iterator<Item = BranchSite> + '_ {
        self.iter().filter(move |site| site.key() == key)
    }

    /// Checks that every record points into the image.
    ///
    /// # Errors
    /// The first record whose site, label or key lies outside `layout`, or a
    /// record still carrying the build-time rewrite marker.
    pub fn validate(&self, layout: &impl ImageLayout) -> Result<(), TableError> {
        if !self.base.is_aligned(JUMP_ENTRY_ALIGN as u64) {
            return Err(TableError::Misaligned(self.base));
        }
        for (index, site) in self.iter().enumerate() {
            let dangling = |field, addr| TableError::Dangling {
                index,
                record: site.record_address(),
                field,
                addr,
            };
            if !layout.is_text(site.code(), 1) {
                return Err(dangling(SiteField::Code, site.code()));
            }
            if !layout.is_text(site.target(), 1) {
                return Err(dangling(SiteField::Target, site.target()));
            }
            if !layout.is_data(site.key()) {
                return Err(dangling(SiteField::Key, site.key()));
            }
            if site.is_hack() {
                return Err(TableError::Unfinalized { code: site.code() });
            }
        }
        Ok(())
    }

    /// Decodes every site and checks that it holds one of its two encodings
    /// and that its label is within jump range.
    ///
    /// Returns the number of sites currently taken.
    ///
    /// # Errors
    /// The first site that cannot be read, decoded or encoded.
    pub fn check_sites<A: Arch>(&self, text: &impl CodeRead) -> Result<usize, TableError> {
        let mut taken = 0;
        for site in self.iter() {
            if site_state::<A>(&site, text)? == JumpType::Jmp {
                taken += 1;
            }
        }
        Ok(taken)
    }
}

/// Which encoding `site` currently holds.
fn site_state<A: Arch>(site: &BranchSite, text: &impl CodeRead) -> Result<JumpType, TableError> {
    let code = site.code();
    let target = site.target();
    let unreadable = |_| TableError::Unreadable { code };

    let mut buf = [0u8; crate::arch::MAX_INSN_LEN];
    text.read(code, &mut buf[..A::PROBE_LEN]).map_err(unreadable)?;
    let len = A::site_len(&buf[..A::PROBE_LEN]).map_err(|_| TableError::BadSite {
        code,
        found: Insn::from_slice(&buf[..A::PROBE_LEN]),
    })?;
    text.read(code, &mut buf[..len]).map_err(unreadable)?;
    let found = Insn::from_slice(&buf[..len]);

    let encode = |ty| {
        A::encode(ty, code, target, len).map_err(|source| TableError::Encode {
            code,
            target,
            source,
        })
    };
    if found == encode(JumpType::Nop)? {
        Ok(JumpType::Nop)
    } else if found == encode(JumpType::Jmp)? {
        Ok(JumpType::Jmp)
    } else {
        Err(TableError::BadSite { code, found })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entry::KeyFlags;
    use core::ops::Range;

    struct Layout {
        text: Range<CodeAddress>,
        data: Range<CodeAddress>,
    }

    impl ImageLayout for Layout {
        fn is_text(&self, addr: CodeAddress, len: u64) -> bool {
            addr.span_within(len, &self.text)
        }

        fn is_data(&self, addr: CodeAddress) -> bool {
            addr.span_within(4, &self.data)
        }
    }

    const TEXT: u64 = 0xFFFF_FFFF_8100_0000;
    const TABLE: u64 = 0xFFFF_FFFF_8200_0000;
    const DATA: u64 = 0xFFFF_FFFF_8300_0000;

    fn layout() -> Layout {
        Layout {
            text: CodeAddress::new(TEXT)..CodeAddress::new(TEXT + 0x1000),
            data: CodeAddress::new(DATA)..CodeAddress::new(DATA + 0x100),
        }
    }

    fn record(index: u64, code: u64, target: u64, key: u64, flags: KeyFlags) -> JumpEntry {
        JumpEntry::locate(
            CodeAddress::new(TABLE + index * JUMP_ENTRY_SIZE as u64),
            CodeAddress::new(code),
            CodeAddress::new(target),
            CodeAddress::new(key),
            flags,
        )
        .unwrap()
    }

    #[test]
    fn sites_are_grouped_by_key() {
        let entries = [
            record(0, TEXT, TEXT + 0x100, DATA, KeyFlags::new()),
            record(1, TEXT + 0x10, TEXT + 0x200, DATA + 8, KeyFlags::new()),
            record(2, TEXT + 0x20, TEXT + 0x300, DATA, KeyFlags::new()),
        ];
        let table = JumpTable::new(CodeAddress::new(TABLE), &entries);
        let codes: Vec<_> = table
            .sites_for(CodeAddress::new(DATA))
            .map(|s| s.code().as_u64())
            .collect();
        assert_eq!(codes, [TEXT, TEXT + 0x20]);
        assert_eq!(table.get(1).unwrap().target().as_u64(), TEXT + 0x200);
        assert!(table.get(3).is_none());
    }

    #[test]
    fn validate_reports_dangling_offsets() {
        let entries = [
            record(0, TEXT, TEXT + 0x100, DATA, KeyFlags::new()),
            record(1, TEXT + 0x10, TEXT + 0x2000, DATA, KeyFlags::new()),
        ];
        let table = JumpTable::new(CodeAddress::new(TABLE), &entries);
        assert_eq!(
            table.validate(&layout()),
            Err(TableError::Dangling {
                index: 1,
                record: CodeAddress::new(TABLE + 16),
                field: SiteField::Target,
                addr: CodeAddress::new(TEXT + 0x2000),
            })
        );

        let keyless = [record(0, TEXT, TEXT + 0x100, TEXT, KeyFlags::new())];
        let table = JumpTable::new(CodeAddress::new(TABLE), &keyless);
        assert!(matches!(
            table.validate(&layout()),
            Err(TableError::Dangling {
                field: SiteField::Key,
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_unfinalized_sites() {
        let entries = [record(0, TEXT, TEXT + 0x100, DATA, KeyFlags::new().with_hack(true))];
        let table = JumpTable::new(CodeAddress::new(TABLE), &entries);
        assert_eq!(
            table.validate(&layout()),
            Err(TableError::Unfinalized {
                code: CodeAddress::new(TEXT)
            })
        );
    }

    #[test]
    fn parse_checks_shape() {
        let entry = record(0, TEXT, TEXT + 0x100, DATA, KeyFlags::new().with_branch(true));
        let mut bytes = entry.to_bytes().to_vec();
        bytes.extend_from_slice(&entry.to_bytes());

        let parsed = JumpTable::parse(CodeAddress::new(TABLE), &bytes).unwrap();
        assert_eq!(parsed, [entry, entry]);

        assert_eq!(
            JumpTable::parse(CodeAddress::new(TABLE), &bytes[..20]),
            Err(TableError::Truncated(20))
        );
        assert_eq!(
            JumpTable::parse(CodeAddress::new(TABLE + 4), &bytes),
            Err(TableError::Misaligned(CodeAddress::new(TABLE + 4)))
        );
    }
}
