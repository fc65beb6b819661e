//! # Writing into code
//!
//! [`TextPoke`] is the single narrow primitive through which instruction bytes
//! are modified. Every poke must be followed by [`TextPoke::sync_core`] before
//! the new bytes may be assumed visible to instruction fetch.

extern crate alloc;

use crate::CodeAddress;
use crate::arch::Insn;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    #[error("{len} bytes at {addr} are outside the text")]
    OutOfBounds { addr: CodeAddress, len: usize },
    #[error("{len} bytes at {addr} cannot be replaced by one aligned store")]
    Straddles { addr: CodeAddress, len: usize },
}

/// Read access to code.
pub trait CodeRead {
    /// Copies `buf.len()` bytes starting at `addr`.
    ///
    /// # Errors
    /// The range is not part of the text.
    fn read(&self, addr: CodeAddress, buf: &mut [u8]) -> Result<(), TextError>;
}

/// Write access to code that may be executing concurrently.
pub trait TextPoke: CodeRead {
    /// Stores `bytes` at `addr`.
    ///
    /// Concurrent instruction fetch may observe the store only after the next
    /// [`sync_core`](Self::sync_core).
    ///
    /// # Errors
    /// The range is not part of the text.
    fn poke(&mut self, addr: CodeAddress, bytes: &[u8]) -> Result<(), TextError>;

    /// Makes all previous pokes visible to instruction fetch on every CPU.
    fn sync_core(&mut self);
}

/// One recorded store.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Poke {
    pub addr: CodeAddress,
    pub bytes: Insn,
}

/// A code image held in memory.
///
/// Keeps a journal of pokes and synchronization points, which makes the
/// exact write sequence of a patch pass observable.
#[derive(Debug, Clone)]
pub struct TextBuffer {
    base: CodeAddress,
    bytes: Vec<u8>,
    journal: Vec<Poke>,
    syncs: usize,
}

impl TextBuffer {
    /// `len` zero bytes loaded at `base`.
    #[must_use]
    pub fn new(base: CodeAddress, len: usize) -> Self {
        Self::from_bytes(base, vec![0; len])
    }

    #[must_use]
    pub const fn from_bytes(base: CodeAddress, bytes: Vec<u8>) -> Self {
        Self {
            base,
            bytes,
            journal: Vec::new(),
            syncs: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> CodeAddress {
        self.base
    }

    #[must_use]
    pub fn range(&self) -> Range<CodeAddress> {
        self.base..self.base + self.bytes.len() as u64
    }

    #[must_use]
    pub fn bytes_at(&self, addr: CodeAddress, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(addr.as_u64().checked_sub(self.base.as_u64())?).ok()?;
        self.bytes.get(start..start.checked_add(len)?)
    }

    /// Places bytes without journaling them, the way a linker lays out an image.
    ///
    /// # Errors
    /// The range is outside the buffer.
    pub fn load(&mut self, addr: CodeAddress, bytes: &[u8]) -> Result<(), TextError> {
        self.slot(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Pokes since creation or the last [`clear_journal`](Self::clear_journal).
    #[must_use]
    pub fn journal(&self) -> &[Poke] {
        &self.journal
    }

    #[must_use]
    pub const fn sync_count(&self) -> usize {
        self.syncs
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
        self.syncs = 0;
    }

    fn slot(&mut self, addr: CodeAddress, len: usize) -> Result<&mut [u8], TextError> {
        let oob = TextError::OutOfBounds { addr, len };
        let start = addr
            .as_u64()
            .checked_sub(self.base.as_u64())
            .and_then(|off| usize::try_from(off).ok())
            .ok_or(oob)?;
        let end = start.checked_add(len).ok_or(oob)?;
        self.bytes.get_mut(start..end).ok_or(oob)
    }
}

impl CodeRead for TextBuffer {
    fn read(&self, addr: CodeAddress, buf: &mut [u8]) -> Result<(), TextError> {
        let src = self.bytes_at(addr, buf.len()).ok_or(TextError::OutOfBounds {
            addr,
            len: buf.len(),
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

impl TextPoke for TextBuffer {
    fn poke(&mut self, addr: CodeAddress, bytes: &[u8]) -> Result<(), TextError> {
        self.slot(addr, bytes.len())?.copy_from_slice(bytes);
        self.journal.push(Poke {
            addr,
            bytes: Insn::from_slice(bytes),
        });
        Ok(())
    }

    fn sync_core(&mut self) {
        self.syncs += 1;
    }
}

/// The running kernel's own text.
///
/// Stores go straight to the instruction bytes. A site that lies within one
/// naturally aligned 64-bit word is replaced with a single store, so a
/// concurrent fetch sees either the old or the new instruction.
#[cfg(feature = "asm")]
pub struct KernelText {
    /// Invoked after the local synchronization, e.g. to IPI the other CPUs
    /// into a serializing instruction. Must not return before every CPU has
    /// acknowledged.
    remote_sync: Option<fn()>,
    dirty: Option<Range<u64>>,
}

#[cfg(feature = "asm")]
impl KernelText {
    /// # Safety
    /// Every address handed to [`TextPoke::poke`] must be mapped and writable
    /// through its own address, and no other writer may exist. `remote_sync`
    /// must wait until every other CPU has executed a serializing instruction
    /// outside of any breakpoint handler.
    #[must_use]
    pub const unsafe fn new(remote_sync: Option<fn()>) -> Self {
        Self {
            remote_sync,
            dirty: None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn store(addr: u64, bytes: &[u8]) {
        let word = addr & !7;
        let shift = addr - word;
        if shift as usize + bytes.len() <= 8 {
            let ptr = word as usize as *mut u64;
            // SAFETY: `KernelText::new` contract; the word is aligned and mapped.
            let mut le = unsafe { ptr.read_volatile() }.to_le_bytes();
            le[shift as usize..shift as usize + bytes.len()].copy_from_slice(bytes);
            // SAFETY: as above.
            unsafe { ptr.write_volatile(u64::from_le_bytes(le)) };
        } else {
            // Not atomic. Only reached for tails behind an armed breakpoint.
            // SAFETY: `KernelText::new` contract.
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as usize as *mut u8, bytes.len());
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn sync_local(_dirty: &Range<u64>) {
        // CPUID is serializing.
        #[allow(unused_unsafe)]
        let _ = unsafe { core::arch::x86_64::__cpuid(0) };
    }

    #[cfg(target_arch = "aarch64")]
    fn sync_local(dirty: &Range<u64>) {
        let ctr: u64;
        unsafe {
            core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
        }
        let dline = 4u64 << ((ctr >> 16) & 0xf);
        let iline = 4u64 << (ctr & 0xf);

        let mut line = dirty.start & !(dline - 1);
        while line < dirty.end {
            unsafe { core::arch::asm!("dc cvau, {}", in(reg) line, options(nostack, preserves_flags)) };
            line += dline;
        }
        unsafe { core::arch::asm!("dsb ish", options(nostack, preserves_flags)) };

        let mut line = dirty.start & !(iline - 1);
        while line < dirty.end {
            unsafe { core::arch::asm!("ic ivau, {}", in(reg) line, options(nostack, preserves_flags)) };
            line += iline;
        }
        unsafe { core::arch::asm!("dsb ish", "isb", options(nostack, preserves_flags)) };
    }

    #[cfg(target_arch = "riscv64")]
    fn sync_local(_dirty: &Range<u64>) {
        unsafe { core::arch::asm!("fence.i", options(nostack, preserves_flags)) };
    }
}

#[cfg(feature = "asm")]
impl CodeRead for KernelText {
    fn read(&self, addr: CodeAddress, buf: &mut [u8]) -> Result<(), TextError> {
        // SAFETY: `KernelText::new` contract.
        unsafe {
            core::ptr::copy_nonoverlapping(
                addr.as_u64() as usize as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }
}

#[cfg(feature = "asm")]
impl TextPoke for KernelText {
    fn poke(&mut self, addr: CodeAddress, bytes: &[u8]) -> Result<(), TextError> {
        let start = addr.as_u64();
        let end = start
            .checked_add(bytes.len() as u64)
            .ok_or(TextError::OutOfBounds {
                addr,
                len: bytes.len(),
            })?;
        Self::store(start, bytes);
        self.dirty = Some(match self.dirty.take() {
            Some(d) => d.start.min(start)..d.end.max(end),
            None => start..end,
        });
        Ok(())
    }

    fn sync_core(&mut self) {
        let dirty = self.dirty.take().unwrap_or(0..0);
        Self::sync_local(&dirty);
        if let Some(remote) = self.remote_sync {
            remote();
        }
    }
}
