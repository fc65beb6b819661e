//! # Patch strategies
//!
//! How a batch of new site encodings reaches the text is fixed per target at
//! build time:
//!
//! * [`DirectOverwrite`] stores each encoding in one go. Only sound where a
//!   site is replaced by a single store that instruction fetch cannot observe
//!   half-done, so it refuses any site that does not fit one naturally aligned
//!   8-byte word.
//! * [`TrapAssisted`] first arms every site with a breakpoint, rewrites the
//!   tails, and only then replaces the heads. A CPU that executes a site in the
//!   meantime traps, and [`TrapSlots::handle_trap`] tells the handler where the
//!   *new* instruction would have gone.
//!
//! The `trap-assisted` cargo feature picks [`DefaultStrategy`].

use crate::arch::{Arch, Insn};
use crate::text::{TextError, TextPoke};
use crate::CodeAddress;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use log::trace;

/// Upper bound of sites rewritten per synchronization round.
pub const POKE_BATCH_MAX: usize = 256;

/// A site rewrite that has been decided but not yet written.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PendingPoke {
    /// First byte of the site.
    pub site: CodeAddress,
    /// The encoding to store.
    pub insn: Insn,
    /// Where execution continues after the new instruction.
    pub resume: CodeAddress,
}

pub trait PatchStrategy {
    const NAME: &'static str;

    /// Whether branch sites are emitted as jumps rather than no-ops.
    const COMPILED_AS_JUMP: bool;

    /// Whether every site must lie within one aligned 8-byte word.
    const SINGLE_WORD_SITES: bool;

    /// Writes `batch` and synchronizes.
    ///
    /// # Errors
    /// A poke fell outside the text, which may then be partially patched, or
    /// the strategy cannot replace a site atomically, in which case nothing
    /// was written.
    fn write_batch<A: Arch, T: TextPoke>(
        text: &mut T,
        traps: &TrapSlots,
        batch: &[PendingPoke],
    ) -> Result<(), TextError>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirectOverwrite;

impl PatchStrategy for DirectOverwrite {
    const NAME: &'static str = "direct";
    const COMPILED_AS_JUMP: bool = false;
    const SINGLE_WORD_SITES: bool = true;

    fn write_batch<A: Arch, T: TextPoke>(
        text: &mut T,
        _traps: &TrapSlots,
        batch: &[PendingPoke],
    ) -> Result<(), TextError> {
        if let Some(poke) = batch.iter().find(|p| !within_word(p.site, p.insn.len())) {
            return Err(TextError::Straddles {
                addr: poke.site,
                len: poke.insn.len(),
            });
        }
        for poke in batch {
            text.poke(poke.site, &poke.insn)?;
        }
        text.sync_core();
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TrapAssisted;

impl PatchStrategy for TrapAssisted {
    const NAME: &'static str = "trap-assisted";
    const COMPILED_AS_JUMP: bool = true;
    const SINGLE_WORD_SITES: bool = false;

    fn write_batch<A: Arch, T: TextPoke>(
        text: &mut T,
        traps: &TrapSlots,
        batch: &[PendingPoke],
    ) -> Result<(), TextError> {
        let head = A::BREAKPOINT.len();
        let armed = traps.arm(batch);

        let result = (|| -> Result<(), TextError> {
            for poke in batch {
                text.poke(poke.site, A::BREAKPOINT)?;
            }
            text.sync_core();

            let mut tails = false;
            for poke in batch.iter().filter(|p| p.insn.len() > head) {
                text.poke(poke.site + head as u64, &poke.insn[head..])?;
                tails = true;
            }
            if tails {
                text.sync_core();
            }

            for poke in batch {
                text.poke(poke.site, &poke.insn[..head])?;
            }
            text.sync_core();
            Ok(())
        })();

        drop(armed);
        result
    }
}

/// Whether `len` bytes at `site` lie within one naturally aligned 8-byte word.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn within_word(site: CodeAddress, len: usize) -> bool {
    (site.as_u64() & 7) as usize + len <= 8
}

#[cfg(not(feature = "trap-assisted"))]
pub type DefaultStrategy = DirectOverwrite;

#[cfg(feature = "trap-assisted")]
pub type DefaultStrategy = TrapAssisted;

struct TrapSlot {
    site: AtomicU64,
    resume: AtomicU64,
}

impl TrapSlot {
    const fn new() -> Self {
        Self {
            site: AtomicU64::new(0),
            resume: AtomicU64::new(0),
        }
    }
}

/// Sites currently armed with a breakpoint.
///
/// The breakpoint handler must reach this without taking the patch lock (the
/// patching CPU holds it), so it usually lives in a `static` next to the
/// handler.
///
/// Slots are disarmed right after the last synchronization of a batch. A CPU
/// that trapped on an armed site must therefore have reached
/// [`handle_trap`](Self::handle_trap) before that synchronization completes:
/// the handler runs with interrupts disabled, and the text's remote
/// synchronization waits for every CPU to acknowledge it.
pub struct TrapSlots {
    slots: [TrapSlot; POKE_BATCH_MAX],
    armed: AtomicUsize,
    /// Handlers currently inspecting `slots`.
    readers: AtomicUsize,
}

impl Default for TrapSlots {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapSlots {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { TrapSlot::new() }; POKE_BATCH_MAX],
            armed: AtomicUsize::new(0),
            readers: AtomicUsize::new(0),
        }
    }

    /// Called by the breakpoint handler with the address of the trapping
    /// instruction.
    ///
    /// Returns the address execution must continue at, or `None` if the trap
    /// was not raised by a site being patched.
    ///
    /// Must be called before the handler re-enables interrupts.
    pub fn handle_trap(&self, addr: CodeAddress) -> Option<CodeAddress> {
        // Pairs with the disarm in `ArmedGuard::drop`: either the patcher sees
        // this reader, or this reader sees the slots disarmed.
        self.readers.fetch_add(1, Ordering::SeqCst);
        let armed = self.armed.load(Ordering::SeqCst);
        let resume = self.slots[..armed]
            .iter()
            .find(|slot| slot.site.load(Ordering::Relaxed) == addr.as_u64())
            .map(|slot| CodeAddress::new(slot.resume.load(Ordering::Relaxed)));
        self.readers.fetch_sub(1, Ordering::Release);

        if let Some(resume) = resume {
            trace!("jump label trap at {addr}, resuming at {resume}");
        }
        resume
    }

    /// Number of sites currently armed.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.armed.load(Ordering::Acquire)
    }

    fn arm(&self, batch: &[PendingPoke]) -> ArmedGuard<'_> {
        assert!(batch.len() <= POKE_BATCH_MAX, "poke batch too large");
        for (slot, poke) in self.slots.iter().zip(batch) {
            slot.site.store(poke.site.as_u64(), Ordering::Relaxed);
            slot.resume.store(poke.resume.as_u64(), Ordering::Relaxed);
        }
        // Publish the slots before the first breakpoint becomes visible.
        self.armed.store(batch.len(), Ordering::Release);
        ArmedGuard { traps: self }
    }
}

/// Disarms on drop, then waits until no handler still looks at the slots.
struct ArmedGuard<'a> {
    traps: &'a TrapSlots,
}

impl Drop for ArmedGuard<'_> {
    fn drop(&mut self) {
        self.traps.armed.store(0, Ordering::SeqCst);
        while self.traps.readers.load(Ordering::SeqCst) != 0 {
            spin_loop();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::X86_64;
    use crate::text::{CodeRead, TextBuffer};

    const BASE: CodeAddress = CodeAddress::new(0xFFFF_FFFF_8100_0000);

    fn jmp(site: CodeAddress) -> PendingPoke {
        PendingPoke {
            site,
            insn: Insn::from_slice(&[0xe9, 0x10, 0, 0, 0]),
            resume: site.offset_by(0x15),
        }
    }

    #[test]
    fn direct_overwrite_is_one_store_per_site() {
        let mut text = TextBuffer::new(BASE, 32);
        let traps = TrapSlots::new();
        let batch = [jmp(BASE), jmp(BASE + 8)];

        DirectOverwrite::write_batch::<X86_64, _>(&mut text, &traps, &batch).unwrap();

        assert_eq!(text.journal().len(), 2);
        assert_eq!(text.sync_count(), 1);
        assert_eq!(text.bytes_at(BASE + 8, 5), Some(&[0xe9, 0x10, 0, 0, 0][..]));
    }

    #[test]
    fn direct_overwrite_refuses_sites_across_words() {
        let mut text = TextBuffer::new(BASE, 32);
        let traps = TrapSlots::new();
        let batch = [jmp(BASE), jmp(BASE + 0xc)];

        assert_eq!(
            DirectOverwrite::write_batch::<X86_64, _>(&mut text, &traps, &batch),
            Err(TextError::Straddles {
                addr: BASE + 0xc,
                len: 5
            })
        );
        assert!(text.journal().is_empty());
        assert_eq!(text.sync_count(), 0);

        assert!(within_word(BASE + 3, 5));
        assert!(!within_word(BASE + 4, 5));
        assert!(within_word(BASE + 6, 2));
    }

    #[test]
    fn trap_assisted_arms_then_tails_then_heads() {
        let mut text = TextBuffer::new(BASE, 32);
        let traps = TrapSlots::new();
        let batch = [jmp(BASE), jmp(BASE + 8)];

        TrapAssisted::write_batch::<X86_64, _>(&mut text, &traps, &batch).unwrap();

        let journal: Vec<_> = text
            .journal()
            .iter()
            .map(|p| (p.addr.displacement_from(BASE), p.bytes.to_vec()))
            .collect();
        assert_eq!(
            journal,
            [
                (0, vec![0xcc]),
                (8, vec![0xcc]),
                (1, vec![0x10, 0, 0, 0]),
                (9, vec![0x10, 0, 0, 0]),
                (0, vec![0xe9]),
                (8, vec![0xe9]),
            ]
        );
        assert_eq!(text.sync_count(), 3);
        assert_eq!(traps.armed(), 0);
        assert_eq!(traps.handle_trap(BASE), None);
    }

    /// Executes the site from inside the patch window.
    struct Racing<'a> {
        text: TextBuffer,
        traps: &'a TrapSlots,
        observed: Vec<Option<CodeAddress>>,
    }

    impl CodeRead for Racing<'_> {
        fn read(&self, addr: CodeAddress, buf: &mut [u8]) -> Result<(), TextError> {
            self.text.read(addr, buf)
        }
    }

    impl TextPoke for Racing<'_> {
        fn poke(&mut self, addr: CodeAddress, bytes: &[u8]) -> Result<(), TextError> {
            self.text.poke(addr, bytes)
        }

        fn sync_core(&mut self) {
            self.text.sync_core();
            if self.text.bytes_at(BASE, 1) == Some(&[0xcc]) {
                self.observed.push(self.traps.handle_trap(BASE));
            }
        }
    }

    #[test]
    fn trap_during_patch_resumes_at_new_destination() {
        let traps = TrapSlots::new();
        let mut racing = Racing {
            text: TextBuffer::new(BASE, 16),
            traps: &traps,
            observed: Vec::new(),
        };

        TrapAssisted::write_batch::<X86_64, _>(&mut racing, &traps, &[jmp(BASE)]).unwrap();

        // armed after the first and second round, resolved after the third
        assert_eq!(racing.observed, [Some(BASE.offset_by(0x15)); 2]);
        assert_eq!(traps.handle_trap(BASE), None);
    }

    #[test]
    fn handlers_never_see_a_stale_slot() {
        const ROUNDS: usize = 2_000;
        let traps = TrapSlots::new();
        let other = BASE + 0x10;
        let done = core::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    // BASE is only ever armed with its own resume address
                    let resume = traps.handle_trap(BASE);
                    assert!(resume.is_none() || resume == Some(BASE.offset_by(0x15)));
                }
            });

            let mut text = TextBuffer::new(BASE, 32);
            for round in 0..ROUNDS {
                let batch = if round % 2 == 0 { jmp(BASE) } else { jmp(other) };
                TrapAssisted::write_batch::<X86_64, _>(&mut text, &traps, &[batch]).unwrap();
                text.clear_journal();
            }
            done.store(true, Ordering::Relaxed);
        });

        assert_eq!(traps.armed(), 0);
    }
}
