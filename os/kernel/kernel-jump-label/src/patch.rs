//! # Applying site encodings
//!
//! [`Patcher::apply`] is the runtime half of a branch site: it finds the site
//! a record points at, derives the no-op or the jump to the record's label,
//! and rewrites the site through the configured [`PatchStrategy`].
//!
//! Sites are verified before they are written: a site must hold either its
//! own no-op or its own jump. Anything else means the text or the table is
//! corrupt, and the patcher refuses to touch it.

extern crate alloc;

use crate::arch::{Arch, EncodeError, Insn, MAX_INSN_LEN};
use crate::entry::{BranchSite, JumpType};
use crate::strategy::{POKE_BATCH_MAX, PatchStrategy, PendingPoke, TrapSlots};
use crate::text::{TextError, TextPoke};
use crate::CodeAddress;
use alloc::vec::Vec;
use core::marker::PhantomData;
use log::trace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("unexpected op at {code}: {found:?}")]
    UnexpectedOp { code: CodeAddress, found: Insn },
    #[error("site {code} cannot jump to {target}: {source}")]
    Encode {
        code: CodeAddress,
        target: CodeAddress,
        #[source]
        source: EncodeError,
    },
    #[error(transparent)]
    Text(#[from] TextError),
}

/// Rewrites branch sites in `T` for architecture `A` using strategy `S`.
///
/// The patcher is not synchronized; it is meant to be reached only through
/// the patch lock of a [`JumpLabel`](crate::JumpLabel), or exclusively during
/// early boot.
pub struct Patcher<'s, A, T, S> {
    text: T,
    traps: &'s TrapSlots,
    queue: Vec<PendingPoke>,
    _arch: PhantomData<(A, S)>,
}

impl<'s, A, T, S> Patcher<'s, A, T, S>
where
    A: Arch,
    T: TextPoke,
    S: PatchStrategy,
{
    #[must_use]
    pub fn new(text: T, traps: &'s TrapSlots) -> Self {
        Self {
            text,
            traps,
            queue: Vec::with_capacity(POKE_BATCH_MAX),
            _arch: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn text(&self) -> &T {
        &self.text
    }

    #[inline]
    pub const fn text_mut(&mut self) -> &mut T {
        &mut self.text
    }

    #[must_use]
    pub fn into_text(self) -> T {
        self.text
    }

    /// Rewrites `site` to `ty` and synchronizes.
    ///
    /// Applying the encoding a site already holds writes nothing.
    ///
    /// # Panics
    /// If the site holds an unexpected instruction, its label is out of jump
    /// range, or it is not part of the text. None of these can be recovered
    /// from once the kernel is running on that text.
    pub fn apply(&mut self, site: &BranchSite, ty: JumpType) {
        if let Err(err) = self.try_apply(site, ty) {
            fatal(&err);
        }
    }

    /// [`apply`](Self::apply), reporting failures instead of panicking.
    ///
    /// Returns whether the site was written.
    ///
    /// # Errors
    /// See [`PatchError`].
    pub fn try_apply(&mut self, site: &BranchSite, ty: JumpType) -> Result<bool, PatchError> {
        let queued = self.queue(site, ty)?;
        self.flush()?;
        Ok(queued)
    }

    /// Adds `site` to the current batch if it does not already hold `ty`.
    ///
    /// A full batch is written out before the site is added.
    ///
    /// # Errors
    /// See [`PatchError`].
    pub fn queue(&mut self, site: &BranchSite, ty: JumpType) -> Result<bool, PatchError> {
        let Some(poke) = self.prepare(site, ty)? else {
            return Ok(false);
        };
        if self.queue.len() == POKE_BATCH_MAX {
            self.flush()?;
        }
        self.queue.push(poke);
        Ok(true)
    }

    /// Writes all queued sites.
    ///
    /// # Errors
    /// See [`PatchError`].
    pub fn flush(&mut self) -> Result<(), PatchError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        trace!(
            "jump label: writing {} site(s) ({}, {})",
            self.queue.len(),
            A::NAME,
            S::NAME
        );
        let result = S::write_batch::<A, T>(&mut self.text, self.traps, &self.queue);
        self.queue.clear();
        result.map_err(PatchError::from)
    }

    /// The encoding `site` currently holds.
    ///
    /// # Errors
    /// See [`PatchError`].
    pub fn current(&self, site: &BranchSite) -> Result<JumpType, PatchError> {
        let decoded = self.decode(site)?;
        if decoded.found == decoded.nop {
            Ok(JumpType::Nop)
        } else if decoded.found == decoded.jmp {
            Ok(JumpType::Jmp)
        } else {
            Err(PatchError::UnexpectedOp {
                code: site.code(),
                found: decoded.found,
            })
        }
    }

    fn prepare(&self, site: &BranchSite, ty: JumpType) -> Result<Option<PendingPoke>, PatchError> {
        let code = site.code();
        let decoded = self.decode(site)?;
        let (want, other) = match ty {
            JumpType::Nop => (decoded.nop, decoded.jmp),
            JumpType::Jmp => (decoded.jmp, decoded.nop),
        };

        if decoded.found == want {
            return Ok(None);
        }
        if decoded.found != other {
            return Err(PatchError::UnexpectedOp {
                code,
                found: decoded.found,
            });
        }

        trace!("jump label: {code}: {:?} -> {want:?}", decoded.found);
        let resume = match ty {
            JumpType::Jmp => site.target(),
            JumpType::Nop => code + want.len() as u64,
        };
        Ok(Some(PendingPoke {
            site: code,
            insn: want,
            resume,
        }))
    }

    fn decode(&self, site: &BranchSite) -> Result<Decoded, PatchError> {
        let code = site.code();
        let target = site.target();

        let mut buf = [0u8; MAX_INSN_LEN];
        self.text.read(code, &mut buf[..A::PROBE_LEN])?;
        let len = A::site_len(&buf[..A::PROBE_LEN]).map_err(|_| PatchError::UnexpectedOp {
            code,
            found: Insn::from_slice(&buf[..A::PROBE_LEN]),
        })?;
        self.text.read(code, &mut buf[..len])?;

        let encode = |ty| {
            A::encode(ty, code, target, len).map_err(|source| PatchError::Encode {
                code,
                target,
                source,
            })
        };
        Ok(Decoded {
            found: Insn::from_slice(&buf[..len]),
            nop: encode(JumpType::Nop)?,
            jmp: encode(JumpType::Jmp)?,
        })
    }
}

struct Decoded {
    found: Insn,
    nop: Insn,
    jmp: Insn,
}

/// Patch failures leave the kernel's own text in an unknown state.
#[cold]
pub(crate) fn fatal(err: &PatchError) -> ! {
    panic!("jump label: {err}")
}
