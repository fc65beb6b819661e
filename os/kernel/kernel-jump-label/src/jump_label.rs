//! # Key state transitions
//!
//! A [`JumpLabel`] owns the jump table of an image and the patcher for its
//! text. Enabling or disabling a [`StaticKey`] only touches the text on the
//! edges between disabled and enabled:
//!
//! ```text
//!            enable (0 -> 1): patch all sites of the key
//!   Disabled ------------------------------------------> Enabled
//!   count 0  <------------------------------------------ count n > 0
//!            disable (1 -> 0): patch all sites back
//!
//!   enable / disable between n and n + 1 (n >= 1): count only
//! ```
//!
//! Counting between positive values is lock free. The edges, and every patch
//! pass, run under the patch lock.

use crate::arch::Arch;
use crate::key::StaticKey;
use crate::lock::PatchLock;
use crate::patch::{Patcher, fatal};
use crate::strategy::{PatchStrategy, TrapSlots};
use crate::table::JumpTable;
use crate::text::TextPoke;
use log::{debug, info, warn};

pub struct JumpLabel<'a, A, T, S> {
    table: JumpTable<'a>,
    patcher: PatchLock<Patcher<'a, A, T, S>>,
}

impl<'a, A, T, S> JumpLabel<'a, A, T, S>
where
    A: Arch,
    T: TextPoke,
    S: PatchStrategy,
{
    /// Manages the sites of `table`, which live in `text`.
    ///
    /// `traps` must be the slots the breakpoint handler consults when `S` is
    /// [`TrapAssisted`](crate::TrapAssisted).
    #[must_use]
    pub fn new(table: JumpTable<'a>, text: T, traps: &'a TrapSlots) -> Self {
        Self {
            table,
            patcher: PatchLock::new(Patcher::new(text, traps)),
        }
    }

    #[inline]
    #[must_use]
    pub const fn table(&self) -> &JumpTable<'a> {
        &self.table
    }

    /// Brings every site in agreement with the current state of its key.
    ///
    /// Run once before any site is relied upon: sites are emitted in a fixed
    /// form that need not match their key's declared default.
    ///
    /// # Safety
    /// Every record's key must be the address of a live [`StaticKey`].
    pub unsafe fn init(&self) {
        let mut patcher = self.patcher.lock();
        let mut patched = 0usize;
        for site in self.table.iter() {
            // SAFETY: guaranteed by the caller.
            let key = unsafe { &*(site.key().as_u64() as usize as *const StaticKey) };
            match patcher.queue(&site, site.desired(key.is_enabled())) {
                Ok(true) => patched += 1,
                Ok(false) => {}
                Err(err) => fatal(&err),
            }
        }
        if let Err(err) = patcher.flush() {
            fatal(&err);
        }
        info!(
            "jump label: {} site(s), {} patched at init ({}, {})",
            self.table.len(),
            patched,
            A::NAME,
            S::NAME
        );
    }

    /// Takes a reference on `key`; the first one switches its sites.
    pub fn enable(&self, key: &StaticKey) {
        if key.inc_if_enabled() {
            return;
        }

        let mut patcher = self.patcher.lock();
        if key.raw() == 0 {
            // Readers keep seeing "enabled" while the sites are in flux.
            key.set_raw(-1);
            self.update(&mut patcher, key, true);
            key.set_raw(1);
        } else if !key.inc_if_enabled() {
            warn!("static key {}: reference count overflow", key.address());
        }
    }

    /// Drops a reference on `key`; the last one switches its sites back.
    pub fn disable(&self, key: &StaticKey) {
        if key.dec_unless_last() {
            return;
        }

        let mut patcher = self.patcher.lock();
        if key.release_last() {
            self.update(&mut patcher, key, false);
        } else if !key.dec_unless_last() {
            warn!("static key {}: disabled more often than enabled", key.address());
        }
    }

    /// Forces `key` to exactly one or zero references.
    ///
    /// Enabling a key that already holds references leaves the count alone,
    /// and so does disabling a key that holds more than one.
    pub fn set_enabled(&self, key: &StaticKey, enabled: bool) {
        let mut patcher = self.patcher.lock();
        if enabled {
            let count = key.raw();
            if count > 0 {
                if count != 1 {
                    warn!("static key {}: set_enabled on a counted key ({count})", key.address());
                }
                return;
            }
            key.set_raw(-1);
            self.update(&mut patcher, key, true);
            key.set_raw(1);
        } else if key.release_last() {
            self.update(&mut patcher, key, false);
        } else {
            let count = key.raw();
            if count != 0 {
                warn!("static key {}: set_enabled on a counted key ({count})", key.address());
            }
        }
    }

    /// The number of enablers of `key`.
    #[inline]
    #[must_use]
    pub fn count(&self, key: &StaticKey) -> i32 {
        key.count()
    }

    /// Runs `f` on the patcher with the patch lock held.
    pub fn with_patcher<R>(&self, f: impl FnOnce(&mut Patcher<'a, A, T, S>) -> R) -> R {
        self.patcher.with_lock(f)
    }

    pub fn into_text(self) -> T {
        self.patcher.into_inner().into_text()
    }

    fn update(&self, patcher: &mut Patcher<'a, A, T, S>, key: &StaticKey, enabled: bool) {
        let mut sites = 0usize;
        let mut patched = 0usize;
        for site in self.table.sites_for(key.address()) {
            sites += 1;
            match patcher.queue(&site, site.desired(enabled)) {
                Ok(true) => patched += 1,
                Ok(false) => {}
                Err(err) => fatal(&err),
            }
        }
        if let Err(err) = patcher.flush() {
            fatal(&err);
        }
        debug!(
            "static key {}: {}, {patched} of {sites} site(s) patched",
            key.address(),
            if enabled { "enabled" } else { "disabled" },
        );
    }
}
