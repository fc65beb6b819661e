use crate::CodeAddress;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicI32, Ordering};

/// A feature flag whose state is compiled into branch sites.
///
/// The cell holds a reference count of enablers. `0` means disabled, any
/// positive count means enabled. While the sites of a key are being rewritten
/// the count is `-1`, which readers report as enabled.
///
/// A key's identity is its address: the jump table refers to it by
/// displacement, so a key must never move once sites refer to it. In practice
/// keys are `static`s.
///
/// ### Examples
/// ```rust
/// # use kernel_jump_label::StaticKey;
/// static TRACING: StaticKey = StaticKey::new_false();
/// static FAST_PATH: StaticKey = StaticKey::new_true();
///
/// assert!(!TRACING.is_enabled());
/// assert_eq!(FAST_PATH.count(), 1);
/// assert!(FAST_PATH.default_enabled());
/// ```
#[repr(C)]
pub struct StaticKey {
    enabled: AtomicI32,
    default_enabled: bool,
}

impl StaticKey {
    /// A key that starts out disabled.
    #[must_use]
    pub const fn new_false() -> Self {
        Self {
            enabled: AtomicI32::new(0),
            default_enabled: false,
        }
    }

    /// A key that starts out enabled with one reference.
    #[must_use]
    pub const fn new_true() -> Self {
        Self {
            enabled: AtomicI32::new(1),
            default_enabled: true,
        }
    }

    /// The number of enablers.
    #[inline]
    #[must_use]
    pub fn count(&self) -> i32 {
        let n = self.enabled.load(Ordering::Relaxed);
        if n >= 0 { n } else { 1 }
    }

    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.count() > 0
    }

    /// The state the key was declared with.
    #[inline]
    #[must_use]
    pub const fn default_enabled(&self) -> bool {
        self.default_enabled
    }

    /// The address the jump table uses to refer to this key.
    #[inline]
    #[must_use]
    pub fn address(&self) -> CodeAddress {
        CodeAddress::from_ptr(self)
    }

    /// Takes one more reference unless the key is disabled or in transition.
    pub(crate) fn inc_if_enabled(&self) -> bool {
        self.enabled
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| {
                if v > 0 { v.checked_add(1) } else { None }
            })
            .is_ok()
    }

    /// Drops one reference unless it is the last one.
    pub(crate) fn dec_unless_last(&self) -> bool {
        self.enabled
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| {
                (v > 1).then(|| v - 1)
            })
            .is_ok()
    }

    #[inline]
    pub(crate) fn raw(&self) -> i32 {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_raw(&self, v: i32) {
        self.enabled.store(v, Ordering::Release);
    }

    /// Swaps `1` for `0`; returns whether this dropped the last reference.
    pub(crate) fn release_last(&self) -> bool {
        self.enabled
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// A key whose declared default is part of its type.
///
/// The branch macros only accept such keys: the placeholder they emit has to
/// match the default before [`JumpLabel::init`](crate::JumpLabel::init) has
/// run.
pub trait DeclaredKey: Deref<Target = StaticKey> {
    const DEFAULT_ENABLED: bool;
}

/// The declared default of `key`, usable in constant expressions.
#[inline]
#[must_use]
pub const fn declared_default<K: DeclaredKey>(_key: &'static K) -> bool {
    K::DEFAULT_ENABLED
}

/// A [`StaticKey`] declared disabled.
///
/// ```rust
/// # use kernel_jump_label::{StaticKeyFalse, declared_default};
/// static TRACING: StaticKeyFalse = StaticKeyFalse::new();
///
/// assert!(!TRACING.is_enabled());
/// assert!(!declared_default(&TRACING));
/// ```
#[repr(transparent)]
pub struct StaticKeyFalse(StaticKey);

/// A [`StaticKey`] declared enabled, holding one reference.
#[repr(transparent)]
pub struct StaticKeyTrue(StaticKey);

impl StaticKeyFalse {
    #[must_use]
    pub const fn new() -> Self {
        Self(StaticKey::new_false())
    }
}

impl StaticKeyTrue {
    #[must_use]
    pub const fn new() -> Self {
        Self(StaticKey::new_true())
    }
}

impl Default for StaticKeyFalse {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for StaticKeyTrue {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for StaticKeyFalse {
    type Target = StaticKey;

    #[inline]
    fn deref(&self) -> &StaticKey {
        &self.0
    }
}

impl Deref for StaticKeyTrue {
    type Target = StaticKey;

    #[inline]
    fn deref(&self) -> &StaticKey {
        &self.0
    }
}

impl DeclaredKey for StaticKeyFalse {
    const DEFAULT_ENABLED: bool = false;
}

impl DeclaredKey for StaticKeyTrue {
    const DEFAULT_ENABLED: bool = true;
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKey")
            .field("address", &self.address())
            .field("count", &self.enabled.load(Ordering::Relaxed))
            .field("default", &self.default_enabled)
            .finish()
    }
}
