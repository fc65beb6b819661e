//! # Emitting branch sites
//!
//! [`static_branch_unlikely!`] and [`static_branch_likely!`] evaluate to a
//! `bool` that is `true` while the key is enabled. With the `asm` feature on a
//! supported target they compile to a single placeholder instruction plus a
//! record in `__jump_table`; elsewhere they read the key.
//!
//! Keys are [`StaticKeyFalse`](crate::StaticKeyFalse) or
//! [`StaticKeyTrue`](crate::StaticKeyTrue) statics. The placeholder is the
//! encoding the declared default calls for, so a site is correct before
//! [`JumpLabel::init`](crate::JumpLabel::init) runs. Trap-assisted builds
//! always emit the jump and rely on `init` to settle the sites.
//!
//! x86-64 sites are emitted so that they never straddle an 8-byte word, which
//! lets a direct overwrite replace one with a single aligned store.

/// `true` while `$key` is enabled; the disabled path is the fall-through.
///
/// `$key` must name a `static` [`StaticKeyFalse`](crate::StaticKeyFalse) or
/// [`StaticKeyTrue`](crate::StaticKeyTrue).
///
/// ```rust
/// # use kernel_jump_label::{StaticKeyFalse, static_branch_unlikely};
/// static TRACE: StaticKeyFalse = StaticKeyFalse::new();
///
/// if static_branch_unlikely!(TRACE) {
///     unreachable!("tracing is off");
/// }
/// ```
#[macro_export]
macro_rules! static_branch_unlikely {
    ($key:path) => {
        $crate::__arch_static_branch!($key, 0)
    };
}

/// `true` while `$key` is enabled; the enabled path is the fall-through.
///
/// ```rust
/// # use kernel_jump_label::{StaticKeyTrue, static_branch_likely};
/// static FAST: StaticKeyTrue = StaticKeyTrue::new();
///
/// assert!(static_branch_likely!(FAST));
/// ```
#[macro_export]
macro_rules! static_branch_likely {
    ($key:path) => {
        !$crate::__arch_static_branch!($key, 1)
    };
}

/// `1` if a site of `key` with polarity `branch` is compiled as the jump.
#[doc(hidden)]
#[must_use]
#[allow(clippy::cast_lossless)]
pub const fn __compiled_as_jump<K: crate::DeclaredKey>(key: &'static K, branch: u8) -> u8 {
    (crate::declared_default(key) != (branch != 0)) as u8
}

// Each body returns whether the site jumped. The record's key field carries
// the site polarity in its low bit.

#[doc(hidden)]
#[macro_export]
#[cfg(all(feature = "asm", target_arch = "x86_64", not(feature = "trap-assisted")))]
macro_rules! __arch_static_branch {
    ($key:path, $branch:literal) => {'site: {
        // SAFETY: the site holds its no-op or its jump to the label.
        unsafe {
            ::core::arch::asm!(
                ".p2align 3,,4",
                "1:",
                ".if {3}",
                "jmp {0}",
                ".else",
                ".byte 0x0f,0x1f,0x44,0x00,0x00",
                ".endif",
                ".pushsection __jump_table, \"aw\"",
                ".balign 8",
                ".long 1b - .",
                ".long {0} - .",
                ".quad {1} + {2} - .",
                ".popsection",
                label { break 'site true; },
                sym $key,
                const $branch,
                const $crate::__compiled_as_jump(&$key, $branch),
                options(att_syntax),
            );
        }
        break 'site false;
    }};
}

#[doc(hidden)]
#[macro_export]
#[cfg(all(feature = "asm", target_arch = "x86_64", feature = "trap-assisted"))]
macro_rules! __arch_static_branch {
    ($key:path, $branch:literal) => {'site: {
        let _ = $crate::__compiled_as_jump(&$key, $branch);
        // SAFETY: the site is a jump to the label until patched into a no-op.
        unsafe {
            ::core::arch::asm!(
                "1: jmp {0}",
                ".pushsection __jump_table, \"aw\"",
                ".balign 8",
                ".long 1b - .",
                ".long {0} - .",
                ".quad {1} + {2} - .",
                ".popsection",
                label { break 'site true; },
                sym $key,
                const $branch,
                options(att_syntax),
            );
        }
        break 'site false;
    }};
}

#[doc(hidden)]
#[macro_export]
#[cfg(all(feature = "asm", target_arch = "aarch64", not(feature = "trap-assisted")))]
macro_rules! __arch_static_branch {
    ($key:path, $branch:literal) => {'site: {
        // SAFETY: the site holds its no-op or its branch to the label.
        unsafe {
            ::core::arch::asm!(
                "1:",
                ".if {3}",
                "b {0}",
                ".else",
                "nop",
                ".endif",
                ".pushsection __jump_table, \"aw\"",
                ".align 3",
                ".long 1b - ., {0} - .",
                ".quad {1} + {2} - .",
                ".popsection",
                label { break 'site true; },
                sym $key,
                const $branch,
                const $crate::__compiled_as_jump(&$key, $branch),
            );
        }
        break 'site false;
    }};
}

#[doc(hidden)]
#[macro_export]
#[cfg(all(feature = "asm", target_arch = "aarch64", feature = "trap-assisted"))]
macro_rules! __arch_static_branch {
    ($key:path, $branch:literal) => {'site: {
        let _ = $crate::__compiled_as_jump(&$key, $branch);
        // SAFETY: the site is a branch to the label until patched into a no-op.
        unsafe {
            ::core::arch::asm!(
                "1: b {0}",
                ".pushsection __jump_table, \"aw\"",
                ".align 3",
                ".long 1b - ., {0} - .",
                ".quad {1} + {2} - .",
                ".popsection",
                label { break 'site true; },
                sym $key,
                const $branch,
            );
        }
        break 'site false;
    }};
}

#[doc(hidden)]
#[macro_export]
#[cfg(all(feature = "asm", target_arch = "riscv64", not(feature = "trap-assisted")))]
macro_rules! __arch_static_branch {
    ($key:path, $branch:literal) => {'site: {
        // SAFETY: the site holds its no-op or its jump to the label.
        unsafe {
            ::core::arch::asm!(
                ".align 2",
                ".option push",
                ".option norelax",
                ".option norvc",
                "1:",
                ".if {3}",
                "j {0}",
                ".else",
                "nop",
                ".endif",
                ".option pop",
                ".pushsection __jump_table, \"aw\"",
                ".align 3",
                ".long 1b - ., {0} - .",
                ".dword {1} + {2} - .",
                ".popsection",
                label { break 'site true; },
                sym $key,
                const $branch,
                const $crate::__compiled_as_jump(&$key, $branch),
            );
        }
        break 'site false;
    }};
}

#[doc(hidden)]
#[macro_export]
#[cfg(all(feature = "asm", target_arch = "riscv64", feature = "trap-assisted"))]
macro_rules! __arch_static_branch {
    ($key:path, $branch:literal) => {'site: {
        let _ = $crate::__compiled_as_jump(&$key, $branch);
        // SAFETY: the site is a jump to the label until patched into a no-op.
        unsafe {
            ::core::arch::asm!(
                ".align 2",
                ".option push",
                ".option norelax",
                ".option norvc",
                "1: j {0}",
                ".option pop",
                ".pushsection __jump_table, \"aw\"",
                ".align 3",
                ".long 1b - ., {0} - .",
                ".dword {1} + {2} - .",
                ".popsection",
                label { break 'site true; },
                sym $key,
                const $branch,
            );
        }
        break 'site false;
    }};
}

#[doc(hidden)]
#[macro_export]
#[cfg(not(all(
    feature = "asm",
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")
)))]
macro_rules! __arch_static_branch {
    ($key:path, $branch:literal) => {{
        let _ = $crate::__compiled_as_jump(&$key, $branch);
        $crate::StaticKey::is_enabled(&$key) != ($branch != 0)
    }};
}
