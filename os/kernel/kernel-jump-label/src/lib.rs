//! # Static keys and jump labels
//!
//! Feature flags that cost a single no-op on the hot path. Every use of a
//! [`StaticKey`] compiles to a fixed-width placeholder instruction plus a
//! record in the `__jump_table` section. Flipping the key rewrites all of its
//! placeholders between the no-op and a jump to the taken label.
//!
//! ```text
//!  .text                                    __jump_table
//!  ┌──────────────────────────┐             ┌─────────────────────────┐
//!  │ 1: nop5 ──────────────────────────────┐│ code   = 1b - .         │
//!  │    ...fall through...    │            ││ target = l_yes - .      │
//!  │ l_yes:                   │            ││ key    = KEY + branch - │
//!  └──────────────────────────┘            │└───────────┬─────────────┘
//!                                          │            ▼
//!                                          │  static KEY: StaticKey
//! ```
//!
//! ## Pieces
//! - [`static_branch_unlikely!`] / [`static_branch_likely!`] emit sites.
//! - [`JumpTable`] reads the records; [`TableBuilder`] lays out images on the
//!   host.
//! - [`Patcher`] rewrites one site, or a batch, through a [`TextPoke`] and a
//!   [`PatchStrategy`].
//! - [`JumpLabel`] counts enablers per key and patches on the edges.
//!
//! Records are position independent: every field is a displacement from its
//! own address, so the table works wherever the image is loaded.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address;
pub mod arch;
mod builder;
mod entry;
mod jump_label;
mod key;
mod lock;
mod macros;
mod patch;
mod strategy;
mod table;
mod text;

pub use address::CodeAddress;
pub use arch::{Aarch64, Arch, EncodeError, Insn, Riscv64, X86_64};
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))]
pub use arch::NativeArch;
pub use builder::{BuiltImage, TableBuilder};
pub use entry::{BranchSite, JUMP_ENTRY_ALIGN, JUMP_ENTRY_SIZE, JumpEntry, JumpType, KeyFlags};
pub use jump_label::JumpLabel;
pub use key::{DeclaredKey, StaticKey, StaticKeyFalse, StaticKeyTrue, declared_default};
#[doc(hidden)]
pub use macros::__compiled_as_jump;
pub use lock::{PatchGuard, PatchLock};
pub use patch::{PatchError, Patcher};
pub use strategy::{
    DefaultStrategy, DirectOverwrite, POKE_BATCH_MAX, PatchStrategy, PendingPoke, TrapAssisted,
    TrapSlots,
};
pub use table::{ImageLayout, JumpTable, SiteField, TableError};
#[cfg(feature = "asm")]
pub use text::KernelText;
pub use text::{CodeRead, Poke, TextBuffer, TextError, TextPoke};
