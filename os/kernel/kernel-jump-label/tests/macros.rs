//! Without the `asm` feature the branch macros read the key.
#![cfg(not(feature = "asm"))]

use kernel_jump_label::{
    StaticKeyFalse, StaticKeyTrue, declared_default, static_branch_likely, static_branch_unlikely,
};

static OFF: StaticKeyFalse = StaticKeyFalse::new();
static ON: StaticKeyTrue = StaticKeyTrue::new();

mod keys {
    use kernel_jump_label::StaticKeyFalse;

    pub static NESTED: StaticKeyFalse = StaticKeyFalse::new();
}

#[test]
fn branches_follow_key_state() {
    assert!(!static_branch_unlikely!(OFF));
    assert!(!static_branch_likely!(OFF));
    assert!(static_branch_unlikely!(ON));
    assert!(static_branch_likely!(ON));
}

#[test]
fn keys_may_be_named_by_path() {
    assert!(!static_branch_unlikely!(keys::NESTED));
    assert!(!static_branch_likely!(self::keys::NESTED));
}

#[test]
fn defaults_are_known_at_compile_time() {
    const ON_DEFAULT: bool = declared_default(&ON);
    const OFF_DEFAULT: bool = declared_default(&OFF);
    assert!(ON_DEFAULT);
    assert!(!OFF_DEFAULT);
}
