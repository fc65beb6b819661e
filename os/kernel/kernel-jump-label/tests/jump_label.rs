use kernel_jump_label::arch::x86_64::{NOP2, NOP5};
use kernel_jump_label::{
    BuiltImage, CodeAddress, DirectOverwrite, JumpLabel, JumpTable, JumpType, StaticKey, TableBuilder,
    TextBuffer, TrapAssisted, TrapSlots, X86_64,
};
use std::sync::Arc;
use std::thread;

const TEXT: CodeAddress = CodeAddress::new(0xFFFF_FFFF_8100_0000);
const TABLE: CodeAddress = CodeAddress::new(0xFFFF_FFFF_8200_0000);

type Direct<'a> = JumpLabel<'a, X86_64, TextBuffer, DirectOverwrite>;

/// Three sites for `key`, each with its own label.
fn three_sites<S: kernel_jump_label::PatchStrategy>(key: &StaticKey) -> (BuiltImage, [CodeAddress; 3]) {
    let mut b = TableBuilder::<X86_64, S>::new(TEXT, 0x1000, TABLE);
    let sites = [
        b.site(key, false, TEXT + 0x100).unwrap(),
        b.site(key, false, TEXT + 0x200).unwrap(),
        b.site(key, false, TEXT + 0x300).unwrap(),
    ];
    (b.finish(), sites)
}

fn jmp5(site: CodeAddress, label: CodeAddress) -> Vec<u8> {
    let rel = i32::try_from(label.displacement_from(site + 5)).unwrap();
    let mut v = vec![0xe9];
    v.extend_from_slice(&rel.to_le_bytes());
    v
}

fn bytes(jl: &Direct<'_>, site: CodeAddress) -> Vec<u8> {
    jl.with_patcher(|p| p.text().bytes_at(site, 5).unwrap().to_vec())
}

#[test]
fn three_sites_patch_only_on_edges() {
    static KEY: StaticKey = StaticKey::new_false();
    let (image, sites) = three_sites::<DirectOverwrite>(&KEY);
    let labels = [TEXT + 0x100, TEXT + 0x200, TEXT + 0x300];
    let traps = TrapSlots::new();
    let jl: Direct<'_> = JumpLabel::new(JumpTable::new(TABLE, &image.entries), image.text, &traps);

    for site in sites {
        assert_eq!(bytes(&jl, site), NOP5);
    }

    jl.enable(&KEY);
    assert_eq!(jl.count(&KEY), 1);
    for (site, label) in sites.into_iter().zip(labels) {
        assert_eq!(bytes(&jl, site), jmp5(site, label));
    }
    let pokes = jl.with_patcher(|p| p.text().journal().len());
    assert_eq!(pokes, 3);

    jl.enable(&KEY);
    assert_eq!(jl.count(&KEY), 2);
    assert_eq!(jl.with_patcher(|p| p.text().journal().len()), pokes);

    jl.disable(&KEY);
    assert_eq!(jl.count(&KEY), 1);
    assert_eq!(jl.with_patcher(|p| p.text().journal().len()), pokes);
    for (site, label) in sites.into_iter().zip(labels) {
        assert_eq!(bytes(&jl, site), jmp5(site, label));
    }

    jl.disable(&KEY);
    assert_eq!(jl.count(&KEY), 0);
    assert!(!KEY.is_enabled());
    for site in sites {
        assert_eq!(bytes(&jl, site), NOP5);
    }
    assert_eq!(jl.with_patcher(|p| p.text().journal().len()), 6);
}

#[test]
fn enable_twice_disable_once_stays_taken() {
    static KEY: StaticKey = StaticKey::new_false();
    let (image, sites) = three_sites::<DirectOverwrite>(&KEY);
    let traps = TrapSlots::new();
    let jl: Direct<'_> = JumpLabel::new(JumpTable::new(TABLE, &image.entries), image.text, &traps);

    jl.enable(&KEY);
    jl.enable(&KEY);
    jl.disable(&KEY);

    assert!(KEY.is_enabled());
    for site in sites {
        let table = *jl.table();
        let s = table.iter().find(|s| s.code() == site).unwrap();
        assert_eq!(jl.with_patcher(|p| p.current(&s)), Ok(JumpType::Jmp));
    }
    assert_eq!(jl.with_patcher(|p| p.text().sync_count()), 1);
}

#[test]
fn enable_then_disable_restores_compiled_bytes() {
    static KEY: StaticKey = StaticKey::new_false();
    let (image, _) = three_sites::<DirectOverwrite>(&KEY);
    let before = image.text.bytes_at(TEXT, 0x1000).unwrap().to_vec();
    let traps = TrapSlots::new();
    let jl: Direct<'_> = JumpLabel::new(JumpTable::new(TABLE, &image.entries), image.text, &traps);

    jl.enable(&KEY);
    jl.disable(&KEY);

    let text = jl.into_text();
    assert_eq!(text.bytes_at(TEXT, 0x1000).unwrap(), &before[..]);
}

#[test]
fn disable_at_zero_is_ignored() {
    static KEY: StaticKey = StaticKey::new_false();
    let (image, _) = three_sites::<DirectOverwrite>(&KEY);
    let traps = TrapSlots::new();
    let jl: Direct<'_> = JumpLabel::new(JumpTable::new(TABLE, &image.entries), image.text, &traps);

    jl.disable(&KEY);
    assert_eq!(jl.count(&KEY), 0);
    assert!(jl.with_patcher(|p| p.text().journal().is_empty()));
}

#[test]
fn keys_only_patch_their_own_sites() {
    static A: StaticKey = StaticKey::new_false();
    static B: StaticKey = StaticKey::new_false();
    let mut b = TableBuilder::<X86_64, DirectOverwrite>::new(TEXT, 0x1000, TABLE);
    let a_site = b.site(&A, false, TEXT + 0x100).unwrap();
    let b_site = b.site(&B, false, TEXT + 0x200).unwrap();
    let image = b.finish();
    let traps = TrapSlots::new();
    let jl: Direct<'_> = JumpLabel::new(JumpTable::new(TABLE, &image.entries), image.text, &traps);

    jl.enable(&B);
    assert_eq!(bytes(&jl, a_site), NOP5);
    assert_eq!(bytes(&jl, b_site), jmp5(b_site, TEXT + 0x200));
}

#[test]
fn likely_sites_jump_while_disabled() {
    static KEY: StaticKey = StaticKey::new_true();
    let mut b = TableBuilder::<X86_64, DirectOverwrite>::new(TEXT, 0x1000, TABLE);
    let site = b.site(&KEY, true, TEXT + 0x80).unwrap();
    let image = b.finish();
    // compiled for an enabled key
    assert_eq!(image.text.bytes_at(site, 5).unwrap(), NOP5);

    let traps = TrapSlots::new();
    let jl: Direct<'_> = JumpLabel::new(JumpTable::new(TABLE, &image.entries), image.text, &traps);
    jl.set_enabled(&KEY, false);
    assert_eq!(bytes(&jl, site), jmp5(site, TEXT + 0x80));

    jl.set_enabled(&KEY, true);
    assert_eq!(jl.count(&KEY), 1);
    assert_eq!(bytes(&jl, site), NOP5);
}

#[test]
fn set_enabled_patches_only_on_change() {
    static KEY: StaticKey = StaticKey::new_false();
    let (image, _) = three_sites::<DirectOverwrite>(&KEY);
    let traps = TrapSlots::new();
    let jl: Direct<'_> = JumpLabel::new(JumpTable::new(TABLE, &image.entries), image.text, &traps);

    jl.set_enabled(&KEY, true);
    jl.set_enabled(&KEY, true);
    assert_eq!(jl.count(&KEY), 1);
    assert_eq!(jl.with_patcher(|p| p.text().sync_count()), 1);

    jl.set_enabled(&KEY, false);
    jl.set_enabled(&KEY, false);
    assert_eq!(jl.count(&KEY), 0);
    assert_eq!(jl.with_patcher(|p| p.text().sync_count()), 2);
}

#[test]
fn init_settles_trap_assisted_sites() {
    static OFF: StaticKey = StaticKey::new_false();
    static ON: StaticKey = StaticKey::new_true();
    let mut b = TableBuilder::<X86_64, TrapAssisted>::new(TEXT, 0x1000, TABLE);
    let off = b.site(&OFF, false, TEXT + 0x100).unwrap();
    let on = b.site(&ON, false, TEXT + 0x200).unwrap();
    let short = b.site_at(TEXT + 0x40, 2, &OFF, false, TEXT + 0x60).map(|()| TEXT + 0x40).unwrap();
    let image = b.finish();

    // every site starts out as a jump
    assert_eq!(image.text.bytes_at(off, 5).unwrap(), jmp5(off, TEXT + 0x100));
    assert_eq!(image.text.bytes_at(short, 2).unwrap(), [0xeb, 0x1e]);

    let traps = TrapSlots::new();
    let jl = JumpLabel::<X86_64, _, TrapAssisted>::new(JumpTable::new(TABLE, &image.entries), image.text, &traps);
    // SAFETY: the records refer to the statics above.
    unsafe { jl.init() };

    let text = jl.into_text();
    assert_eq!(text.bytes_at(off, 5).unwrap(), NOP5);
    assert_eq!(text.bytes_at(short, 2).unwrap(), NOP2);
    assert_eq!(text.bytes_at(on, 5).unwrap(), jmp5(on, TEXT + 0x200));
    // breakpoints, tails, heads
    assert_eq!(text.sync_count(), 3);
    assert_eq!(traps.armed(), 0);
}

#[test]
fn out_of_range_labels_are_rejected_at_build_time() {
    static KEY: StaticKey = StaticKey::new_false();
    let mut b = TableBuilder::<X86_64, DirectOverwrite>::new(TEXT, 0x1000, TABLE);
    assert!(matches!(
        b.site_at(TEXT, 2, &KEY, false, TEXT + 0x800),
        Err(kernel_jump_label::TableError::Encode { .. })
    ));
    assert!(b.finish().entries.is_empty());
}

#[test]
fn concurrent_enablers_patch_once() {
    static KEY: StaticKey = StaticKey::new_false();
    let (image, sites) = three_sites::<DirectOverwrite>(&KEY);
    let traps: &'static TrapSlots = Box::leak(Box::new(TrapSlots::new()));
    let entries: &'static [_] = Box::leak(image.entries.into_boxed_slice());
    let table = JumpTable::new(TABLE, entries);
    let jl: Arc<JumpLabel<'static, X86_64, TextBuffer, DirectOverwrite>> =
        Arc::new(JumpLabel::new(table, image.text, traps));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let jl = Arc::clone(&jl);
            thread::spawn(move || {
                for _ in 0..100 {
                    jl.enable(&KEY);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(jl.count(&KEY), 800);
    assert_eq!(jl.with_patcher(|p| p.text().journal().len()), sites.len());

    for _ in 0..800 {
        jl.disable(&KEY);
    }
    assert_eq!(jl.count(&KEY), 0);
    assert_eq!(jl.with_patcher(|p| p.text().journal().len()), 2 * sites.len());
}

#[test]
fn set_enabled_false_keeps_concurrent_references() {
    static KEY: StaticKey = StaticKey::new_false();
    const ENABLERS: usize = 4;
    const PER_ENABLER: i32 = 50;

    let (image, sites) = three_sites::<DirectOverwrite>(&KEY);
    let traps: &'static TrapSlots = Box::leak(Box::new(TrapSlots::new()));
    let entries: &'static [_] = Box::leak(image.entries.into_boxed_slice());
    let table = JumpTable::new(TABLE, entries);
    let jl: Arc<JumpLabel<'static, X86_64, TextBuffer, DirectOverwrite>> =
        Arc::new(JumpLabel::new(table, image.text, traps));
    let total = ENABLERS as i32 * PER_ENABLER;

    for _ in 0..200 {
        jl.set_enabled(&KEY, true);
        let handles: Vec<_> = (0..ENABLERS)
            .map(|_| {
                let jl = Arc::clone(&jl);
                thread::spawn(move || {
                    for _ in 0..PER_ENABLER {
                        jl.enable(&KEY);
                    }
                })
            })
            .collect();
        jl.set_enabled(&KEY, false);
        for h in handles {
            h.join().unwrap();
        }

        // either the forced reference was dropped first, or it survives
        let count = jl.count(&KEY);
        assert!(count == total || count == total + 1, "count {count}");
        let table = *jl.table();
        for site in table.iter().filter(|s| sites.contains(&s.code())) {
            assert_eq!(jl.with_patcher(|p| p.current(&site)), Ok(JumpType::Jmp));
        }

        for _ in 0..count {
            jl.disable(&KEY);
        }
        assert_eq!(jl.count(&KEY), 0);
    }
}
