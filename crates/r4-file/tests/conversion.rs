#![forbid(unsafe_code)]

use proptest::prelude::*;
use r4_error::R4Error;
use r4_file::{Container, FileConfig, FileEnv, FormattingPolicy, UnixFile};
use r4_item::{Flow, FlowDest, Item, NoKillHook};
use r4_page::PageCache;
use r4_tree::{CountingThrottle, MemSpace, MemTree, Txn};
use r4_types::{KeyFormat, ObjectId};
use std::sync::Arc;
use std::thread;

const PAGE: usize = 16;

struct Rig {
    env: FileEnv,
    space: Arc<MemSpace>,
    throttle: Arc<CountingThrottle>,
    config: FileConfig,
}

fn rig(formatting: FormattingPolicy, tail2extent_pages: usize, extent2tail_pages: usize) -> Rig {
    let config = FileConfig {
        formatting,
        tail2extent_pages,
        extent2tail_pages,
        ..FileConfig::with_page_size(PAGE)
    };
    let space = Arc::new(MemSpace::unlimited());
    let throttle = Arc::new(CountingThrottle::default());
    let env = FileEnv {
        tree: Arc::new(MemTree::new(KeyFormat::Large, PAGE, PAGE).unwrap()),
        cache: Arc::new(PageCache::new(PAGE).unwrap()),
        space: space.clone(),
        throttle: throttle.clone(),
    };
    Rig {
        env,
        space,
        throttle,
        config,
    }
}

impl Rig {
    fn create(&self) -> UnixFile {
        UnixFile::create(self.env.clone(), self.config.clone(), 7, 0, ObjectId(65)).unwrap()
    }

    fn reload(&self, file: &UnixFile) -> UnixFile {
        UnixFile::load(self.env.remount().unwrap(), self.config.clone(), *file.sd_key()).unwrap()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect()
}

fn contents(file: &UnixFile) -> Vec<u8> {
    let txn = Txn::new();
    let mut buf = vec![0_u8; usize::try_from(file.size()).unwrap()];
    let n = file.read(&txn, 0, &mut FlowDest::Kernel(&mut buf)).unwrap();
    assert_eq!(n, buf.len());
    buf
}

fn all_of(file: &UnixFile, extent: bool) -> bool {
    file.items()
        .iter()
        .all(|item| matches!(item, Item::Extent(_)) == extent && matches!(item, Item::Extent(_) | Item::Tail(_)))
}

#[test]
fn forty_bytes_of_tails_become_one_extent() {
    let rig = rig(FormattingPolicy::AlwaysTails, 3, 1);
    let file = rig.create();
    let txn = Txn::new();
    file.write(&txn, 0, &Flow::Kernel(&[b'A'; 40])).unwrap();
    assert_eq!(file.container(), Container::Tails);

    let report = {
        let mut guard = file.access().get_exclusive(&txn);
        file.tail2extent(&mut guard).unwrap()
    };
    assert_eq!(report.replaces, 1);
    assert_eq!(report.pages, 3);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.bytes, 40);
    assert_eq!(report.cut_ranges, vec![0..40]);
    assert_eq!(report.resumed_from, None);
    assert_eq!(rig.throttle.calls(), 1);

    assert_eq!(file.container(), Container::Extents);
    assert!(!file.is_mixed().unwrap());
    assert!(!file.in_conversion());
    let items = file.items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_extent().unwrap().width(), 3);
    assert_eq!(contents(&file), vec![b'A'; 40]);
}

#[test]
fn twenty_byte_extent_file_becomes_tails_page_by_page() {
    let rig = rig(FormattingPolicy::NeverTails, 3, 1);
    let file = rig.create();
    let txn = Txn::new();
    let data = pattern(20);
    file.write(&txn, 0, &Flow::Kernel(&data)).unwrap();
    assert_eq!(file.container(), Container::Extents);

    let report = {
        let mut guard = file.access().get_exclusive(&txn);
        file.extent2tail(&mut guard).unwrap()
    };
    assert_eq!(report.iterations, 2);
    assert_eq!(report.cut_ranges, vec![0..16, 16..20]);
    assert_eq!(report.segments, vec![16, 4]);
    assert_eq!(report.bytes, 20);
    assert_eq!(file.container(), Container::Tails);
    assert!(all_of(&file, false));
    assert_eq!(rig.env.tree.blocks().allocated(), 0);
    assert_eq!(contents(&file), data);
}

#[test]
fn no_space_up_front_leaves_file_untouched() {
    let rig = rig(FormattingPolicy::AlwaysTails, 1, 1);
    let file = rig.create();
    let txn = Txn::new();
    let data = pattern(50);
    file.write(&txn, 0, &Flow::Kernel(&data)).unwrap();
    let before = file.items();

    rig.space.fail_after(0);
    let result = {
        let mut guard = file.access().get_exclusive(&txn);
        file.tail2extent(&mut guard)
    };
    assert!(matches!(result, Err(R4Error::NoSpace)));
    assert_eq!(file.items(), before);
    assert!(!file.is_mixed().unwrap());
    assert!(!file.in_conversion());
    assert_eq!(file.container(), Container::Tails);
}

#[test]
fn no_space_midway_leaves_a_readable_mixed_file() {
    let rig = rig(FormattingPolicy::AlwaysTails, 1, 1);
    let file = rig.create();
    let txn = Txn::new();
    let data = pattern(50);
    file.write(&txn, 0, &Flow::Kernel(&data)).unwrap();

    rig.space.fail_after(2);
    let result = {
        let mut guard = file.access().get_exclusive(&txn);
        file.tail2extent(&mut guard)
    };
    assert!(matches!(result, Err(R4Error::NoSpace)));
    assert!(file.is_mixed().unwrap());
    assert!(!file.in_conversion());
    assert_eq!(contents(&file), data);
}

#[test]
fn reopen_finishes_interrupted_tail2extent() {
    let rig = rig(FormattingPolicy::AlwaysTails, 1, 1);
    let file = rig.create();
    let txn = Txn::new();
    let data = pattern(100);
    file.write(&txn, 0, &Flow::Kernel(&data)).unwrap();

    rig.space.fail_after(3);
    {
        let mut guard = file.access().get_exclusive(&txn);
        assert!(file.tail2extent(&mut guard).is_err());
    }
    rig.space.clear_failure();

    let again = rig.reload(&file);
    let report = again.open(&txn).unwrap().expect("conversion resumed");
    assert_eq!(report.resumed_from, Some(48));
    assert_eq!(report.bytes, 52);
    assert!(!again.is_mixed().unwrap());
    assert_eq!(again.container(), Container::Extents);
    assert!(all_of(&again, true));
    assert_eq!(contents(&again), data);
}

#[test]
fn reopen_finishes_interrupted_extent2tail() {
    let rig = rig(FormattingPolicy::NeverTails, 1, 1);
    let file = rig.create();
    let txn = Txn::new();
    let data = pattern(50);
    file.write(&txn, 0, &Flow::Kernel(&data)).unwrap();

    rig.space.fail_after(2);
    {
        let mut guard = file.access().get_exclusive(&txn);
        assert!(matches!(file.extent2tail(&mut guard), Err(R4Error::NoSpace)));
    }
    rig.space.clear_failure();
    assert!(file.is_mixed().unwrap());

    let again = rig.reload(&file);
    let report = again.open(&txn).unwrap().expect("conversion resumed");
    assert_eq!(report.resumed_from, Some(32));
    assert_eq!(report.bytes, 18);
    assert_eq!(report.segments, vec![16, 2]);
    assert_eq!(again.container(), Container::Tails);
    assert!(all_of(&again, false));
    assert_eq!(contents(&again), data);
}

#[test]
fn resumed_extent2tail_converts_skipped_holes() {
    let rig = rig(FormattingPolicy::SmallFile, 3, 1);
    let file = rig.create();
    let txn = Txn::new();
    file.write(&txn, 100, &Flow::Kernel(b"abc")).unwrap();
    file.write(&txn, 48, &Flow::Kernel(b"x")).unwrap();
    file.truncate(&txn, 60).unwrap();
    assert_eq!(file.container(), Container::Extents);

    rig.space.fail_after(1);
    {
        let mut guard = file.access().get_exclusive(&txn);
        assert!(matches!(file.extent2tail(&mut guard), Err(R4Error::NoSpace)));
    }
    rig.space.clear_failure();

    let again = rig.reload(&file);
    let report = again.open(&txn).unwrap().expect("conversion resumed");
    assert_eq!(report.resumed_from, Some(16));
    assert_eq!(report.bytes, 44);
    assert_eq!(report.segments, vec![16, 16, 12]);
    assert!(all_of(&again, false));
    let mut want = vec![0_u8; 60];
    want[48] = b'x';
    assert_eq!(contents(&again), want);

    let tail = pattern(100);
    again.write(&txn, 60, &Flow::Kernel(&tail)).unwrap();
    assert_eq!(again.container(), Container::Extents);
    assert!(all_of(&again, true));
    want.extend_from_slice(&tail);
    assert_eq!(contents(&again), want);
}

#[test]
fn tail2extent_zero_fills_gaps_between_tails() {
    let rig = rig(FormattingPolicy::AlwaysTails, 3, 1);
    let file = rig.create();
    let txn = Txn::new();
    let mut data = pattern(50);
    file.write(&txn, 0, &Flow::Kernel(&data)).unwrap();
    rig.env
        .tree
        .cut_range(&file.body_key(20), &file.body_key(35), &mut NoKillHook)
        .unwrap();
    data[20..36].fill(0);
    assert_eq!(contents(&file), data);

    let report = {
        let mut guard = file.access().get_exclusive(&txn);
        file.tail2extent(&mut guard).unwrap()
    };
    assert_eq!(report.bytes, 50);
    assert_eq!(report.cut_ranges, vec![0..48, 48..50]);
    assert_eq!(file.container(), Container::Extents);
    assert!(all_of(&file, true));
    assert_eq!(contents(&file), data);
}

#[test]
fn extent_lost_after_tail_cut_needs_fsck() {
    let rig = rig(FormattingPolicy::AlwaysTails, 3, 1);
    let file = rig.create();
    let txn = Txn::new();
    file.write(&txn, 0, &Flow::Kernel(&[b'A'; 40])).unwrap();

    rig.env.tree.blocks().fail_after(1);
    let result = {
        let mut guard = file.access().get_exclusive(&txn);
        file.tail2extent(&mut guard)
    };
    assert!(matches!(result, Err(R4Error::NeedsFsck(_))));
    assert!(file.is_mixed().unwrap());
    assert!(!file.in_conversion());
}

#[test]
fn tails_lost_after_extent_cut_needs_fsck() {
    let rig = rig(FormattingPolicy::NeverTails, 3, 1);
    let file = rig.create();
    let txn = Txn::new();
    file.write(&txn, 0, &Flow::Kernel(&pattern(20))).unwrap();

    rig.env.tree.fail_tail_writes_after(0);
    let result = {
        let mut guard = file.access().get_exclusive(&txn);
        file.extent2tail(&mut guard)
    };
    assert!(matches!(result, Err(R4Error::NeedsFsck(_))));
    assert!(file.is_mixed().unwrap());
    assert!(!file.in_conversion());
}

#[test]
fn loaded_file_conversion_checks_current_state() {
    let rig = rig(FormattingPolicy::NeverTails, 3, 1);
    let file = rig.create();
    let txn = Txn::new();
    file.write(&txn, 0, &Flow::Kernel(&pattern(20))).unwrap();

    let again = rig.reload(&file);
    assert_eq!(again.container(), Container::Unknown);
    let result = {
        let mut guard = again.access().get_exclusive(&txn);
        again.tail2extent(&mut guard)
    };
    assert!(matches!(result, Err(R4Error::InvariantViolation(_))));
    assert!(!again.is_mixed().unwrap());
    assert!(all_of(&again, true));
}

#[test]
fn last_release_returns_small_extent_file_to_tails() {
    let rig = rig(FormattingPolicy::SmallFile, 3, 1);
    let file = rig.create();
    let txn = Txn::new();
    let data = pattern(100);
    file.write(&txn, 0, &Flow::Kernel(&data)).unwrap();
    assert_eq!(file.container(), Container::Extents);
    file.truncate(&txn, 30).unwrap();
    assert_eq!(file.container(), Container::Extents);

    file.open(&txn).unwrap();
    file.open(&txn).unwrap();
    assert_eq!(file.release(&txn).unwrap(), None);
    let report = file.release(&txn).unwrap().expect("converted on last release");
    assert_eq!(report.bytes, 30);
    assert_eq!(file.container(), Container::Tails);
    assert!(all_of(&file, false));
    assert_eq!(contents(&file), data[..30]);
}

#[test]
fn readers_see_stable_bytes_while_a_writer_converts() {
    let rig = rig(FormattingPolicy::SmallFile, 1, 1);
    let file = rig.create();
    let txn = Txn::new();
    let head = pattern(60);
    file.write(&txn, 0, &Flow::Kernel(&head)).unwrap();
    assert_eq!(file.container(), Container::Tails);

    thread::scope(|s| {
        for _ in 0..3 {
            s.spawn(|| {
                let txn = Txn::new();
                for _ in 0..200 {
                    let mut buf = vec![0_u8; head.len()];
                    let n = file.read(&txn, 0, &mut FlowDest::Kernel(&mut buf)).unwrap();
                    assert_eq!(n, head.len());
                    assert_eq!(buf, head);
                }
            });
        }
        s.spawn(|| {
            let txn = Txn::new();
            file.write(&txn, 60, &Flow::Kernel(&[9; 40])).unwrap();
        });
    });

    assert_eq!(file.container(), Container::Extents);
    assert!(!file.in_conversion());
    let mut want = head.clone();
    want.extend_from_slice(&[9; 40]);
    assert_eq!(contents(&file), want);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn resumed_tail2extent_matches_uninterrupted(
        len in 1_usize..160,
        batch in 1_usize..4,
        grants in 0_u64..8,
    ) {
        let rig = rig(FormattingPolicy::AlwaysTails, batch, 1);
        let file = rig.create();
        let txn = Txn::new();
        let data = pattern(len);
        file.write(&txn, 0, &Flow::Kernel(&data)).unwrap();

        rig.space.fail_after(grants);
        let first = {
            let mut guard = file.access().get_exclusive(&txn);
            file.tail2extent(&mut guard)
        };
        rig.space.clear_failure();
        prop_assert!(!file.in_conversion());
        let mixed = file.is_mixed().unwrap();

        let again = rig.reload(&file);
        let resumed = again.open(&txn).unwrap();
        match (&first, &resumed) {
            (Err(err), None) => {
                // Failed before touching anything: still plain tails.
                prop_assert!(matches!(err, R4Error::NoSpace));
                prop_assert!(!mixed);
                prop_assert!(all_of(&again, false));
            }
            (Err(_), Some(report)) => {
                prop_assert!(mixed);
                let start = report.resumed_from.unwrap_or(0);
                prop_assert_eq!(start % PAGE as u64, 0);
                prop_assert_eq!(start + report.bytes, len as u64);
                prop_assert!(all_of(&again, true));
            }
            (Ok(report), leftover) => {
                prop_assert_eq!(report.bytes, len as u64);
                // Only the final flag update may have been refused.
                prop_assert_eq!(mixed, leftover.is_some());
                if let Some(noop) = leftover {
                    prop_assert_eq!(noop.bytes, 0);
                }
                prop_assert!(all_of(&again, true));
            }
        }
        prop_assert!(!again.is_mixed().unwrap());
        prop_assert_eq!(contents(&again), data);
    }
}
