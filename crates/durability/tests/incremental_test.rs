//! Incremental save tests
//!
//! A save that is given the loader of the previous snapshot of the same
//! file must only write pages whose content changed, keep every other entry
//! pointing at the bytes already on disk, and reuse space freed by earlier
//! saves.

use ramsnap_core::RamBlock;
use ramsnap_durability::testing::{patterned_page, GuestRamBuilder};
use ramsnap_durability::{RamLoader, RamSaver, SaveFlags, SaveStats, SaverConfig};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PAGE: usize = 4096;

fn save(path: &Path, flags: SaveFlags, prior: Option<RamLoader>, blocks: &[RamBlock]) -> SaveStats {
    let mut saver = RamSaver::with_config(
        path,
        flags,
        prior.map(Arc::new),
        false,
        SaverConfig::for_testing(),
    )
    .unwrap();
    for block in blocks {
        saver.register_block(block.clone());
    }
    saver.save_all_pages();
    saver.complete();
    saver.join();
    assert!(!saver.has_error(), "{:?}", saver.first_error());
    saver.stats()
}

fn reopen(path: &Path) -> RamLoader {
    RamLoader::open(path).unwrap()
}

fn three_pages(seeds: [u64; 3]) -> RamBlock {
    GuestRamBuilder::new(PAGE)
        .patterned_page(seeds[0])
        .patterned_page(seeds[1])
        .patterned_page(seeds[2])
        .build_block("pc.ram", 0)
}

fn assert_block(loader: &RamLoader, block: &RamBlock) {
    let mut restored = vec![0u8; block.total_size() as usize];
    loader.restore_block(block.id(), &mut restored).unwrap();
    assert!(restored == block.bytes(), "block '{}' differs", block.id());
}

#[test]
fn test_unchanged_save_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let block = three_pages([1, 2, 3]);

    let first = save(&path, SaveFlags::NONE, None, &[block.clone()]);
    assert_eq!(first.changed_pages, 3);

    let before = reopen(&path);
    let before_pages: Vec<_> = before.index().iter_pages().map(|(_, _, e)| e.location()).collect();

    let second = save(&path, SaveFlags::NONE, Some(before), &[block.clone()]);
    assert_eq!(second.total_pages, 3);
    assert_eq!(second.same_pages, 3);
    assert_eq!(second.changed_pages, 0);
    assert_eq!(second.bytes_written, 0);

    let after = reopen(&path);
    let after_pages: Vec<_> = after.index().iter_pages().map(|(_, _, e)| e.location()).collect();
    assert_eq!(before_pages, after_pages);
    assert!(after.index().iter_pages().all(|(_, _, e)| e.same));
    assert_block(&after, &block);
}

#[test]
fn test_single_changed_page_is_the_only_write() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");

    save(&path, SaveFlags::ASYNC, None, &[three_pages([1, 2, 3])]);
    let prior = reopen(&path);
    let prior_a = *prior.index().page(0, 0).unwrap();
    let prior_c = *prior.index().page(0, 2).unwrap();
    let prior_len = prior.file_len();

    let changed = three_pages([1, 20, 3]);
    let stats = save(&path, SaveFlags::ASYNC, Some(prior), &[changed.clone()]);
    assert_eq!(stats.changed_pages, 1);
    assert_eq!(stats.same_pages, 2);
    assert_eq!(stats.bytes_written, PAGE as u64);

    let loader = reopen(&path);
    let a = loader.index().page(0, 0).unwrap();
    let b = loader.index().page(0, 1).unwrap();
    let c = loader.index().page(0, 2).unwrap();
    assert_eq!(a.location(), prior_a.location());
    assert_eq!(c.location(), prior_c.location());
    assert!(a.same && c.same && !b.same);
    // Nothing was free in the previous file, so the new payload is appended
    assert!(b.file_pos >= prior_len);
    assert_block(&loader, &changed);
}

/// Two blocks of 4 and 2 pages, full save then one changed page
#[test]
fn test_two_block_incremental_scenario() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");

    let block_a = |second: u64| {
        GuestRamBuilder::new(PAGE)
            .zero_page()
            .patterned_page(second)
            .patterned_page(2)
            .zero_page()
            .build_block("a", 0)
    };
    let block_b = GuestRamBuilder::new(PAGE)
        .patterned_page(3)
        .zero_page()
        .build_block("b", 1 << 20);

    let full = save(&path, SaveFlags::NONE, None, &[block_a(1), block_b.clone()]);
    assert_eq!(full.total_pages, 6);
    assert_eq!(full.changed_pages, 3);
    assert_eq!(full.zero_pages, 3);

    let loader = reopen(&path);
    assert_eq!(loader.index().total_pages, 6);
    let stored = loader.index().iter_pages().filter(|(_, _, e)| !e.zeroed()).count();
    assert_eq!(stored, 3);

    let incremental = save(&path, SaveFlags::NONE, Some(loader), &[block_a(4), block_b.clone()]);
    assert_eq!(incremental.total_pages, 6);
    assert_eq!(incremental.changed_pages, 1);
    assert_eq!(incremental.same_pages, 5);
    assert_eq!(incremental.bytes_written, PAGE as u64);

    let loader = reopen(&path);
    let same = loader.index().iter_pages().filter(|(_, _, e)| e.same).count();
    assert_eq!(same, 5);
    assert_block(&loader, &block_a(4));
    assert_block(&loader, &block_b);
}

#[test]
fn test_freed_payload_space_is_reused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");

    // Save 1: A B C laid out back to back after the offset slot
    save(&path, SaveFlags::NONE, None, &[three_pages([1, 2, 3])]);
    let old_b = reopen(&path).index().page(0, 1).unwrap().location();
    assert_eq!(old_b.offset, 8 + PAGE as u64);

    // Save 2: B changes and is appended; its old range is no longer referenced
    let stats = save(&path, SaveFlags::NONE, Some(reopen(&path)), &[three_pages([1, 20, 3])]);
    assert_eq!(stats.gap_reuses, 0);
    let loader = reopen(&path);
    assert!(loader.gaps().contains(&(old_b.offset, PAGE as u64)));

    // Save 3: no change, the free range stays free
    let stats = save(&path, SaveFlags::NONE, Some(loader), &[three_pages([1, 20, 3])]);
    assert_eq!(stats.bytes_written, 0);
    let loader = reopen(&path);
    assert!(loader.gaps().contains(&(old_b.offset, PAGE as u64)));

    // Save 4: C changes and lands exactly in B's old slot
    let last = three_pages([1, 20, 30]);
    let stats = save(&path, SaveFlags::NONE, Some(loader), &[last.clone()]);
    assert_eq!(stats.changed_pages, 1);
    assert_eq!(stats.gap_reuses, 1);

    let loader = reopen(&path);
    assert_eq!(loader.index().page(0, 2).unwrap().location(), old_b);
    assert!(!loader.gaps().contains(&(old_b.offset, PAGE as u64)));
    assert_block(&loader, &last);
}

#[test]
fn test_file_size_stays_bounded_across_saves() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");

    save(&path, SaveFlags::NONE, None, &[three_pages([1, 2, 3])]);
    let baseline = reopen(&path).file_len();

    // The same page flips between two contents; freed ranges get recycled
    for round in 0..8u64 {
        let block = three_pages([1, 100 + round % 2, 3]);
        save(&path, SaveFlags::NONE, Some(reopen(&path)), &[block.clone()]);
        assert_block(&reopen(&path), &block);
    }
    let final_len = reopen(&path).file_len();
    assert!(
        final_len <= baseline + 4 * PAGE as u64,
        "file grew from {} to {}",
        baseline,
        final_len
    );
}

#[test]
fn test_page_becoming_zero_frees_its_payload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");

    save(&path, SaveFlags::NONE, None, &[three_pages([1, 2, 3])]);
    let old_c = reopen(&path).index().page(0, 2).unwrap().location();

    let zeroed = GuestRamBuilder::new(PAGE)
        .patterned_page(1)
        .patterned_page(2)
        .zero_page()
        .build_block("pc.ram", 0);
    let stats = save(&path, SaveFlags::NONE, Some(reopen(&path)), &[zeroed.clone()]);
    assert_eq!(stats.zero_pages, 1);
    assert_eq!(stats.bytes_written, 0);

    let loader = reopen(&path);
    assert!(loader.index().page(0, 2).unwrap().zeroed());
    assert!(loader.gaps().iter().any(|&(offset, _)| offset == old_c.offset));
    assert_block(&loader, &zeroed);
}

#[test]
fn test_resized_block_is_saved_in_full() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    save(&path, SaveFlags::NONE, None, &[three_pages([1, 2, 3])]);

    let grown = GuestRamBuilder::new(PAGE)
        .patterned_page(1)
        .patterned_page(2)
        .patterned_page(3)
        .patterned_page(4)
        .build_block("pc.ram", 0);
    let stats = save(&path, SaveFlags::NONE, Some(reopen(&path)), &[grown.clone()]);
    assert_eq!(stats.same_pages, 0);
    assert_eq!(stats.changed_pages, 4);
    assert_block(&reopen(&path), &grown);
}

#[test]
fn test_reordered_blocks_match_by_id() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let ram = three_pages([1, 2, 3]);
    let vram = GuestRamBuilder::new(PAGE)
        .patterned_page(7)
        .build_block("vga.vram", 1 << 30);

    save(&path, SaveFlags::NONE, None, &[ram.clone(), vram.clone()]);
    let stats = save(&path, SaveFlags::NONE, Some(reopen(&path)), &[vram.clone(), ram.clone()]);
    assert_eq!(stats.same_pages, 4);
    assert_eq!(stats.bytes_written, 0);

    let loader = reopen(&path);
    assert_eq!(loader.index().blocks[0].descriptor.id, "vga.vram");
    assert_block(&loader, &ram);
    assert_block(&loader, &vram);
}

#[test]
fn test_compressed_incremental_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let flags = SaveFlags::ASYNC.union(SaveFlags::COMPRESS);

    save(&path, flags, None, &[three_pages([1, 2, 3])]);
    let changed = three_pages([1, 2, 33]);
    let stats = save(&path, flags, Some(reopen(&path)), &[changed.clone()]);
    assert_eq!(stats.same_pages, 2);
    assert_eq!(stats.changed_pages, 1);

    let loader = reopen(&path);
    assert!(loader.compressed());
    assert_block(&loader, &changed);
}

#[test]
fn test_prior_with_other_compression_forces_full_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let block = three_pages([1, 2, 3]);

    save(&path, SaveFlags::NONE, None, &[block.clone()]);
    let stats = save(&path, SaveFlags::COMPRESS, Some(reopen(&path)), &[block.clone()]);
    assert_eq!(stats.same_pages, 0);
    assert_eq!(stats.changed_pages, 3);

    let loader = reopen(&path);
    assert!(loader.compressed());
    assert_block(&loader, &block);
}

#[test]
fn test_sync_and_async_incremental_agree() {
    let dir = TempDir::new().unwrap();
    let sync_path = dir.path().join("sync.snap");
    let async_path = dir.path().join("async.snap");
    let first = three_pages([5, 6, 7]);
    let second = three_pages([5, 60, 7]);

    for (path, flags) in [(&sync_path, SaveFlags::NONE), (&async_path, SaveFlags::ASYNC)] {
        save(path, flags, None, &[first.clone()]);
        save(path, flags, Some(reopen(path)), &[second.clone()]);
    }

    let a = reopen(&sync_path);
    let b = reopen(&async_path);
    // Hashing workers may finish out of order, so only placement can differ
    let entries = |l: &RamLoader| -> Vec<_> {
        l.index().iter_pages().map(|(_, _, e)| (e.size_on_disk, e.same, e.hash())).collect()
    };
    assert_eq!(entries(&a), entries(&b));
    assert_eq!(a.read_block(0).unwrap(), b.read_block(0).unwrap());
    assert_eq!(&a.read_block(0).unwrap()[PAGE..2 * PAGE], patterned_page(60, PAGE).as_slice());
}
