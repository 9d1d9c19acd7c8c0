//! Save/load round-trip tests
//!
//! Whatever is in guest RAM when a save runs must come back byte for byte,
//! for every combination of sync/async and raw/compressed saves.

use proptest::prelude::*;
use ramsnap_core::RamBlock;
use ramsnap_durability::testing::{patterned_page, GuestRamBuilder};
use ramsnap_durability::{RamLoader, RamSaver, SaveFlags, SaverConfig};
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PAGE: usize = 4096;

fn save(path: &Path, flags: SaveFlags, blocks: &[RamBlock]) -> RamSaver {
    let mut saver =
        RamSaver::with_config(path, flags, None, false, SaverConfig::for_testing()).unwrap();
    for block in blocks {
        saver.register_block(block.clone());
    }
    saver.save_all_pages();
    saver.complete();
    saver.join();
    saver
}

fn assert_restores(path: &Path, blocks: &[RamBlock]) {
    let loader = RamLoader::open(path).unwrap();
    assert_eq!(loader.index().blocks.len(), blocks.len());
    for block in blocks {
        let mut restored = vec![0xFFu8; block.total_size() as usize];
        loader.restore_block(block.id(), &mut restored).unwrap();
        assert!(restored == block.bytes(), "block '{}' differs after restore", block.id());
    }
}

fn random_block(id: &str, start: u64, pages: usize, seed: u64) -> RamBlock {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut builder = GuestRamBuilder::new(PAGE);
    for _ in 0..pages {
        builder = match rng.gen_range(0..4) {
            0 => builder.zero_page(),
            1 => {
                // Sparse page: mostly zero, a few random bytes
                let mut page = vec![0u8; PAGE];
                for _ in 0..8 {
                    let at = rng.gen_range(0..PAGE);
                    page[at] = rng.gen_range(1..=255);
                }
                builder.page(&page)
            }
            _ => {
                let mut page = vec![0u8; PAGE];
                rng.fill(page.as_mut_slice());
                builder.page(&page)
            }
        };
    }
    builder.build_block(id, start)
}

#[test]
fn test_sync_raw_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let blocks = vec![
        random_block("pc.ram", 0, 32, 1),
        random_block("vga.vram", 1 << 30, 8, 2),
    ];
    let saver = save(&path, SaveFlags::NONE, &blocks);
    assert!(!saver.has_error());
    assert!(!saver.compressed());
    assert_restores(&path, &blocks);
}

#[test]
fn test_async_compressed_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let blocks = vec![
        random_block("pc.ram", 0, 64, 3),
        random_block("vga.vram", 1 << 30, 16, 4),
    ];
    let saver = save(&path, SaveFlags::ASYNC.union(SaveFlags::COMPRESS), &blocks);
    assert!(!saver.has_error(), "{:?}", saver.first_error());
    assert!(saver.compressed());

    let loader = RamLoader::open(&path).unwrap();
    assert!(loader.compressed());
    assert_restores(&path, &blocks);
}

#[test]
fn test_async_many_pages_through_small_queues() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    // Far more pages than queue slots, so both stages apply backpressure
    let blocks = vec![random_block("pc.ram", 0, 512, 5)];
    let saver = save(&path, SaveFlags::ASYNC, &blocks);
    assert!(!saver.has_error());
    assert_eq!(saver.stats().total_pages, 512);
    assert_restores(&path, &blocks);
}

#[test]
fn test_compressible_pages_shrink() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let page = vec![0x42u8; PAGE];
    let mut builder = GuestRamBuilder::new(PAGE);
    for _ in 0..16 {
        builder = builder.page(&page);
    }
    let blocks = vec![builder.build_block("ram", 0)];

    let saver = save(&path, SaveFlags::COMPRESS, &blocks);
    assert!(saver.stats().bytes_written < 16 * PAGE as u64 / 4);
    assert_restores(&path, &blocks);
}

#[test]
fn test_incompressible_page_still_stored_compressed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let blocks = vec![random_block("ram", 0, 1, 99)];
    let saver = save(&path, SaveFlags::COMPRESS, &blocks);

    let loader = RamLoader::open(&path).unwrap();
    let entry = loader.index().page(0, 0).unwrap();
    // Random data grows under zstd; the frame is kept rather than the raw page
    assert!(entry.size_on_disk as usize > PAGE);
    assert_eq!(saver.stats().bytes_written, entry.size_on_disk as u64);
    assert_restores(&path, &blocks);
}

#[test]
fn test_pages_not_saved_load_as_zero() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let block = GuestRamBuilder::new(PAGE)
        .patterned_page(1)
        .patterned_page(2)
        .build_block("ram", 0);

    let mut saver = RamSaver::new(&path, SaveFlags::NONE, None, false).unwrap();
    saver.register_block(block);
    saver.save_page(0, PAGE as u64, PAGE as u32);
    saver.complete();

    let restored = RamLoader::open(&path).unwrap().read_block(0).unwrap();
    assert!(restored[..PAGE].iter().all(|&b| b == 0));
    assert_eq!(&restored[PAGE..], patterned_page(2, PAGE).as_slice());
}

#[test]
fn test_index_lists_every_page_in_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let blocks = vec![
        random_block("b", 1 << 20, 3, 7),
        random_block("a", 0, 5, 8),
    ];
    save(&path, SaveFlags::ASYNC, &blocks);

    let loader = RamLoader::open(&path).unwrap();
    let index = loader.index();
    assert_eq!(index.total_pages, 8);
    let ids: Vec<&str> = index.blocks.iter().map(|b| b.descriptor.id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);

    let order: Vec<(usize, u32)> = index.iter_pages().map(|(b, p, _)| (b, p)).collect();
    let expected: Vec<(usize, u32)> = (0..3)
        .map(|p| (0, p))
        .chain((0..5).map(|p| (1, p)))
        .collect();
    assert_eq!(order, expected);
    assert!(index.iter_pages().all(|(_, _, e)| e.hash_filled));
}

#[test]
fn test_small_page_size_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vm.snap");
    let memory: Vec<u8> = (0..16 * 512).map(|i| (i % 251) as u8).collect();
    let block = RamBlock::new("rom", 0, 512, Arc::new(memory)).unwrap();
    save(&path, SaveFlags::ASYNC.union(SaveFlags::COMPRESS), &[block.clone()]);
    assert_restores(&path, &[block]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_save_load_roundtrip(
        layout in proptest::collection::vec(proptest::collection::vec(0u8..4, 1..12), 1..4),
        asynchronous in any::<bool>(),
        compress in any::<bool>(),
    ) {
        let blocks: Vec<RamBlock> = layout
            .iter()
            .enumerate()
            .map(|(bi, kinds)| {
                let mut builder = GuestRamBuilder::new(PAGE);
                for (pi, kind) in kinds.iter().enumerate() {
                    builder = match kind {
                        0 => builder.zero_page(),
                        // Repeated content across pages and blocks
                        1 => builder.patterned_page(1),
                        _ => builder.patterned_page((bi * 100 + pi) as u64 + *kind as u64),
                    };
                }
                builder.build_block(&format!("block{}", bi), (bi as u64) << 32)
            })
            .collect();

        let mut flags = SaveFlags::NONE;
        if asynchronous {
            flags = flags.union(SaveFlags::ASYNC);
        }
        if compress {
            flags = flags.union(SaveFlags::COMPRESS);
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.snap");
        let saver = save(&path, flags, &blocks);
        prop_assert!(!saver.has_error());

        let loader = RamLoader::open(&path).unwrap();
        let expected_pages: u64 = layout.iter().map(|k| k.len() as u64).sum();
        prop_assert_eq!(loader.index().total_pages, expected_pages);
        for block in &blocks {
            let mut restored = vec![0u8; block.total_size() as usize];
            loader.restore_block(block.id(), &mut restored).unwrap();
            prop_assert!(restored == block.bytes());
        }

        // Zero pages never occupy payload space
        let zero_pages = layout.iter().flatten().filter(|&&k| k == 0).count() as u64;
        prop_assert_eq!(saver.stats().zero_pages, zero_pages);
        let stored = loader.index().iter_pages().filter(|(_, _, e)| !e.zeroed()).count() as u64;
        prop_assert_eq!(stored, expected_pages - zero_pages);
    }
}
