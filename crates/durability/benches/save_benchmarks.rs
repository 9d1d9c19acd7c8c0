//! Save path benchmarks
//!
//! ## Benchmark Path Types
//!
//! - `full_*`: first save of a file, every non-zero page is written
//! - `incremental_*`: save against the previous snapshot, only changed pages
//!   are written
//! - `load_*`: materializing a whole block from a published snapshot
//!
//! ## Dirty Ratios
//!
//! Incremental benchmarks label the share of pages that changed since the
//! prior save (`dirty_0`, `dirty_10`, `dirty_100`). Which pages change is
//! chosen with a fixed seed so baselines stay comparable.
//!
//! ## Running
//!
//! ```bash
//! cargo bench -p ramsnap-durability --bench save_benchmarks
//! cargo bench -p ramsnap-durability --bench save_benchmarks -- "incremental"
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ramsnap_core::RamBlock;
use ramsnap_durability::testing::GuestRamBuilder;
use ramsnap_durability::{RamLoader, RamSaver, SaveFlags, SaverConfig};
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Fixed seed for choosing dirty pages
const BENCH_SEED: u64 = 0xDEADBEEF_CAFEBABE;

const PAGE: usize = 4096;

/// 16 MiB of guest RAM
const PAGES: usize = 4096;

/// Guest RAM where a quarter of the pages are zero
fn guest_block(generation: u64, dirty_percent: u32) -> RamBlock {
    let mut rng = rand::rngs::StdRng::seed_from_u64(BENCH_SEED);
    let mut builder = GuestRamBuilder::new(PAGE);
    for page in 0..PAGES as u64 {
        let dirty = rng.gen_range(0..100) < dirty_percent;
        builder = if page % 4 == 0 {
            builder.zero_page()
        } else if dirty {
            builder.patterned_page(page + generation * PAGES as u64)
        } else {
            builder.patterned_page(page)
        };
    }
    builder.build_block("pc.ram", 0)
}

fn bench_config() -> SaverConfig {
    SaverConfig::default().with_sync_on_complete(false)
}

fn run_save(path: &Path, flags: SaveFlags, prior: Option<Arc<RamLoader>>, block: &RamBlock) {
    let mut saver = RamSaver::with_config(path, flags, prior, false, bench_config()).unwrap();
    saver.register_block(block.clone());
    saver.save_all_pages();
    saver.complete();
    black_box(saver.stats());
}

fn full_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_save");
    group.throughput(Throughput::Bytes((PAGES * PAGE) as u64));
    group.sample_size(10);

    let block = guest_block(0, 0);
    for (name, flags) in [
        ("sync_raw", SaveFlags::NONE),
        ("async_raw", SaveFlags::ASYNC),
        ("async_zstd", SaveFlags::ASYNC.union(SaveFlags::COMPRESS)),
    ] {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("vm.snap");
            b.iter(|| run_save(&path, flags, None, &block));
        });
    }
    group.finish();
}

fn incremental_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("incremental_save");
    group.throughput(Throughput::Bytes((PAGES * PAGE) as u64));
    group.sample_size(10);

    let base = guest_block(0, 0);
    for dirty in [0u32, 10, 100] {
        let changed = guest_block(1, dirty);
        for (name, flags) in [
            ("async_raw", SaveFlags::ASYNC),
            ("async_zstd", SaveFlags::ASYNC.union(SaveFlags::COMPRESS)),
        ] {
            let id = BenchmarkId::new(name, format!("dirty_{}", dirty));
            group.bench_function(id, |b| {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("vm.snap");
                b.iter_batched(
                    || {
                        run_save(&path, flags, None, &base);
                        Arc::new(RamLoader::open(&path).unwrap())
                    },
                    |prior| run_save(&path, flags, Some(prior), &changed),
                    criterion::BatchSize::PerIteration,
                );
            });
        }
    }
    group.finish();
}

fn load_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_block");
    group.throughput(Throughput::Bytes((PAGES * PAGE) as u64));
    group.sample_size(10);

    let block = guest_block(0, 0);
    for (name, flags) in [("raw", SaveFlags::NONE), ("zstd", SaveFlags::COMPRESS)] {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("vm.snap");
            run_save(&path, flags, None, &block);
            let loader = RamLoader::open(&path).unwrap();
            b.iter(|| black_box(loader.read_block(0).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, full_save, incremental_save, load_block);
criterion_main!(benches);
