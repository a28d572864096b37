use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

use termbuf::{BatchSink, BufferConfig, EntryBuffer, MemoryCrawlState, Result};

/// Accepts every batch and keeps nothing
struct DiscardSink;

impl BatchSink for DiscardSink {
    fn push_buffer(&self, payload: &[u8]) -> Result<()> {
        black_box(payload.len());
        Ok(())
    }
}

struct BenchEnv {
    _tmp: TempDir,
    buffer: EntryBuffer,
}

fn build_env(capacity: usize) -> BenchEnv {
    let tmp = TempDir::new().unwrap();
    let config =
        BufferConfig::new(capacity).with_recovery_path(tmp.path().join("termbuf.saved.data"));
    let buffer = EntryBuffer::new(
        config,
        Arc::new(DiscardSink),
        Arc::new(MemoryCrawlState::new()),
    )
    .unwrap();
    BenchEnv { _tmp: tmp, buffer }
}

fn bench_record_occurrence(c: &mut Criterion) {
    let terms: Vec<String> = (0..256).map(|i| format!("term{}", i)).collect();
    let pages: Vec<String> = (0..64).map(|i| format!("CHK@page-{}", i)).collect();

    let mut group = c.benchmark_group("record_occurrence");
    for capacity in [0usize, 64 * 1024, 4 * 1024 * 1024] {
        let env = build_env(capacity);
        let mut n = 0u32;
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &env, |b, env| {
            b.iter(|| {
                let term = &terms[n as usize % terms.len()];
                let page = &pages[(n as usize / terms.len()) % pages.len()];
                env.buffer
                    .record_occurrence(term, 1.0, page, n, None)
                    .unwrap();
                black_box(env.buffer.maybe_flush().unwrap());
                n = n.wrapping_add(1);
            });
        });
        env.buffer.shutdown().unwrap();
    }
    group.finish();
}

fn bench_merge_same_entry(c: &mut Criterion) {
    let env = build_env(0);
    let entry = env
        .buffer
        .record_occurrence("rust", 1.0, "CHK@page", 0, None)
        .unwrap();

    let mut offset = 1u32;
    c.bench_function("add_position_same_entry", |b| {
        b.iter(|| {
            env.buffer.add_position(&entry, offset % 4096, None).unwrap();
            offset = offset.wrapping_add(1);
        });
    });
    env.buffer.shutdown().unwrap();
}

criterion_group!(benches, bench_record_occurrence, bench_merge_same_entry);
criterion_main!(benches);
