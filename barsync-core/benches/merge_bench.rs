//! Criterion benchmarks for the sync hot paths.
//!
//! Benchmarks:
//! 1. Merge of a fresh batch onto a large stored series (append and prepend)
//! 2. Window planning across periods

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use barsync_core::domain::{BarRecord, Direction, Period};
use barsync_core::sync::{merge_records, DensityModel, Span, WindowPlanner};
use chrono::{Duration, NaiveDate, NaiveDateTime};

// ── Helpers ──────────────────────────────────────────────────────────

fn t0() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 2)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
}

fn make_bars(offset: usize, n: usize) -> Vec<BarRecord> {
    (offset..offset + n)
        .map(|i| {
            let mut bar = BarRecord::at(t0() + Duration::minutes(i as i64), Period::Min1);
            bar.close = 100.0 + (i as f64 * 0.1).sin() * 10.0;
            bar
        })
        .collect()
}

// ── 1. Merge ─────────────────────────────────────────────────────────

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    for &stored in &[10_000usize, 100_000] {
        let existing = make_bars(10_000, stored);
        let newer = make_bars(10_000 + stored - 500, 10_000);
        let older = make_bars(0, 10_000);

        group.bench_with_input(BenchmarkId::new("append", stored), &stored, |b, _| {
            b.iter(|| {
                merge_records(
                    black_box(existing.clone()),
                    black_box(newer.clone()),
                    Period::Min1,
                )
            })
        });
        group.bench_with_input(BenchmarkId::new("prepend", stored), &stored, |b, _| {
            b.iter(|| {
                merge_records(
                    black_box(existing.clone()),
                    black_box(older.clone()),
                    Period::Min1,
                )
            })
        });
    }
    group.finish();
}

// ── 2. Planning ──────────────────────────────────────────────────────

fn bench_planner(c: &mut Criterion) {
    let planner = WindowPlanner::new(10_000);
    let density = DensityModel::new();
    let span = Span::new(t0(), t0() + Duration::days(3_650));

    c.bench_function("plan_window_all_periods", |b| {
        b.iter(|| {
            for period in Period::ALL {
                for direction in [Direction::Forward, Direction::Backward] {
                    black_box(planner.plan(black_box(span), direction, period, &density));
                }
            }
        })
    });
}

criterion_group!(benches, bench_merge, bench_planner);
criterion_main!(benches);
