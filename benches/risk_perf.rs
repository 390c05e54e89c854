mod fixtures;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use ebrisk::aggregate::{aggregate_losses, build_agg_loss_table};
use ebrisk::calculator::EventBasedRisk;
use ebrisk::partition::gmf_slices;
use ebrisk::store::MemoryStore;
use ebrisk::types::{Correlation, LossTypeIdx};

use fixtures::{LARGE, MEDIUM, SMALL, build_scenario, kids, loss_records, sorted_eids};

// ── Group 1: partition (GMF rows per planning pass) ─────────────────────────

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");
    for &num_events in &[1_000u32, 10_000, 100_000] {
        let eids = sorted_eids(num_events, 8);
        group.throughput(Throughput::Elements(eids.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(num_events), &eids, |b, eids| {
            b.iter(|| gmf_slices(eids, 5_000).expect("sorted input"))
        });
    }
    group.finish();
}

// ── Group 2: aggregate (loss records into the event loss table) ─────────────

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate");
    for &num_assets in &[100u32, 1_000, 5_000] {
        let records = loss_records(200, num_assets);
        let kids = kids(num_assets, 8);
        group.throughput(Throughput::Elements(records.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(num_assets), &records, |b, records| {
            b.iter(|| {
                let acc = aggregate_losses(records, 8, &kids, Correlation::Uncorrelated);
                build_agg_loss_table(vec![(LossTypeIdx(0), acc)], 2, Correlation::Uncorrelated)
            })
        });
    }
    group.finish();
}

// ── Group 3: full_run (plan through post-process) ───────────────────────────

fn bench_full_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_run");
    for (name, size) in [("small", &SMALL), ("medium", &MEDIUM), ("large", &LARGE)] {
        if name == "large" {
            group.sample_size(10);
        }
        for from_ruptures in [false, true] {
            let label = format!("{name}/{}", if from_ruptures { "ruptures" } else { "gmfs" });
            group.bench_function(BenchmarkId::from_parameter(label), |b| {
                b.iter_batched(
                    || {
                        let scenario = build_scenario(size, 42);
                        let hazard = scenario.hazard(from_ruptures);
                        let calc = EventBasedRisk::new(scenario.into_context(), MemoryStore::new())
                            .expect("thread pool");
                        (calc, hazard)
                    },
                    |(mut calc, hazard)| calc.run(&hazard),
                    BatchSize::LargeInput,
                )
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_partition, bench_aggregate, bench_full_run);
criterion_main!(benches);
