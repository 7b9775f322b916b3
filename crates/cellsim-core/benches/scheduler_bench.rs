use cellsim_core::{Cell, Scheduler, SimulationConfig};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use glam::DVec3;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn seeded_scheduler(config: SimulationConfig, cells: usize, seed: u64) -> Scheduler {
    let mut scheduler = Scheduler::new(config.clone()).expect("scheduler");
    let resources = scheduler.resources_mut();
    resources.register::<Cell>();
    let mut rng = SmallRng::seed_from_u64(seed);
    for _ in 0..cells {
        let position = DVec3::new(
            rng.random_range(config.min_bound..config.max_bound),
            rng.random_range(config.min_bound..config.max_bound),
            rng.random_range(config.min_bound..config.max_bound),
        );
        resources
            .create(Cell::new(position, rng.random_range(4.0..8.0)))
            .expect("cell");
    }
    scheduler
}

fn bench_scheduler_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_step");
    let samples: usize = env_or("CELLSIM_BENCH_SAMPLES", 20_usize).max(10);
    let warm: u64 = env_or("CELLSIM_BENCH_WARMUP_SECS", 2);
    let measure: u64 = env_or("CELLSIM_BENCH_MEASURE_SECS", 8);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));
    // Iterations per bench sample (override via CELLSIM_BENCH_STEPS)
    let steps: u64 = env_or("CELLSIM_BENCH_STEPS", 10_u64).max(1);
    let cell_counts: Vec<usize> = std::env::var("CELLSIM_BENCH_CELLS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![1_000_usize, 10_000, 50_000]);

    for guard in [true, false] {
        for &cells in &cell_counts {
            let name = format!(
                "steps{steps}_cells{cells}_{}",
                if guard { "guarded" } else { "unguarded" }
            );
            group.bench_function(name, |b| {
                b.iter_batched(
                    || {
                        let config = SimulationConfig {
                            bound_space: true,
                            min_bound: 0.0,
                            // keep density roughly constant across sizes
                            max_bound: (cells as f64).cbrt() * 8.0,
                            neighbor_guard: guard,
                            history_capacity: 1,
                            ..SimulationConfig::default()
                        };
                        seeded_scheduler(config, cells, 0xCE11)
                    },
                    |mut scheduler| {
                        scheduler.simulate(steps).expect("simulate");
                    },
                    BatchSize::LargeInput,
                );
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_scheduler_steps);
criterion_main!(benches);
