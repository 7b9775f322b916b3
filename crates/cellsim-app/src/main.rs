use anyhow::{Context, Result};
use cellsim_app::{GrowDivide, env_overrides, load_config, parse_override, seed_population};
use cellsim_core::Scheduler;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

/// Run a headless grow-and-divide cell population.
#[derive(Parser, Debug)]
#[command(name = "cellsim-app", version, about)]
struct Cli {
    /// Number of cells seeded before the first iteration.
    #[arg(long, env = "CELLSIM_CELLS", default_value_t = 500)]
    cells: usize,

    /// Iterations to simulate.
    #[arg(long, env = "CELLSIM_ITERATIONS", default_value_t = 50)]
    iterations: u64,

    /// Seed for the initial population.
    #[arg(long, env = "CELLSIM_SEED", default_value_t = 0xCE11_5EED)]
    seed: u64,

    /// JSON file with a simulation configuration.
    #[arg(long, env = "CELLSIM_CONFIG")]
    config: Option<PathBuf>,

    /// Worker threads (overrides the configuration).
    #[arg(long)]
    threads: Option<usize>,

    /// Disable the neighbor guard.
    #[arg(long)]
    no_guard: bool,

    /// Clamp cells into the configured domain.
    #[arg(long)]
    bound: bool,

    /// Configuration override `key=value`; may be repeated.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Volume added to each cell per iteration.
    #[arg(long, default_value_t = 0.5)]
    growth_rate: f64,

    /// Print the final iteration summary as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut overrides = env_overrides(std::env::vars());
    for raw in &cli.overrides {
        overrides.push(parse_override(raw)?);
    }
    if let Some(threads) = cli.threads {
        overrides.push(("num_threads".to_owned(), threads.to_string()));
    }
    if cli.no_guard {
        overrides.push(("neighbor_guard".to_owned(), "false".to_owned()));
    }
    if cli.bound {
        overrides.push(("bound_space".to_owned(), "true".to_owned()));
    }
    let config = load_config(cli.config.as_deref(), &overrides)?;

    let mut scheduler = Scheduler::new(config).context("failed to build scheduler")?;
    let module = GrowDivide {
        growth_rate: cli.growth_rate,
        ..GrowDivide::default()
    };
    seed_population(&mut scheduler, cli.cells, cli.seed, module)?;
    info!(
        cells = cli.cells,
        iterations = cli.iterations,
        threads = scheduler.num_threads(),
        guard = scheduler.context().neighbor_guard(),
        "Starting cellsim run"
    );

    scheduler
        .simulate(cli.iterations)
        .context("simulation aborted")?;

    match scheduler.history().last() {
        Some(summary) => {
            info!(
                iteration = summary.iteration,
                objects = summary.objects,
                added = summary.added,
                removed = summary.removed,
                "Run complete"
            );
            if cli.json {
                println!("{}", serde_json::to_string(summary)?);
            }
        }
        None => warn!("Run completed without any iterations"),
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
