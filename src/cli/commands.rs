//! CLI command definitions for compute-forge.
//!
//! Every command builds a [`ComputeEngine`] from the pool configuration,
//! runs its work through the pool, and prints the result as pretty JSON.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Parser;
use futures::future::BoxFuture;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::PoolConfig;
use crate::engine::{ComputeEngine, SubmitOptions};
use crate::kernels::{BandStructureParams, DiagonalizationRequest, Lattice, SimulationParams};
use crate::scheduler::{JobProgress, PoolStats, Priority, WorkerSnapshot};

/// Parallel compute engine for numeric jobs.
#[derive(Parser)]
#[command(name = "compute-forge")]
#[command(about = "Run prioritized numeric jobs on an auto-scaling worker pool")]
#[command(version)]
#[command(
    long_about = "compute-forge runs matrix diagonalization, Ising Monte Carlo and tight-binding band structure jobs on a pool of workers.\n\nPool settings come from --config (YAML) or COMPUTE_* environment variables.\n\nExample usage:\n  compute-forge simulate --size 32 --temperature 2.269 --seed 7\n  compute-forge bench --jobs 48 --metrics"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML pool configuration. Falls back to COMPUTE_* environment variables.
    #[arg(short, long, global = true, env = "COMPUTE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Compute leading eigenpairs of a symmetric matrix.
    #[command(alias = "eig")]
    Diagonalize(DiagonalizeArgs),

    /// Run a 2D Ising Monte Carlo simulation.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Compute a tight-binding band structure.
    Bands(BandsArgs),

    /// Submit a mixed-priority batch and report pool statistics.
    Bench(BenchArgs),
}

/// Options shared by every single-job command.
#[derive(clap::Args, Debug, Clone)]
pub struct JobArgs {
    /// Priority class (critical, high, medium, low). Defaults per operation.
    #[arg(short = 'p', long)]
    pub priority: Option<Priority>,

    /// Additional attempts after a failure.
    #[arg(long, default_value = "0")]
    pub retries: u32,

    /// Abandon an attempt after this many milliseconds.
    #[arg(long)]
    pub deadline_ms: Option<u64>,

    /// Log progress updates reported by the kernel.
    #[arg(long)]
    pub progress: bool,
}

impl JobArgs {
    /// Builds submit options, spawning a progress logger if requested.
    fn submit_options(&self) -> SubmitOptions {
        let mut options = SubmitOptions::new().with_retries(self.retries);
        if let Some(priority) = self.priority {
            options = options.with_priority(priority);
        }
        if let Some(ms) = self.deadline_ms {
            options = options.with_deadline(Duration::from_millis(ms));
        }
        if self.progress {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(log_progress(rx));
            options = options.with_progress(tx);
        }
        options
    }
}

/// Arguments for the diagonalize command.
#[derive(Parser, Debug)]
pub struct DiagonalizeArgs {
    /// JSON file holding the matrix as an array of rows.
    #[arg(short = 'f', long, conflicts_with = "size")]
    pub matrix_file: Option<PathBuf>,

    /// Dimension of a random symmetric (GOE) matrix to diagonalize.
    #[arg(short = 'n', long, default_value = "64")]
    pub size: usize,

    /// Number of leading eigenpairs.
    #[arg(short = 'k', long, default_value = "3")]
    pub count: usize,

    /// Seed for the random matrix.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Power iteration cap per eigenpair.
    #[arg(long, default_value = "1000")]
    pub max_iterations: usize,

    #[command(flatten)]
    pub job: JobArgs,
}

/// Arguments for the simulate command.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Lattice edge length.
    #[arg(short = 'L', long, default_value = "32")]
    pub size: usize,

    /// Temperature in units of J/k_B.
    #[arg(short = 'T', long, default_value = "2.269")]
    pub temperature: f64,

    /// Exchange coupling J.
    #[arg(long, default_value = "1.0")]
    pub coupling: f64,

    /// External field h.
    #[arg(long, default_value = "0.0")]
    pub field: f64,

    /// Sweeps discarded before measuring.
    #[arg(long, default_value = "200")]
    pub thermalization: usize,

    /// Sweeps measured.
    #[arg(long, default_value = "1000")]
    pub sweeps: usize,

    /// RNG seed.
    #[arg(long)]
    pub seed: Option<u64>,

    #[command(flatten)]
    pub job: JobArgs,
}

/// Arguments for the bands command.
#[derive(Parser, Debug)]
pub struct BandsArgs {
    /// Lattice (chain, square, honeycomb).
    #[arg(long, default_value = "honeycomb")]
    pub lattice: Lattice,

    /// Nearest-neighbor hopping t.
    #[arg(long, default_value = "1.0")]
    pub hopping: f64,

    /// On-site energy.
    #[arg(long, default_value = "0.0")]
    pub onsite: f64,

    /// k-points per path segment.
    #[arg(long, default_value = "50")]
    pub points: usize,

    #[command(flatten)]
    pub job: JobArgs,
}

/// Arguments for the bench command.
#[derive(Parser, Debug)]
pub struct BenchArgs {
    /// Number of jobs to submit.
    #[arg(short = 'j', long, default_value = "24")]
    pub jobs: usize,

    /// Seed for job parameters.
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Retry budget for every job.
    #[arg(long, default_value = "1")]
    pub retries: u32,

    /// Also print Prometheus metrics.
    #[arg(long)]
    pub metrics: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    info!(
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        auto_scale = config.auto_scale,
        "Loaded pool configuration"
    );
    let engine = ComputeEngine::new(config)?;

    let result = match cli.command {
        Commands::Diagonalize(args) => run_diagonalize_command(&engine, args).await,
        Commands::Simulate(args) => run_simulate_command(&engine, args).await,
        Commands::Bands(args) => run_bands_command(&engine, args).await,
        Commands::Bench(args) => run_bench_command(&engine, args).await,
    };

    engine.shutdown();
    result
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PoolConfig> {
    let config = match path {
        Some(path) => PoolConfig::from_yaml_file(path).map_err(|e| {
            anyhow::anyhow!("Failed to load config from {}: {}", path.display(), e)
        })?,
        None => PoolConfig::from_env()?,
    };
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json_output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

async fn log_progress(mut rx: mpsc::UnboundedReceiver<JobProgress>) {
    while let Some(update) = rx.recv().await {
        info!(
            job_id = %update.job_id,
            attempt = update.attempt,
            percent = (update.fraction * 100.0).round() as u64,
            "Progress"
        );
    }
}

// ============================================================================
// Single-job commands
// ============================================================================

async fn run_diagonalize_command(
    engine: &ComputeEngine,
    args: DiagonalizeArgs,
) -> anyhow::Result<()> {
    let matrix = match &args.matrix_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
            serde_json::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Invalid matrix in {}: {}", path.display(), e))?
        }
        None => {
            let mut rng = seeded_rng(args.seed);
            random_symmetric_matrix(args.size, &mut rng)?
        }
    };

    let mut request = DiagonalizationRequest::new(matrix, args.count);
    request.max_iterations = args.max_iterations;

    let computed = engine.diagonalize(request, args.job.submit_options()).await?;
    if !computed.value.converged {
        warn!(job_id = %computed.job_id, "Power iteration did not converge for every eigenpair");
    }
    print_json(&computed)
}

async fn run_simulate_command(engine: &ComputeEngine, args: SimulateArgs) -> anyhow::Result<()> {
    let mut params = SimulationParams::new(args.size, args.temperature)
        .with_sweeps(args.thermalization, args.sweeps);
    params.coupling = args.coupling;
    params.external_field = args.field;
    params.seed = args.seed;

    let computed = engine.run_simulation(params, args.job.submit_options()).await?;
    print_json(&computed)
}

async fn run_bands_command(engine: &ComputeEngine, args: BandsArgs) -> anyhow::Result<()> {
    let mut params = BandStructureParams::new(args.lattice)
        .with_hopping(args.hopping)
        .with_points_per_segment(args.points);
    params.onsite_energy = args.onsite;

    let computed = engine.band_structure(params, args.job.submit_options()).await?;
    print_json(&computed)
}

fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    }
}

/// Samples a GOE matrix: `(X + Xᵀ) / 2` with standard normal entries.
fn random_symmetric_matrix(n: usize, rng: &mut ChaCha8Rng) -> anyhow::Result<Vec<Vec<f64>>> {
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| anyhow::anyhow!("Invalid normal distribution: {}", e))?;

    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let value = if i == j {
                normal.sample(rng)
            } else {
                (normal.sample(rng) + normal.sample(rng)) / 2.0
            };
            matrix[i][j] = value;
            matrix[j][i] = value;
        }
    }
    Ok(matrix)
}

// ============================================================================
// Bench Command Implementation
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct BenchOutput {
    jobs: usize,
    succeeded: usize,
    failed: usize,
    wall_time: Duration,
    failures: Vec<String>,
    pool: PoolStats,
    workers: Vec<WorkerSnapshot>,
}

async fn run_bench_command(engine: &ComputeEngine, args: BenchArgs) -> anyhow::Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let started = Instant::now();

    info!(jobs = args.jobs, seed = args.seed, "Submitting benchmark batch");

    let futures = (0..args.jobs).map(|i| {
        let priority = Priority::ALL[rng.random_range(0..Priority::ALL.len())];
        let options = SubmitOptions::new()
            .with_priority(priority)
            .with_retries(args.retries);
        let seed: u64 = rng.random();

        let job: BoxFuture<'_, anyhow::Result<()>> = match i % 3 {
            0 => {
                let size = rng.random_range(16..=48);
                let matrix = random_symmetric_matrix(size, &mut ChaCha8Rng::seed_from_u64(seed));
                Box::pin(async move {
                    let request = DiagonalizationRequest::new(matrix?, 3);
                    engine.diagonalize(request, options).await.map(|_| ())?;
                    Ok(())
                })
            }
            1 => {
                let size = rng.random_range(8..=24);
                let params = SimulationParams::new(size, rng.random_range(1.0..4.0))
                    .with_sweeps(50, 200)
                    .with_seed(seed);
                Box::pin(async move {
                    engine.run_simulation(params, options).await.map(|_| ())?;
                    Ok(())
                })
            }
            _ => {
                let lattices = [Lattice::Chain, Lattice::Square, Lattice::Honeycomb];
                let lattice = lattices[rng.random_range(0..lattices.len())];
                let params = BandStructureParams::new(lattice).with_points_per_segment(200);
                Box::pin(async move {
                    engine.band_structure(params, options).await.map(|_| ())?;
                    Ok(())
                })
            }
        };
        job
    });
    let futures: Vec<_> = futures.collect();
    let results = futures::future::join_all(futures).await;

    let failures: Vec<String> = results
        .iter()
        .filter_map(|r| r.as_ref().err().map(|e| e.to_string()))
        .collect();

    let output = BenchOutput {
        jobs: args.jobs,
        succeeded: results.len() - failures.len(),
        failed: failures.len(),
        wall_time: started.elapsed(),
        failures,
        pool: engine.stats(),
        workers: engine.worker_stats(),
    };

    info!(
        succeeded = output.succeeded,
        failed = output.failed,
        wall_time_ms = output.wall_time.as_millis() as u64,
        "Benchmark complete"
    );

    print_json(&output)?;
    if args.metrics {
        println!("{}", engine.pool().metrics().export());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_simulate_command_defaults() {
        let cli = Cli::try_parse_from(["compute-forge", "simulate"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.size, 32);
                assert_eq!(args.temperature, 2.269);
                assert_eq!(args.sweeps, 1000);
                assert!(args.seed.is_none());
                assert!(args.job.priority.is_none());
                assert_eq!(args.job.retries, 0);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_job_args_parse_priority() {
        let cli = Cli::try_parse_from([
            "compute-forge",
            "bands",
            "--lattice",
            "square",
            "--priority",
            "critical",
            "--deadline-ms",
            "500",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Bands(args) => {
                assert_eq!(args.lattice, Lattice::Square);
                assert_eq!(args.job.priority, Some(Priority::Critical));
                assert_eq!(args.job.deadline_ms, Some(500));
            }
            _ => panic!("Expected Bands command"),
        }
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let result = Cli::try_parse_from(["compute-forge", "simulate", "--priority", "urgent"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "compute-forge",
            "bench",
            "--jobs",
            "6",
            "--log-level",
            "debug",
            "--config",
            "pool.yaml",
        ])
        .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.config, Some(PathBuf::from("pool.yaml")));
        match cli.command {
            Commands::Bench(args) => {
                assert_eq!(args.jobs, 6);
                assert!(!args.metrics);
            }
            _ => panic!("Expected Bench command"),
        }
    }

    #[test]
    fn test_random_symmetric_matrix() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let matrix = random_symmetric_matrix(5, &mut rng).expect("valid distribution");

        assert_eq!(matrix.len(), 5);
        for i in 0..5 {
            for j in 0..5 {
                assert_eq!(matrix[i][j], matrix[j][i]);
            }
        }
        assert!(DiagonalizationRequest::new(matrix, 2).validate().is_ok());
    }
}
