use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ktest_sched::config::{load_environments, SchedulerConfig};
use ktest_sched::dashboard::{run_dashboard, DashboardState};
use ktest_sched::runner::SimulatedRunner;
use ktest_sched::scheduler::{
    Environment, HardwareProfile, HardwareRequirement, JobPriority, JobState, SchedulerEvent,
    SubmitRequest, TestScheduler, TestSpec,
};
use ktest_sched::shutdown;

#[derive(Parser, Debug)]
#[command(name = "ktest-sched")]
#[command(version)]
#[command(about = "Priority scheduler for kernel test jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler with its JSON control API
    Serve(ServeArgs),

    /// Run a self-contained simulation and print a summary
    Simulate(SimulateArgs),
}

// =============================================================================
// Serve
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port for the control API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Environment inventory file (JSON array)
    #[arg(long)]
    environments: Option<PathBuf>,

    /// Default retry budget for submitted jobs
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Queue capacity before submissions are rejected
    #[arg(long, default_value = "10000")]
    queue_capacity: usize,

    /// Per-execution timeout in seconds
    #[arg(long, default_value = "600")]
    execution_timeout_secs: u64,

    /// Fraction of simulated runs that fail
    #[arg(long, default_value = "0.2")]
    failure_rate: f64,

    /// Fraction of simulated failures reported as kernel panics
    #[arg(long, default_value = "0.25")]
    fatal_rate: f64,

    /// Multiplier applied to estimated durations when simulating
    #[arg(long, default_value = "0.1")]
    time_scale: f64,

    /// Seconds to wait for running jobs after a shutdown signal
    #[arg(long, default_value = "30")]
    drain_grace_secs: u64,
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SchedulerConfig::default()
        .with_max_retries(args.max_retries)
        .with_queue_capacity(args.queue_capacity)
        .with_execution_timeout(Duration::from_secs(args.execution_timeout_secs));

    let runner = SimulatedRunner::new(args.failure_rate, args.fatal_rate, args.time_scale);
    let scheduler = TestScheduler::new(config, Arc::new(runner));

    if let Some(path) = &args.environments {
        let environments = load_environments(path)?;
        let loaded = environments.len();
        for environment in environments {
            scheduler.add_environment(environment).await?;
        }
        tracing::info!(loaded, path = %path.display(), "Environment inventory loaded");
    } else {
        tracing::warn!("No environment inventory given, register environments over the API");
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let dashboard_state = DashboardState {
        scheduler: scheduler.clone(),
    };
    tokio::spawn(async move {
        run_dashboard(addr, dashboard_state).await;
    });

    let shutdown_token = shutdown::install_shutdown_handler();

    // Periodically surface allocations that have outrun their estimate.
    let watch_scheduler = scheduler.clone();
    let watch_token = shutdown_token.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for allocation in watch_scheduler.stale_allocations().await {
                        tracing::warn!(
                            job_id = %allocation.job_id,
                            environment_id = %allocation.environment_id,
                            allocated_at = %allocation.allocated_at,
                            "Allocation has exceeded its estimated duration"
                        );
                    }
                }
                _ = watch_token.cancelled() => break,
            }
        }
    });

    shutdown_token.cancelled().await;

    let cancelled = scheduler.shutdown().await;
    tracing::info!(cancelled, "Queued jobs cancelled, draining running jobs");
    shutdown::drain_running(&scheduler, Duration::from_secs(args.drain_grace_secs)).await;

    Ok(())
}

// =============================================================================
// Simulate
// =============================================================================

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of environments to register
    #[arg(long, default_value = "4")]
    environments: usize,

    /// Number of jobs to submit
    #[arg(long, default_value = "20")]
    jobs: usize,

    /// Fraction of runs that fail
    #[arg(long, default_value = "0.2")]
    failure_rate: f64,

    /// Fraction of failures reported as kernel panics
    #[arg(long, default_value = "0.25")]
    fatal_rate: f64,

    /// Multiplier applied to estimated durations
    #[arg(long, default_value = "0.01")]
    time_scale: f64,

    /// Default retry budget for submitted jobs
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Overall simulation timeout in seconds
    #[arg(long, default_value = "120")]
    timeout_secs: u64,
}

fn simulation_environment(index: usize) -> Environment {
    // Alternate virtual x86 machines with physical arm boards so both
    // matching paths get exercised.
    if index % 2 == 0 {
        Environment::new(
            format!("qemu-x86-{index}"),
            HardwareProfile {
                architecture: "x86_64".to_string(),
                memory_mb: 4096,
                peripherals: Default::default(),
                is_virtual: true,
            },
        )
    } else {
        Environment::new(
            format!("board-arm64-{index}"),
            HardwareProfile {
                architecture: "arm64".to_string(),
                memory_mb: 2048,
                peripherals: ["usb".to_string(), "gpio".to_string()].into(),
                is_virtual: false,
            },
        )
    }
}

fn simulation_request(index: usize, total: usize) -> SubmitRequest {
    let subsystems = ["mm", "sched", "fs", "net"];
    let subsystem = subsystems[index % subsystems.len()];
    let priority = match index % 3 {
        0 => JobPriority::Low,
        1 => JobPriority::Medium,
        _ => JobPriority::High,
    };
    let mut spec = TestSpec {
        name: format!("{subsystem}-regression-{index}"),
        target_subsystem: subsystem.to_string(),
        command: format!("ktest run {subsystem} --case {index}"),
        hardware: None,
        estimated_duration_secs: 30 + (index as u64 % 5) * 15,
    };
    // Every third job needs real arm hardware.
    if index % 3 == 2 {
        spec.hardware = Some(HardwareRequirement {
            architecture: "arm64".to_string(),
            min_memory_mb: 1024,
            peripherals: ["usb".to_string()].into(),
        });
    }
    SubmitRequest::new(spec, priority, index as f64 / total.max(1) as f64)
}

async fn run_simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SchedulerConfig::default()
        .with_max_retries(args.max_retries)
        .with_execution_timeout(Duration::from_secs(60));
    let runner = SimulatedRunner::new(args.failure_rate, args.fatal_rate, args.time_scale);
    let scheduler = TestScheduler::new(config, Arc::new(runner));

    let mut events = scheduler.subscribe().await;

    for index in 0..args.environments {
        scheduler.add_environment(simulation_environment(index)).await?;
    }
    for index in 0..args.jobs {
        scheduler
            .submit_job(simulation_request(index, args.jobs))
            .await?;
    }

    // Wait for every job to reach a terminal state.
    let waited = tokio::time::timeout(Duration::from_secs(args.timeout_secs), async {
        let mut terminal = 0usize;
        while terminal < args.jobs {
            match events.recv().await {
                Some(
                    SchedulerEvent::JobSucceeded { .. }
                    | SchedulerEvent::JobFailed { .. }
                    | SchedulerEvent::JobCancelled { .. },
                ) => terminal += 1,
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;
    if waited.is_err() {
        eprintln!("Simulation timed out with jobs still outstanding");
        std::process::exit(1);
    }

    let jobs = scheduler.list_jobs().await;
    let passed = jobs.iter().filter(|j| j.state == JobState::Passed).count();
    let failed = jobs.iter().filter(|j| j.state == JobState::Failed).count();
    let retries: u32 = jobs.iter().map(|j| j.retry_count).sum();

    println!("Simulation complete");
    println!("{}", "=".repeat(40));
    println!("Environments: {}", args.environments);
    println!("Submitted:    {}", args.jobs);
    println!("Passed:       {}", passed);
    println!("Failed:       {}", failed);
    println!("Retries:      {}", retries);

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
        Commands::Simulate(simulate_args) => run_simulate(simulate_args).await?,
    }

    Ok(())
}
