//! evopool - specialist pool evolution engine
//!
//! ## Commands
//!
//! - `validate`: check every domain document in a directory
//! - `simulate`: run seeded synthetic traffic through an engine
//! - `status`: inspect a persisted engine snapshot

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use evopool::report;
use evopool::simulate::{self, SimulatedExecutor, SimulatedVoter, SimulationOptions};
use evopool_collective::{Engine, JsonFilePersistence, Persistence};
use evopool_config::{DomainRegistry, EngineConfig, EvaluationMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "evopool")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Specialist pool evolution and weighted-council evaluation", long_about = None)]
struct Cli {
    /// Engine settings file (default: $EVOPOOL_CONFIG, then the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the domain documents in a directory
    Validate {
        /// Directory holding one TOML document per domain
        dir: PathBuf,
    },

    /// Run seeded synthetic tasks through a fresh or restored engine
    Simulate {
        /// Domain documents directory (default: `domains_dir` from the settings)
        #[arg(long)]
        domains: Option<PathBuf>,

        /// Number of tasks to run
        #[arg(long, default_value_t = 200)]
        tasks: usize,

        /// Seed for selection, skills and traffic
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Evaluation mode: committee, council or both
        #[arg(long, value_parser = parse_mode)]
        mode: Option<EvaluationMode>,

        /// Snapshot file to restore from and save to
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Show pools, graveyard and budget of a saved snapshot
    Status {
        /// Snapshot file
        #[arg(long)]
        state: PathBuf,

        /// Also list retired specialists
        #[arg(long)]
        graveyard: bool,
    },
}

fn parse_mode(s: &str) -> std::result::Result<EvaluationMode, String> {
    EvaluationMode::from_str(s)
        .ok_or_else(|| format!("unknown evaluation mode '{}' (committee, council, both)", s))
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Validate { dir } => validate(cli.config, dir),
        Commands::Simulate {
            domains,
            tasks,
            seed,
            mode,
            state,
        } => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            simulate(config, domains, tasks, seed, mode, state).await
        }
        Commands::Status { state, graveyard } => status(state, graveyard),
    }
}

fn validate(config: Option<PathBuf>, dir: PathBuf) -> Result<()> {
    if let Some(path) = config {
        EngineConfig::from_file(&path)?;
        println!("ok  {}", path.display());
    }

    let (registry, load) = DomainRegistry::load_dir(&dir)?;
    for name in &load.loaded {
        println!("ok  {}", name);
    }
    for excluded in &load.excluded {
        println!("err {}: {}", excluded.source.display(), excluded.reason);
    }
    if !load.excluded.is_empty() {
        bail!(
            "{} of {} domain documents are invalid",
            load.excluded.len(),
            load.excluded.len() + registry.len()
        );
    }
    if registry.is_empty() {
        bail!("no domain documents found in {}", dir.display());
    }
    Ok(())
}

async fn simulate(
    mut config: EngineConfig,
    domains: Option<PathBuf>,
    tasks: usize,
    seed: u64,
    mode: Option<EvaluationMode>,
    state: Option<PathBuf>,
) -> Result<()> {
    let dir = domains
        .or_else(|| config.domains_dir.clone())
        .context("no domains directory given and none configured")?;
    let (registry, load) = DomainRegistry::load_dir(&dir)?;
    if registry.is_empty() {
        bail!("no valid domain documents in {}", dir.display());
    }
    if !load.excluded.is_empty() {
        tracing::warn!("{} domain documents excluded", load.excluded.len());
    }
    if let Some(mode) = mode {
        config.evaluation.mode = mode;
    }
    if state.is_some() {
        config.persistence.snapshot_path = state;
    }

    let engine = Engine::builder(config)
        .registry(registry.clone())
        .executor(Arc::new(SimulatedExecutor::new(&registry, seed)))
        .voter(Arc::new(SimulatedVoter::new(seed)))
        .seed(seed)
        .build()
        .await?;

    let summary = simulate::run(&engine, &registry, &SimulationOptions { tasks, seed }).await?;
    engine.save_snapshot().await?;

    println!(
        "{} tasks: {} completed, {} failed, {} deferred, {} rejected, {} errors, {} rated\n",
        summary.submitted,
        summary.completed,
        summary.failed,
        summary.deferred,
        summary.rejected,
        summary.errors,
        summary.feedback
    );
    let mut statuses = Vec::new();
    for domain in engine.domains() {
        statuses.push(engine.domain_status(&domain).await?);
    }
    print!("{}", report::pools(&statuses));
    println!();
    print!("{}", report::graveyard(&engine.list_graveyard(None).await));
    println!();
    print!("{}", report::budget(&engine.snapshot().await.budget));
    if engine.evaluation_mode() == EvaluationMode::Both {
        println!();
        print!("{}", report::comparison(&engine.comparison()));
    }
    Ok(())
}

fn status(state: PathBuf, show_graveyard: bool) -> Result<()> {
    let Some(snapshot) = JsonFilePersistence::new(&state).load()? else {
        println!("No snapshot at {}", state.display());
        return Ok(());
    };

    println!(
        "Snapshot v{} saved {}\n",
        snapshot.version,
        snapshot.saved_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let statuses: Vec<_> = snapshot.pools.iter().map(|pool| pool.status()).collect();
    print!("{}", report::pools(&statuses));
    println!();
    if show_graveyard {
        print!("{}", report::graveyard(&snapshot.graveyard.list(None)));
    } else {
        println!("{} retired specialists", snapshot.graveyard.len());
    }
    println!();
    print!("{}", report::budget(&snapshot.budget));
    Ok(())
}
