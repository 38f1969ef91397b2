//! meshsim: discrete-event simulator for microservice resilience experiments.
//!
//! # Usage
//!
//! ```text
//! meshsim init --name checkout --path checkout.toml
//! meshsim run --config checkout.toml --format json --graph checkout.dot
//! meshsim sweep --config checkout.toml --seeds 1,2,3,4
//! ```

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "meshsim",
    about = "meshsim: microservice resilience simulator",
    version,
    propagate_version = true
)]
struct Cli {
    /// Log output format: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment and print its summary
    Run {
        /// Experiment file (TOML)
        #[arg(short, long)]
        config: String,
        /// Override the experiment seed
        #[arg(long)]
        seed: Option<u64>,
        /// Override the simulated duration in seconds
        #[arg(long)]
        duration: Option<f64>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Write the sampled time series as JSON to this file
        #[arg(short, long)]
        output: Option<String>,
        /// Write the service dependency graph (.dot for Graphviz, JSON otherwise)
        #[arg(long)]
        graph: Option<String>,
    },
    /// Check an experiment file without running it
    Validate {
        #[arg(short, long)]
        config: String,
    },
    /// Write a two-tier experiment scaffold
    Init {
        #[arg(short, long, default_value = "experiment")]
        name: String,
        #[arg(short, long, default_value = "experiment.toml")]
        path: String,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run independent replications of one experiment in parallel.
    ///
    /// Replications differ only in their seed. Pass explicit seeds, or a
    /// number of runs seeded consecutively from the experiment seed.
    Sweep {
        #[arg(short, long)]
        config: String,
        #[arg(long, value_delimiter = ',')]
        seeds: Vec<u64>,
        #[arg(long, default_value = "4")]
        runs: u64,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn init_tracing(log_format: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("meshsim=info")?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match log_format {
        "json" => builder.json().init(),
        _ => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_format)?;

    match cli.command {
        Commands::Run {
            config,
            seed,
            duration,
            format,
            output,
            graph,
        } => commands::run::run(
            &config,
            commands::run::RunArgs {
                seed,
                duration,
                format: &format,
                output: output.as_deref(),
                graph: graph.as_deref(),
            },
        ),
        Commands::Validate { config } => commands::validate::validate(&config),
        Commands::Init { name, path, force } => commands::validate::init(&name, &path, force),
        Commands::Sweep {
            config,
            seeds,
            runs,
            format,
        } => commands::sweep::sweep(&config, seeds, runs, &format).await,
    }
}
