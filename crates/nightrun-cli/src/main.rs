//! Nightrun CLI tool.

use clap::{Parser, Subcommand};

mod commands;
mod sink;

#[derive(Parser)]
#[command(name = "nightrun")]
#[command(about = "Nightrun fleet maintenance scheduler", long_about = None)]
struct Cli {
    /// Increase output verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch today's jobs across the fleet
    Jobs(commands::jobs::JobsArgs),
    /// Execute one job's commands locally (the remote-side runner)
    Job(commands::job::JobArgs),
    /// Validate a job-plan file
    Validate {
        /// Path to the job-plan file
        #[arg(default_value = "jobs.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Jobs(args) => commands::jobs::run(args, cli.verbose).await?,
        Commands::Job(args) => commands::job::run(args, cli.verbose).await?,
        Commands::Validate { path } => commands::validate::run(&path),
    };
    std::process::exit(code);
}
