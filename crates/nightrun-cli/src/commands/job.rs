//! The `job` subcommand: the remote-side runner.
//!
//! Executes one job's command list through the shell and prints the
//! scheduler's retrieval contract on stdout: first line `0` or `1`,
//! following lines the absolute paths of the produced log files.
//! Progress goes to stderr so stdout stays machine-readable.

use anyhow::{Context, bail};
use clap::Args;
use std::io::Write;
use std::path::PathBuf;
use tokio::process::Command;

#[derive(Args)]
pub struct JobArgs {
    /// Name of the job-plan file
    #[arg(short = 'j', long)]
    jobs_config: String,

    /// The job whose commands to execute
    #[arg(long)]
    job: String,

    /// Extra directory searched for job-plan files
    #[arg(long, env = "NIGHTRUN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Where the job's log file is written
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

pub async fn run(args: JobArgs, _verbose: u8) -> anyhow::Result<i32> {
    let dirs = super::plan_dirs(args.config_dir.as_deref());
    let Some(plan_file) = super::find_plan_file(&dirs, &args.jobs_config) else {
        bail!("the job-plan file '{}' was not found", args.jobs_config);
    };
    let plan = nightrun_config::load_plan(&plan_file)
        .with_context(|| format!("loading {}", plan_file.display()))?;

    let Some(job) = plan.job(&args.job) else {
        bail!(
            "impossible to find the job \"{}\" in {}",
            args.job,
            plan_file.display()
        );
    };

    std::fs::create_dir_all(&args.log_dir)
        .with_context(|| format!("creating {}", args.log_dir.display()))?;
    let log_path = args.log_dir.join(format!("{}.log", file_stem(&job.name)));
    let mut log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("creating {}", log_path.display()))?;

    let len_max = job.commands.iter().map(|c| c.len()).max().unwrap_or(0);
    let mut passed = 0usize;
    let mut res = 0;

    for command in &job.commands {
        eprint!(
            "Executing {} {} ",
            command,
            ".".repeat(len_max - command.len())
        );
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .with_context(|| format!("spawning '{}'", command))?;

        writeln!(log_file, "$ {}", command)?;
        log_file.write_all(&output.stdout)?;
        log_file.write_all(&output.stderr)?;
        writeln!(log_file)?;

        if output.status.success() {
            passed += 1;
            eprintln!("OK");
        } else {
            res = 1;
            eprintln!("KO");
        }
    }

    eprintln!(
        "\nCommands: {} ({}/{})",
        if res == 0 { "OK" } else { "KO" },
        passed,
        job.commands.len()
    );

    // The retrieval contract: result line, then log file paths
    println!("{}", res);
    let absolute = std::path::absolute(&log_path).unwrap_or(log_path);
    println!("{}", absolute.display());

    Ok(res)
}

/// A filesystem-safe stem for the job's log file.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
