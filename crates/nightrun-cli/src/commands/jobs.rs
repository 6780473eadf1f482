//! The `jobs` subcommand: dispatch today's jobs across the fleet.

use crate::sink::ConsoleSink;
use anyhow::{Context, bail};
use chrono::Datelike;
use clap::Args;
use nightrun_core::{Error, Machine, OutputSink};
use nightrun_remote::{SshOptions, SshTransport, Transport};
use nightrun_scheduler::{RunPaths, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct JobsArgs {
    /// Name of the job-plan file to run
    #[arg(short = 'j', long)]
    jobs_config: Option<String>,

    /// Restrict the run to these job names
    #[arg(short = 'o', long, value_delimiter = ',')]
    only_jobs: Vec<String>,

    /// List the available job-plan files and exit
    #[arg(short = 'l', long)]
    list: bool,

    /// With --list, do not print directory labels
    #[arg(long)]
    no_label: bool,

    /// Connect to the machines without executing any job
    #[arg(short = 't', long)]
    test_connection: bool,

    /// Publish live status documents into this directory
    #[arg(short = 'p', long)]
    publish: Option<PathBuf>,

    /// Extra directory searched for job-plan files
    #[arg(long, env = "NIGHTRUN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Local toolchain tree deployed to the machines
    /// (defaults to the running binary's directory)
    #[arg(long)]
    install_tree: Option<PathBuf>,

    /// Where retrieved remote logs land
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Refuse SSH host keys that are not already known
    #[arg(long)]
    strict_host_keys: bool,

    /// SSH private key used when a machine has no password
    #[arg(long)]
    identity: Option<PathBuf>,
}

pub async fn run(args: JobsArgs, verbose: u8) -> anyhow::Result<i32> {
    let dirs = super::plan_dirs(args.config_dir.as_deref());
    let sink: Arc<dyn OutputSink> = Arc::new(ConsoleSink::new(verbose));

    if args.list {
        for dir in &dirs {
            if !args.no_label {
                sink.write(&format!("------ {}\n", dir.display()), 0);
            }
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut names: Vec<String> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".kdl"))
                .map(|name| name.trim_end_matches(".kdl").to_string())
                .collect();
            names.sort();
            for name in names {
                sink.write(&format!("{}\n", name), 0);
            }
        }
        return Ok(0);
    }

    let Some(config_name) = &args.jobs_config else {
        bail!("the --jobs-config option is required");
    };
    let Some(plan_file) = super::find_plan_file(&dirs, config_name) else {
        bail!(
            "the job-plan file '{}' was not found; use --list to see the possible files",
            config_name
        );
    };
    info!(plan = %plan_file.display(), "loading job plan");

    let mut plan = nightrun_config::load_plan(&plan_file)
        .with_context(|| format!("loading {}", plan_file.display()))?;
    if !args.only_jobs.is_empty() {
        plan.jobs.retain(|job| args.only_jobs.contains(&job.name));
    }

    let toolchain_dir = match args.install_tree {
        Some(dir) => dir,
        None => super::install_dir().context("cannot locate the running binary")?,
    };
    let paths = RunPaths {
        plan_file: plan_file.clone(),
        toolchain_dir,
        log_dir: args.log_dir.clone(),
    };

    let ssh_options = SshOptions {
        identity_path: args.identity.clone(),
        strict_host_keys: args.strict_host_keys,
    };
    let factory = move |_machine: &Machine| -> Box<dyn Transport> {
        Box::new(SshTransport::new(ssh_options.clone()))
    };

    let today = chrono::Local::now().weekday();
    let mut scheduler = Scheduler::new(&plan, today, paths, sink.clone(), &factory)?;

    scheduler.open_all_connections().await;
    if args.test_connection {
        scheduler.close_connections().await;
        return Ok(0);
    }

    if let Some(dir) = &args.publish {
        scheduler
            .attach_report(dir)
            .with_context(|| format!("initializing status report in {}", dir.display()))?;
    }

    let outcome = scheduler.run_jobs().await;
    scheduler.write_all_results().await;
    scheduler.close_connections().await;

    match outcome {
        Ok(true) => Ok(0),
        Ok(false) => Ok(1),
        Err(Error::Interrupted) => Ok(1),
        Err(e) => Err(e.into()),
    }
}
