//! The `validate` subcommand.

use std::path::Path;

/// Parse and validate a job-plan file; exit code reports the outcome.
pub fn run(path: &str) -> i32 {
    match nightrun_config::load_plan(Path::new(path)) {
        Ok(plan) => {
            println!(
                "{}: OK ({} machines, {} jobs)",
                path,
                plan.machines.len(),
                plan.jobs.len()
            );
            0
        }
        Err(e) => {
            eprintln!("{}: {}", path, e);
            1
        }
    }
}
