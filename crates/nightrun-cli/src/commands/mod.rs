//! CLI subcommands.

pub mod job;
pub mod jobs;
pub mod validate;

use std::path::{Path, PathBuf};

/// Directories searched for job-plan files: the explicit override first,
/// then `data/jobs` next to the installed binary.
pub fn plan_dirs(config_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = config_dir {
        dirs.push(dir.to_path_buf());
    }
    if let Some(exe_dir) = install_dir() {
        dirs.push(exe_dir.join("data").join("jobs"));
    }
    dirs
}

/// The directory the running binary was installed into.
pub fn install_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

/// Locate a plan file by name across the search directories, appending the
/// `.kdl` extension when missing.
pub fn find_plan_file(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    let file_name = if name.ends_with(".kdl") {
        name.to_string()
    } else {
        format!("{}.kdl", name)
    };
    // An explicit path wins over the search directories
    let direct = PathBuf::from(&file_name);
    if direct.exists() {
        return Some(direct);
    }
    dirs.iter()
        .map(|dir| dir.join(&file_name))
        .find(|candidate| candidate.exists())
}
