//! Status document model.

use chrono::{DateTime, Local};
use nightrun_core::{HostKey, ResultCode};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Overall run status stamped on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "finished")]
    Finished,
    #[serde(rename = "Forced interruption")]
    ForcedInterruption,
}

/// One job's row in a status document. Replaced wholesale on every update.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub name: String,
    pub machine: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub install_path: String,
    pub application: Option<String>,
    pub distribution: Option<String>,
    pub group: Option<String>,
    pub timeout: u64,
    pub commands: String,
    /// Human status string, as produced by the scheduler.
    pub state: String,
    pub begin: Option<DateTime<Local>>,
    pub end: Option<DateTime<Local>>,
    /// Captured stdout, display-control characters stripped.
    pub out: String,
    /// Captured stderr, display-control characters stripped.
    pub err: String,
    pub res: ResultCode,
    /// First collected log file, when any were retrieved.
    pub log_file: Option<String>,
    pub after: Option<AfterLink>,
}

/// Link from a dependent job to its prerequisite.
#[derive(Debug, Clone, Serialize)]
pub struct AfterLink {
    pub name: String,
    /// The prerequisite's first log file, once it has one.
    pub link: Option<String>,
}

/// A job present in the plan but not eligible today.
#[derive(Debug, Clone, Serialize)]
pub struct NotTodayRecord {
    pub name: String,
    pub application: Option<String>,
    pub distribution: Option<String>,
    pub commands: String,
    pub state: &'static str,
}

impl NotTodayRecord {
    pub fn new(
        name: String,
        application: Option<String>,
        distribution: Option<String>,
        commands: String,
    ) -> Self {
        Self {
            name,
            application,
            distribution,
            commands,
            state: "Not today",
        }
    }
}

/// One status document: the global view, or one report group's slice.
#[derive(Debug, Clone, Serialize)]
pub struct ReportDocument {
    pub hosts: Vec<HostKey>,
    pub applications: Vec<String>,
    pub distributions: Vec<String>,
    pub jobs: Vec<JobRecord>,
    pub jobs_not_today: Vec<NotTodayRecord>,
    pub updated: DateTime<Local>,
    pub status: RunStatus,
}

static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    // ANSI escape sequences plus raw control characters other than \n and \t
    Regex::new(r"\x1B\[[0-9;]*[A-Za-z]|[\x00-\x08\x0B-\x1F\x7F]").expect("valid regex")
});

/// Strip display-control characters from captured command output.
pub fn scrub(text: &str) -> String {
    CONTROL_CHARS.replace_all(text, "").into_owned()
}
