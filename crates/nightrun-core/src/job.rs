//! Job definitions and the parsed job plan.

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::Machine;

/// Static description of one remote job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job name.
    pub name: String,
    /// Name of the machine the job runs on.
    pub machine: String,
    /// Shell commands the remote runner executes, in order.
    pub commands: Vec<String>,
    /// Maximum execution time, in seconds.
    pub timeout: u64,
    /// Name of a job that must finish before this one starts.
    pub after: Option<String>,
    /// Application tag, for reporting.
    pub application: Option<String>,
    /// Distribution tag, for reporting.
    pub distribution: Option<String>,
    /// Report-grouping tag; no scheduling effect.
    pub group: Option<String>,
    /// Days of the week the job is eligible to run.
    pub when: Vec<Weekday>,
}

impl JobDefinition {
    /// Whether the job is eligible to run on `day`.
    pub fn runs_on(&self, day: Weekday) -> bool {
        self.when.contains(&day)
    }
}

/// A parsed job plan: the machines and job definitions for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPlan {
    pub machines: Vec<Machine>,
    pub jobs: Vec<JobDefinition>,
}

impl JobPlan {
    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// Result reported by the remote runner.
///
/// The remote side prints `0` or `1` on the first line of its stdout;
/// `NotRun` covers everything before that line has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// No result has been reported yet.
    NotRun,
    /// The remote runner reported success.
    Success,
    /// The remote runner reported failure.
    Failure,
}

impl ResultCode {
    /// Parse the first line of the remote runner's stdout.
    ///
    /// Anything other than a literal `0` counts as a failure.
    pub fn parse(line: &str) -> Self {
        if line.trim() == "0" {
            ResultCode::Success
        } else {
            ResultCode::Failure
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ResultCode::Failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str, when: Vec<Weekday>) -> JobDefinition {
        JobDefinition {
            name: name.to_string(),
            machine: "build1".to_string(),
            commands: vec!["echo hello".to_string()],
            timeout: 600,
            after: None,
            application: None,
            distribution: None,
            group: None,
            when,
        }
    }

    #[test]
    fn runs_on_checks_eligibility_days() {
        let job = definition("nightly", vec![Weekday::Mon, Weekday::Thu]);
        assert!(job.runs_on(Weekday::Mon));
        assert!(job.runs_on(Weekday::Thu));
        assert!(!job.runs_on(Weekday::Sun));
    }

    #[test]
    fn result_code_parses_manifest_line() {
        assert_eq!(ResultCode::parse("0"), ResultCode::Success);
        assert_eq!(ResultCode::parse("0\n"), ResultCode::Success);
        assert_eq!(ResultCode::parse("1"), ResultCode::Failure);
        assert_eq!(ResultCode::parse("garbage"), ResultCode::Failure);
        assert!(ResultCode::parse("1").is_failure());
        assert!(!ResultCode::NotRun.is_failure());
    }

    #[test]
    fn plan_lookups_find_by_name() {
        let plan = JobPlan {
            machines: vec![Machine {
                name: "build1".to_string(),
                host: "build1.example.org".to_string(),
                port: 22,
                user: "maint".to_string(),
                password: None,
                install_path: "nightrun".to_string(),
            }],
            jobs: vec![definition("nightly", vec![Weekday::Mon])],
        };
        assert!(plan.machine("build1").is_some());
        assert!(plan.machine("missing").is_none());
        assert!(plan.job("nightly").is_some());
        assert!(plan.job("missing").is_none());
    }
}
