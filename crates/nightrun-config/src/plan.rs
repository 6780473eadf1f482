//! Job-plan configuration parsing.

use crate::{ConfigError, ConfigResult};
use chrono::Weekday;
use kdl::{KdlDocument, KdlNode};
use nightrun_core::machine::{DEFAULT_INSTALL_PATH, DEFAULT_PORT};
use nightrun_core::{JobDefinition, JobPlan, Machine};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Load and validate a job plan from a KDL file.
pub fn load_plan(path: &Path) -> ConfigResult<JobPlan> {
    let text = std::fs::read_to_string(path)?;
    parse_plan(&text)
}

/// Parse a job plan from KDL text.
///
/// Dangling `after` references and dependency cycles are rejected here,
/// before any connection is opened. A job referencing an undefined machine
/// is kept: the scheduler warns about it and drops the job at plan-build
/// time, matching the treatment of machines that fail to connect.
pub fn parse_plan(kdl: &str) -> ConfigResult<JobPlan> {
    let doc: KdlDocument = kdl.parse()?;

    let mut machines: Vec<Machine> = Vec::new();
    let mut jobs: Vec<JobDefinition> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "machine" => {
                let machine = parse_machine(node)?;
                if machines.iter().any(|m| m.name == machine.name) {
                    return Err(ConfigError::Duplicate(format!(
                        "machine '{}'",
                        machine.name
                    )));
                }
                machines.push(machine);
            }
            "job" => {
                let job = parse_job(node)?;
                if jobs.iter().any(|j| j.name == job.name) {
                    return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
                }
                jobs.push(job);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    // Validate dependency references before anything runs
    let job_names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
    for job in &jobs {
        if let Some(after) = &job.after {
            if !job_names.contains(&after.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' depends on unknown job '{}'",
                    job.name, after
                )));
            }
        }
    }

    if let Err(cycle) = detect_cycle(&jobs) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(JobPlan { machines, jobs })
}

fn parse_machine(node: &KdlNode) -> ConfigResult<Machine> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("machine name".to_string()))?;
    let host = get_string_prop(node, "host")
        .ok_or_else(|| ConfigError::MissingField(format!("host for machine '{}'", name)))?;
    let user = match get_string_prop(node, "user").or_else(local_user) {
        Some(user) => user,
        None => {
            return Err(ConfigError::MissingField(format!(
                "user for machine '{}'",
                name
            )));
        }
    };

    let port = match get_int_prop(node, "port") {
        None => DEFAULT_PORT,
        Some(p) => u16::try_from(p).map_err(|_| ConfigError::InvalidValue {
            field: format!("port for machine '{}'", name),
            message: format!("{} is not a valid port number", p),
        })?,
    };

    Ok(Machine {
        name,
        host,
        port,
        user,
        password: get_string_prop(node, "password"),
        install_path: get_string_prop(node, "install-path")
            .unwrap_or_else(|| DEFAULT_INSTALL_PATH.to_string()),
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;
    let machine = get_string_prop(node, "machine")
        .ok_or_else(|| ConfigError::MissingField(format!("machine for job '{}'", name)))?;
    let timeout = get_int_prop(node, "timeout")
        .ok_or_else(|| ConfigError::MissingField(format!("timeout for job '{}'", name)))?;
    let timeout = u64::try_from(timeout).map_err(|_| ConfigError::InvalidValue {
        field: format!("timeout for job '{}'", name),
        message: "timeout must be a positive number of seconds".to_string(),
    })?;

    let mut commands = Vec::new();
    let mut when = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "when" => {
                    for day in get_all_string_args(child) {
                        let day = Weekday::from_str(&day).map_err(|_| {
                            ConfigError::InvalidValue {
                                field: format!("when for job '{}'", name),
                                message: format!("unknown day of week: {}", day),
                            }
                        })?;
                        when.push(day);
                    }
                }
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "commands for job '{}'",
            name
        )));
    }

    Ok(JobDefinition {
        name,
        machine,
        commands,
        timeout,
        after: get_string_prop(node, "after"),
        application: get_string_prop(node, "application"),
        distribution: get_string_prop(node, "distribution"),
        group: get_string_prop(node, "group"),
        when,
    })
}

/// The invoking user, for machines that do not configure one.
fn local_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

/// Detect cycles in the `after` graph using DFS.
fn detect_cycle(jobs: &[JobDefinition]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let job_map: HashMap<&str, &JobDefinition> =
        jobs.iter().map(|j| (j.name.as_str(), j)).collect();

    for job in jobs {
        if !visited.contains_key(job.name.as_str()) {
            if let Some(cycle) = dfs_detect_cycle(&job.name, &job_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    job_map: &'a HashMap<&'a str, &'a JobDefinition>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(job) = job_map.get(node) {
        if let Some(dep) = &job.after {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, job_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
