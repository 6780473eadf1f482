//! Scheduler scenarios against a scripted transport.

use async_trait::async_trait;
use chrono::Weekday;
use nightrun_core::{JobDefinition, JobPlan, Machine, NoopSink};
use nightrun_remote::{ProcessOutput, RemoteProcess, Transport, TransportError, TransportResult};
use nightrun_scheduler::{RunPaths, Scheduler};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// (machine name, operation) pairs, in order.
type OpLog = Arc<Mutex<Vec<(String, String)>>>;

#[derive(Clone, Default)]
struct MachineScript {
    refuse_connect: bool,
    /// stdout of the job-runner invocation (the result manifest).
    job_stdout: String,
    /// Polls of `is_finished` before the job process reports completion.
    polls_to_finish: u32,
    /// The job process never completes (timeout scenarios).
    never_finishes: bool,
}

struct ScriptedTransport {
    machine: String,
    script: MachineScript,
    ops: OpLog,
}

impl ScriptedTransport {
    fn log(&self, op: String) {
        self.ops.lock().unwrap().push((self.machine.clone(), op));
    }
}

struct ScriptedProcess {
    stdout: String,
    remaining: AtomicU32,
    never: bool,
}

impl ScriptedProcess {
    fn done(stdout: &str) -> Box<dyn RemoteProcess> {
        Box::new(Self {
            stdout: stdout.to_string(),
            remaining: AtomicU32::new(0),
            never: false,
        })
    }
}

#[async_trait]
impl RemoteProcess for ScriptedProcess {
    fn is_finished(&self) -> bool {
        if self.never {
            return false;
        }
        let left = self.remaining.load(Ordering::SeqCst);
        if left == 0 {
            return true;
        }
        self.remaining.store(left - 1, Ordering::SeqCst);
        false
    }

    async fn collect(&mut self) -> ProcessOutput {
        ProcessOutput {
            stdout: self.stdout.clone(),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self, _machine: &Machine) -> TransportResult<()> {
        if self.script.refuse_connect {
            return Err(TransportError::AuthenticationFailed);
        }
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> TransportResult<Box<dyn RemoteProcess>> {
        self.log(format!("exec {}", command));
        if command.starts_with("ps aux") {
            return Ok(ScriptedProcess::done("4242\n"));
        }
        if command.starts_with("kill") {
            return Ok(ScriptedProcess::done(""));
        }
        Ok(Box::new(ScriptedProcess {
            stdout: self.script.job_stdout.clone(),
            remaining: AtomicU32::new(self.script.polls_to_finish),
            never: self.script.never_finishes,
        }))
    }

    async fn make_dir(&mut self, remote: &str) -> TransportResult<()> {
        self.log(format!("mkdir {}", remote));
        Ok(())
    }

    async fn upload_file(&mut self, _local: &Path, remote: &str) -> TransportResult<()> {
        self.log(format!("put {}", remote));
        Ok(())
    }

    async fn upload_symlink(&mut self, _target: &str, remote: &str) -> TransportResult<()> {
        self.log(format!("symlink {}", remote));
        Ok(())
    }

    async fn download_file(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        self.log(format!("get {}", remote));
        if remote.contains("missing") {
            return Err(TransportError::Protocol("no such file".to_string()));
        }
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, "log")?;
        Ok(())
    }

    async fn close(&mut self) {}
}

fn all_days() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ]
}

fn machine(name: &str, host: &str) -> Machine {
    Machine {
        name: name.to_string(),
        host: host.to_string(),
        port: 22,
        user: "maint".to_string(),
        password: None,
        install_path: "nightrun".to_string(),
    }
}

fn job(name: &str, machine: &str, after: Option<&str>) -> JobDefinition {
    JobDefinition {
        name: name.to_string(),
        machine: machine.to_string(),
        commands: vec!["make".to_string()],
        timeout: 600,
        after: after.map(String::from),
        application: None,
        distribution: None,
        group: None,
        when: all_days(),
    }
}

fn paths(label: &str) -> RunPaths {
    let base = std::env::temp_dir().join(format!(
        "nightrun-sched-{}-{}",
        label,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&base);
    std::fs::create_dir_all(base.join("tree")).unwrap();
    std::fs::write(base.join("plan.kdl"), "").unwrap();
    RunPaths {
        plan_file: base.join("plan.kdl"),
        toolchain_dir: base.join("tree"),
        log_dir: base.join("logs"),
    }
}

fn build_scheduler(
    plan: &JobPlan,
    scripts: HashMap<String, MachineScript>,
    ops: OpLog,
    label: &str,
) -> Scheduler {
    let factory = move |machine: &Machine| -> Box<dyn Transport> {
        let script = scripts.get(&machine.name).cloned().unwrap_or_default();
        Box::new(ScriptedTransport {
            machine: machine.name.clone(),
            script,
            ops: ops.clone(),
        })
    };
    Scheduler::new(
        plan,
        Weekday::Mon,
        paths(label),
        Arc::new(NoopSink),
        &factory,
    )
    .unwrap()
}

fn execs_for<'a>(ops: &'a [(String, String)], machine: &str) -> Vec<&'a str> {
    ops.iter()
        .filter(|(m, op)| m == machine && op.starts_with("exec"))
        .map(|(_, op)| op.as_str())
        .collect()
}

#[tokio::test]
async fn unreachable_machine_fails_without_dispatch() {
    let plan = JobPlan {
        machines: vec![machine("m1", "host1")],
        jobs: vec![job("a", "m1", None)],
    };
    let scripts = HashMap::from([(
        "m1".to_string(),
        MachineScript {
            refuse_connect: true,
            ..Default::default()
        },
    )]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "unreachable");

    scheduler.open_all_connections().await;
    let success = scheduler.run_jobs().await.unwrap();
    assert!(!success);

    let task = scheduler.task("a").unwrap();
    assert!(task.is_finished());
    assert!(task.has_failed());
    assert_eq!(task.status(), "SSH connection failed");
    assert!(task.record().err.contains("has failed"));

    // The remote side was never touched
    let ops = ops.lock().unwrap();
    assert!(execs_for(&ops, "m1").is_empty());
}

#[tokio::test]
async fn failure_cancels_both_dependents_without_dispatch() {
    // A fails, B and C depend on A, all on distinct hosts
    let plan = JobPlan {
        machines: vec![
            machine("m1", "host1"),
            machine("m2", "host2"),
            machine("m3", "host3"),
        ],
        jobs: vec![
            job("a", "m1", None),
            job("b", "m2", Some("a")),
            job("c", "m3", Some("a")),
        ],
    };
    let scripts = HashMap::from([(
        "m1".to_string(),
        MachineScript {
            job_stdout: "1\n".to_string(),
            ..Default::default()
        },
    )]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "cancel");

    scheduler.open_all_connections().await;
    let success = scheduler.run_jobs().await.unwrap();
    assert!(!success);

    assert!(scheduler.task("a").unwrap().has_failed());
    for name in ["b", "c"] {
        let task = scheduler.task(name).unwrap();
        assert!(task.is_cancelled());
        assert!(task.is_finished());
        assert_eq!(task.status(), "Cancelled");
    }

    let ops = ops.lock().unwrap();
    assert!(execs_for(&ops, "m2").is_empty());
    assert!(execs_for(&ops, "m3").is_empty());
}

#[tokio::test]
async fn cancellation_cascades_transitively() {
    let plan = JobPlan {
        machines: vec![
            machine("m1", "host1"),
            machine("m2", "host2"),
            machine("m3", "host3"),
        ],
        jobs: vec![
            job("a", "m1", None),
            job("b", "m2", Some("a")),
            job("c", "m3", Some("b")),
        ],
    };
    let scripts = HashMap::from([(
        "m1".to_string(),
        MachineScript {
            job_stdout: "1\n".to_string(),
            ..Default::default()
        },
    )]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "cascade");

    scheduler.open_all_connections().await;
    scheduler.run_jobs().await.unwrap();

    assert!(scheduler.task("b").unwrap().is_cancelled());
    assert!(scheduler.task("c").unwrap().is_cancelled());
}

#[tokio::test]
async fn timeout_forces_finish_and_issues_kill() {
    let plan = JobPlan {
        machines: vec![machine("m1", "host1")],
        jobs: vec![JobDefinition {
            timeout: 0,
            ..job("slow", "m1", None)
        }],
    };
    let scripts = HashMap::from([(
        "m1".to_string(),
        MachineScript {
            never_finishes: true,
            ..Default::default()
        },
    )]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "timeout");

    scheduler.open_all_connections().await;
    let success = scheduler.run_jobs().await.unwrap();
    assert!(!success);

    let task = scheduler.task("slow").unwrap();
    assert!(task.is_finished());
    assert!(task.has_timed_out());
    assert!(task.has_failed());
    assert!(task.record().err.contains("TIMEOUT : 0 seconds elapsed"));
    assert!(task.status().starts_with("Timeout since "));

    let ops = ops.lock().unwrap();
    let execs = execs_for(&ops, "m1");
    assert!(execs.iter().any(|op| op.contains("ps aux")));
    assert!(execs.iter().any(|op| op.contains("kill -9 4242")));
}

#[tokio::test]
async fn manifest_round_trip_segregates_out_files() {
    let plan = JobPlan {
        machines: vec![machine("m1", "host1")],
        jobs: vec![job("a", "m1", None)],
    };
    let scripts = HashMap::from([(
        "m1".to_string(),
        MachineScript {
            job_stdout: "0\n/remote/logs/a.log\n/remote/OUT/b.log\n".to_string(),
            ..Default::default()
        },
    )]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "manifest");

    scheduler.open_all_connections().await;
    let success = scheduler.run_jobs().await.unwrap();
    assert!(success);

    let task = scheduler.task("a").unwrap();
    assert!(!task.has_failed());
    assert_eq!(task.result_code(), nightrun_core::ResultCode::Success);
    // Finishing is monotonic
    assert!(task.is_finished());

    let logs: Vec<String> = task
        .log_files()
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    assert_eq!(logs.len(), 2);
    assert!(logs[0].ends_with("a.log") && !logs[0].contains("OUT"));
    assert!(logs[1].ends_with("b.log") && logs[1].contains("OUT"));
    assert!(task.log_files().iter().all(|p| p.exists()));
}

#[tokio::test]
async fn partial_log_retrieval_is_tolerated() {
    let plan = JobPlan {
        machines: vec![machine("m1", "host1")],
        jobs: vec![job("a", "m1", None)],
    };
    let scripts = HashMap::from([(
        "m1".to_string(),
        MachineScript {
            job_stdout: "0\n/remote/missing.log\n/remote/ok.log\n".to_string(),
            ..Default::default()
        },
    )]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "partial");

    scheduler.open_all_connections().await;
    let success = scheduler.run_jobs().await.unwrap();

    // The result code still governs success
    assert!(success);
    let task = scheduler.task("a").unwrap();
    assert!(!task.has_failed());
    assert_eq!(task.log_files().len(), 1);
    assert!(task.record().err.contains("could not retrieve /remote/missing.log"));
}

#[tokio::test]
async fn one_job_per_endpoint_is_serialized() {
    // Two machine identities resolving to the same (host, port)
    let plan = JobPlan {
        machines: vec![machine("m1", "shared"), machine("m2", "shared")],
        jobs: vec![job("first", "m1", None), job("second", "m2", None)],
    };
    let scripts = HashMap::from([
        (
            "m1".to_string(),
            MachineScript {
                job_stdout: "0\n".to_string(),
                polls_to_finish: 2,
                ..Default::default()
            },
        ),
        (
            "m2".to_string(),
            MachineScript {
                job_stdout: "0\n".to_string(),
                polls_to_finish: 2,
                ..Default::default()
            },
        ),
    ]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "endpoint");
    assert_eq!(scheduler.hosts().len(), 1);

    scheduler.open_all_connections().await;
    let success = scheduler.run_jobs().await.unwrap();
    assert!(success);

    let first = scheduler.task("first").unwrap();
    let second = scheduler.task("second").unwrap();
    assert!(second.begin_time().unwrap() >= first.end_time().unwrap());
}

#[tokio::test]
async fn dependent_starts_after_prerequisite_finishes() {
    let plan = JobPlan {
        machines: vec![machine("m1", "host1"), machine("m2", "host2")],
        jobs: vec![job("a", "m1", None), job("b", "m2", Some("a"))],
    };
    let scripts = HashMap::from([
        (
            "m1".to_string(),
            MachineScript {
                job_stdout: "0\n".to_string(),
                polls_to_finish: 2,
                ..Default::default()
            },
        ),
        (
            "m2".to_string(),
            MachineScript {
                job_stdout: "0\n".to_string(),
                ..Default::default()
            },
        ),
    ]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "dependent");

    scheduler.open_all_connections().await;
    let success = scheduler.run_jobs().await.unwrap();
    assert!(success);

    let a = scheduler.task("a").unwrap();
    let b = scheduler.task("b").unwrap();
    assert!(b.begin_time().unwrap() >= a.end_time().unwrap());
}

#[tokio::test]
async fn dependency_outside_todays_set_is_fatal() {
    let mut ghost = job("ghost", "m1", None);
    ghost.when = vec![Weekday::Tue]; // today is Monday in these tests
    let plan = JobPlan {
        machines: vec![machine("m1", "host1")],
        jobs: vec![ghost, job("b", "m1", Some("ghost"))],
    };

    let factory = |machine: &Machine| -> Box<dyn Transport> {
        Box::new(ScriptedTransport {
            machine: machine.name.clone(),
            script: MachineScript::default(),
            ops: Arc::new(Mutex::new(Vec::new())),
        })
    };
    let result = Scheduler::new(
        &plan,
        Weekday::Mon,
        paths("ghost"),
        Arc::new(NoopSink),
        &factory,
    );
    assert!(matches!(
        result,
        Err(nightrun_core::Error::UnknownDependency { .. })
    ));
}

#[tokio::test]
async fn undefined_machine_drops_job() {
    let plan = JobPlan {
        machines: vec![machine("m1", "host1")],
        jobs: vec![job("a", "m1", None), job("b", "undefined", None)],
    };
    let scripts = HashMap::from([(
        "m1".to_string(),
        MachineScript {
            job_stdout: "0\n".to_string(),
            ..Default::default()
        },
    )]);
    let ops: OpLog = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = build_scheduler(&plan, scripts, ops.clone(), "undefined");

    assert_eq!(scheduler.tasks().len(), 1);
    scheduler.open_all_connections().await;
    let success = scheduler.run_jobs().await.unwrap();
    assert!(success);
    assert!(scheduler.task("b").is_none());
}
