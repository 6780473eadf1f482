//! The fleet scheduler: one polling loop driving every job to completion.

use crate::display::{host_header, str_of_length};
use crate::task::JobTask;
use chrono::Weekday;
use nightrun_core::{Error, HostKey, JobDefinition, JobPlan, Machine, OutputSink, Result};
use nightrun_remote::{RemoteConnection, Transport};
use nightrun_report::{JobRecord, NotTodayRecord, ReportSink, RunStatus};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Width of one host column in the live status line.
const COLUMN_WIDTH: usize = 20;

/// Pause between polling iterations.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Padding for the connection banner.
const CONNECT_PAD: usize = 50;

/// Builds one transport per machine; tests substitute their own.
pub type TransportFactory = dyn Fn(&Machine) -> Box<dyn Transport> + Send + Sync;

/// Filesystem inputs of a run.
pub struct RunPaths {
    /// The job-plan file, deployed to every machine.
    pub plan_file: PathBuf,
    /// Local toolchain tree deployed to every machine.
    pub toolchain_dir: PathBuf,
    /// Where retrieved remote logs land.
    pub log_dir: PathBuf,
}

/// Owns the fleet of connections and job tasks for one run.
///
/// Everything runs on the single task that calls into the scheduler;
/// concurrency across hosts comes from interleaved polling of the
/// non-blocking remote processes, never from worker tasks.
pub struct Scheduler {
    connections: Vec<Arc<Mutex<RemoteConnection>>>,
    hosts: Vec<HostKey>,
    tasks: Vec<JobTask>,
    not_today: Vec<JobDefinition>,
    paths: RunPaths,
    sink: Arc<dyn OutputSink>,
    report: Option<ReportSink>,
}

impl Scheduler {
    /// Resolve the plan into machines, connections and tasks for `today`.
    ///
    /// Machines are constructed once per distinct name; a job referencing
    /// an undefined machine is warned about and dropped. A dependency on a
    /// job missing from today's set is a fatal plan error: the run would
    /// otherwise never terminate.
    pub fn new(
        plan: &JobPlan,
        today: Weekday,
        paths: RunPaths,
        sink: Arc<dyn OutputSink>,
        factory: &TransportFactory,
    ) -> Result<Self> {
        let plan_name = paths
            .plan_file
            .file_name()
            .ok_or_else(|| {
                Error::Internal(format!(
                    "job-plan path has no file name: {}",
                    paths.plan_file.display()
                ))
            })?
            .to_string_lossy()
            .into_owned();

        let mut machines: Vec<Machine> = Vec::new();
        let mut connections: Vec<Arc<Mutex<RemoteConnection>>> = Vec::new();
        let mut hosts: Vec<HostKey> = Vec::new();
        let mut tasks: Vec<JobTask> = Vec::new();
        let mut not_today: Vec<JobDefinition> = Vec::new();

        for def in &plan.jobs {
            if !def.runs_on(today) {
                not_today.push(def.clone());
                continue;
            }

            let known = machines.iter().position(|m| m.name == def.machine);
            let (machine, conn) = match known {
                Some(i) => (machines[i].clone(), connections[i].clone()),
                None => match plan.machine(&def.machine) {
                    Some(machine_def) => {
                        let machine = machine_def.clone();
                        let conn = Arc::new(Mutex::new(RemoteConnection::new(
                            machine.clone(),
                            factory(&machine),
                        )));
                        let key = machine.host_key();
                        if !hosts.contains(&key) {
                            hosts.push(key);
                        }
                        machines.push(machine.clone());
                        connections.push(conn.clone());
                        (machine, conn)
                    }
                    None => {
                        warn!(
                            job = %def.name,
                            machine = %def.machine,
                            "job requires a machine that is not defined; it will not be launched"
                        );
                        sink.write(
                            &format!(
                                "WARNING: the job \"{}\" requires the machine \"{}\" but this \
                                 machine is not defined in the configuration file.\n\
                                 The job will not be launched.\n",
                                def.name, def.machine
                            ),
                            0,
                        );
                        continue;
                    }
                },
            };

            tasks.push(JobTask::new(
                def.clone(),
                machine,
                conn,
                &plan_name,
                &paths.log_dir,
            ));
        }

        let names: HashSet<&str> = tasks.iter().map(|t| t.name()).collect();
        for task in &tasks {
            if let Some(after) = task.after() {
                if !names.contains(after) {
                    return Err(Error::UnknownDependency {
                        job: task.name().to_string(),
                        after: after.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            connections,
            hosts,
            tasks,
            not_today,
            paths,
            sink,
            report: None,
        })
    }

    pub fn tasks(&self) -> &[JobTask] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&JobTask> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    pub fn hosts(&self) -> &[HostKey] {
        &self.hosts
    }

    /// Connect every distinct machine in turn and deploy the toolchain to
    /// the ones that accepted. Failures are recorded per machine, never
    /// raised: their jobs report the failure when they run.
    pub async fn open_all_connections(&mut self) {
        self.sink
            .write("Establishing connection with all the machines :\n", 0);

        for conn in self.connections.clone() {
            let mut conn = conn.lock().await;
            let begin = format!("Connection to {}: ", conn.machine().name);
            let dots = CONNECT_PAD.saturating_sub(begin.len());
            let padding = if dots == 0 {
                " ".to_string()
            } else {
                format!("{} ", ".".repeat(dots))
            };
            self.sink.write(&format!("{}{}", begin, padding), 0);
            self.sink.flush();

            let state = conn.connect().await;
            if state.is_connected() {
                let deployed = conn
                    .deploy_toolchain(&self.paths.toolchain_dir, &self.paths.plan_file)
                    .await;
                match deployed {
                    Ok(()) => self.sink.write("OK\n", 0),
                    Err(reason) => self.sink.write(&format!("KO {}\n", reason), 0),
                }
            } else {
                let reason = state.failure_reason().unwrap_or("unknown failure");
                self.sink.write(&format!("KO {}\n", reason), 0);
            }
        }
        self.sink.write("\n", 0);

        for task in self.tasks.iter_mut() {
            task.refresh_connection_state().await;
        }
    }

    /// Enable status-document publishing into `dir`.
    pub fn attach_report(&mut self, dir: &Path) -> std::io::Result<()> {
        let records = self.records();
        let not_today = self
            .not_today
            .iter()
            .map(|def| {
                NotTodayRecord::new(
                    def.name.clone(),
                    def.application.clone(),
                    def.distribution.clone(),
                    def.commands.join(" ; "),
                )
            })
            .collect();
        self.report = Some(ReportSink::new(dir, records, not_today)?);
        Ok(())
    }

    /// Drive every task to completion.
    ///
    /// Returns overall success: true only when no task failed. An operator
    /// interruption surfaces as `Error::Interrupted` after the kill sweep
    /// and the final report stamp.
    pub async fn run_jobs(&mut self) -> Result<bool> {
        self.sink.write("Executing the jobs :\n", 0);
        let (rule, header) = host_header(&self.hosts, COLUMN_WIDTH);
        self.sink
            .write(&format!("{}\n{}\n{}\n", rule, header, rule), 0);
        self.sink.flush();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut interrupted = false;

        while !self.all_finished() {
            let mut new_start = false;
            for key in self.hosts.clone() {
                if self.is_occupied(&key) {
                    continue;
                }
                // First runnable task bound to this endpoint, in plan order
                let candidate = self.tasks.iter().position(|t| {
                    !t.has_begun()
                        && t.host_key() == key
                        && match t.after() {
                            None => true,
                            Some(after) => self.prerequisite_satisfied(after),
                        }
                });
                if let Some(i) = candidate {
                    info!(job = %self.tasks[i].name(), host = %key, "starting job");
                    self.tasks[i].run().await;
                    new_start = true;
                }
            }

            self.cancel_dependents_of_failed();
            let new_finished = self.update_states().await;

            if new_start || new_finished {
                self.push_report();
                self.display_status();
            }

            tokio::select! {
                _ = &mut ctrl_c => {
                    interrupted = true;
                    break;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        self.sink.write(&format!("\n{}\n\n", rule), 0);
        if interrupted {
            self.sink.write("\nForced interruption\n\n", 0);
            warn!("forced interruption; killing unfinished jobs");
        }

        // Best-effort kill of anything still out there
        for task in self.tasks.iter_mut() {
            if !task.is_finished() {
                task.kill_remote_process().await;
            }
        }

        let status = if interrupted {
            RunStatus::ForcedInterruption
        } else {
            RunStatus::Finished
        };
        let records = self.records();
        if let Some(report) = self.report.as_mut() {
            if let Err(e) = report.update(records) {
                warn!(error = %e, "could not write status report");
            }
            if let Err(e) = report.finish(status) {
                warn!(error = %e, "could not write final status report");
            }
        }

        if interrupted {
            return Err(Error::Interrupted);
        }
        Ok(self.overall_success())
    }

    /// Per-job textual results dump.
    pub async fn write_all_results(&self) {
        for task in &self.tasks {
            self.sink.write(
                &format!("#------- Results for job {} -------#\n", task.name()),
                0,
            );
            task.write_results(self.sink.as_ref()).await;
            self.sink.write("\n\n", 0);
        }
    }

    pub async fn close_connections(&mut self) {
        for conn in &self.connections {
            conn.lock().await.close().await;
        }
    }

    fn all_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    fn overall_success(&self) -> bool {
        self.tasks.iter().all(|t| !t.has_failed())
    }

    fn finished_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_finished()).count()
    }

    /// Whether a job is running on the endpoint.
    fn is_occupied(&self, key: &HostKey) -> bool {
        self.tasks
            .iter()
            .any(|t| t.is_running() && t.host_key() == *key)
    }

    /// A dependent may start only once its prerequisite finished without
    /// failing; a failed prerequisite leaves it for the cancellation sweep.
    fn prerequisite_satisfied(&self, name: &str) -> bool {
        self.tasks
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.is_finished() && !t.has_failed())
            .unwrap_or(false)
    }

    /// Cancel every not-yet-started task whose prerequisite failed.
    /// Cascades over repeated cycles: a cancelled task counts as failed.
    fn cancel_dependents_of_failed(&mut self) {
        let failed: HashSet<String> = self
            .tasks
            .iter()
            .filter(|t| t.has_failed())
            .map(|t| t.name().to_string())
            .collect();

        for task in self.tasks.iter_mut() {
            if task.has_begun() {
                continue;
            }
            if let Some(after) = task.after() {
                if failed.contains(after) {
                    info!(job = %task.name(), after, "cancelling job: prerequisite failed");
                    task.cancel();
                }
            }
        }
    }

    /// Advance timeouts and completion for every task. Returns whether
    /// anything newly finished.
    async fn update_states(&mut self) -> bool {
        let before = self.finished_count();
        for task in self.tasks.iter_mut() {
            if task.is_running() {
                task.check_time().await;
            }
            task.has_finished().await;
        }
        self.finished_count() > before
    }

    fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.tasks.iter().map(|t| t.record()).collect();
        for record in records.iter_mut() {
            if let Some(after) = record.after.as_mut() {
                after.link = self
                    .tasks
                    .iter()
                    .find(|t| t.name() == after.name)
                    .and_then(|t| t.first_log_file());
            }
        }
        records
    }

    fn push_report(&mut self) {
        let records = self.records();
        if let Some(report) = self.report.as_mut() {
            if let Err(e) = report.update(records) {
                warn!(error = %e, "could not write status report");
            }
        }
    }

    /// Redraw the one-column-per-host status line.
    fn display_status(&self) {
        let mut line = String::new();
        for key in &self.hosts {
            let running = self
                .tasks
                .iter()
                .find(|t| t.is_running() && t.host_key() == *key);
            let cell = match running {
                Some(task) => str_of_length(task.name(), COLUMN_WIDTH),
                None => str_of_length("empty", COLUMN_WIDTH),
            };
            line.push('|');
            line.push_str(&cell);
        }
        self.sink.write(&format!("\r{}|", line), 0);
        self.sink.flush();
    }
}
