//! The per-job runtime state machine.

use chrono::{DateTime, Duration, Local};
use nightrun_core::{ConnectionState, HostKey, JobDefinition, Machine, OutputSink, ResultCode};
use nightrun_remote::{RemoteConnection, RemoteProcess};
use nightrun_report::document::scrub;
use nightrun_report::{AfterLink, JobRecord};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Command prefix used to find the remote runner's pids for a kill sweep.
const KILL_PATTERN: &str = "nightrun job --jobs-config";

/// One schedulable job bound to a machine's connection.
///
/// The task only moves forward: once finished it never reverts, and `run`
/// fires at most once. All mutation happens from the scheduler's single
/// control task.
pub struct JobTask {
    definition: JobDefinition,
    machine: Machine,
    conn: Arc<Mutex<RemoteConnection>>,
    /// Last observed state of the machine's connection.
    conn_state: ConnectionState,
    /// The remote invocation of the job runner.
    command: String,
    /// Where retrieved remote log files land.
    log_dir: PathBuf,

    begun: bool,
    finished: bool,
    timed_out: bool,
    cancelled: bool,
    t0: Option<DateTime<Local>>,
    tf: Option<DateTime<Local>>,
    out: Option<String>,
    err: Option<String>,
    result: ResultCode,
    process: Option<Box<dyn RemoteProcess>>,
    log_files: Vec<PathBuf>,
}

impl JobTask {
    pub fn new(
        definition: JobDefinition,
        machine: Machine,
        conn: Arc<Mutex<RemoteConnection>>,
        plan_name: &str,
        log_dir: &Path,
    ) -> Self {
        let command = format!(
            "{}/nightrun job --jobs-config {} --job {}",
            machine.install_path,
            plan_name,
            sh_quote(&definition.name)
        );
        Self {
            definition,
            machine,
            conn,
            conn_state: ConnectionState::Unknown,
            command,
            log_dir: log_dir.to_path_buf(),
            begun: false,
            finished: false,
            timed_out: false,
            cancelled: false,
            t0: None,
            tf: None,
            out: None,
            err: None,
            result: ResultCode::NotRun,
            process: None,
            log_files: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn after(&self) -> Option<&str> {
        self.definition.after.as_deref()
    }

    pub fn host_key(&self) -> HostKey {
        self.machine.host_key()
    }

    pub fn has_begun(&self) -> bool {
        self.begun
    }

    /// Cached terminal flag; `has_finished` is the poll that advances it.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_running(&self) -> bool {
        self.begun && !self.finished
    }

    pub fn has_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn result_code(&self) -> ResultCode {
        self.result
    }

    pub fn begin_time(&self) -> Option<DateTime<Local>> {
        self.t0
    }

    pub fn end_time(&self) -> Option<DateTime<Local>> {
        self.tf
    }

    pub fn log_files(&self) -> &[PathBuf] {
        &self.log_files
    }

    pub fn first_log_file(&self) -> Option<String> {
        self.log_files
            .first()
            .map(|p| p.to_string_lossy().into_owned())
    }

    /// Refresh the cached connection state from the owning connection.
    pub async fn refresh_connection_state(&mut self) {
        let state = self.conn.lock().await.state().clone();
        self.conn_state = state;
    }

    /// Fire the job on its machine. A second call is a no-op.
    ///
    /// A machine that never connected, or a dispatch that failed to start,
    /// finishes the task immediately with canned output; no remote call is
    /// retried.
    pub async fn run(&mut self) {
        if self.begun {
            warn!(job = %self.definition.name, "a job can only be launched once");
            return;
        }

        let connected = {
            let conn = self.conn.lock().await;
            self.conn_state = conn.state().clone();
            conn.is_connected()
        };

        if !connected {
            self.finished = true;
            self.out = Some("N/A".to_string());
            self.err = Some(format!(
                "Connection to machine (name: {}, host: {}, port: {}, user: {}) has failed",
                self.machine.name, self.machine.host, self.machine.port, self.machine.user
            ));
        } else {
            self.t0 = Some(Local::now());
            let process = {
                let mut conn = self.conn.lock().await;
                conn.execute(&self.command).await
            };
            match process {
                Some(process) => self.process = Some(process),
                None => {
                    self.finished = true;
                    self.tf = Some(Local::now());
                    self.out = Some("N/A".to_string());
                    self.err = Some("The server failed to execute the command".to_string());
                }
            }
        }

        self.begun = true;
    }

    /// Poll for completion; memoized once true.
    ///
    /// When the remote command has exited, reads stdout/stderr to EOF,
    /// stamps the end time and retrieves the listed log files.
    pub async fn has_finished(&mut self) -> bool {
        if self.finished {
            return true;
        }
        if !self.begun {
            return false;
        }

        let done = self
            .process
            .as_ref()
            .map(|p| p.is_finished())
            .unwrap_or(false);
        if done {
            self.finished = true;
            if let Some(process) = self.process.as_mut() {
                let output = process.collect().await;
                self.out = Some(output.stdout);
                self.err = Some(output.stderr);
            }
            self.tf = Some(Local::now());
            self.process = None;
            self.retrieve_logs().await;
        }

        self.finished
    }

    /// Whether the job counts as failed: unreachable machine, timeout,
    /// cancellation, or a failing remote result. Meaningless (false)
    /// before the job has finished.
    pub fn has_failed(&self) -> bool {
        if !self.finished {
            return false;
        }
        if !self.conn_state.is_connected() {
            return true;
        }
        if self.timed_out || self.cancelled {
            return true;
        }
        self.result.is_failure()
    }

    /// Mark the task finished without ever dispatching it. Idempotent.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.begun = true;
        self.finished = true;
        self.cancelled = true;
        let msg = "This job was not launched because its prerequisite failed.";
        self.out = Some(msg.to_string());
        self.err = Some(msg.to_string());
    }

    pub fn time_elapsed(&self) -> Option<Duration> {
        self.t0.map(|t0| Local::now() - t0)
    }

    pub fn total_duration(&self) -> Duration {
        match (self.t0, self.tf) {
            (Some(t0), Some(tf)) => tf - t0,
            _ => Duration::zero(),
        }
    }

    /// Enforce the timeout: once elapsed running time exceeds the budget,
    /// force-finish the task, kill the remote processes and record the
    /// kill output. Log retrieval afterwards is best-effort; its failures
    /// are appended to stderr rather than raised.
    pub async fn check_time(&mut self) {
        if !self.begun || self.finished {
            return;
        }
        let Some(elapsed) = self.time_elapsed() else {
            return;
        };
        if elapsed.num_milliseconds() <= self.definition.timeout as i64 * 1000 {
            return;
        }

        self.finished = true;
        self.timed_out = true;
        self.tf = Some(Local::now());

        let (kill_out, _kill_err) = self.kill_remote_process().await;
        self.out = Some(format!("TIMEOUT\n{}", kill_out));
        self.err = Some(format!(
            "TIMEOUT : {} seconds elapsed\n",
            self.definition.timeout
        ));

        if let Some(mut process) = self.process.take() {
            if process.is_finished() {
                let partial = process.collect().await;
                self.fetch_manifest(&partial.stdout).await;
            } else {
                self.push_err_note("log retrieval skipped: remote process still running after kill");
            }
        }
    }

    /// Remote pids whose command line matches the job-runner invocation.
    async fn get_pids(&mut self) -> Vec<String> {
        let cmd = format!(
            "ps aux | grep \"{}\" | awk '{{print $2}}'",
            KILL_PATTERN
        );
        let process = {
            let mut conn = self.conn.lock().await;
            conn.execute(&cmd).await
        };
        let Some(mut process) = process else {
            return Vec::new();
        };
        let output = process.collect().await;
        output
            .stdout
            .lines()
            .map(|line| line.chars().filter(|c| c.is_ascii_digit()).collect::<String>())
            .filter(|pid| !pid.is_empty())
            .collect()
    }

    /// Kill the remote job-runner processes. Returns the kill command's
    /// captured output.
    pub async fn kill_remote_process(&mut self) -> (String, String) {
        let pids = self.get_pids().await;
        if pids.is_empty() {
            return (String::new(), String::new());
        }
        let cmd = pids
            .iter()
            .map(|pid| format!("kill -9 {}", pid))
            .collect::<Vec<_>>()
            .join(" ; ");
        let process = {
            let mut conn = self.conn.lock().await;
            conn.execute(&cmd).await
        };
        match process {
            Some(mut process) => {
                let output = process.collect().await;
                (output.stdout, output.stderr)
            }
            None => (String::new(), String::new()),
        }
    }

    async fn retrieve_logs(&mut self) {
        let stdout = self.out.clone().unwrap_or_default();
        self.fetch_manifest(&stdout).await;
    }

    /// Parse the remote runner's manifest: first non-empty line is the
    /// result code, following lines are remote log paths. Files under a
    /// directory literally named `OUT` mirror into a local `OUT`
    /// subdirectory. Each line is tolerated independently: a failed
    /// download is noted on stderr and the rest continue.
    async fn fetch_manifest(&mut self, stdout: &str) {
        let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some(first) = lines.first() else {
            self.push_err_note("no result line in remote output");
            self.result = ResultCode::Failure;
            return;
        };
        self.result = ResultCode::parse(first);

        for remote_path in &lines[1..] {
            let remote_path = remote_path.trim();
            let path = Path::new(remote_path);
            let Some(base) = path.file_name() else {
                self.push_err_note(&format!("unusable log path: {}", remote_path));
                continue;
            };
            let in_out_dir = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n == "OUT")
                .unwrap_or(false);
            let local = if in_out_dir {
                self.log_dir.join("OUT").join(base)
            } else {
                self.log_dir.join(base)
            };

            if local.exists() {
                self.log_files.push(local);
                continue;
            }
            let result = {
                let mut conn = self.conn.lock().await;
                conn.download(remote_path, &local).await
            };
            match result {
                Ok(()) => self.log_files.push(local),
                Err(e) => {
                    self.push_err_note(&format!("could not retrieve {}: {}", remote_path, e))
                }
            }
        }
    }

    fn push_err_note(&mut self, note: &str) {
        let err = self.err.get_or_insert_with(String::new);
        if !err.is_empty() && !err.ends_with('\n') {
            err.push('\n');
        }
        err.push_str(note);
        err.push('\n');
    }

    /// Human status string.
    pub fn status(&self) -> String {
        if !self.conn_state.is_connected() {
            return "SSH connection failed".to_string();
        }
        if !self.begun {
            return "Not launched".to_string();
        }
        if self.cancelled {
            return "Cancelled".to_string();
        }
        if self.is_running() {
            return match self.t0 {
                Some(t0) => format!("Running since {}", t0.format(TIME_FORMAT)),
                None => "Running".to_string(),
            };
        }
        match (self.timed_out, self.tf) {
            (true, Some(tf)) => format!("Timeout since {}", tf.format(TIME_FORMAT)),
            (true, None) => "Timeout".to_string(),
            (false, Some(tf)) => format!("Finished since {}", tf.format(TIME_FORMAT)),
            (false, None) => "Finished".to_string(),
        }
    }

    /// The job's row for the status documents.
    pub fn record(&self) -> JobRecord {
        JobRecord {
            name: self.definition.name.clone(),
            machine: self.machine.name.clone(),
            host: self.machine.host.clone(),
            port: self.machine.port,
            user: self.machine.user.clone(),
            install_path: self.machine.install_path.clone(),
            application: self.definition.application.clone(),
            distribution: self.definition.distribution.clone(),
            group: self.definition.group.clone(),
            timeout: self.definition.timeout,
            commands: self.definition.commands.join(" ; "),
            state: self.status(),
            begin: self.t0,
            end: self.tf,
            out: scrub(self.out.as_deref().unwrap_or("")),
            err: scrub(self.err.as_deref().unwrap_or("")),
            res: self.result,
            log_file: self.first_log_file(),
            after: self.definition.after.clone().map(|name| AfterLink {
                name,
                link: None,
            }),
        }
    }

    /// The per-job section of the final results dump.
    pub async fn write_results(&self, sink: &dyn OutputSink) {
        sink.write(&format!("name : {}\n", self.definition.name), 0);
        if let Some(after) = &self.definition.after {
            sink.write(&format!("after : {}\n", after), 0);
        }
        let total = self.total_duration().num_seconds();
        sink.write(
            &format!("Time elapsed : {:4}min {:2}s\n", total / 60, total % 60),
            0,
        );
        if let Some(t0) = self.t0 {
            sink.write(&format!("Begin time : {}\n", t0.format(TIME_FORMAT)), 0);
        }
        if let Some(tf) = self.tf {
            sink.write(&format!("End time   : {}\n\n", tf.format(TIME_FORMAT)), 0);
        }

        let head = "Informations about connection :";
        sink.write(&format!("{}\n{}\n", head, "-".repeat(head.len())), 0);
        {
            let conn = self.conn.lock().await;
            conn.write_info(sink);
        }

        sink.write("out :\n", 0);
        match &self.out {
            Some(out) => sink.write(&format!("{}\n", out), 0),
            None => sink.write("Unable to get output\n", 0),
        }
        sink.write("err :\n", 0);
        match &self.err {
            Some(err) => sink.write(&format!("{}\n", err), 0),
            None => sink.write("Unable to get error\n", 0),
        }
    }
}

/// Single-quote `text` for the remote shell.
fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}
