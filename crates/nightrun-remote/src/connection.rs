//! Per-machine remote connections.

use nightrun_core::{ConnectionState, Machine, OutputSink};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::transport::{RemoteProcess, Transport, TransportError, TransportResult};

/// Directory names never deployed to a remote machine.
const VCS_METADATA: &[&str] = &[".git", ".svn", ".hg", "CVS"];

/// Remote subdirectory the job-plan file is uploaded into.
const REMOTE_PLAN_DIR: &str = "data/jobs";

/// One machine's remote-shell session, with recorded connection status.
///
/// Every operation fails soft: errors are converted into recorded state or
/// sentinel return values, never propagated as panics. The scheduler is the
/// only caller; one task drives all connections.
pub struct RemoteConnection {
    machine: Machine,
    transport: Box<dyn Transport>,
    state: ConnectionState,
}

impl RemoteConnection {
    pub fn new(machine: Machine, transport: Box<dyn Transport>) -> Self {
        Self {
            machine,
            transport,
            state: ConnectionState::Unknown,
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Outcome of the most recent connection attempt; `Unknown` before the
    /// first one.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Attempt to authenticate. Each call is a fresh attempt and overwrites
    /// the recorded outcome of the previous one.
    pub async fn connect(&mut self) -> ConnectionState {
        self.state = match self.transport.connect(&self.machine).await {
            Ok(()) => ConnectionState::Connected,
            Err(e) => ConnectionState::Failed {
                reason: e.to_string(),
            },
        };
        self.state.clone()
    }

    /// Upload the local toolchain tree to the machine's install path and
    /// the job-plan file to `data/jobs/<basename>`.
    ///
    /// VCS metadata directories are excluded; file modes and symlinks are
    /// preserved. Any failure marks the connection as failed so jobs bound
    /// to this machine short-circuit instead of dispatching.
    pub async fn deploy_toolchain(
        &mut self,
        local_tree: &Path,
        plan_file: &Path,
    ) -> Result<(), String> {
        match self.try_deploy(local_tree, plan_file).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = format!("toolchain deploy failed: {}", e);
                self.state = ConnectionState::Failed {
                    reason: reason.clone(),
                };
                Err(reason)
            }
        }
    }

    async fn try_deploy(&mut self, local_tree: &Path, plan_file: &Path) -> TransportResult<()> {
        let install = self.machine.install_path.clone();
        self.transport.make_dir(&install).await?;
        self.put_dir(local_tree, &install).await?;

        let mut plan_dir = install.clone();
        for part in REMOTE_PLAN_DIR.split('/') {
            plan_dir = format!("{}/{}", plan_dir, part);
            self.transport.make_dir(&plan_dir).await?;
        }

        let basename = plan_file
            .file_name()
            .ok_or_else(|| {
                TransportError::Protocol(format!(
                    "job-plan path has no file name: {}",
                    plan_file.display()
                ))
            })?
            .to_string_lossy()
            .into_owned();
        self.transport
            .upload_file(plan_file, &format!("{}/{}", plan_dir, basename))
            .await
    }

    /// Upload the contents of `source` under the remote `target` directory,
    /// creating subdirectories as needed.
    async fn put_dir(&mut self, source: &Path, target: &str) -> TransportResult<()> {
        let mut stack: Vec<(PathBuf, String)> = vec![(source.to_path_buf(), target.to_string())];

        while let Some((dir, remote_base)) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if VCS_METADATA.contains(&name.as_str()) {
                    continue;
                }
                let local_path = entry.path();
                let remote_path = format!("{}/{}", remote_base, name);
                let file_type = entry.file_type()?;
                if file_type.is_symlink() {
                    // An unreadable or unsupported link is skipped, not fatal
                    if let Ok(link) = std::fs::read_link(&local_path) {
                        if let Err(e) = self
                            .transport
                            .upload_symlink(&link.to_string_lossy(), &remote_path)
                            .await
                        {
                            debug!(path = %remote_path, error = %e, "skipping symlink");
                        }
                    }
                } else if file_type.is_dir() {
                    self.transport.make_dir(&remote_path).await?;
                    stack.push((local_path, remote_path));
                } else {
                    self.transport.upload_file(&local_path, &remote_path).await?;
                }
            }
        }
        Ok(())
    }

    /// Fire a remote command without waiting for it.
    ///
    /// `None` means the dispatch itself failed; the command was never
    /// started. The caller decides what that means for its job.
    pub async fn execute(&mut self, command: &str) -> Option<Box<dyn RemoteProcess>> {
        match self.transport.exec(command).await {
            Ok(process) => Some(process),
            Err(e) => {
                error!(
                    machine = %self.machine.name,
                    command,
                    error = %e,
                    "the server failed to execute the command"
                );
                None
            }
        }
    }

    /// Download one remote file.
    pub async fn download(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        self.transport.download_file(remote, local).await
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Connection info block for the results dump.
    pub fn write_info(&self, sink: &dyn OutputSink) {
        sink.write(&format!("host : {}\n", self.machine.host), 0);
        sink.write(&format!("port : {}\n", self.machine.port), 0);
        sink.write(&format!("user : {}\n", self.machine.user), 0);
        let status = if self.is_connected() { "OK" } else { "KO" };
        sink.write(&format!("Connection : {}\n\n", status), 0);
    }
}
