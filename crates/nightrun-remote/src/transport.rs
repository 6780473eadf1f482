//! Transport trait seam for remote machines.

use async_trait::async_trait;
use nightrun_core::Machine;
use std::path::Path;
use thiserror::Error;

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("the server's host key could not be verified")]
    HostKeyRejected,

    #[error("not connected")]
    NotConnected,

    #[error("{0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Output collected from a finished remote command.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A remote command fired without waiting for completion.
#[async_trait]
pub trait RemoteProcess: Send {
    /// Whether the remote command has exited. Non-blocking.
    fn is_finished(&self) -> bool;

    /// Read stdout and stderr to EOF.
    ///
    /// Blocks until the remote side closes the channel; cheap once
    /// `is_finished` has returned true.
    async fn collect(&mut self) -> ProcessOutput;
}

/// One authenticated remote-shell session to one host.
///
/// All operations fail soft with a `TransportError`; implementations must
/// not panic on transport faults.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate against `machine`.
    ///
    /// May be called again after a failure; every call is a fresh attempt
    /// and overwrites the outcome of the previous one.
    async fn connect(&mut self, machine: &Machine) -> TransportResult<()>;

    /// Fire a command without waiting for it to finish.
    async fn exec(&mut self, command: &str) -> TransportResult<Box<dyn RemoteProcess>>;

    /// Create a remote directory. Succeeds when it already exists.
    async fn make_dir(&mut self, remote: &str) -> TransportResult<()>;

    /// Upload one file, preserving its mode bits.
    async fn upload_file(&mut self, local: &Path, remote: &str) -> TransportResult<()>;

    /// Create a remote symlink at `remote` pointing at `target`.
    async fn upload_symlink(&mut self, target: &str, remote: &str) -> TransportResult<()>;

    /// Download one remote file.
    async fn download_file(&mut self, remote: &str, local: &Path) -> TransportResult<()>;

    /// Tear the session down.
    async fn close(&mut self);
}
