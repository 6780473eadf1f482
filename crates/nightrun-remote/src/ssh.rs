//! SSH transport built on russh.

use async_trait::async_trait;
use nightrun_core::Machine;
use russh::client::AuthResult;
use russh::keys::known_hosts::learn_known_hosts;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::transport::{
    ProcessOutput, RemoteProcess, Transport, TransportError, TransportResult,
};

/// Options shared by every SSH transport in a run.
#[derive(Debug, Clone, Default)]
pub struct SshOptions {
    /// Private key used when a machine has no password configured.
    /// Falls back to the conventional `~/.ssh` identities when unset.
    pub identity_path: Option<PathBuf>,
    /// Refuse host keys that are not already in `known_hosts`.
    ///
    /// Off by default: unattended runs against a known fleet learn unknown
    /// keys on first contact (trust-on-first-use). A key that CHANGED is
    /// always refused, strict or not.
    pub strict_host_keys: bool,
}

/// Marker error for a host key refused by the verification policy.
#[derive(Debug, Error)]
#[error("the server's host key could not be verified")]
struct HostKeyRejection;

/// russh client handler implementing the host-key policy.
#[derive(Debug)]
struct ClientHandler {
    host: String,
    port: u16,
    strict: bool,
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) if self.strict => Err(HostKeyRejection.into()),
            Ok(false) => {
                tracing::info!(
                    host = %self.host,
                    port = self.port,
                    "server key not present in known_hosts; learning"
                );
                learn_known_hosts(&self.host, self.port, server_public_key)
                    .map_err(|_| HostKeyRejection)?;
                Ok(true)
            }
            // A key mismatch is never auto-trusted
            Err(err) => {
                tracing::warn!(
                    host = %self.host,
                    port = self.port,
                    error = %err,
                    "server key validation failed"
                );
                Err(HostKeyRejection.into())
            }
        }
    }
}

/// Production transport: one russh session per machine.
pub struct SshTransport {
    options: SshOptions,
    handle: Option<russh::client::Handle<ClientHandler>>,
}

impl SshTransport {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            handle: None,
        }
    }

    async fn sftp(&self) -> TransportResult<SftpSession> {
        let handle = self.handle.as_ref().ok_or(TransportError::NotConnected)?;
        let channel = handle.channel_open_session().await.map_err(to_protocol)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(to_protocol)?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn identity(&self) -> Option<PathBuf> {
        if let Some(path) = &self.options.identity_path {
            return Some(path.clone());
        }
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        ["id_ed25519", "id_rsa"]
            .iter()
            .map(|name| home.join(".ssh").join(name))
            .find(|p| p.exists())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&mut self, machine: &Machine) -> TransportResult<()> {
        // Drop any previous session; every call is a fresh attempt
        self.close().await;

        let config = Arc::new(russh::client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: machine.host.clone(),
            port: machine.port,
            strict: self.options.strict_host_keys,
        };

        let mut handle = russh::client::connect(
            config,
            (machine.host.as_str(), machine.port),
            handler,
        )
        .await
        .map_err(map_connect_err)?;

        let auth = if let Some(password) = &machine.password {
            handle
                .authenticate_password(machine.user.clone(), password.clone())
                .await
                .map_err(to_protocol)?
        } else {
            let identity = self.identity().ok_or_else(|| {
                TransportError::Protocol(
                    "no SSH identity found and no password configured".to_string(),
                )
            })?;
            let key = russh::keys::load_secret_key(&identity, None)
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
            let hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(to_protocol)?
                .flatten();
            handle
                .authenticate_publickey(
                    machine.user.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                )
                .await
                .map_err(to_protocol)?
        };

        match auth {
            AuthResult::Success => {
                self.handle = Some(handle);
                Ok(())
            }
            AuthResult::Failure { .. } => Err(TransportError::AuthenticationFailed),
        }
    }

    async fn exec(&mut self, command: &str) -> TransportResult<Box<dyn RemoteProcess>> {
        let handle = self.handle.as_ref().ok_or(TransportError::NotConnected)?;
        let mut channel = handle.channel_open_session().await.map_err(to_protocol)?;
        channel.exec(true, command).await.map_err(to_protocol)?;

        let captured = Arc::new(Mutex::new(Captured::default()));
        let finished = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(drain_channel(channel, captured.clone(), finished.clone()));

        Ok(Box::new(SshProcess {
            captured,
            finished,
            reader: Some(reader),
        }))
    }

    async fn make_dir(&mut self, remote: &str) -> TransportResult<()> {
        let sftp = self.sftp().await?;
        match sftp.metadata(remote).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(TransportError::Protocol(format!(
                "remote path exists but is not a directory: {}",
                remote
            ))),
            Err(_) => sftp
                .create_dir(remote)
                .await
                .map_err(|e| TransportError::Protocol(e.to_string())),
        }
    }

    async fn upload_file(&mut self, local: &Path, remote: &str) -> TransportResult<()> {
        let sftp = self.sftp().await?;
        let mut local_file = tokio::fs::File::open(local).await?;
        let flags = OpenFlags::WRITE
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        let mut remote_file = sftp
            .open_with_flags(remote, flags)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        tokio::io::copy(&mut local_file, &mut remote_file).await?;
        remote_file.flush().await?;
        remote_file.shutdown().await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(local)?.permissions().mode() & 0o7777;
            let attrs = FileAttributes {
                permissions: Some(mode),
                ..Default::default()
            };
            if let Err(e) = sftp.set_metadata(remote, attrs).await {
                tracing::debug!(remote, error = %e, "could not set mode bits");
            }
        }

        Ok(())
    }

    async fn upload_symlink(&mut self, target: &str, remote: &str) -> TransportResult<()> {
        let sftp = self.sftp().await?;
        sftp.symlink(remote, target)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn download_file(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        let sftp = self.sftp().await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut remote_file = sftp
            .open(remote)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let mut local_file = tokio::fs::File::create(local).await?;
        tokio::io::copy(&mut remote_file, &mut local_file).await?;
        local_file.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

fn to_protocol(err: russh::Error) -> TransportError {
    TransportError::Protocol(err.to_string())
}

fn map_connect_err(err: anyhow::Error) -> TransportError {
    if err.downcast_ref::<HostKeyRejection>().is_some() {
        return TransportError::HostKeyRejected;
    }
    if let Some(russh::Error::UnknownKey) = err.downcast_ref::<russh::Error>() {
        return TransportError::HostKeyRejected;
    }
    TransportError::Protocol(err.to_string())
}

#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Absorb one channel message into the capture buffers.
/// Returns true when the channel is done.
fn absorb(msg: &ChannelMsg, captured: &mut Captured) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            captured.stdout.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            captured.stderr.extend_from_slice(data);
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

async fn drain_channel(
    mut channel: russh::Channel<russh::client::Msg>,
    captured: Arc<Mutex<Captured>>,
    finished: Arc<AtomicBool>,
) {
    while let Some(msg) = channel.wait().await {
        let done = {
            let mut buf = captured.lock().expect("capture buffer poisoned");
            absorb(&msg, &mut buf)
        };
        if done {
            break;
        }
    }
    finished.store(true, Ordering::Release);
    let _ = channel.close().await;
}

/// Handle to a remote command; output accumulates in the background while
/// the scheduler polls `is_finished`.
struct SshProcess {
    captured: Arc<Mutex<Captured>>,
    finished: Arc<AtomicBool>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

#[async_trait]
impl RemoteProcess for SshProcess {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    async fn collect(&mut self) -> ProcessOutput {
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        let buf = self.captured.lock().expect("capture buffer poisoned");
        ProcessOutput {
            stdout: String::from_utf8_lossy(&buf.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&buf.stderr).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;

    #[test]
    fn absorb_accumulates_streams() {
        let mut captured = Captured::default();

        let msg = ChannelMsg::Data {
            data: CryptoVec::from_slice(b"out"),
        };
        assert!(!absorb(&msg, &mut captured));
        assert_eq!(captured.stdout, b"out");

        let msg = ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"err"),
            ext: 1,
        };
        assert!(!absorb(&msg, &mut captured));
        assert_eq!(captured.stderr, b"err");

        // Non-stderr extended data is dropped
        let msg = ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"skip"),
            ext: 2,
        };
        assert!(!absorb(&msg, &mut captured));
        assert_eq!(captured.stderr, b"err");

        assert!(absorb(&ChannelMsg::Close, &mut captured));
    }

    #[test]
    fn connect_errors_map_to_host_key_rejection() {
        let err = map_connect_err(HostKeyRejection.into());
        assert!(matches!(err, TransportError::HostKeyRejected));

        let err = map_connect_err(anyhow::Error::new(russh::Error::UnknownKey));
        assert!(matches!(err, TransportError::HostKeyRejected));

        let err = map_connect_err(anyhow::anyhow!("connection refused"));
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
