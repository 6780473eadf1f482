//! Machine definitions and connection state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default SSH port for machines that do not configure one.
pub const DEFAULT_PORT: u16 = 22;

/// Default remote directory the toolchain is deployed to.
pub const DEFAULT_INSTALL_PATH: &str = "nightrun";

/// A machine jobs can run on.
///
/// Several named machines may resolve to the same `(host, port)` endpoint
/// with different credentials or install paths; scheduling concurrency is
/// keyed by the endpoint, not the machine name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Unique machine name referenced by job definitions.
    pub name: String,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Password, when password authentication is used.
    pub password: Option<String>,
    /// Remote directory the toolchain is deployed to.
    pub install_path: String,
}

impl Machine {
    /// The endpoint this machine resolves to.
    pub fn host_key(&self) -> HostKey {
        HostKey {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// The `(host, port)` endpoint a machine resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostKey {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_PORT {
            write!(f, "{}", self.host)
        } else {
            write!(f, "({}, {})", self.host, self.port)
        }
    }
}

/// Outcome of the most recent connection attempt.
///
/// `Unknown` (never attempted) is deliberately distinct from `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    Unknown,
    /// The last attempt authenticated successfully.
    Connected,
    /// The last attempt failed.
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// The failure reason, if the last attempt failed.
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            ConnectionState::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}
