//! Remote-shell transport for Nightrun.
//!
//! `Transport` is the seam between the scheduler and the wire: the
//! production implementation is [`ssh::SshTransport`], tests substitute
//! their own. [`connection::RemoteConnection`] owns one transport per
//! machine and carries the fail-soft semantics the scheduler relies on.

pub mod connection;
pub mod ssh;
pub mod transport;

pub use connection::RemoteConnection;
pub use ssh::{SshOptions, SshTransport};
pub use transport::{ProcessOutput, RemoteProcess, Transport, TransportError, TransportResult};
