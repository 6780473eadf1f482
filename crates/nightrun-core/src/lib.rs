//! Core domain types for the Nightrun maintenance scheduler.
//!
//! This crate contains:
//! - Machine and endpoint types
//! - Job definitions and the parsed job plan
//! - Connection-state and result-code enums
//! - Error types
//! - The output façade the scheduler reports through

pub mod error;
pub mod job;
pub mod machine;
pub mod output;

pub use error::{Error, Result};
pub use job::{JobDefinition, JobPlan, ResultCode};
pub use machine::{ConnectionState, HostKey, Machine};
pub use output::{NoopSink, OutputSink};
