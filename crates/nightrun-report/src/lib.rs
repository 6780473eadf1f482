//! Live status documents for Nightrun runs.
//!
//! One global document plus one per report-group tag, each rebuilt from
//! the scheduler's job snapshots and written as JSON for an external
//! viewer.

pub mod document;
pub mod sink;

pub use document::{AfterLink, JobRecord, NotTodayRecord, ReportDocument, RunStatus};
pub use sink::ReportSink;
