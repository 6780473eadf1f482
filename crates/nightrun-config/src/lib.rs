//! KDL job-plan parsing for Nightrun.

pub mod error;
pub mod plan;

pub use error::{ConfigError, ConfigResult};
pub use plan::{load_plan, parse_plan};
