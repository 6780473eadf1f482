//! Terminal implementation of the output façade.

use nightrun_core::OutputSink;
use std::io::Write;

/// Writes to stdout, filtered by a verbosity threshold.
pub struct ConsoleSink {
    threshold: u8,
}

impl ConsoleSink {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }
}

impl OutputSink for ConsoleSink {
    fn write(&self, text: &str, verbosity: u8) {
        if verbosity <= self.threshold {
            print!("{}", text);
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}
