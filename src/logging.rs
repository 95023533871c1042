//! User-facing console output.
//!
//! The per-entry status lines (`>>> [obj] /path`, `<<<         /path`,
//! `--- [!md5 ] /path`) are a stable output contract consumed by calling
//! tooling, so they go straight to stdout. Warnings and diagnostics go to
//! stderr and are mirrored as `tracing` events so a subscriber can capture
//! them.

use tracing::{debug, warn};

/// Console logger for the merge and unmerge engines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logger {
    verbose: bool,
}

impl Logger {
    /// Create a logger. With `verbose`, informational notes are printed too.
    #[must_use]
    pub const fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Emit one per-entry status line. Always printed.
    pub fn status(self, line: &str) {
        debug!(target: "pkgmerge::status", "{line}");
        println!("{line}");
    }

    /// Emit a warning. Always printed, to stderr.
    pub fn warn(self, message: &str) {
        warn!("{message}");
        eprintln!("!!! {message}");
    }

    /// Emit an informational note. Printed only in verbose mode.
    pub fn info(self, message: &str) {
        debug!("{message}");
        if self.verbose {
            eprintln!("... {message}");
        }
    }
}
