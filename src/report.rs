//! Progress reporting seam.
//!
//! Terminal UI (spinners, colors) lives outside this crate; the engine talks
//! to it through this trait. The default implementation forwards to
//! `tracing`, so embedding the engine without a UI still yields structured
//! logs.

use tracing::{info, warn};

/// Sink for user-facing progress messages.
pub trait Reporter: Send + Sync {
    /// A normal progress message.
    fn info(&self, message: &str);

    /// A message about a suppressed or recoverable problem.
    fn warn(&self, message: &str);
}

/// Reporter forwarding everything to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn info(&self, message: &str) {
        info!("{message}");
    }

    fn warn(&self, message: &str) {
        warn!("{message}");
    }
}
