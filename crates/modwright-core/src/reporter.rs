//! Progress reporting trait for dependency injection.
//!
//! Long-running steps (download, unpack, checksum) report fractional
//! progress through a caller-supplied sink so the core stays decoupled from
//! any particular UI.

use modwright_schema::{ModId, ModVersion};

/// Caller-supplied progress and status sink.
pub trait Reporter: Send + Sync {
    /// Fractional progress (0.0 to 1.0) of a named phase for one mod.
    fn progress(&self, id: &ModId, version: &ModVersion, phase: &str, fraction: f64);

    /// A mod operation completed.
    fn done(&self, id: &ModId, version: &ModVersion, detail: &str);

    /// A mod operation failed with a reason.
    fn failed(&self, id: &ModId, version: &ModVersion, reason: &str);

    /// Informational message.
    fn info(&self, msg: &str);

    /// Non-blocking warning, e.g. a surfaced conflict record.
    fn warning(&self, msg: &str);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn progress(&self, id: &ModId, version: &ModVersion, phase: &str, fraction: f64) {
        (**self).progress(id, version, phase, fraction);
    }
    fn done(&self, id: &ModId, version: &ModVersion, detail: &str) {
        (**self).done(id, version, detail);
    }
    fn failed(&self, id: &ModId, version: &ModVersion, reason: &str) {
        (**self).failed(id, version, reason);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
}

/// A no-op reporter for silent operations and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn progress(&self, _: &ModId, _: &ModVersion, _: &str, _: f64) {}
    fn done(&self, _: &ModId, _: &ModVersion, _: &str) {}
    fn failed(&self, _: &ModId, _: &ModVersion, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
}
