//! Small logging helpers.

use std::time::Instant;

/// Logs the wall time of a scope when dropped.
///
/// ```ignore
/// let _t = ScopeTimer::new("cpu search");
/// // ... work ...
/// // logs "cpu search: 12.3ms" at INFO when _t goes out of scope
/// ```
pub struct ScopeTimer {
    label: &'static str,
    start: Instant,
}

impl ScopeTimer {
    pub fn new(label: &'static str) -> Self {
        log::debug!("{label}...");
        ScopeTimer {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopeTimer {
    fn drop(&mut self) {
        log::info!("{}: {:.3?}", self.label, self.start.elapsed());
    }
}
