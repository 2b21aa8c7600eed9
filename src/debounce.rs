use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Per-path change debouncer.
///
/// Editors tend to fire several modification events for one save; this
/// rejects near-duplicate events for the same path inside a fixed window.
/// It does not batch or coalesce — each accepted event is handled on its own.
pub struct Debouncer {
    window: Duration,
    last_accepted: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: HashMap::new(),
        }
    }

    /// Decide whether to act on a change event at time `now`.
    ///
    /// Accepts iff no prior accepted event for `path` falls within the
    /// window; the timestamp is only updated on acceptance, so a burst of
    /// rejected events does not keep pushing the window forward.
    pub fn accept(&mut self, path: &Path, now: Instant) -> bool {
        if let Some(&last) = self.last_accepted.get(path) {
            if now.duration_since(last) < self.window {
                tracing::debug!(path = %path.display(), "change debounced");
                return false;
            }
        }
        self.last_accepted.insert(path.to_path_buf(), now);
        true
    }
}
