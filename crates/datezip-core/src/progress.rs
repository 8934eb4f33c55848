use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Type alias for progress callback: `(stage, current, total, message)`
pub type ProgressCallback = dyn Fn(&str, u64, u64, &str) + Send + Sync;

const MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Throttled progress reporter — emits at most every 200ms or on completion.
pub struct ThrottledProgress {
    inner: Arc<ProgressCallback>,
    last_emit: Mutex<Option<Instant>>,
}

impl ThrottledProgress {
    pub fn new(inner: Arc<ProgressCallback>) -> Self {
        Self {
            inner,
            last_emit: Mutex::new(None),
        }
    }

    /// `current` counts finished items, so `current == total` is completion.
    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current >= total;
        {
            let mut last = self.last_emit.lock().unwrap_or_else(PoisonError::into_inner);
            if !is_done && last.map_or(false, |t| t.elapsed() < MIN_INTERVAL) {
                return;
            }
            *last = Some(Instant::now());
        }
        (self.inner)(stage, current, total, message);
    }
}
