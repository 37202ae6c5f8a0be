use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    static GRAD_MODE: Cell<bool> = Cell::new(true);
}

/// Thread-local gradient mode. Backward functions observe the mode of the
/// graph task that scheduled them, so `create_graph` propagates correctly
/// across worker threads.
pub struct GradMode;

impl GradMode {
    pub fn is_enabled() -> bool {
        GRAD_MODE.with(|mode| mode.get())
    }

    pub fn set_enabled(enabled: bool) {
        GRAD_MODE.with(|mode| mode.set(enabled));
    }
}

/// Scoped gradient-mode switch; restores the previous value on drop.
pub struct AutoGradMode {
    prev: bool,
}

impl AutoGradMode {
    pub fn new(enabled: bool) -> Self {
        let prev = GradMode::is_enabled();
        GradMode::set_enabled(enabled);
        AutoGradMode { prev }
    }
}

impl Drop for AutoGradMode {
    fn drop(&mut self) {
        GradMode::set_enabled(self.prev);
    }
}

static ANOMALY_MODE: AtomicBool = AtomicBool::new(false);

/// Process-wide anomaly detection toggle. When enabled, the engine scans
/// every produced gradient for NaNs and reports the failing node on error.
pub struct AnomalyMode;

impl AnomalyMode {
    pub fn is_enabled() -> bool {
        ANOMALY_MODE.load(Ordering::Relaxed)
    }

    pub fn set_enabled(enabled: bool) {
        ANOMALY_MODE.store(enabled, Ordering::Relaxed);
    }
}
