//! Progress tracking and callbacks for registration workflows.
//!
//! Estimators report every optimizer iteration through a [`ProgressTracker`];
//! the tracker forwards to an optional user callback.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Progress information for one optimizer iteration.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Pipeline step the iteration belongs to.
    pub step: String,
    /// Pyramid level, for multi-resolution estimators.
    pub level: Option<usize>,
    /// Current iteration number.
    pub iteration: usize,
    /// Iteration cap (if known).
    pub total_iterations: Option<usize>,
    /// Current metric value.
    pub metric: f64,
    /// Length of the last parameter update.
    pub step_length: f64,
    /// Time elapsed since the step started.
    pub elapsed: Duration,
    /// Estimated remaining time.
    pub estimated_remaining: Option<Duration>,
}

impl ProgressInfo {
    /// Progress through the iteration cap, in percent.
    pub fn progress_percent(&self) -> Option<f64> {
        self.total_iterations
            .filter(|&total| total > 0)
            .map(|total| (self.iteration as f64 / total as f64) * 100.0)
    }

    /// Extrapolate the remaining time from the average iteration time.
    pub fn calculate_remaining(&mut self) {
        if let Some(total) = self.total_iterations {
            if self.iteration > 0 {
                let avg_time_per_iter = self.elapsed.as_secs_f64() / self.iteration as f64;
                let remaining_iters = total.saturating_sub(self.iteration);
                self.estimated_remaining = Some(Duration::from_secs_f64(avg_time_per_iter * remaining_iters as f64));
            }
        }
    }
}

/// Progress callback trait for monitoring registration progress.
pub trait ProgressCallback: Send + Sync {
    /// Called at each iteration with progress information.
    fn on_progress(&self, info: &ProgressInfo);

    /// Called when a step starts.
    fn on_start(&self, _step: &str) {}

    /// Called when a step finishes successfully.
    fn on_complete(&self, _step: &str, _elapsed: Duration) {}

    /// Called when a step attempt fails.
    fn on_error(&self, _step: &str, _error: &str) {}
}

/// Console progress callback that logs to tracing.
#[derive(Debug, Clone)]
pub struct ConsoleProgressCallback {
    /// Log interval (iterations), at least 1.
    log_interval: usize,
}

impl Default for ConsoleProgressCallback {
    fn default() -> Self {
        Self { log_interval: 50 }
    }
}

impl ConsoleProgressCallback {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }

    pub fn log_interval(&self) -> usize {
        self.log_interval
    }
}

impl ProgressCallback for ConsoleProgressCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        if info.iteration % self.log_interval == 0 || info.total_iterations == Some(info.iteration) {
            let remaining = info
                .estimated_remaining
                .map(|d| format!("{:.2}s", d.as_secs_f64()))
                .unwrap_or_else(|| "N/A".to_string());

            tracing::info!(
                step = %info.step,
                level = ?info.level,
                iteration = info.iteration,
                metric = info.metric,
                step_length = info.step_length,
                "Iter {}/{} ({:.1}%) | ETA: {}",
                info.iteration,
                info.total_iterations.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string()),
                info.progress_percent().unwrap_or(0.0),
                remaining
            );
        }
    }

    fn on_start(&self, step: &str) {
        tracing::info!(step, "step started");
    }

    fn on_complete(&self, step: &str, elapsed: Duration) {
        tracing::info!(step, "step completed in {:.2}s", elapsed.as_secs_f64());
    }

    fn on_error(&self, step: &str, error: &str) {
        tracing::error!(step, "step failed: {}", error);
    }
}

/// History callback that records all progress information.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    history: Arc<Mutex<Vec<ProgressInfo>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the recorded history.
    pub fn history(&self) -> Vec<ProgressInfo> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Errors reported through [`ProgressCallback::on_error`].
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Clear the history.
    pub fn clear(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl ProgressCallback for HistoryCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).push(info.clone());
    }

    fn on_error(&self, step: &str, error: &str) {
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{}: {}", step, error));
    }
}

/// Per-step progress reporter handed to estimators.
#[derive(Clone)]
pub struct ProgressTracker {
    step: Arc<str>,
    callback: Option<Arc<dyn ProgressCallback>>,
    start: Instant,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("step", &self.step)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::disabled()
    }
}

impl ProgressTracker {
    pub fn new(step: &str, callback: Option<Arc<dyn ProgressCallback>>) -> Self {
        Self {
            step: Arc::from(step),
            callback,
            start: Instant::now(),
        }
    }

    /// A tracker that reports nowhere.
    pub fn disabled() -> Self {
        Self::new("", None)
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    /// Restart the clock and notify the callback.
    pub fn start(&mut self) {
        self.start = Instant::now();
        if let Some(callback) = &self.callback {
            callback.on_start(&self.step);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Report one iteration.
    pub fn update(
        &self,
        level: Option<usize>,
        iteration: usize,
        total_iterations: Option<usize>,
        metric: f64,
        step_length: f64,
    ) {
        let Some(callback) = &self.callback else {
            return;
        };
        let mut info = ProgressInfo {
            step: self.step.to_string(),
            level,
            iteration,
            total_iterations,
            metric,
            step_length,
            elapsed: self.start.elapsed(),
            estimated_remaining: None,
        };
        info.calculate_remaining();
        callback.on_progress(&info);
    }

    pub fn complete(&self) {
        if let Some(callback) = &self.callback {
            callback.on_complete(&self.step, self.start.elapsed());
        }
    }

    pub fn error(&self, error: &str) {
        if let Some(callback) = &self.callback {
            callback.on_error(&self.step, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(iteration: usize, total: Option<usize>) -> ProgressInfo {
        ProgressInfo {
            step: "rigid".into(),
            level: None,
            iteration,
            total_iterations: total,
            metric: 0.5,
            step_length: 1.0,
            elapsed: Duration::from_secs(10),
            estimated_remaining: None,
        }
    }

    #[test]
    fn test_progress_info() {
        let info = info(10, Some(100));
        assert_eq!(info.progress_percent(), Some(10.0));
        assert_eq!(self::info(3, Some(0)).progress_percent(), None);
    }

    #[test]
    fn test_console_zero_interval_is_clamped() {
        let console = ConsoleProgressCallback::new(0);
        assert_eq!(console.log_interval(), 1);
        console.on_progress(&info(7, None));
    }

    #[test]
    fn test_progress_info_remaining() {
        let mut info = info(10, Some(100));
        info.calculate_remaining();
        let remaining = info.estimated_remaining.unwrap();
        assert!((remaining.as_secs_f64() - 90.0).abs() < 1e-6);
    }

    #[test]
    fn test_tracker_forwards_to_history() {
        let history = HistoryCallback::new();
        let tracker = ProgressTracker::new("affine", Some(Arc::new(history.clone())));
        tracker.update(None, 1, Some(5), 0.25, 0.5);
        tracker.update(Some(0), 2, Some(5), 0.125, 0.5);
        tracker.error("boom");

        let recorded = history.history();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].step, "affine");
        assert_eq!(recorded[1].level, Some(0));
        assert_eq!(history.errors(), vec!["affine: boom".to_string()]);
    }

    #[test]
    fn test_disabled_tracker_is_silent() {
        let tracker = ProgressTracker::disabled();
        tracker.update(None, 1, None, 0.0, 0.0);
        tracker.complete();
    }
}
