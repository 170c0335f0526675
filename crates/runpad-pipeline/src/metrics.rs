use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trait for metrics backends. Implementations can forward to Prometheus,
/// StatsD, or simply log metrics.
pub trait MetricsBackend: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_histogram(&self, name: &str, value: f64);
}

/// In-memory counters for one or more build managers.
pub struct BuildMetrics {
    pub builds_started: AtomicU64,
    pub builds_succeeded: AtomicU64,
    pub builds_failed: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_faulted: AtomicU64,
    pub references_loaded: AtomicU64,
    pub reference_failures: AtomicU64,
    backend: Option<Arc<dyn MetricsBackend>>,
}

impl std::fmt::Debug for BuildMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildMetrics")
            .field("builds_started", &self.builds_started)
            .field("builds_succeeded", &self.builds_succeeded)
            .field("builds_failed", &self.builds_failed)
            .field("runs_completed", &self.runs_completed)
            .field("runs_faulted", &self.runs_faulted)
            .field("references_loaded", &self.references_loaded)
            .field("reference_failures", &self.reference_failures)
            .finish()
    }
}

impl Default for BuildMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildMetrics {
    pub fn new() -> Self {
        Self {
            builds_started: AtomicU64::new(0),
            builds_succeeded: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_faulted: AtomicU64::new(0),
            references_loaded: AtomicU64::new(0),
            reference_failures: AtomicU64::new(0),
            backend: None,
        }
    }

    pub fn with_backend(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    fn bump(&self, counter: &AtomicU64, name: &str) {
        let val = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(backend) = &self.backend {
            backend.record_counter(name, val);
        }
    }

    fn time(&self, name: &str, duration: Duration) {
        if let Some(backend) = &self.backend {
            backend.record_histogram(name, duration.as_secs_f64() * 1000.0);
        }
    }

    pub fn record_build_started(&self) {
        self.bump(&self.builds_started, "runpad.builds_started");
    }

    pub fn record_build_finished(&self, success: bool, duration: Duration) {
        if success {
            self.bump(&self.builds_succeeded, "runpad.builds_succeeded");
        } else {
            self.bump(&self.builds_failed, "runpad.builds_failed");
        }
        self.time("runpad.build_ms", duration);
    }

    pub fn record_run_finished(&self, faulted: bool, duration: Duration) {
        if faulted {
            self.bump(&self.runs_faulted, "runpad.runs_faulted");
        } else {
            self.bump(&self.runs_completed, "runpad.runs_completed");
        }
        self.time("runpad.run_ms", duration);
    }

    pub fn record_reference_loaded(&self) {
        self.bump(&self.references_loaded, "runpad.references_loaded");
    }

    pub fn record_reference_failure(&self) {
        self.bump(&self.reference_failures, "runpad.reference_failures");
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            builds_started: self.builds_started.load(Ordering::Relaxed),
            builds_succeeded: self.builds_succeeded.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_faulted: self.runs_faulted.load(Ordering::Relaxed),
            references_loaded: self.references_loaded.load(Ordering::Relaxed),
            reference_failures: self.reference_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of build metrics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub builds_started: u64,
    pub builds_succeeded: u64,
    pub builds_failed: u64,
    pub runs_completed: u64,
    pub runs_faulted: u64,
    pub references_loaded: u64,
    pub reference_failures: u64,
}

/// Logging-based metrics backend. Emits metrics as structured log events.
pub struct LoggingMetricsBackend;

impl MetricsBackend for LoggingMetricsBackend {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, value = value, kind = "counter", "metric");
    }

    fn record_histogram(&self, name: &str, value: f64) {
        tracing::info!(metric = name, value = value, kind = "histogram", "metric");
    }
}
