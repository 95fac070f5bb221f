//! Lifecycle and execution metrics.
//!
//! One [`MetricsCollector`] is shared by an isolate and everything built on
//! it. Counters are atomics so a snapshot can be taken from another thread
//! while the isolate's thread keeps running.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Contexts created
    pub contexts_created: u64,
    /// Contexts disposed
    pub contexts_disposed: u64,
    /// Scripts compiled by the engine
    pub scripts_compiled: u64,
    /// Compilations served from the script cache
    pub compile_cache_hits: u64,
    /// Script runs and callbacks that completed
    pub scripts_run: u64,
    /// Script runs and callbacks that threw
    pub scripts_failed: u64,
    /// Total time spent running scripts, in microseconds
    pub run_time_us: u64,
    /// Work items accepted by the queue
    pub tasks_queued: u64,
    /// Work items whose completion callback ran
    pub tasks_completed: u64,
    /// Work items refused by the queue
    pub tasks_refused: u64,
    /// Close callbacks invoked by the shutdown sweep
    pub close_callbacks: u64,
    /// Close callbacks that threw
    pub close_failures: u64,
    /// Error counts by error code
    pub errors: HashMap<String, u64>,
}

/// Metrics collector for one isolate
pub struct MetricsCollector {
    contexts_created: AtomicU64,
    contexts_disposed: AtomicU64,
    scripts_compiled: AtomicU64,
    compile_cache_hits: AtomicU64,
    scripts_run: AtomicU64,
    scripts_failed: AtomicU64,
    run_time_us: AtomicU64,
    tasks_queued: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_refused: AtomicU64,
    close_callbacks: AtomicU64,
    close_failures: AtomicU64,
    error_counts: parking_lot::Mutex<HashMap<String, u64>>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            contexts_created: AtomicU64::new(0),
            contexts_disposed: AtomicU64::new(0),
            scripts_compiled: AtomicU64::new(0),
            compile_cache_hits: AtomicU64::new(0),
            scripts_run: AtomicU64::new(0),
            scripts_failed: AtomicU64::new(0),
            run_time_us: AtomicU64::new(0),
            tasks_queued: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_refused: AtomicU64::new(0),
            close_callbacks: AtomicU64::new(0),
            close_failures: AtomicU64::new(0),
            error_counts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn record_context_created(&self) {
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_context_disposed(&self) {
        self.contexts_disposed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compile(&self, cache_hit: bool) {
        if cache_hit {
            self.compile_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.scripts_compiled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_run(&self, elapsed: Duration, success: bool) {
        if success {
            self.scripts_run.fetch_add(1, Ordering::Relaxed);
        } else {
            self.scripts_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.run_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_task_queued(&self) {
        self.tasks_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_task_refused(&self) {
        self.tasks_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_close_callback(&self, success: bool) {
        self.close_callbacks.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.close_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an error
    pub fn record_error(&self, error_code: &str) {
        let mut counts = self.error_counts.lock();
        *counts.entry(error_code.to_string()).or_insert(0) += 1;
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            contexts_created: self.contexts_created.load(Ordering::Relaxed),
            contexts_disposed: self.contexts_disposed.load(Ordering::Relaxed),
            scripts_compiled: self.scripts_compiled.load(Ordering::Relaxed),
            compile_cache_hits: self.compile_cache_hits.load(Ordering::Relaxed),
            scripts_run: self.scripts_run.load(Ordering::Relaxed),
            scripts_failed: self.scripts_failed.load(Ordering::Relaxed),
            run_time_us: self.run_time_us.load(Ordering::Relaxed),
            tasks_queued: self.tasks_queued.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_refused: self.tasks_refused.load(Ordering::Relaxed),
            close_callbacks: self.close_callbacks.load(Ordering::Relaxed),
            close_failures: self.close_failures.load(Ordering::Relaxed),
            errors: self.error_counts.lock().clone(),
        }
    }

    /// Export Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP isolate_contexts_total Contexts by lifecycle event\n");
        output.push_str("# TYPE isolate_contexts_total counter\n");
        output.push_str(&format!(
            "isolate_contexts_total{{event=\"created\"}} {}\n",
            s.contexts_created
        ));
        output.push_str(&format!(
            "isolate_contexts_total{{event=\"disposed\"}} {}\n",
            s.contexts_disposed
        ));

        output.push_str("\n# HELP isolate_script_runs_total Script runs by outcome\n");
        output.push_str("# TYPE isolate_script_runs_total counter\n");
        output.push_str(&format!(
            "isolate_script_runs_total{{status=\"success\"}} {}\n",
            s.scripts_run
        ));
        output.push_str(&format!(
            "isolate_script_runs_total{{status=\"error\"}} {}\n",
            s.scripts_failed
        ));

        output.push_str("\n# HELP isolate_compilations_total Script compilations by source\n");
        output.push_str("# TYPE isolate_compilations_total counter\n");
        output.push_str(&format!(
            "isolate_compilations_total{{source=\"engine\"}} {}\n",
            s.scripts_compiled
        ));
        output.push_str(&format!(
            "isolate_compilations_total{{source=\"cache\"}} {}\n",
            s.compile_cache_hits
        ));

        output.push_str("\n# HELP isolate_tasks_total Queued work items by outcome\n");
        output.push_str("# TYPE isolate_tasks_total counter\n");
        for (status, count) in [
            ("queued", s.tasks_queued),
            ("completed", s.tasks_completed),
            ("refused", s.tasks_refused),
        ] {
            output.push_str(&format!(
                "isolate_tasks_total{{status=\"{}\"}} {}\n",
                status, count
            ));
        }

        output.push_str("\n# HELP isolate_close_callbacks_total Shutdown close callbacks\n");
        output.push_str("# TYPE isolate_close_callbacks_total counter\n");
        output.push_str(&format!("isolate_close_callbacks_total {}\n", s.close_callbacks));
        output.push_str(&format!(
            "isolate_close_callbacks_total{{status=\"error\"}} {}\n",
            s.close_failures
        ));

        // Errors
        output.push_str("\n# HELP isolate_errors_total Error counts by code\n");
        output.push_str("# TYPE isolate_errors_total counter\n");
        for (code, count) in s.errors {
            output.push_str(&format!("isolate_errors_total{{code=\"{}\"}} {}\n", code, count));
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
