//! # Isolate Host
//!
//! Multi-isolate JavaScript execution management on top of V8. A host
//! process creates any number of isolates, each bound to its own event
//! loop, with contexts and per-context environments inside them, and
//! tears every one of them down through a deterministic shutdown protocol.
//!
//! ## Architecture
//!
//! ```text
//! IsolateThread (optional, one OS thread per isolate)
//!     │
//!     ▼
//! IsolateHost ── EventLoop (timers, async signals, queued work)
//!     │
//!     ├── Isolate ── Context ── Environment (process, timers, listeners)
//!     │
//!     ▼
//! Shutdown: RUNNING → DRAINING → EXITING → RECLAIMING → SWEEPING → CLOSED
//! ```
//!
//! ## Features
//!
//! - **Isolate affinity**: every wrapper checks it is used with its own isolate
//! - **Scoped entry**: one lock utility for every call into the engine
//! - **Event loop**: timers, cross-thread async handles and a bounded work pool
//! - **Tracked handles**: persistent handles swept with close callbacks at exit
//! - **Shutdown report**: the transitions, exit codes and sweep outcomes of a run

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod context;
pub mod engine;
pub mod environment;
pub mod error;
pub mod event_loop;
pub mod host;
pub mod lifecycle;
pub mod metrics;
pub mod thread;

// Re-export commonly used types
pub use config::{AllocatorKind, CloseErrorPolicy, IsolateConfig, ProfilingEvent, ProfilingHook};
pub use context::{Context, ContextId};
pub use engine::{HandleId, HandleKind, HeapStats, Isolate, IsolateId, RunResult, Script};
pub use environment::{CallbackReceiver, Environment, IsolateData};
pub use error::{ErrorCode, IsolateError, Result, ScriptError};
pub use event_loop::{AsyncHandle, AsyncSender, EventLoop, RunMode};
pub use host::IsolateHost;
pub use lifecycle::{Shutdown, ShutdownReport, ShutdownState};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use thread::{IsolateThread, IsolateThreadHandle, ScriptTask};

/// The embedded bootstrap script that installs `process` and the timer
/// globals in every environment.
pub const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.0.0");
    }

    #[test]
    fn test_bootstrap_loaded() {
        assert!(!BOOTSTRAP_JS.is_empty());
        assert!(BOOTSTRAP_JS.contains("drainTimers"));
        assert!(BOOTSTRAP_JS.contains("emitBeforeExit"));
    }
}
