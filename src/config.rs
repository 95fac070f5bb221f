//! Construction-time configuration.
//!
//! An [`IsolateConfig`] is threaded explicitly through isolate, event loop
//! and environment construction. Nothing in the crate reads global state.

use crate::context::ContextId;
use crate::engine::IsolateId;
use crate::lifecycle::ShutdownState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Default number of in-flight work items before the queue refuses more
pub const DEFAULT_MAX_PENDING_WORK: usize = 1024;

/// Default size of the blocking worker pool
pub const DEFAULT_MAX_BLOCKING_THREADS: usize = 4;

/// Default number of compiled scripts kept per isolate
pub const DEFAULT_SCRIPT_CACHE_SIZE: usize = 128;

/// Default name for dedicated isolate threads
pub const DEFAULT_THREAD_NAME: &str = "isolate-host";

/// Smallest accepted non-zero heap limit (1 MB)
pub const MIN_HEAP_SIZE_BYTES: usize = 1024 * 1024;

/// How array buffer backing stores are allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AllocatorKind {
    /// Memory is zero-filled before it is handed to script code
    #[default]
    ZeroFill,
    /// Memory is handed out uninitialized
    Uninitialized,
}

/// What the shutdown sweep does when a close callback throws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseErrorPolicy {
    /// Log every exception, finish the sweep, then abort the process thread
    #[default]
    Abort,
    /// Log every exception and record it in the shutdown report
    LogAndContinue,
}

/// Script run once by `Environment::load`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryScript {
    /// Resource name
    pub name: String,
    /// Source text
    pub source: String,
}

/// Events delivered to a [`ProfilingHook`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ProfilingEvent {
    /// An isolate was created
    IsolateCreated {
        /// The new isolate
        isolate: IsolateId,
    },
    /// A context was created
    ContextCreated {
        /// Owning isolate
        isolate: IsolateId,
        /// The new context id
        context: ContextId,
    },
    /// A context was disposed
    ContextDisposed {
        /// Owning isolate
        isolate: IsolateId,
        /// The disposed context id
        context: ContextId,
    },
    /// A script was compiled or taken from the cache
    ScriptCompiled {
        /// Owning isolate
        isolate: IsolateId,
        /// Resource name
        name: String,
        /// Whether the compiled script came from the cache
        cache_hit: bool,
    },
    /// The shutdown protocol entered a state
    ShutdownState {
        /// Isolate being shut down
        isolate: IsolateId,
        /// State entered
        state: ShutdownState,
    },
    /// An isolate was disposed
    IsolateDisposed {
        /// The disposed isolate
        isolate: IsolateId,
    },
}

/// Callback receiving profiling events
#[derive(Clone)]
pub struct ProfilingHook(Arc<dyn Fn(&ProfilingEvent) + Send + Sync>);

impl ProfilingHook {
    /// Wrap a callback
    pub fn new(f: impl Fn(&ProfilingEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Deliver one event
    pub fn emit(&self, event: &ProfilingEvent) {
        (self.0)(event)
    }
}

impl std::fmt::Debug for ProfilingHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProfilingHook(..)")
    }
}

/// Configuration for one isolate and everything built on it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolateConfig {
    /// Array buffer allocator choice
    #[serde(default)]
    pub allocator: AllocatorKind,

    /// Initial heap size in bytes (0 = engine default)
    #[serde(default)]
    pub initial_heap_size: usize,

    /// Maximum heap size in bytes (0 = engine default)
    #[serde(default)]
    pub max_heap_size: usize,

    /// Start environments with the profiler idle notifier enabled
    #[serde(default)]
    pub start_profiler_idle_notifier: bool,

    /// Receives profiling events (not serializable)
    #[serde(skip)]
    pub profiling_hook: Option<ProfilingHook>,

    /// Policy for exceptions thrown by close callbacks during shutdown
    #[serde(default)]
    pub close_error_policy: CloseErrorPolicy,

    /// Maximum queued work items in flight per event loop
    #[serde(default = "default_max_pending_work")]
    pub max_pending_work: usize,

    /// Worker threads available to queued work
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,

    /// Compiled scripts cached per isolate (0 disables the cache)
    #[serde(default = "default_script_cache_size")]
    pub script_cache_size: usize,

    /// Script run by `Environment::load`
    #[serde(default)]
    pub entry_script: Option<EntryScript>,

    /// Name given to dedicated isolate threads
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            allocator: AllocatorKind::default(),
            initial_heap_size: 0,
            max_heap_size: 0,
            start_profiler_idle_notifier: false,
            profiling_hook: None,
            close_error_policy: CloseErrorPolicy::default(),
            max_pending_work: DEFAULT_MAX_PENDING_WORK,
            max_blocking_threads: DEFAULT_MAX_BLOCKING_THREADS,
            script_cache_size: DEFAULT_SCRIPT_CACHE_SIZE,
            entry_script: None,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl IsolateConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Set the allocator
    pub fn with_allocator(mut self, allocator: AllocatorKind) -> Self {
        self.allocator = allocator;
        self
    }

    /// Set initial and maximum heap sizes
    pub fn with_heap_limits(mut self, initial: usize, max: usize) -> Self {
        self.initial_heap_size = initial;
        self.max_heap_size = max;
        self
    }

    /// Enable or disable the profiler idle notifier
    pub fn with_profiler_idle_notifier(mut self, enable: bool) -> Self {
        self.start_profiler_idle_notifier = enable;
        self
    }

    /// Install a profiling event hook
    pub fn with_profiling_hook(mut self, hook: ProfilingHook) -> Self {
        self.profiling_hook = Some(hook);
        self
    }

    /// Set the close callback exception policy
    pub fn with_close_error_policy(mut self, policy: CloseErrorPolicy) -> Self {
        self.close_error_policy = policy;
        self
    }

    /// Set the in-flight work limit
    pub fn with_max_pending_work(mut self, max: usize) -> Self {
        self.max_pending_work = max;
        self
    }

    /// Set the blocking worker pool size
    pub fn with_max_blocking_threads(mut self, threads: usize) -> Self {
        self.max_blocking_threads = threads;
        self
    }

    /// Set the per-isolate script cache size
    pub fn with_script_cache_size(mut self, entries: usize) -> Self {
        self.script_cache_size = entries;
        self
    }

    /// Set the entry script run by `Environment::load`
    pub fn with_entry_script(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.entry_script = Some(EntryScript {
            name: name.into(),
            source: source.into(),
        });
        self
    }

    /// Set the dedicated thread name
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Deliver a profiling event to the hook, if any
    pub(crate) fn profile(&self, event: ProfilingEvent) {
        if let Some(hook) = &self.profiling_hook {
            hook.emit(&event);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_heap_size != 0 && self.max_heap_size < MIN_HEAP_SIZE_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "max_heap_size".into(),
                reason: "must be 0 or at least 1MB".into(),
            });
        }

        if self.max_heap_size != 0 && self.initial_heap_size > self.max_heap_size {
            return Err(ConfigError::InvalidValue {
                field: "initial_heap_size".into(),
                reason: "must not exceed max_heap_size".into(),
            });
        }

        if self.max_pending_work == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_pending_work".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.max_blocking_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_blocking_threads".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.thread_name.is_empty() {
            return Err(ConfigError::MissingField {
                field: "thread_name".into(),
            });
        }

        if let Some(entry) = &self.entry_script {
            if entry.name.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "entry_script.name".into(),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// Missing required field
    #[error("Missing required configuration field: {field}")]
    MissingField {
        /// The field name
        field: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_max_pending_work() -> usize {
    DEFAULT_MAX_PENDING_WORK
}

fn default_max_blocking_threads() -> usize {
    DEFAULT_MAX_BLOCKING_THREADS
}

fn default_script_cache_size() -> usize {
    DEFAULT_SCRIPT_CACHE_SIZE
}

fn default_thread_name() -> String {
    DEFAULT_THREAD_NAME.to_string()
}
