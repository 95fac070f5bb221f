//! JavaScript engine management.
//!
//! This module owns everything that touches V8 directly: process-wide
//! platform initialisation, the [`Isolate`] wrapper with its single lock
//! utility, compiled [`Script`]s with their per-isolate cache, and the
//! tagged persistent handle table swept at shutdown.

pub mod compiler;
pub mod handles;
pub mod isolate;
pub mod script;

pub use handles::{HandleId, HandleKind};
pub use isolate::{HeapStats, Isolate, IsolateState};
pub use script::{RunResult, Script};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

static PLATFORM: OnceCell<()> = OnceCell::new();

/// Initialise the V8 platform for this process.
///
/// V8 allows exactly one platform per process, so this is the one piece of
/// process-wide state the crate keeps. Called implicitly by
/// [`Isolate::new`]; calling it again is a no-op.
pub fn initialize_platform() {
    PLATFORM.get_or_init(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
        info!(version = v8::V8::get_version(), "Initialized V8 platform");
    });
}

/// Unique isolate ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IsolateId(Uuid);

impl IsolateId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IsolateId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for IsolateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_ids_are_unique() {
        let a = IsolateId::new();
        let b = IsolateId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn test_initialize_platform_is_idempotent() {
        initialize_platform();
        initialize_platform();
        assert!(PLATFORM.get().is_some());
    }
}
