//! Error types for isolate management.
//!
//! This module defines error codes, script error details, and the main error
//! type used throughout the crate.

use crate::context::ContextId;
use crate::engine::IsolateId;
use serde::{Deserialize, Serialize};

/// Error codes for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The engine could not create an isolate or context
    IsolateCreationFailed,
    /// Loop, thread or async handle creation failed at the OS level
    OsError,
    /// Two entities belong to different isolates
    CrossIsolate,
    /// A context does not match the one registered for its id
    CrossContext,
    /// An environment already exists for the context
    DuplicateEnvironment,
    /// No context is registered under the id
    NoSuchContext,
    /// The wrapper no longer reaches its native resource
    Detached,
    /// Source text failed to compile
    CompileError,
    /// Script execution raised an exception
    RuntimeError,
    /// The work queue refused a task
    ThreadQueue,
    /// The event loop still owns open handles
    LoopBusy,
    /// Operation not valid in the current lifecycle state
    InvalidState,
    /// Invalid argument or configuration
    InvalidArgument,
    /// Serialization/deserialization error
    SerializationError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::IsolateCreationFailed => write!(f, "ISOLATE_CREATION_FAILED"),
            ErrorCode::OsError => write!(f, "OS_ERROR"),
            ErrorCode::CrossIsolate => write!(f, "CROSS_ISOLATE"),
            ErrorCode::CrossContext => write!(f, "CROSS_CONTEXT"),
            ErrorCode::DuplicateEnvironment => write!(f, "DUPLICATE_ENVIRONMENT"),
            ErrorCode::NoSuchContext => write!(f, "NO_SUCH_CONTEXT"),
            ErrorCode::Detached => write!(f, "DETACHED"),
            ErrorCode::CompileError => write!(f, "COMPILE_ERROR"),
            ErrorCode::RuntimeError => write!(f, "RUNTIME_ERROR"),
            ErrorCode::ThreadQueue => write!(f, "THREAD_QUEUE"),
            ErrorCode::LoopBusy => write!(f, "LOOP_BUSY"),
            ErrorCode::InvalidState => write!(f, "INVALID_STATE"),
            ErrorCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            ErrorCode::SerializationError => write!(f, "SERIALIZATION_ERROR"),
        }
    }
}

/// Source location of a script exception
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    /// Resource name the script was compiled under
    pub resource: String,
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
}

/// Error details from compiling or running a script.
///
/// Carries only text: the engine's exception object never leaves its isolate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptError {
    /// Error code, either `CompileError` or `RuntimeError`
    pub code: ErrorCode,

    /// The exception's string form, verbatim
    pub message: String,

    /// JavaScript stack trace, when the thrown value carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Where the exception was raised
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl ScriptError {
    /// Create a new script error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
            location: None,
        }
    }

    /// Create a compile error
    pub fn compile_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CompileError, message)
    }

    /// Create a runtime error
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuntimeError, message)
    }

    /// Add stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Add source location
    pub fn with_location(mut self, resource: impl Into<String>, line: u32, column: u32) -> Self {
        self.location = Some(SourceLocation {
            resource: resource.into(),
            line,
            column,
        });
        self
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " at {}:{}:{}", loc.resource, loc.line, loc.column)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

/// Main error type for isolate management
#[derive(Debug, thiserror::Error)]
pub enum IsolateError {
    /// Isolate or context creation failed inside the engine
    #[error("Engine error: {0}")]
    Engine(String),

    /// Loop, thread or async handle creation failed
    #[error("OS error: {0}")]
    Os(String),

    /// Entities from two different isolates were combined
    #[error("Cross-isolate use: expected isolate {expected}, found {found}")]
    CrossIsolate {
        /// Isolate the operation is bound to
        expected: IsolateId,
        /// Isolate the offending entity belongs to
        found: IsolateId,
    },

    /// A context is not the one registered for its id
    #[error("Cross-context use of context {context}")]
    CrossContext {
        /// The offending context id
        context: ContextId,
    },

    /// A second environment was requested for a context
    #[error("Existing environment for context {context}")]
    DuplicateEnvironment {
        /// The context that already has an environment
        context: ContextId,
    },

    /// No context registered under the id
    #[error("No such context: {0}")]
    NoSuchContext(ContextId),

    /// The wrapper was neutered and no longer reaches its resource
    #[error("{0} is detached")]
    Detached(String),

    /// Compile or runtime failure in script code
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// The work queue refused a task
    #[error("Thread queue error: {0}")]
    ThreadQueue(String),

    /// The event loop still owns open handles
    #[error("Event loop busy: {open_handles} open handle(s)")]
    LoopBusy {
        /// Number of handles and tasks still open
        open_handles: usize,
    },

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl IsolateError {
    /// Error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            IsolateError::Engine(_) => ErrorCode::IsolateCreationFailed,
            IsolateError::Os(_) => ErrorCode::OsError,
            IsolateError::CrossIsolate { .. } => ErrorCode::CrossIsolate,
            IsolateError::CrossContext { .. } => ErrorCode::CrossContext,
            IsolateError::DuplicateEnvironment { .. } => ErrorCode::DuplicateEnvironment,
            IsolateError::NoSuchContext(_) => ErrorCode::NoSuchContext,
            IsolateError::Detached(_) => ErrorCode::Detached,
            IsolateError::Script(e) => e.code,
            IsolateError::ThreadQueue(_) => ErrorCode::ThreadQueue,
            IsolateError::LoopBusy { .. } => ErrorCode::LoopBusy,
            IsolateError::InvalidState(_) => ErrorCode::InvalidState,
            IsolateError::Config(_) => ErrorCode::InvalidArgument,
            IsolateError::Serialization(_) => ErrorCode::SerializationError,
        }
    }

    /// Whether this is a misuse precondition reported before any mutation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            IsolateError::CrossIsolate { .. }
                | IsolateError::CrossContext { .. }
                | IsolateError::DuplicateEnvironment { .. }
        )
    }

    /// The script error payload, if this is a script failure
    pub fn as_script_error(&self) -> Option<&ScriptError> {
        match self {
            IsolateError::Script(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn detached(what: impl Into<String>) -> Self {
        IsolateError::Detached(what.into())
    }
}

impl From<serde_json::Error> for IsolateError {
    fn from(e: serde_json::Error) -> Self {
        IsolateError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for IsolateError {
    fn from(e: std::io::Error) -> Self {
        IsolateError::Os(e.to_string())
    }
}

/// Result type alias for isolate operations
pub type Result<T> = std::result::Result<T, IsolateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::DuplicateEnvironment.to_string(), "DUPLICATE_ENVIRONMENT");
        assert_eq!(ErrorCode::ThreadQueue.to_string(), "THREAD_QUEUE");
    }

    #[test]
    fn test_script_error_with_location() {
        let err = ScriptError::runtime_error("boom").with_location("main.js", 3, 7);
        assert_eq!(err.code, ErrorCode::RuntimeError);
        assert_eq!(err.to_string(), "[RUNTIME_ERROR] boom at main.js:3:7");
    }

    #[test]
    fn test_script_error_serialization() {
        let err = ScriptError::compile_error("SyntaxError: Unexpected end of input");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("COMPILE_ERROR"));
        assert!(!json.contains("stack"));
    }

    #[test]
    fn test_isolate_error_codes() {
        let dup = IsolateError::DuplicateEnvironment {
            context: ContextId::new(1),
        };
        assert_eq!(dup.code(), ErrorCode::DuplicateEnvironment);
        assert!(dup.is_precondition());

        let script: IsolateError = ScriptError::runtime_error("boom").into();
        assert_eq!(script.code(), ErrorCode::RuntimeError);
        assert_eq!(script.as_script_error().map(|e| e.message.as_str()), Some("boom"));
        assert!(!script.is_precondition());
    }

    #[test]
    fn test_io_error_maps_to_os() {
        let io = std::io::Error::new(std::io::ErrorKind::WouldBlock, "resource busy");
        let err: IsolateError = io.into();
        assert_eq!(err.code(), ErrorCode::OsError);
        assert!(err.to_string().contains("resource busy"));
    }
}
