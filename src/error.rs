//! Error types for the engine, the runtime, and call handles.
//!
//! The error handling strategy follows three rules:
//!
//! - Expected scheduling races (starting an already-running pool, stopping a
//!   stopped one) are `bool` "did not happen" signals, not errors.
//! - Failures inside a task's execution are caught at the task boundary and
//!   normalized into a [`ScriptError`] naming the context and the failing
//!   script or function; they never terminate a worker thread.
//! - Lifecycle misuse (initializing twice, installing an extension after
//!   initialization) is a programmer error and panics loudly. Teardown paths
//!   never panic; they log.

use crate::runtime::ContextId;
use thiserror::Error;

/// A normalized script execution failure.
///
/// Every failure raised while a task executes against the runtime is reduced
/// to one of these variants, each carrying the context identifier and the
/// script or function name for diagnostics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScriptError {
    /// The script or bound function raised an error while executing.
    #[error("an error has occurred while executing {name} in context {context}: {message}")]
    Execution {
        /// Context (logical namespace) the work executed in.
        context: ContextId,
        /// Script or function name.
        name: String,
        /// Human-readable failure description.
        message: String,
    },

    /// The task panicked; the panic was caught at the task boundary.
    #[error("{name} in context {context} panicked: {message}")]
    Panicked {
        /// Context the work executed in.
        context: ContextId,
        /// Script or function name.
        name: String,
        /// Panic payload, stringified.
        message: String,
    },

    /// A named function was not present in the context's namespace.
    #[error("no function named {name} in context {context}")]
    UnknownFunction {
        /// Context searched.
        context: ContextId,
        /// Function name looked up.
        name: String,
    },

    /// A file-backed script could not be read when it was claimed.
    ///
    /// Read errors surface at execution time, not at submission time.
    #[error("cannot read script {name}: {message}")]
    SourceUnavailable {
        /// Script name (usually the file name).
        name: String,
        /// Underlying I/O failure description.
        message: String,
    },

    /// The task ran outside the runtime's valid lifetime.
    ///
    /// This indicates the pool executed work outside the
    /// `[initialize, finalize)` interval; the engine prevents it for work it
    /// schedules itself.
    #[error("runtime not initialized while executing {name} in context {context}")]
    RuntimeGone {
        /// Context the work would have executed in.
        context: ContextId,
        /// Script or function name.
        name: String,
    },
}

impl ScriptError {
    /// Normalizes an arbitrary error message into an [`ScriptError::Execution`]
    /// naming the given context and script.
    pub fn execution(
        context: impl Into<ContextId>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Execution {
            context: context.into(),
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by [`CallResult::get`](crate::call::CallResult::get).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// The call executed and failed; the normalized failure is attached.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The call was discarded before a worker could execute it (the pool was
    /// destroyed with the task still queued, or the pending queue was
    /// cleared).
    #[error("call was discarded before a result was produced")]
    Abandoned,
}

/// Errors from engine operations performed on the calling thread.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The runtime is not initialized; `lookup`/`bind` require a running
    /// engine.
    #[error("script engine is not initialized")]
    NotInitialized,

    /// The requested function does not exist in the named context.
    #[error("no function named {name} in context {context}")]
    UnknownFunction {
        /// Context searched.
        context: ContextId,
        /// Function name looked up.
        name: String,
    },

    /// A startup script failed during `start()`; the engine rolled back to
    /// the uninitialized state.
    #[error("startup script failed: {0}")]
    Startup(#[source] ScriptError),
}
