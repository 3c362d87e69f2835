//! Scriptloom: thread-pooled task execution against a single-threaded
//! embedded scripting runtime.
//!
//! # Overview
//!
//! Embedded interpreters are usually single-threaded: only one thread may
//! touch the runtime at a time, and initialization/finalization must be
//! carefully bracketed. Scriptloom makes such a runtime safely usable from a
//! multi-threaded host:
//!
//! - A fixed-size [`pool::FixedThreadPool`] claims submitted tasks in FIFO
//!   order; tasks submitted while the pool is stopped are deferred and
//!   survive a stop/start cycle.
//! - An exclusive runtime guard serializes every touch of the runtime; a
//!   worker holds the pool's queue lock only to claim a task, never while a
//!   script runs.
//! - [`call::CallResult`] is a move-only, write-once handle: the submitting
//!   thread blocks in `get()` until a worker publishes the typed result or a
//!   normalized error.
//! - The [`engine::ScriptEngine`] owns the runtime's lifetime: extensions are
//!   installed before initialization, startup scripts run in order before any
//!   external work, and finalization happens only after the pool has drained.
//!
//! # Example
//!
//! ```no_run
//! use scriptloom::engine::{EngineConfig, ScriptEngine};
//! use scriptloom::runtime::Value;
//!
//! let mut engine = ScriptEngine::new(EngineConfig::default());
//! engine.install_extension("greeter", |ext| {
//!     ext.function("greet", |_args| Ok(Value::Str("hello".to_string())));
//! });
//! engine.start().expect("startup scripts failed");
//!
//! let call = engine.bind("greeter", "greet", vec![]).unwrap();
//! let result = engine.submit_call(call);
//! println!("{:?}", result.get());
//!
//! engine.finish_and_stop();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod call;
pub mod engine;
pub mod error;
pub mod pool;
pub mod runtime;
pub mod script;
pub mod task;

pub use call::CallResult;
pub use engine::{EngineConfig, ScriptEngine};
pub use error::{CallError, EngineError, ScriptError};
pub use pool::FixedThreadPool;
pub use runtime::{ContextId, Value};
pub use script::{BufferedScript, Script, ScriptFile};
