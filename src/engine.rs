//! The script engine: runtime lifecycle control plus task submission.
//!
//! [`ScriptEngine`] brackets the worker pool's running interval with runtime
//! initialization and finalization:
//!
//! - `start()` builds the runtime, registers every installed extension, runs
//!   the startup scripts in registration order on the calling thread (so they
//!   finish before any externally submitted work), attaches the runtime —
//!   from this point the exclusive guard is acquirable — and only then starts
//!   the pool.
//! - `stop()` / `finish_and_stop()` stop the pool first (joining every
//!   worker, so nobody can hold the runtime guard), then detach and tear
//!   down the runtime from the stopping thread while holding the affinity
//!   token captured at initialization.
//!
//! The pool's running interval is therefore always a sub-interval of
//! `[initialize, finalize)`.

use crate::call::{channel, CallResult, CallSlot};
use crate::error::{EngineError, ScriptError};
use crate::pool::FixedThreadPool;
use crate::runtime::{
    ContextId, Evaluator, ExtensionBuilder, Extension, LineEvaluator, RuntimeCell, RuntimeCore,
    Value,
};
use crate::script::{BoundCall, BufferedScript, Script};
use crate::task::{panic_message, Task};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Context identifier and extension name of the built-in writer module.
pub const BUILTIN_CONTEXT: &str = "loom";

/// A startup script entry in the engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupScript {
    /// Context the script executes in.
    pub context: String,
    /// Path to the script file.
    pub path: PathBuf,
}

/// Engine construction parameters.
///
/// Deserializable so process glue can read it from its configuration files;
/// the property-file parser itself lives outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads the pool runs.
    pub worker_threads: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
    /// File-backed scripts executed, in order, at every `start()`.
    pub startup_scripts: Vec<StartupScript>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            thread_name_prefix: "scriptloom".to_string(),
            startup_scripts: Vec::new(),
        }
    }
}

/// Buffered capture of script output.
///
/// Scripts and native extensions write here instead of stdout; the buffer is
/// flushed to the logging collaborator after every script execution and on
/// engine teardown.
pub struct ScriptWriter {
    state: Mutex<WriterState>,
}

struct WriterState {
    buffer: String,
    dirty: bool,
}

impl ScriptWriter {
    fn new() -> Self {
        Self {
            state: Mutex::new(WriterState {
                buffer: String::new(),
                dirty: false,
            }),
        }
    }

    /// Appends a message to the buffer.
    pub fn write(&self, message: &str) {
        let mut state = self.state.lock();
        state.buffer.push_str(message);
        state.dirty = true;
    }

    /// Emits the buffered output as info-level log lines and clears it.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        if !state.dirty {
            return;
        }
        for line in state.buffer.lines() {
            info!(target: "scriptloom::script_output", "{line}");
        }
        state.buffer.clear();
        state.dirty = false;
    }
}

impl Drop for ScriptWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

impl fmt::Debug for ScriptWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ScriptWriter")
            .field("buffered_bytes", &state.buffer.len())
            .field("dirty", &state.dirty)
            .finish()
    }
}

/// State shared between the engine and its worker tasks.
struct EngineShared {
    runtime: RuntimeCell,
    writer: Arc<ScriptWriter>,
}

/// Controller state mutated only by administrative operations.
struct Controller {
    extensions: Vec<Extension>,
    startup: Vec<Arc<dyn Script>>,
    initialized: bool,
}

type EvaluatorFactory = Box<dyn Fn() -> Box<dyn Evaluator> + Send + Sync>;

/// Multi-threaded front end to a single-threaded scripting runtime.
///
/// See the [module documentation](self) for the lifecycle contract.
pub struct ScriptEngine {
    pool: FixedThreadPool,
    shared: Arc<EngineShared>,
    ctl: Mutex<Controller>,
    evaluator_factory: EvaluatorFactory,
}

impl ScriptEngine {
    /// Creates an engine with the default line-oriented evaluator.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_evaluator(config, || Box::new(LineEvaluator))
    }

    /// Creates an engine whose runtime uses evaluators produced by `factory`.
    ///
    /// The factory runs once per `start()`, since the runtime is rebuilt for
    /// every running interval.
    pub fn with_evaluator<F>(config: EngineConfig, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Evaluator> + Send + Sync + 'static,
    {
        let startup: Vec<Arc<dyn Script>> = config
            .startup_scripts
            .iter()
            .map(|entry| {
                Arc::new(crate::script::ScriptFile::from_path(
                    entry.context.as_str(),
                    &entry.path,
                )) as Arc<dyn Script>
            })
            .collect();
        Self {
            pool: FixedThreadPool::new(config.worker_threads, config.thread_name_prefix.clone()),
            shared: Arc::new(EngineShared {
                runtime: RuntimeCell::default(),
                writer: Arc::new(ScriptWriter::new()),
            }),
            ctl: Mutex::new(Controller {
                extensions: Vec::new(),
                startup,
                initialized: false,
            }),
            evaluator_factory: Box::new(factory),
        }
    }

    /// Registers a native extension module.
    ///
    /// The extension's functions seed the namespace of the context with the
    /// same name, at every `start()`.
    ///
    /// # Panics
    ///
    /// Panics if the engine is running: extensions register before
    /// initialization.
    pub fn install_extension<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: FnOnce(&mut ExtensionBuilder),
    {
        let mut ctl = self.ctl.lock();
        assert!(
            !ctl.initialized,
            "native extensions must be installed before the engine starts"
        );
        let mut builder = ExtensionBuilder::new(name);
        factory(&mut builder);
        ctl.extensions.push(builder.build());
    }

    /// Registers source to run once, in order, immediately after the runtime
    /// becomes available at every `start()`, before any externally submitted
    /// work.
    pub fn run_after_start(&mut self, source: impl Into<String>, context: impl Into<ContextId>) {
        let mut ctl = self.ctl.lock();
        let name = format!("startup_{}", ctl.startup.len());
        ctl.startup
            .push(Arc::new(BufferedScript::new(name, context, source)));
    }

    /// Registers an arbitrary script as startup work.
    pub fn run_script_after_start(&mut self, script: impl Script + 'static) {
        self.ctl.lock().startup.push(Arc::new(script));
    }

    /// Initializes the runtime and starts the pool.
    ///
    /// Returns `Ok(false)` if the engine is already running (a no-op, not an
    /// error). Returns `Err` if a startup script failed; the engine rolls
    /// back to the stopped, uninitialized state.
    pub fn start(&self) -> Result<bool, EngineError> {
        let mut ctl = self.ctl.lock();
        if ctl.initialized {
            return Ok(false);
        }

        let mut core = RuntimeCore::new((self.evaluator_factory)());
        core.register_extension(writer_extension(&self.shared.writer), true);
        for extension in &ctl.extensions {
            core.register_extension(extension.clone(), false);
        }

        let bootstrap = BufferedScript::new("init_script_system", BUILTIN_CONTEXT, "flush");
        let mut scripts: Vec<Arc<dyn Script>> = Vec::with_capacity(1 + ctl.startup.len());
        scripts.push(Arc::new(bootstrap));
        scripts.extend(ctl.startup.iter().cloned());
        for script in &scripts {
            let outcome = script.execute(&mut core);
            self.shared.writer.flush();
            if let Err(err) = outcome {
                error!(script = script.name(), %err, "startup script failed");
                return Err(EngineError::Startup(err));
            }
            debug!(script = script.name(), "startup script finished");
        }

        // From here on the exclusive runtime guard is acquirable.
        self.shared.runtime.attach(core);
        ctl.initialized = true;
        let started = self.pool.start();
        debug_assert!(started, "pool must be stopped while uninitialized");
        info!("script engine started");
        Ok(true)
    }

    /// Stops the pool without draining, then finalizes the runtime.
    ///
    /// Unclaimed tasks survive in the deferred queue and run after the next
    /// `start()`. Returns `false` if the engine was not running.
    pub fn stop(&self) -> bool {
        let mut ctl = self.ctl.lock();
        if !self.pool.stop() {
            return false;
        }
        self.finalize(&mut ctl);
        true
    }

    /// Drains every pending task, stops the pool, then finalizes the runtime.
    ///
    /// Returns `false` if the engine was not running.
    pub fn finish_and_stop(&self) -> bool {
        let mut ctl = self.ctl.lock();
        if !self.pool.finish_and_stop() {
            return false;
        }
        self.finalize(&mut ctl);
        true
    }

    /// Tears the runtime down. The pool is already stopped, so no worker can
    /// hold the guard; detaching re-attaches the runtime to this thread
    /// together with the affinity token captured at initialization.
    ///
    /// Never panics: teardown failures are logged, not thrown.
    fn finalize(&self, ctl: &mut Controller) {
        if !ctl.initialized {
            return;
        }
        match self.shared.runtime.detach() {
            Some((core, affinity)) => {
                debug!(
                    initialized_on = ?affinity.thread(),
                    finalized_on = ?std::thread::current().id(),
                    "finalizing script runtime"
                );
                drop(core);
            }
            None => error!("runtime lifetime flag out of sync during finalize"),
        }
        self.shared.writer.flush();
        ctl.initialized = false;
        info!("script engine stopped");
    }

    /// Whether the pool is currently running and accepting tasks.
    #[must_use]
    pub fn running(&self) -> bool {
        self.pool.running()
    }

    /// Discards every pending (unclaimed) task.
    pub fn clear(&self) {
        self.pool.clear();
    }

    /// The engine's script output buffer.
    #[must_use]
    pub fn writer(&self) -> &ScriptWriter {
        &self.shared.writer
    }

    /// Submits a fire-and-forget script.
    ///
    /// If the engine is not running the task is deferred until the next
    /// `start()`. Execution failures are logged through the tracing
    /// collaborator; they are never silently dropped.
    pub fn submit(&self, script: impl Script + 'static) {
        self.pool.submit_boxed(Box::new(ScriptTask {
            script: Box::new(script),
            shared: Arc::clone(&self.shared),
        }));
    }

    /// Submits a bound call and returns a handle to its future result.
    ///
    /// Non-blocking for the caller; the handle's `get()` blocks until a
    /// worker has executed the call under the exclusive runtime guard.
    pub fn submit_call(&self, call: BoundCall) -> CallResult<Value> {
        let (slot, result) = channel();
        self.pool.submit_boxed(Box::new(CallableTask {
            call,
            slot,
            shared: Arc::clone(&self.shared),
        }));
        result
    }

    /// Submits an arbitrary callable executing under the exclusive runtime
    /// guard, with a typed result.
    ///
    /// `context` and `name` are used only for diagnostics when the callable
    /// fails.
    pub fn submit_call_with<T, F>(
        &self,
        context: impl Into<ContextId>,
        name: impl Into<String>,
        f: F,
    ) -> CallResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RuntimeCore) -> Result<T, ScriptError> + Send + 'static,
    {
        let (slot, result) = channel();
        self.pool.submit_boxed(Box::new(FnCallTask {
            context: context.into(),
            name: name.into(),
            f,
            slot,
            shared: Arc::clone(&self.shared),
        }));
        result
    }

    /// Resolves a named function inside a context.
    ///
    /// Resolution happens once, on the calling thread, under the exclusive
    /// guard; the returned [`BoundCall`] is reusable across submissions.
    pub fn lookup(
        &self,
        context: impl Into<ContextId>,
        name: &str,
    ) -> Result<BoundCall, EngineError> {
        let context = context.into();
        let mut session = self
            .shared
            .runtime
            .acquire()
            .ok_or(EngineError::NotInitialized)?;
        let callable =
            session
                .core()
                .lookup(&context, name)
                .ok_or_else(|| EngineError::UnknownFunction {
                    context: context.clone(),
                    name: name.to_string(),
                })?;
        Ok(BoundCall::new(context, name, callable, Vec::new()))
    }

    /// Resolves a named function and captures its arguments.
    pub fn bind(
        &self,
        context: impl Into<ContextId>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<BoundCall, EngineError> {
        Ok(self.lookup(context, name)?.with_args(args))
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        // Forced stop: nothing new is claimed, in-flight work finishes,
        // deferred tasks are discarded with the pool. Teardown never panics.
        if self.pool.running() {
            if !self.stop() {
                error!("script engine shutdown did not complete cleanly");
            }
        } else if self.shared.runtime.is_attached() {
            let mut ctl = self.ctl.lock();
            self.finalize(&mut ctl);
        }
    }
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("running", &self.pool.running())
            .field("initialized", &self.shared.runtime.is_attached())
            .field("pool", &self.pool)
            .finish()
    }
}

fn writer_extension(writer: &Arc<ScriptWriter>) -> Extension {
    let mut builder = ExtensionBuilder::new(BUILTIN_CONTEXT);
    let w = Arc::clone(writer);
    builder.function("write", move |args| {
        for arg in args {
            w.write(&arg.to_string());
        }
        w.write("\n");
        Ok(Value::Unit)
    });
    let w = Arc::clone(writer);
    builder.function("flush", move |_| {
        w.flush();
        Ok(Value::Unit)
    });
    builder.build()
}

/// Fire-and-forget execution of a script under the runtime guard.
struct ScriptTask {
    script: Box<dyn Script>,
    shared: Arc<EngineShared>,
}

impl Task for ScriptTask {
    fn execute(self: Box<Self>) {
        let Self { script, shared } = *self;
        let outcome = match shared.runtime.acquire() {
            None => Err(ScriptError::RuntimeGone {
                context: script.context().clone(),
                name: script.name().to_string(),
            }),
            Some(mut session) => script.execute(session.core()),
        };
        shared.writer.flush();
        if let Err(err) = outcome {
            // No call slot to record into; the log line is the surface.
            warn!(%err, "script execution failed");
        }
    }

    fn describe(&self) -> &str {
        self.script.name()
    }
}

/// Execution of a bound call, publishing into a call slot.
struct CallableTask {
    call: BoundCall,
    slot: CallSlot<Value>,
    shared: Arc<EngineShared>,
}

impl Task for CallableTask {
    fn execute(self: Box<Self>) {
        let Self { call, slot, shared } = *self;
        let outcome = match shared.runtime.acquire() {
            None => Err(ScriptError::RuntimeGone {
                context: call.context().clone(),
                name: call.function().to_string(),
            }),
            Some(session) => {
                // The guard is held across the invocation and released on
                // every exit path, including panic unwinding.
                let held = session;
                let result = catch_unwind(AssertUnwindSafe(|| call.invoke()));
                drop(held);
                match result {
                    Ok(outcome) => outcome,
                    Err(payload) => Err(ScriptError::Panicked {
                        context: call.context().clone(),
                        name: call.function().to_string(),
                        message: panic_message(payload.as_ref()),
                    }),
                }
            }
        };
        shared.writer.flush();
        slot.fulfill(outcome);
    }

    fn describe(&self) -> &str {
        self.call.function()
    }
}

/// Execution of an arbitrary typed callable, publishing into a call slot.
struct FnCallTask<T, F> {
    context: ContextId,
    name: String,
    f: F,
    slot: CallSlot<T>,
    shared: Arc<EngineShared>,
}

impl<T, F> Task for FnCallTask<T, F>
where
    T: Send,
    F: FnOnce(&mut RuntimeCore) -> Result<T, ScriptError> + Send,
{
    fn execute(self: Box<Self>) {
        let Self {
            context,
            name,
            f,
            slot,
            shared,
        } = *self;
        let outcome = match shared.runtime.acquire() {
            None => Err(ScriptError::RuntimeGone {
                context: context.clone(),
                name: name.clone(),
            }),
            Some(mut session) => match catch_unwind(AssertUnwindSafe(|| f(session.core()))) {
                Ok(outcome) => outcome.map_err(|err| {
                    ScriptError::execution(context.clone(), name.clone(), err.to_string())
                }),
                Err(payload) => Err(ScriptError::Panicked {
                    context: context.clone(),
                    name: name.clone(),
                    message: panic_message(payload.as_ref()),
                }),
            },
        };
        shared.writer.flush();
        slot.fulfill(outcome);
    }

    fn describe(&self) -> &str {
        &self.name
    }
}
