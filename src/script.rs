//! Runnable work variants: inline source, file-backed source, and bound
//! calls.
//!
//! Every script carries a context identifier (the logical namespace it
//! executes in) and a human-readable name. Failures are normalized at this
//! boundary into a single [`ScriptError`] naming both, regardless of what
//! went wrong underneath.

use crate::error::ScriptError;
use crate::runtime::{ContextId, NativeFn, RuntimeCore, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A unit of runnable work executed against the runtime's binding context.
///
/// Implementations run while the exclusive runtime guard is held by the
/// executing worker; they must not attempt to re-acquire it.
pub trait Script: Send + Sync {
    /// Name used in diagnostics (script file name, label, or function name).
    fn name(&self) -> &str;

    /// The logical namespace this work executes in.
    fn context(&self) -> &ContextId;

    /// Executes the work against the runtime, producing a value or a
    /// normalized error.
    fn execute(&self, runtime: &mut RuntimeCore) -> Result<Value, ScriptError>;
}

fn normalize(context: &ContextId, name: &str, err: &ScriptError) -> ScriptError {
    ScriptError::execution(context.clone(), name, err.to_string())
}

/// A script holding its source in memory.
pub struct BufferedScript {
    name: String,
    context: ContextId,
    code: String,
}

impl BufferedScript {
    /// Creates a script from in-memory source.
    pub fn new(
        name: impl Into<String>,
        context: impl Into<ContextId>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            context: context.into(),
            code: code.into(),
        }
    }
}

impl Script for BufferedScript {
    fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> &ContextId {
        &self.context
    }

    fn execute(&self, runtime: &mut RuntimeCore) -> Result<Value, ScriptError> {
        runtime
            .eval(&self.context, &self.code)
            .map_err(|err| normalize(&self.context, &self.name, &err))
    }
}

impl fmt::Debug for BufferedScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedScript")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("bytes", &self.code.len())
            .finish()
    }
}

/// A script loaded from a file when a worker claims it.
///
/// Read errors surface as execution errors at run time, not at submission
/// time: a missing file fails the task, not the submit call.
#[derive(Debug)]
pub struct ScriptFile {
    name: String,
    context: ContextId,
    path: PathBuf,
}

impl ScriptFile {
    /// Creates a file-backed script with an explicit name.
    pub fn new(
        name: impl Into<String>,
        context: impl Into<ContextId>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            context: context.into(),
            path: path.into(),
        }
    }

    /// Creates a file-backed script named after the file itself.
    pub fn from_path(context: impl Into<ContextId>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            name,
            context: context.into(),
            path,
        }
    }

    /// The script's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Script for ScriptFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn context(&self) -> &ContextId {
        &self.context
    }

    fn execute(&self, runtime: &mut RuntimeCore) -> Result<Value, ScriptError> {
        let code = fs::read_to_string(&self.path).map_err(|err| ScriptError::SourceUnavailable {
            name: self.name.clone(),
            message: format!("{}: {err}", self.path.display()),
        })?;
        runtime
            .eval(&self.context, &code)
            .map_err(|err| normalize(&self.context, &self.name, &err))
    }
}

/// A named function resolved once and reusable for many submissions.
///
/// Produced by [`ScriptEngine::lookup`] and [`ScriptEngine::bind`]; the
/// context and function names are carried only for diagnostics when
/// execution fails.
///
/// [`ScriptEngine::lookup`]: crate::engine::ScriptEngine::lookup
/// [`ScriptEngine::bind`]: crate::engine::ScriptEngine::bind
#[derive(Clone)]
pub struct BoundCall {
    context: ContextId,
    function: String,
    callable: NativeFn,
    args: Vec<Value>,
}

impl BoundCall {
    pub(crate) fn new(
        context: ContextId,
        function: impl Into<String>,
        callable: NativeFn,
        args: Vec<Value>,
    ) -> Self {
        Self {
            context,
            function: function.into(),
            callable,
            args,
        }
    }

    /// The context the function was resolved in.
    #[must_use]
    pub fn context(&self) -> &ContextId {
        &self.context
    }

    /// The bound function's name.
    #[must_use]
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Returns a copy of this call with different arguments.
    #[must_use]
    pub fn with_args(&self, args: Vec<Value>) -> Self {
        Self {
            args,
            ..self.clone()
        }
    }

    /// Invokes the bound function with its captured arguments.
    ///
    /// Callers must hold the exclusive runtime guard.
    pub fn invoke(&self) -> Result<Value, ScriptError> {
        (self.callable)(&self.args).map_err(|err| normalize(&self.context, &self.function, &err))
    }
}

impl fmt::Debug for BoundCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundCall")
            .field("context", &self.context)
            .field("function", &self.function)
            .field("args", &self.args)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExtensionBuilder, LineEvaluator};
    use std::io::Write;
    use std::sync::Arc;

    fn runtime_with_echo() -> RuntimeCore {
        let mut core = RuntimeCore::new(Box::new(LineEvaluator));
        let mut builder = ExtensionBuilder::new("echo");
        builder.function("echo", |args| {
            Ok(args.first().cloned().unwrap_or(Value::Unit))
        });
        builder.function("fail", |_| {
            Err(ScriptError::execution("echo", "fail", "always fails"))
        });
        core.register_extension(builder.build(), false);
        core
    }

    #[test]
    fn buffered_script_runs_source() {
        let mut runtime = runtime_with_echo();
        let script = BufferedScript::new("hello", "echo", "echo 42");
        assert_eq!(script.execute(&mut runtime).expect("eval"), Value::Int(42));
    }

    #[test]
    fn buffered_script_error_names_script_and_context() {
        let mut runtime = runtime_with_echo();
        let script = BufferedScript::new("broken", "echo", "no_such_function");
        let err = script.execute(&mut runtime).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("broken"), "{rendered}");
        assert!(rendered.contains("echo"), "{rendered}");
    }

    #[test]
    fn script_file_reads_at_execution_time() {
        let mut runtime = runtime_with_echo();
        let dir = std::env::temp_dir().join("scriptloom-script-tests");
        std::fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("echo_seven.loom");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "echo 7").expect("write");

        let script = ScriptFile::from_path("echo", &path);
        assert_eq!(script.name(), "echo_seven.loom");
        assert_eq!(script.execute(&mut runtime).expect("eval"), Value::Int(7));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_an_execution_error_not_a_submit_error() {
        let mut runtime = runtime_with_echo();
        // Construction succeeds even though the path does not exist.
        let script = ScriptFile::from_path("echo", "/nonexistent/scriptloom.loom");
        let err = script.execute(&mut runtime).unwrap_err();
        assert!(matches!(err, ScriptError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("scriptloom.loom"));
    }

    #[test]
    fn bound_call_invokes_with_captured_args() {
        let callable: NativeFn =
            Arc::new(|args| Ok(args.first().cloned().unwrap_or(Value::Unit)));
        let call = BoundCall::new(
            ContextId::from("echo"),
            "echo",
            callable,
            vec![Value::Str("hi".into())],
        );
        assert_eq!(call.invoke().expect("invoke"), Value::Str("hi".into()));

        let rebound = call.with_args(vec![Value::Int(3)]);
        assert_eq!(rebound.invoke().expect("invoke"), Value::Int(3));
    }

    #[test]
    fn bound_call_failure_names_function() {
        let callable: NativeFn = Arc::new(|_| {
            Err(ScriptError::execution("orbits", "advance", "bad ephemeris"))
        });
        let call = BoundCall::new(ContextId::from("orbits"), "advance", callable, vec![]);
        let err = call.invoke().unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("advance"), "{rendered}");
        assert!(rendered.contains("orbits"), "{rendered}");
        assert!(rendered.contains("bad ephemeris"), "{rendered}");
    }
}
