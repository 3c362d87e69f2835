//! The embedded runtime and the exclusive guard serializing access to it.
//!
//! The runtime behaves as a single logical resource: it must never be entered
//! by two threads simultaneously. That requirement is enforced here with a
//! plain mutex owned by the engine ([`RuntimeCell`]) and a scoped session
//! type ([`RuntimeSession`]): entering the scope blocks until the calling
//! thread has exclusive ownership, and leaving the scope (including by panic
//! unwinding) releases it unconditionally.
//!
//! The runtime itself ([`RuntimeCore`]) is deliberately small: per-context
//! namespaces of named native functions, registered through extensions, plus
//! a pluggable [`Evaluator`] that gives source text meaning. Scriptloom is
//! not a language runtime; a real embedding supplies its own evaluator and
//! keeps the concurrency contract.

use crate::error::ScriptError;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Identifier of the logical namespace a task executes in.
///
/// Two tasks with different context identifiers are independent with respect
/// to naming collisions; two tasks with the same identifier observe a shared
/// namespace, so submission-order FIFO is the ordering tool for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl ContextId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ContextId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A value produced by or passed to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value.
    Unit,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String.
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("()"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// A native function callable from scripts and bound calls.
pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync>;

/// A named bundle of native functions, registered before initialization.
#[derive(Clone)]
pub struct Extension {
    name: String,
    functions: HashMap<String, NativeFn>,
}

impl Extension {
    /// The extension's module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Extension")
            .field("name", &self.name)
            .field("functions", &names)
            .finish()
    }
}

/// Builder handed to extension factories.
pub struct ExtensionBuilder {
    extension: Extension,
}

impl ExtensionBuilder {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            extension: Extension {
                name: name.into(),
                functions: HashMap::new(),
            },
        }
    }

    /// Registers a native function under `name`.
    pub fn function<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        self.extension.functions.insert(name.into(), Arc::new(f));
        self
    }

    pub(crate) fn build(self) -> Extension {
        self.extension
    }
}

/// The shared namespace of one context.
///
/// Created on first use, seeded with the functions of the extension whose
/// name matches the context identifier (plus any always-available
/// extensions), and retained for the lifetime of the runtime so that
/// functions defined by earlier scripts stay resolvable.
#[derive(Default)]
pub struct Namespace {
    functions: HashMap<String, NativeFn>,
}

impl Namespace {
    /// Defines (or redefines) a function in this namespace.
    ///
    /// Evaluators use this to make script-defined callables visible to later
    /// scripts and to `lookup`.
    pub fn define<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, ScriptError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    /// Resolves a function by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.functions.get(name).map(Arc::clone)
    }

    fn absorb(&mut self, extension: &Extension) {
        for (name, f) in &extension.functions {
            self.functions.insert(name.clone(), Arc::clone(f));
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Namespace").field("functions", &names).finish()
    }
}

/// Gives source text meaning inside a context's namespace.
///
/// The default is [`LineEvaluator`]; real embeddings plug in an adapter to
/// their interpreter here. Evaluators run while the exclusive runtime guard
/// is held, so they may freely mutate the namespace.
pub trait Evaluator: Send {
    /// Evaluates `source` inside `namespace`, returning the script's value.
    fn eval(
        &self,
        source: &str,
        context: &ContextId,
        namespace: &mut Namespace,
    ) -> Result<Value, ScriptError>;
}

/// Minimal line-oriented evaluator.
///
/// Each non-empty line that does not start with `#` is a call:
/// `function arg arg ...`. Arguments parse as booleans, integers, floats, or
/// (optionally quoted) strings. The value of the last call is the script's
/// value; a script with no calls evaluates to [`Value::Unit`].
#[derive(Debug, Default)]
pub struct LineEvaluator;

impl LineEvaluator {
    fn parse_token(token: &str) -> Value {
        if let Some(stripped) = token.strip_prefix('"') {
            return Value::Str(stripped.strip_suffix('"').unwrap_or(stripped).to_string());
        }
        match token {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(i) = token.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(x) = token.parse::<f64>() {
            return Value::Float(x);
        }
        Value::Str(token.to_string())
    }

    fn tokenize(line: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        for ch in line.chars() {
            match ch {
                '"' => {
                    in_quotes = !in_quotes;
                    current.push(ch);
                }
                c if c.is_whitespace() && !in_quotes => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
        tokens
    }
}

impl Evaluator for LineEvaluator {
    fn eval(
        &self,
        source: &str,
        context: &ContextId,
        namespace: &mut Namespace,
    ) -> Result<Value, ScriptError> {
        let mut last = Value::Unit;
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let tokens = Self::tokenize(line);
            let (name, args) = tokens
                .split_first()
                .expect("tokenize returns no empty token lists");
            let Some(function) = namespace.get(name) else {
                return Err(ScriptError::UnknownFunction {
                    context: context.clone(),
                    name: name.clone(),
                });
            };
            let args: Vec<Value> = args.iter().map(|t| Self::parse_token(t)).collect();
            last = function(&args)?;
        }
        Ok(last)
    }
}

/// The embedded runtime: extensions plus per-context namespaces.
///
/// Strictly single-threaded by contract; reachable only through a
/// [`RuntimeSession`] while the engine is initialized.
pub struct RuntimeCore {
    evaluator: Box<dyn Evaluator>,
    extensions: HashMap<String, Extension>,
    /// Extensions seeded into every context namespace, regardless of name.
    ambient: Vec<String>,
    contexts: HashMap<ContextId, Namespace>,
}

impl RuntimeCore {
    pub(crate) fn new(evaluator: Box<dyn Evaluator>) -> Self {
        Self {
            evaluator,
            extensions: HashMap::new(),
            ambient: Vec::new(),
            contexts: HashMap::new(),
        }
    }

    pub(crate) fn register_extension(&mut self, extension: Extension, ambient: bool) {
        if ambient {
            self.ambient.push(extension.name.clone());
        }
        self.extensions.insert(extension.name.clone(), extension);
    }

    /// Returns the namespace of `context`, creating and seeding it on first
    /// use.
    pub fn namespace_mut(&mut self, context: &ContextId) -> &mut Namespace {
        if !self.contexts.contains_key(context) {
            let mut namespace = Namespace::default();
            for name in &self.ambient {
                if let Some(ext) = self.extensions.get(name) {
                    namespace.absorb(ext);
                }
            }
            if let Some(ext) = self.extensions.get(context.as_str()) {
                namespace.absorb(ext);
            }
            self.contexts.insert(context.clone(), namespace);
        }
        self.contexts
            .get_mut(context)
            .expect("namespace inserted above")
    }

    /// Evaluates `source` in the namespace of `context`.
    pub fn eval(&mut self, context: &ContextId, source: &str) -> Result<Value, ScriptError> {
        // Split borrows: the evaluator is immutable while the namespace is
        // mutated.
        if !self.contexts.contains_key(context) {
            self.namespace_mut(context);
        }
        let namespace = self
            .contexts
            .get_mut(context)
            .expect("namespace seeded above");
        self.evaluator.eval(source, context, namespace)
    }

    /// Resolves a named function in `context`.
    pub fn lookup(&mut self, context: &ContextId, name: &str) -> Option<NativeFn> {
        self.namespace_mut(context).get(name)
    }
}

impl fmt::Debug for RuntimeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut extensions: Vec<&str> = self.extensions.keys().map(String::as_str).collect();
        extensions.sort_unstable();
        f.debug_struct("RuntimeCore")
            .field("extensions", &extensions)
            .field("contexts", &self.contexts.len())
            .finish()
    }
}

/// Record of the execution context the runtime was left in at
/// initialization.
///
/// Finalization must happen from the viewpoint of this context: the engine
/// re-attaches the runtime under the exclusive guard and restores this token
/// before tearing the runtime down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAffinity {
    thread: ThreadId,
}

impl ThreadAffinity {
    pub(crate) fn capture() -> Self {
        Self {
            thread: thread::current().id(),
        }
    }

    /// The thread the runtime was initialized on.
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

pub(crate) struct AttachedRuntime {
    pub(crate) core: RuntimeCore,
    pub(crate) affinity: ThreadAffinity,
}

/// Owner of the runtime's lifetime flag and of the exclusive guard.
///
/// The slot is `Some` exactly while the runtime is initialized. Acquiring a
/// session blocks until no other thread holds one; acquisition never fails,
/// it only blocks — but a session can only be produced while the runtime is
/// alive.
#[derive(Default)]
pub(crate) struct RuntimeCell {
    slot: Mutex<Option<AttachedRuntime>>,
}

impl RuntimeCell {
    /// Installs the runtime, flipping the lifetime flag on.
    ///
    /// # Panics
    ///
    /// Panics if the runtime is already initialized: initializing twice
    /// without an intervening finalize is a programmer error.
    pub(crate) fn attach(&self, core: RuntimeCore) {
        let mut slot = self.slot.lock();
        assert!(
            slot.is_none(),
            "script runtime initialized twice without an intervening finalize"
        );
        *slot = Some(AttachedRuntime {
            core,
            affinity: ThreadAffinity::capture(),
        });
    }

    /// Removes the runtime, flipping the lifetime flag off.
    ///
    /// Blocks until no session is held, which discharges the "no worker may
    /// hold the guard during finalize" precondition. Returns the runtime and
    /// the affinity token captured at initialization, or `None` if the
    /// runtime was never attached.
    pub(crate) fn detach(&self) -> Option<(RuntimeCore, ThreadAffinity)> {
        let mut slot = self.slot.lock();
        slot.take().map(|attached| (attached.core, attached.affinity))
    }

    /// Scoped acquisition of the exclusive runtime guard.
    ///
    /// Blocks until the calling thread has exclusive logical ownership.
    /// Returns `None` if the runtime is outside its valid lifetime.
    pub(crate) fn acquire(&self) -> Option<RuntimeSession<'_>> {
        let guard = self.slot.lock();
        if guard.is_none() {
            return None;
        }
        Some(RuntimeSession { guard })
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// A scope with exclusive ownership of the runtime.
///
/// Dropping the session releases ownership unconditionally, on every exit
/// path including panic unwinding. Acquisition is not re-entrant: a task
/// must acquire at most once.
pub struct RuntimeSession<'a> {
    guard: MutexGuard<'a, Option<AttachedRuntime>>,
}

impl RuntimeSession<'_> {
    /// The runtime, exclusively owned for the duration of the session.
    pub fn core(&mut self) -> &mut RuntimeCore {
        &mut self
            .guard
            .as_mut()
            .expect("session exists only while the runtime is attached")
            .core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core_with_extension() -> RuntimeCore {
        let mut core = RuntimeCore::new(Box::new(LineEvaluator));
        let mut builder = ExtensionBuilder::new("math");
        builder.function("add", |args| {
            let mut sum = 0;
            for arg in args {
                match arg {
                    Value::Int(i) => sum += i,
                    other => {
                        return Err(ScriptError::execution(
                            "math",
                            "add",
                            format!("expected integer, got {other}"),
                        ))
                    }
                }
            }
            Ok(Value::Int(sum))
        });
        core.register_extension(builder.build(), false);
        core
    }

    #[test]
    fn eval_calls_extension_function() {
        let mut core = core_with_extension();
        let context = ContextId::from("math");
        let value = core.eval(&context, "add 1 2 3").expect("eval");
        assert_eq!(value, Value::Int(6));
    }

    #[test]
    fn last_line_wins_and_comments_skipped() {
        let mut core = core_with_extension();
        let context = ContextId::from("math");
        let value = core
            .eval(&context, "# warm up\nadd 1 1\n\nadd 10 20")
            .expect("eval");
        assert_eq!(value, Value::Int(30));
    }

    #[test]
    fn unknown_function_names_context() {
        let mut core = core_with_extension();
        let context = ContextId::from("math");
        let err = core.eval(&context, "subtract 1").unwrap_err();
        assert_eq!(
            err,
            ScriptError::UnknownFunction {
                context: context.clone(),
                name: "subtract".to_string(),
            }
        );
    }

    #[test]
    fn contexts_are_isolated() {
        let mut core = core_with_extension();
        let other = ContextId::from("other");
        // The "math" extension seeds only the "math" context.
        assert!(core.lookup(&other, "add").is_none());
        assert!(core.lookup(&ContextId::from("math"), "add").is_some());
    }

    #[test]
    fn ambient_extension_seeds_every_context() {
        let mut core = RuntimeCore::new(Box::new(LineEvaluator));
        let mut builder = ExtensionBuilder::new("io");
        builder.function("ping", |_| Ok(Value::Str("pong".into())));
        core.register_extension(builder.build(), true);

        for context in ["a", "b", "c"] {
            let value = core.eval(&ContextId::from(context), "ping").expect("eval");
            assert_eq!(value, Value::Str("pong".into()));
        }
    }

    #[test]
    fn namespace_definitions_persist_across_evals() {
        let mut core = core_with_extension();
        let context = ContextId::from("math");
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let calls_clone = std::sync::Arc::clone(&calls);
        core.namespace_mut(&context).define("tick", move |_| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            Ok(Value::Unit)
        });

        core.eval(&context, "tick\ntick").expect("eval");
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn quoted_arguments_keep_spaces() {
        let mut core = RuntimeCore::new(Box::new(LineEvaluator));
        let mut builder = ExtensionBuilder::new("echo");
        builder.function("echo", |args| Ok(args[0].clone()));
        core.register_extension(builder.build(), false);

        let value = core
            .eval(&ContextId::from("echo"), "echo \"hello there\"")
            .expect("eval");
        assert_eq!(value, Value::Str("hello there".to_string()));
    }

    #[test]
    fn cell_attach_detach_roundtrip() {
        let cell = RuntimeCell::default();
        assert!(!cell.is_attached());
        assert!(cell.acquire().is_none());

        cell.attach(RuntimeCore::new(Box::new(LineEvaluator)));
        assert!(cell.is_attached());
        assert!(cell.acquire().is_some());

        let (_core, affinity) = cell.detach().expect("attached");
        assert_eq!(affinity.thread(), std::thread::current().id());
        assert!(!cell.is_attached());
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn double_attach_panics() {
        let cell = RuntimeCell::default();
        cell.attach(RuntimeCore::new(Box::new(LineEvaluator)));
        cell.attach(RuntimeCore::new(Box::new(LineEvaluator)));
    }
}
