//! Script execution against registry contexts.
//!
//! A run goes through three scopes on the engine thread:
//!
//! 1. evaluate the code (console shim installed first)
//! 2. settle: drain microtasks and fire due timers until nothing is left
//!    or the deadline passes
//! 3. restore the console and convert the completion value
//!
//! The runtime's interrupt handler stops script code once the deadline has
//! passed or the service handle has raised the cancel flag.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rquickjs::context::EvalOptions;
use rquickjs::function::Rest;
use rquickjs::{Ctx, Persistent, Value};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::console::{self, ConsoleBuffer, ConsoleSlot};
use crate::context::{Context, ContextOptions, MemorySample, MicrotaskMode};
use crate::error::{Error, ErrorKind, Result};
use crate::registry::ContextRegistry;
use crate::security::SecurityValidator;

/// Longest single sleep while waiting for a timer, so cancellation is
/// noticed promptly.
const TIMER_POLL: Duration = Duration::from_millis(5);

const CODE_GENERATION_DENIED: &str = "Code generation from strings disallowed";

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the script completed without error
    pub success: bool,
    /// Context the script ran in
    pub context_id: String,
    /// Completion value; absent for `undefined`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Wall-clock time spent, in milliseconds
    pub execution_time_ms: u64,
    /// Captured console lines, in call order
    #[serde(default)]
    pub console_output: Vec<String>,
    /// Whether console output hit its byte limit
    #[serde(default)]
    pub console_truncated: bool,
    /// Heap sample taken after the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<MemorySample>,
    /// Classified failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl ExecutionResult {
    /// A run that did not settle before its deadline.
    pub fn timed_out(context_id: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        let context_id = context_id.into();
        let elapsed_ms = elapsed.as_millis() as u64;
        Self {
            success: false,
            error: Some(
                Error::timeout(timeout.as_millis() as u64)
                    .with_context(context_id.clone())
                    .with_execution_time(elapsed_ms),
            ),
            context_id,
            result: None,
            execution_time_ms: elapsed_ms,
            console_output: Vec::new(),
            console_truncated: false,
            memory_usage: None,
        }
    }

    /// The error kind, if the run failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Options for [`ExecutionEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    /// Context to run in; a fresh console-only context when absent
    pub context_id: Option<String>,
    /// Requested timeout in milliseconds
    #[serde(rename = "timeout")]
    pub timeout_ms: Option<u64>,
    /// Name recorded in error details
    pub filename: Option<String>,
    /// Include the script stack trace in errors
    pub display_errors: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            context_id: None,
            timeout_ms: None,
            filename: None,
            display_errors: true,
        }
    }
}

impl RunOptions {
    /// Run in the given context.
    pub fn in_context(id: impl Into<String>) -> Self {
        Self {
            context_id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Request a timeout.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Record a filename in error details.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Include or omit stack traces.
    pub fn with_display_errors(mut self, display: bool) -> Self {
        self.display_errors = display;
        self
    }
}

/// Options for [`ExecutionEngine::evaluate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluateOptions {
    /// Context to evaluate in; a fresh console-only context when absent
    pub context_id: Option<String>,
    /// Requested timeout in milliseconds
    #[serde(rename = "timeout")]
    pub timeout_ms: Option<u64>,
}

impl From<EvaluateOptions> for RunOptions {
    fn from(options: EvaluateOptions) -> Self {
        Self {
            context_id: options.context_id,
            timeout_ms: options.timeout_ms,
            ..Default::default()
        }
    }
}

/// Wrap an expression so it is parsed as one.
pub(crate) fn expression_source(expression: &str) -> String {
    format!("({}\n)", expression)
}

/// Where a run executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// A live context.
    Existing(String),
    /// A new console-only context created under this id.
    Ephemeral(String),
}

impl Target {
    pub fn id(&self) -> &str {
        match self {
            Target::Existing(id) | Target::Ephemeral(id) => id,
        }
    }
}

/// Deadline shared with the runtime's interrupt handler.
#[derive(Debug, Default)]
struct Budget {
    deadline: Mutex<Option<Instant>>,
    cancel: Mutex<Option<Arc<AtomicBool>>>,
}

impl Budget {
    fn arm(&self, deadline: Instant, cancel: Option<Arc<AtomicBool>>) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Some(deadline);
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = cancel;
    }

    fn disarm(&self) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Past the deadline or cancelled. Always false while disarmed.
    fn expired(&self) -> bool {
        self.cancelled() || self.deadline().is_some_and(|d| Instant::now() >= d)
    }
}

/// A failure raised while running script code.
#[derive(Debug, Clone, PartialEq)]
enum Fault {
    /// The script threw.
    Script {
        name: Option<String>,
        message: String,
        stack: Option<String>,
    },
    /// The engine ran out of memory.
    OutOfMemory,
    /// The host side failed.
    Host(String),
}

impl Fault {
    /// Convert an engine error, taking the pending exception if there is one.
    fn from_engine<'js>(ctx: &Ctx<'js>, err: rquickjs::Error) -> Self {
        match err {
            rquickjs::Error::Exception => Self::from_thrown(ctx, ctx.catch()),
            rquickjs::Error::Allocation => Fault::OutOfMemory,
            other => Fault::Host(other.to_string()),
        }
    }

    fn from_thrown<'js>(ctx: &Ctx<'js>, thrown: Value<'js>) -> Self {
        let Some(obj) = thrown.as_object() else {
            return Fault::Script {
                name: None,
                message: console::format_value(ctx, &thrown),
                stack: None,
            };
        };
        let field = |key: &str| {
            obj.get::<_, Option<String>>(key)
                .ok()
                .flatten()
                .filter(|s| !s.is_empty())
        };
        let name = field("name");
        let message = field("message").unwrap_or_else(|| console::format_value(ctx, &thrown));
        Fault::Script {
            stack: field("stack"),
            name,
            message,
        }
    }

    fn classify(self, config: &EngineConfig) -> Error {
        match self {
            Fault::OutOfMemory => Error::new(ErrorKind::MemoryExceeded, "Script ran out of memory")
                .with_details(serde_json::json!({ "limitBytes": config.memory_limit_bytes() })),
            Fault::Host(message) => Error::context_error(message),
            Fault::Script {
                name,
                message,
                stack,
            } => {
                let text = match &name {
                    Some(name) => format!("{}: {}", name, message),
                    None => message.clone(),
                };
                let kind = if message.contains(CODE_GENERATION_DENIED)
                    || name.as_deref() == Some("SecurityError")
                {
                    ErrorKind::SecurityViolation
                } else if message.contains("out of memory") {
                    ErrorKind::MemoryExceeded
                } else {
                    ErrorKind::ExecutionFailure
                };
                let mut err = Error::new(kind, text).with_stack(stack);
                if let Some(name) = name {
                    err = err.with_details(serde_json::json!({ "name": name }));
                }
                err
            }
        }
    }
}

/// Completion value, converted now or kept for after the microtask drain.
enum Completion {
    Ready(Option<serde_json::Value>),
    Deferred(Persistent<Value<'static>>),
}

/// Runs scripts in registry contexts. Lives on the engine thread.
pub struct ExecutionEngine {
    registry: ContextRegistry,
    config: Arc<EngineConfig>,
    validator: Option<SecurityValidator>,
    budget: Arc<Budget>,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("registry", &self.registry)
            .field("security_scan", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Create an engine with an empty registry.
    pub fn new(config: Arc<EngineConfig>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut registry = ContextRegistry::new(config.clone(), clock)?;

        let budget = Arc::new(Budget::default());
        let interrupt = budget.clone();
        registry.set_interrupt(Arc::new(move || interrupt.expired()));

        Ok(Self {
            registry,
            validator: config.security_scan.then(SecurityValidator::new),
            config,
            budget,
        })
    }

    /// The context registry.
    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    /// The context registry, mutably.
    pub fn registry_mut(&mut self) -> &mut ContextRegistry {
        &mut self.registry
    }

    /// Run code.
    ///
    /// Fails only when the target context cannot be resolved; everything the
    /// script itself does wrong is reported inside the result.
    pub fn run(&mut self, code: &str, options: &RunOptions) -> Result<ExecutionResult> {
        let target = match &options.context_id {
            Some(id) => Target::Existing(id.clone()),
            None => Target::Ephemeral(self.registry.generate_id()),
        };
        self.run_in(code, target, options, None)
    }

    /// Evaluate an expression; `evaluate("1 + 1")` yields 2.
    pub fn evaluate(&mut self, expression: &str, options: &EvaluateOptions) -> Result<ExecutionResult> {
        self.run(&expression_source(expression), &options.clone().into())
    }

    pub(crate) fn run_in(
        &mut self,
        code: &str,
        target: Target,
        options: &RunOptions,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let timeout = self.config.effective_timeout(options.timeout_ms);

        match &target {
            Target::Existing(id) => {
                self.registry.get(id)?;
            }
            Target::Ephemeral(id) => {
                self.registry.create(id, ContextOptions::default())?;
            }
        }
        let context_id = target.id().to_string();
        tracing::debug!(context_id = %context_id, timeout_ms = timeout.as_millis() as u64, "run started");

        let preflight = match &self.validator {
            Some(validator) => validator.scan(code),
            None => Ok(true),
        }
        .and_then(|_| self.registry.memory_check());

        let (outcome, console_output, console_truncated) = match preflight {
            Ok(_) => {
                self.budget.arm(started + timeout, cancel);
                if self.budget.expired() {
                    // Cancelled while queued; the caller already has its result.
                    self.budget.disarm();
                    tracing::debug!(context_id = %context_id, "skipping run cancelled before it started");
                    let now = self.registry.now();
                    self.registry.get(&context_id)?.record_run(now, None);
                    return Ok(ExecutionResult::timed_out(context_id, timeout, started.elapsed()));
                }
                let run = self.execute(&context_id, code);
                let timed_out = self.budget.expired();
                self.budget.disarm();
                let (outcome, lines, truncated) = run?;
                let outcome = match outcome {
                    Err(_) if timed_out => Err(Error::timeout(timeout.as_millis() as u64)),
                    Err(fault) => Err(fault.classify(&self.config)),
                    Ok(value) => Ok(value),
                };
                (outcome, lines, truncated)
            }
            Err(e) => (Err(e), Vec::new(), false),
        };

        let now = self.registry.now();
        let monitoring = self.config.memory_monitoring;
        let context = self.registry.get(&context_id)?;
        let sample = monitoring.then(|| context.sample(now));
        context.record_run(now, sample);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(value) => ExecutionResult {
                success: true,
                context_id,
                result: value,
                execution_time_ms: elapsed_ms,
                console_output,
                console_truncated,
                memory_usage: sample,
                error: None,
            },
            Err(mut err) => {
                if !options.display_errors {
                    err.stack = None;
                }
                if let Some(filename) = &options.filename {
                    err = err.with_details(serde_json::json!({ "filename": filename }));
                }
                if err.kind == ErrorKind::Timeout {
                    tracing::warn!(context_id = %context_id, elapsed_ms, "run timed out");
                }
                ExecutionResult {
                    success: false,
                    error: Some(err.with_context(context_id.clone()).with_execution_time(elapsed_ms)),
                    context_id,
                    result: None,
                    execution_time_ms: elapsed_ms,
                    console_output,
                    console_truncated,
                    memory_usage: sample,
                }
            }
        };
        tracing::debug!(
            context_id = %result.context_id,
            success = result.success,
            elapsed_ms,
            "run finished"
        );
        Ok(result)
    }

    /// Evaluate and settle. The outer error is for a vanished context only.
    #[allow(clippy::type_complexity)]
    fn execute(
        &self,
        context_id: &str,
        code: &str,
    ) -> Result<(std::result::Result<Option<serde_json::Value>, Fault>, Vec<String>, bool)> {
        let context = self.registry.lookup(context_id)?;
        let js = &context.js;
        let mode = context.options.microtask_mode;
        let capture = self.config.console_capture;
        let buffer = Rc::new(RefCell::new(ConsoleBuffer::new(self.config.max_console_bytes)));

        let (slot, evaluated) = js.with(|ctx| {
            let slot = if capture {
                match console::install_shim(&ctx, buffer.clone()) {
                    Ok(slot) => slot,
                    Err(e) => return (ConsoleSlot::Untouched, Err(Fault::from_engine(&ctx, e))),
                }
            } else {
                ConsoleSlot::Untouched
            };

            let mut eval_options = EvalOptions::default();
            eval_options.strict = false;
            let evaluated = ctx
                .eval_with_options::<Value<'_>, _>(code, eval_options)
                .map_err(|e| Fault::from_engine(&ctx, e))
                .and_then(|value| match mode {
                    MicrotaskMode::Default => completion_value(&ctx, value).map(Completion::Ready),
                    MicrotaskMode::AfterEvaluate => {
                        Ok(Completion::Deferred(Persistent::save(&ctx, value)))
                    }
                });
            (slot, evaluated)
        });

        let settled = match evaluated {
            Ok(completion) => self.settle(context).map(|_| completion),
            Err(fault) => Err(fault),
        };

        let outcome = js.with(|ctx| {
            if let Err(e) = console::restore(&ctx, slot) {
                let _ = ctx.catch();
                tracing::warn!(context_id, "failed to restore console: {}", e);
            }
            match settled? {
                Completion::Ready(value) => Ok(value),
                Completion::Deferred(value) => {
                    let value = value.restore(&ctx).map_err(|e| Fault::from_engine(&ctx, e))?;
                    settled_value(&ctx, value)
                }
            }
        });

        let dropped = context.timers.borrow_mut().clear();
        if dropped > 0 {
            tracing::debug!(context_id, dropped, "discarded timers still pending at settle");
        }

        let (lines, truncated) = buffer.borrow_mut().take();
        Ok((outcome, lines, truncated))
    }

    /// Drain microtasks and fire due timers until idle or out of budget.
    fn settle(&self, context: &Context) -> std::result::Result<(), Fault> {
        let Some(deadline) = self.budget.deadline() else {
            return Ok(());
        };
        let (js, timers) = (&context.js, &context.timers);
        loop {
            self.drain_jobs(context)?;

            // Bind first so the queue is not borrowed while the callback runs.
            let next = timers.borrow_mut().pop_due(deadline);
            let Some(timer) = next else {
                return Ok(());
            };
            while Instant::now() < timer.due {
                if self.budget.expired() {
                    return Err(Fault::Host("deadline reached while waiting for a timer".into()));
                }
                std::thread::sleep(timer.due.saturating_duration_since(Instant::now()).min(TIMER_POLL));
            }

            js.with(|ctx| {
                let callback = timer
                    .callback
                    .clone()
                    .restore(&ctx)
                    .map_err(|e| Fault::from_engine(&ctx, e))?;
                let args = timer
                    .args
                    .iter()
                    .map(|arg| arg.clone().restore(&ctx))
                    .collect::<rquickjs::Result<Vec<_>>>()
                    .map_err(|e| Fault::from_engine(&ctx, e))?;
                callback
                    .call::<_, ()>((Rest(args),))
                    .map_err(|e| Fault::from_engine(&ctx, e))
            })?;

            let cleared = timers.borrow_mut().finish();
            if !cleared {
                timers.borrow_mut().reschedule(timer);
            }
        }
    }

    /// Run pending jobs until none are left.
    fn drain_jobs(&self, context: &Context) -> std::result::Result<(), Fault> {
        loop {
            if self.budget.expired() {
                return Err(Fault::Host("deadline reached with microtasks pending".into()));
            }
            match context.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(_) => {
                    return Err(context.js.with(|ctx| Fault::from_thrown(&ctx, ctx.catch())));
                }
            }
        }
    }

    /// Drop every context.
    pub fn shutdown(&mut self) -> usize {
        self.registry.clear()
    }
}

/// JSON form of a completion value; `undefined` (and anything JSON cannot
/// represent, like functions) becomes `None`.
fn completion_value<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> std::result::Result<Option<serde_json::Value>, Fault> {
    if value.is_undefined() {
        return Ok(None);
    }
    match ctx.json_stringify(value.clone()) {
        Ok(Some(json)) => {
            let text = json.to_string().map_err(|e| Fault::from_engine(ctx, e))?;
            serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| Fault::Host(format!("completion value is not valid JSON: {}", e)))
        }
        Ok(None) => Ok(None),
        Err(rquickjs::Error::Exception) => {
            // BigInt and cyclic values: fall back to the printed form.
            let _ = ctx.catch();
            Ok(Some(serde_json::Value::String(console::format_value(ctx, &value))))
        }
        Err(e) => Err(Fault::from_engine(ctx, e)),
    }
}

/// Completion value after the drain: settled promises are unwrapped.
fn settled_value<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> std::result::Result<Option<serde_json::Value>, Fault> {
    let Some(promise) = value.as_promise() else {
        return completion_value(ctx, value);
    };
    match promise.result::<Value<'js>>() {
        None => completion_value(ctx, value),
        Some(Ok(resolved)) => completion_value(ctx, resolved),
        Some(Err(e)) => Err(Fault::from_engine(ctx, e)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::templates::GlobalTemplate;

    fn engine_with(config: EngineConfig) -> ExecutionEngine {
        ExecutionEngine::new(Arc::new(config), Arc::new(SystemClock)).unwrap()
    }

    fn engine() -> ExecutionEngine {
        engine_with(EngineConfig::default())
    }

    fn create(engine: &mut ExecutionEngine, id: &str, options: ContextOptions) {
        engine.registry_mut().create(id, options).unwrap();
    }

    // ==================== Basic runs ====================

    #[test]
    fn test_run_arithmetic_in_fresh_context() {
        let mut engine = engine();
        let result = engine.run("2 + 2", &RunOptions::default()).unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(serde_json::json!(4)));
        assert!(result.context_id.starts_with("ctx-"));
        assert!(result.memory_usage.is_some());
        assert!(engine.registry().lookup(&result.context_id).is_ok());
    }

    #[test]
    fn test_each_ephemeral_run_gets_a_new_context() {
        let mut engine = engine();
        let a = engine.run("1", &RunOptions::default()).unwrap();
        let b = engine.run("1", &RunOptions::default()).unwrap();
        assert_ne!(a.context_id, b.context_id);
        assert_eq!(engine.registry().len(), 2);
    }

    #[test]
    fn test_undefined_completion_is_absent() {
        let mut engine = engine();
        let result = engine.run("let x = 1;", &RunOptions::default()).unwrap();
        assert!(result.success);
        assert_eq!(result.result, None);
    }

    #[test]
    fn test_object_completion() {
        let mut engine = engine();
        let result = engine
            .evaluate("{ a: [1, 'two', null] }", &EvaluateOptions::default())
            .unwrap();
        assert_eq!(result.result, Some(serde_json::json!({ "a": [1, "two", null] })));
    }

    #[test]
    fn test_unknown_context() {
        let mut engine = engine();
        let err = engine.run("1", &RunOptions::in_context("nope")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContextNotFound);
    }

    // ==================== State ====================

    #[test]
    fn test_state_persists_and_count_increments() {
        let mut engine = engine();
        create(&mut engine, "a", ContextOptions::default());

        engine.run("globalThis.total = 40", &RunOptions::in_context("a")).unwrap();
        let result = engine.run("total + 2", &RunOptions::in_context("a")).unwrap();

        assert_eq!(result.result, Some(serde_json::json!(42)));
        assert_eq!(engine.registry().lookup("a").unwrap().execution_count, 2);
    }

    #[test]
    fn test_contexts_are_isolated() {
        let mut engine = engine();
        create(&mut engine, "a", ContextOptions::default());
        create(&mut engine, "b", ContextOptions::default());

        engine.run("var shared = 'a'", &RunOptions::in_context("a")).unwrap();
        let result = engine
            .run("typeof shared", &RunOptions::in_context("b"))
            .unwrap();
        assert_eq!(result.result, Some(serde_json::json!("undefined")));
    }

    // ==================== Failures ====================

    #[test]
    fn test_timeout() {
        let mut engine = engine();
        let started = Instant::now();
        let result = engine
            .run("while (true) {}", &RunOptions::default().with_timeout_ms(100))
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The context is still usable afterwards.
        let again = engine
            .run("1 + 1", &RunOptions::in_context(result.context_id))
            .unwrap();
        assert!(again.success);
    }

    #[test]
    fn test_script_error_is_classified() {
        let mut engine = engine();
        let result = engine
            .run("throw new TypeError('bad input')", &RunOptions::default().with_filename("job.js"))
            .unwrap();

        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::ExecutionFailure);
        assert_eq!(err.message, "TypeError: bad input");
        assert_eq!(err.details.as_ref().unwrap()["filename"], "job.js");
        assert_eq!(err.details.as_ref().unwrap()["name"], "TypeError");
        assert!(err.context_id.is_some());
    }

    #[test]
    fn test_display_errors_controls_stack() {
        let mut engine = engine();
        let code = "function boom() { throw new Error('x') }\nboom()";

        let shown = engine.run(code, &RunOptions::default()).unwrap();
        assert!(shown.error.unwrap().stack.is_some());

        let hidden = engine
            .run(code, &RunOptions::default().with_display_errors(false))
            .unwrap();
        assert!(hidden.error.unwrap().stack.is_none());
    }

    #[test]
    fn test_thrown_non_error() {
        let mut engine = engine();
        let result = engine.run("throw 'plain'", &RunOptions::default()).unwrap();
        assert_eq!(result.error.unwrap().message, "plain");
    }

    #[test]
    fn test_syntax_error() {
        let mut engine = engine();
        let result = engine.run("let = ;", &RunOptions::default()).unwrap();
        let err = result.error.unwrap();
        assert_eq!(err.kind, ErrorKind::ExecutionFailure);
        assert!(err.message.starts_with("SyntaxError"));
    }

    // ==================== Code generation ====================

    #[test]
    fn test_eval_blocked_by_default() {
        let mut engine = engine();
        for code in [
            "eval('1')",
            "new Function('return 1')()",
            "(function () {}).constructor('return 1')()",
            "(async function () {}).constructor('return 1')",
        ] {
            let result = engine.run(code, &RunOptions::default()).unwrap();
            assert_eq!(
                result.error_kind(),
                Some(ErrorKind::SecurityViolation),
                "{}",
                code
            );
        }

        let result = engine
            .run("(() => {}) instanceof Function", &RunOptions::default())
            .unwrap();
        assert_eq!(result.result, Some(serde_json::json!(true)));
    }

    #[test]
    fn test_eval_allowed_when_enabled() {
        let mut engine = engine();
        create(&mut engine, "a", ContextOptions::default().with_code_generation(true));
        let result = engine.run("eval('1')", &RunOptions::in_context("a")).unwrap();
        assert_eq!(result.result, Some(serde_json::json!(1)));
    }

    #[test]
    fn test_security_scan_when_enabled() {
        let mut scanning = engine_with(EngineConfig {
            security_scan: true,
            ..Default::default()
        });
        let result = scanning
            .run("require('fs')", &RunOptions::default())
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::SecurityViolation));

        // Without the scan the same code simply fails to find `require`.
        let mut plain = engine();
        let result = plain.run("require('fs')", &RunOptions::default()).unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionFailure));
    }

    #[test]
    fn test_run_cancelled_while_queued_is_skipped() {
        let mut engine = engine();
        create(&mut engine, "a", ContextOptions::default());
        let cancel = Arc::new(AtomicBool::new(true));

        let result = engine
            .run_in(
                "globalThis.ran = true",
                Target::Existing("a".into()),
                &RunOptions::default(),
                Some(cancel),
            )
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));

        let check = engine.run("typeof ran", &RunOptions::in_context("a")).unwrap();
        assert_eq!(check.result, Some(serde_json::json!("undefined")));
        assert_eq!(engine.registry().lookup("a").unwrap().execution_count, 2);
    }

    #[test]
    fn test_memory_ceiling_fails_before_running() {
        let mut engine = engine_with(EngineConfig {
            memory_limit_mb: 0,
            ..Default::default()
        });
        let result = engine
            .run("console.log('never')", &RunOptions::default())
            .unwrap();

        assert_eq!(result.error_kind(), Some(ErrorKind::MemoryExceeded));
        assert!(result.console_output.is_empty());
        assert_eq!(
            engine.registry().lookup(&result.context_id).unwrap().execution_count,
            1
        );
    }

    // ==================== Console ====================

    #[test]
    fn test_console_capture_order_and_format() {
        let mut engine = engine();
        let result = engine
            .run(
                "console.log('a', 1, {b: 2}); console.warn(null); console.error(undefined); console.info([1]); console.debug(true)",
                &RunOptions::default(),
            )
            .unwrap();

        assert_eq!(
            result.console_output,
            ["a 1 {\"b\":2}", "[WARN] null", "[ERROR] undefined", "[INFO] [1]", "[DEBUG] true"]
        );
    }

    #[test]
    fn test_console_kept_on_failure_and_restored() {
        let mut engine = engine();
        create(&mut engine, "a", ContextOptions::default());
        let result = engine
            .run("console.log('before'); throw new Error('x')", &RunOptions::in_context("a"))
            .unwrap();
        assert_eq!(result.console_output, ["before"]);

        // A reference kept from a previous run no longer records.
        engine.run("globalThis.saved = console.log", &RunOptions::in_context("a")).unwrap();
        let result = engine.run("saved('late'); 1", &RunOptions::in_context("a")).unwrap();
        assert!(result.console_output.is_empty());
    }

    #[test]
    fn test_console_capture_disabled() {
        let mut engine = engine_with(EngineConfig {
            console_capture: false,
            ..Default::default()
        });
        let result = engine.run("console.log('x'); 1", &RunOptions::default()).unwrap();
        assert!(result.success);
        assert!(result.console_output.is_empty());
    }

    #[test]
    fn test_console_truncation() {
        let mut engine = engine_with(EngineConfig {
            max_console_bytes: 16,
            ..Default::default()
        });
        let result = engine
            .run("for (let i = 0; i < 100; i++) console.log('line ' + i)", &RunOptions::default())
            .unwrap();

        assert!(result.success);
        assert!(result.console_truncated);
        assert_eq!(result.console_output.last().unwrap(), console::TRUNCATION_MARKER);
    }

    #[test]
    fn test_console_without_template() {
        let mut engine = engine();
        create(
            &mut engine,
            "bare",
            ContextOptions::default().with_templates([GlobalTemplate::Crypto]),
        );
        let result = engine
            .run("typeof console", &RunOptions::in_context("bare"))
            .unwrap();
        assert_eq!(result.result, Some(serde_json::json!("undefined")));
        assert!(result.console_output.is_empty());

        let result = engine
            .run("console.log('x')", &RunOptions::in_context("bare"))
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionFailure));
        assert!(result.error.unwrap().message.starts_with("ReferenceError"));
    }

    #[test]
    fn test_destroy_after_keeping_console_method() {
        let mut engine = engine();
        create(&mut engine, "a", ContextOptions::default());
        let result = engine
            .run("globalThis.saved = console.log; saved('kept'); 1", &RunOptions::in_context("a"))
            .unwrap();
        assert!(result.success);
        assert_eq!(result.console_output, ["kept"]);

        assert!(engine.registry_mut().destroy("a").unwrap());
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn test_sweep_after_keeping_console() {
        let clock = ManualClock::default();
        let config = EngineConfig {
            idle_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let mut engine = ExecutionEngine::new(Arc::new(config), Arc::new(clock.clone())).unwrap();
        let result = engine.run("var keep = console; 1", &RunOptions::default()).unwrap();
        assert!(result.success);

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(engine.registry_mut().sweep_idle(), [result.context_id]);

        engine.run("var keep = console; 2", &RunOptions::default()).unwrap();
        assert_eq!(engine.shutdown(), 1);
    }

    // ==================== Settling ====================

    #[test]
    fn test_timers_fire_in_order() {
        let mut engine = engine();
        create(
            &mut engine,
            "t",
            ContextOptions::default().with_templates([GlobalTemplate::Console, GlobalTemplate::Timers]),
        );
        let result = engine
            .run(
                "setTimeout(() => console.log('late'), 20);\
                 setTimeout(() => console.log('soon'), 0);\
                 setImmediate(() => console.log('now'));\
                 Promise.resolve().then(() => console.log('micro'));\
                 console.log('sync')",
                &RunOptions::in_context("t"),
            )
            .unwrap();

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.console_output, ["sync", "micro", "soon", "now", "late"]);
    }

    #[test]
    fn test_interval_cleared_from_callback() {
        let mut engine = engine();
        create(
            &mut engine,
            "t",
            ContextOptions::default().with_templates([GlobalTemplate::Console, GlobalTemplate::Timers]),
        );
        let result = engine
            .run(
                "let n = 0; const id = setInterval(() => { n++; console.log(n); if (n === 3) clearInterval(id); }, 1);",
                &RunOptions::in_context("t"),
            )
            .unwrap();
        assert_eq!(result.console_output, ["1", "2", "3"]);
    }

    #[test]
    fn test_timers_past_deadline_are_discarded() {
        let mut engine = engine();
        create(
            &mut engine,
            "t",
            ContextOptions::default().with_templates([GlobalTemplate::Console, GlobalTemplate::Timers]),
        );
        let result = engine
            .run(
                "setTimeout(() => console.log('too late'), 10000); 'done'",
                &RunOptions::in_context("t").with_timeout_ms(50),
            )
            .unwrap();
        assert!(result.success);
        assert!(result.console_output.is_empty());
        assert!(engine.registry().lookup("t").unwrap().timers.borrow().len() == 0);
    }

    #[test]
    fn test_endless_microtasks_time_out() {
        let mut engine = engine();
        let result = engine
            .run(
                "function spin() { Promise.resolve().then(spin) } spin()",
                &RunOptions::default().with_timeout_ms(100),
            )
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_microtask_modes() {
        let mut engine = engine();
        create(&mut engine, "default", ContextOptions::default());
        create(
            &mut engine,
            "after",
            ContextOptions::default().with_microtask_mode(MicrotaskMode::AfterEvaluate),
        );
        let code = "Promise.resolve(7)";

        let eager = engine.run(code, &RunOptions::in_context("default")).unwrap();
        assert_eq!(eager.result, Some(serde_json::json!({})));

        let settled = engine.run(code, &RunOptions::in_context("after")).unwrap();
        assert_eq!(settled.result, Some(serde_json::json!(7)));

        let rejected = engine
            .run("Promise.reject(new RangeError('no'))", &RunOptions::in_context("after"))
            .unwrap();
        assert_eq!(rejected.error.unwrap().message, "RangeError: no");
    }

    #[test]
    fn test_evaluate_wraps_expression() {
        let mut engine = engine();
        let result = engine
            .evaluate("[1, 2, 3].map(x => x * 2)", &EvaluateOptions::default())
            .unwrap();
        assert_eq!(result.result, Some(serde_json::json!([2, 4, 6])));

        // A trailing line comment does not swallow the closing paren.
        let result = engine
            .evaluate("40 + 2 // answer", &EvaluateOptions::default())
            .unwrap();
        assert_eq!(result.result, Some(serde_json::json!(42)));
    }

    #[test]
    fn test_templates_are_usable() {
        let mut engine = engine();
        create(&mut engine, "all", ContextOptions::default().with_templates(GlobalTemplate::ALL));
        let run = |engine: &mut ExecutionEngine, code: &str| {
            let result = engine.run(code, &RunOptions::in_context("all")).unwrap();
            assert!(result.success, "{}: {:?}", code, result.error);
            result.result.unwrap()
        };

        assert_eq!(run(&mut engine, "Buffer.from('hi').toString('hex')"), "6869");
        assert_eq!(run(&mut engine, "Buffer.from('aGk=', 'base64').toString()"), "hi");
        assert_eq!(run(&mut engine, "Buffer.concat([Buffer.from('a'), Buffer.from('b')]).toString()"), "ab");
        assert_eq!(run(&mut engine, "Buffer.isBuffer(Buffer.alloc(2))"), true);
        assert_eq!(run(&mut engine, "btoa('hi') + atob('aGk=')"), "aGk=hi");
        assert_eq!(run(&mut engine, "new TextDecoder().decode(new TextEncoder().encode('héllo'))"), "héllo");
        assert_eq!(run(&mut engine, "new URL('/a?b=1', 'https://x.dev').searchParams.get('b')"), "1");
        assert_eq!(run(&mut engine, "crypto.hash('sha256', 'abc').slice(0, 8)"), "ba7816bf");
        assert_eq!(run(&mut engine, "crypto.randomUUID().length"), 36);
        assert_eq!(run(&mut engine, "crypto.randomBytes(8).length"), 8);
        assert_eq!(run(&mut engine, "Object.isFrozen(process) && process.cwd()"), "/");
        assert_eq!(run(&mut engine, "Object.keys(process.env).length"), 0);
    }
}
