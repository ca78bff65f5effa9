//! Console capture for script runs.
//!
//! Before a run the engine swaps the context's `console` binding for a shim
//! that records every call into a [`ConsoleBuffer`] and then forwards to the
//! original binding. After the run the original binding is put back.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Function, Object, Persistent, Value};

/// Marker appended once when captured output hits its byte limit.
pub const TRUNCATION_MARKER: &str = "... [output truncated] ...";

/// Console method a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    /// `console.log`
    Log,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
    /// `console.debug`
    Debug,
}

impl ConsoleLevel {
    /// Every level, in the order methods are installed.
    pub const ALL: [ConsoleLevel; 5] = [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
        ConsoleLevel::Debug,
    ];

    /// Name of the console method.
    pub fn method(&self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }

    /// Level for a console method name.
    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.method() == method)
    }

    /// Render a captured line. `log` output is recorded verbatim.
    pub fn format_line(&self, message: &str) -> String {
        match self {
            ConsoleLevel::Log => message.to_string(),
            ConsoleLevel::Info => format!("[INFO] {}", message),
            ConsoleLevel::Warn => format!("[WARN] {}", message),
            ConsoleLevel::Error => format!("[ERROR] {}", message),
            ConsoleLevel::Debug => format!("[DEBUG] {}", message),
        }
    }
}

/// Ordered console lines with a byte budget.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    lines: Vec<String>,
    bytes: usize,
    limit: usize,
    truncated: bool,
}

impl ConsoleBuffer {
    /// Create a buffer holding at most `limit` bytes of line text.
    pub fn new(limit: usize) -> Self {
        Self {
            lines: Vec::new(),
            bytes: 0,
            limit,
            truncated: false,
        }
    }

    /// Record one console call.
    pub fn push(&mut self, level: ConsoleLevel, message: &str) {
        if self.truncated {
            return;
        }

        let line = level.format_line(message);
        if self.bytes + line.len() > self.limit {
            self.truncated = true;
            self.lines.push(TRUNCATION_MARKER.to_string());
            return;
        }

        self.bytes += line.len();
        self.lines.push(line);
    }

    /// Captured lines so far.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether output was dropped.
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    /// Take the captured lines, leaving the buffer empty.
    pub fn take(&mut self) -> (Vec<String>, bool) {
        let truncated = self.truncated;
        self.bytes = 0;
        self.truncated = false;
        (std::mem::take(&mut self.lines), truncated)
    }
}

/// Builds the recording shim around the original binding. Every reference
/// the shim holds stays inside the script heap, where the collector sees it.
const SHIM_FACTORY: &str = r#"
(record, original) => {
  const shim = {};
  for (const level of ["log", "info", "warn", "error", "debug"]) {
    const forward = typeof original[level] === "function" ? original[level] : undefined;
    shim[level] = (...args) => {
      record(level, ...args);
      if (forward !== undefined) forward.apply(original, args);
    };
  }
  return shim;
}
"#;

/// What to put back into the `console` slot after a run.
pub(crate) enum ConsoleSlot {
    /// Capture was not installed.
    Untouched,
    /// The binding that was replaced.
    Saved(Persistent<Value<'static>>),
}

/// Replace `console` with a recording shim.
///
/// A context without a `console` binding is left alone, so its namespace
/// never gains a key during a run.
pub(crate) fn install_shim<'js>(
    ctx: &Ctx<'js>,
    buffer: Rc<RefCell<ConsoleBuffer>>,
) -> rquickjs::Result<ConsoleSlot> {
    let globals = ctx.globals();
    let original: Value<'js> = globals.get("console")?;
    let Some(target) = original.as_object() else {
        return Ok(ConsoleSlot::Untouched);
    };

    let record = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, method: String, args: Rest<Value<'js>>| {
            if let Some(level) = ConsoleLevel::from_method(&method) {
                let message = format_args(&ctx, &args.0);
                buffer.borrow_mut().push(level, &message);
            }
        },
    )?;
    let factory: Function<'js> = ctx.eval(SHIM_FACTORY)?;
    let shim: Object<'js> = factory.call((record, target.clone()))?;
    globals.set("console", shim)?;

    Ok(ConsoleSlot::Saved(Persistent::save(ctx, original)))
}

/// Put the original `console` binding back.
pub(crate) fn restore<'js>(ctx: &Ctx<'js>, slot: ConsoleSlot) -> rquickjs::Result<()> {
    match slot {
        ConsoleSlot::Untouched => Ok(()),
        ConsoleSlot::Saved(original) => ctx.globals().set("console", original.restore(ctx)?),
    }
}

/// Join console arguments the way they are recorded.
pub(crate) fn format_args<'js>(ctx: &Ctx<'js>, args: &[Value<'js>]) -> String {
    args.iter()
        .map(|value| format_value(ctx, value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render one value: strings verbatim, `null`/`undefined` by name,
/// everything else as JSON, falling back to `String(value)`.
pub(crate) fn format_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    if value.is_null() {
        return "null".to_string();
    }
    if value.is_undefined() {
        return "undefined".to_string();
    }

    match ctx.json_stringify(value.clone()) {
        Ok(Some(json)) => match json.to_string() {
            Ok(text) => text,
            Err(_) => coerce(ctx, value),
        },
        Ok(None) => coerce(ctx, value),
        Err(_) => {
            // Clear the pending exception (e.g. BigInt or a cycle).
            let _ = ctx.catch();
            coerce(ctx, value)
        }
    }
}

fn coerce<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    let coerced = ctx
        .globals()
        .get::<_, Function<'js>>("String")
        .and_then(|string| string.call::<_, std::string::String>((value.clone(),)));
    match coerced {
        Ok(text) => text,
        Err(_) => {
            let _ = ctx.catch();
            "[unprintable]".to_string()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn with_ctx<R>(f: impl FnOnce(Ctx<'_>) -> R) -> R {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(f)
    }

    // ==================== ConsoleBuffer Tests ====================

    #[test]
    fn test_buffer_under_limit() {
        let mut buffer = ConsoleBuffer::new(100);
        buffer.push(ConsoleLevel::Log, "hello");
        buffer.push(ConsoleLevel::Error, "bad");

        assert!(!buffer.was_truncated());
        assert_eq!(buffer.lines(), ["hello", "[ERROR] bad"]);
    }

    #[test]
    fn test_buffer_truncates_once() {
        let mut buffer = ConsoleBuffer::new(8);
        buffer.push(ConsoleLevel::Log, "12345");
        buffer.push(ConsoleLevel::Log, "67890");
        buffer.push(ConsoleLevel::Log, "more");

        assert!(buffer.was_truncated());
        assert_eq!(buffer.lines(), ["12345", TRUNCATION_MARKER]);
    }

    #[test]
    fn test_buffer_exact_boundary() {
        let mut buffer = ConsoleBuffer::new(10);
        buffer.push(ConsoleLevel::Log, "12345");
        buffer.push(ConsoleLevel::Log, "67890");
        assert!(!buffer.was_truncated());

        buffer.push(ConsoleLevel::Log, "x");
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_buffer_zero_limit() {
        let mut buffer = ConsoleBuffer::new(0);
        buffer.push(ConsoleLevel::Log, "hello");
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_buffer_take_resets() {
        let mut buffer = ConsoleBuffer::new(100);
        buffer.push(ConsoleLevel::Warn, "careful");

        let (lines, truncated) = buffer.take();
        assert_eq!(lines, vec!["[WARN] careful".to_string()]);
        assert!(!truncated);
        assert!(buffer.lines().is_empty());
    }

    // ==================== Formatting Tests ====================

    #[test]
    fn test_format_values() {
        with_ctx(|ctx| {
            let values: Vec<Value<'_>> = ctx
                .eval(r#"["text", 42, null, undefined, {a: [1, true]}, 1.5]"#)
                .unwrap();
            let rendered: Vec<String> = values.iter().map(|v| format_value(&ctx, v)).collect();
            assert_eq!(
                rendered,
                ["text", "42", "null", "undefined", r#"{"a":[1,true]}"#, "1.5"]
            );
        });
    }

    #[test]
    fn test_format_falls_back_to_string_coercion() {
        with_ctx(|ctx| {
            let value: Value<'_> = ctx.eval("10n").unwrap();
            assert_eq!(format_value(&ctx, &value), "10");

            let value: Value<'_> = ctx.eval("(function named() {})").unwrap();
            assert!(format_value(&ctx, &value).starts_with("function named"));

            let value: Value<'_> = ctx.eval("const o = {}; o.self = o; o").unwrap();
            assert_eq!(format_value(&ctx, &value), "[object Object]");
        });
    }

    #[test]
    fn test_shim_records_and_restores() {
        with_ctx(|ctx| {
            ctx.eval::<(), _>("var console = { log() {}, warn() {} };").unwrap();

            let buffer = Rc::new(RefCell::new(ConsoleBuffer::new(1024)));
            let slot = install_shim(&ctx, buffer.clone()).unwrap();
            assert!(matches!(slot, ConsoleSlot::Saved(_)));

            ctx.eval::<(), _>(r#"console.log("a", 1); console.warn({b: null}); console.info()"#)
                .unwrap();
            restore(&ctx, slot).unwrap();

            assert_eq!(
                buffer.borrow().lines(),
                ["a 1", r#"[WARN] {"b":null}"#, "[INFO] "]
            );
            let restored: bool = ctx.eval("console.info === undefined").unwrap();
            assert!(restored);
        });
    }

    #[test]
    fn test_shim_skipped_without_console() {
        with_ctx(|ctx| {
            let buffer = Rc::new(RefCell::new(ConsoleBuffer::new(1024)));
            let slot = install_shim(&ctx, buffer.clone()).unwrap();
            assert!(matches!(slot, ConsoleSlot::Untouched));
            assert!(!ctx.globals().contains_key("console").unwrap());

            restore(&ctx, slot).unwrap();
            assert!(!ctx.globals().contains_key("console").unwrap());
        });
    }

    #[test]
    fn test_kept_shim_does_not_outlive_runtime() {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        let buffer = Rc::new(RefCell::new(ConsoleBuffer::new(1024)));
        ctx.with(|ctx| {
            ctx.eval::<(), _>("var console = { log() {} };").unwrap();
            let slot = install_shim(&ctx, buffer.clone()).unwrap();
            ctx.eval::<(), _>("globalThis.keep = console; globalThis.saved = console.log; saved('x')")
                .unwrap();
            restore(&ctx, slot).unwrap();
        });
        assert_eq!(buffer.borrow().lines(), ["x"]);

        // Freeing the runtime aborts if the shim hid references from the collector.
        drop(ctx);
        drop(rt);
        assert_eq!(Rc::strong_count(&buffer), 1);
    }

    #[test]
    fn test_shim_forwards_to_original() {
        with_ctx(|ctx| {
            ctx.eval::<(), _>("var seen = []; var console = { log: (...a) => seen.push(a.length) };")
                .unwrap();

            let buffer = Rc::new(RefCell::new(ConsoleBuffer::new(1024)));
            let slot = install_shim(&ctx, buffer.clone()).unwrap();
            ctx.eval::<(), _>("console.log(1, 2, 3)").unwrap();
            restore(&ctx, slot).unwrap();

            let seen: Vec<i32> = ctx.eval("seen").unwrap();
            assert_eq!(seen, vec![3]);
            assert_eq!(buffer.borrow().lines(), ["1 2 3"]);
            let restored: bool = ctx.eval("typeof console.log === 'function' && console.info === undefined").unwrap();
            assert!(restored);
        });
    }
}
