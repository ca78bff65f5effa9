//! The set of live contexts.
//!
//! The registry owns every context together with the runtime it runs on.
//! It is not `Send`: it lives on the engine thread and is only reached
//! through commands sent by [`Cove`](crate::Cove).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use rquickjs::{Ctx, Runtime};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::context::{Context, ContextInfo, ContextOptions, MemorySample};
use crate::error::{Error, Result};
use crate::security::check_custom_global;
use crate::templates::{TemplateEnv, TimerQueue};

/// Native stack the engine may use before raising a RangeError.
const MAX_STACK_BYTES: usize = 1024 * 1024;

/// Replaces every string-to-code entry point with a thrower.
///
/// The thrower keeps `Function.prototype` as its `prototype` so
/// `fn instanceof Function` still holds.
const DENY_CODE_GENERATION: &str = r#"
(function () {
  const FunctionPrototype = Function.prototype;
  const deny = function () {
    throw new EvalError("Code generation from strings disallowed for this context");
  };
  Object.defineProperty(deny, "prototype", { value: FunctionPrototype });
  const constructors = [
    FunctionPrototype,
    Object.getPrototypeOf(function* () {}),
    Object.getPrototypeOf(async function () {}),
    Object.getPrototypeOf(async function* () {}),
  ];
  for (const proto of constructors) {
    Object.defineProperty(proto, "constructor", { value: deny, writable: false, configurable: false });
  }
  globalThis.eval = deny;
  globalThis.Function = deny;
})();
"#;

/// Predicate polled by every runtime while script code runs; returning
/// true interrupts the script.
pub(crate) type InterruptCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Owner of every live context.
///
/// Each context gets its own runtime, so pending jobs, heap usage and the
/// memory ceiling never cross context boundaries.
pub struct ContextRegistry {
    contexts: HashMap<String, Context>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    started: Instant,
    interrupt: Option<InterruptCheck>,
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("contexts", &self.contexts.len())
            .field("max_contexts", &self.config.max_contexts)
            .finish_non_exhaustive()
    }
}

impl ContextRegistry {
    /// Create an empty registry.
    pub fn new(config: Arc<EngineConfig>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            contexts: HashMap::new(),
            config,
            clock,
            started: Instant::now(),
            interrupt: None,
        })
    }

    /// Install the interrupt check on runtimes created from now on.
    pub(crate) fn set_interrupt(&mut self, check: InterruptCheck) {
        self.interrupt = Some(check);
    }

    fn new_runtime(&self) -> Result<Runtime> {
        let runtime = Runtime::new()
            .map_err(|e| Error::context_error(format!("failed to start script runtime: {}", e)))?;
        runtime.set_max_stack_size(MAX_STACK_BYTES);
        if self.config.memory_monitoring && self.config.memory_limit_mb > 0 {
            runtime.set_memory_limit(self.config.memory_limit_bytes() as usize);
        }
        if let Some(check) = &self.interrupt {
            let check = check.clone();
            runtime.set_interrupt_handler(Some(Box::new(move || check())));
        }
        Ok(runtime)
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Create a context.
    ///
    /// Templates are installed in the listed order, then custom globals, so
    /// later entries win on a name collision.
    pub fn create(&mut self, id: &str, options: ContextOptions) -> Result<ContextInfo> {
        if id.is_empty() {
            return Err(Error::context_error("Context id must not be empty"));
        }
        if self.contexts.contains_key(id) {
            return Err(Error::context_exists(id));
        }
        if self.contexts.len() >= self.config.max_contexts {
            return Err(Error::context_limit_reached(self.config.max_contexts).with_context(id));
        }
        for name in options.globals.keys() {
            check_custom_global(name).map_err(|e| e.with_context(id))?;
        }

        let runtime = self.new_runtime().map_err(|e| e.with_context(id))?;
        let js = rquickjs::Context::full(&runtime).map_err(|e| {
            Error::context_error(format!("failed to create context: {}", e)).with_context(id)
        })?;
        let timers = Rc::new(RefCell::new(TimerQueue::new()));
        let env = TemplateEnv {
            context_id: id.to_string(),
            timers: timers.clone(),
            started: self.started,
        };

        js.with(|ctx| populate(&ctx, &options, &env))
            .map_err(|e| e.with_context(id))?;

        let now = self.clock.now();
        let context = Context {
            id: id.to_string(),
            globals: options.binding_names(),
            options,
            created_at: now,
            last_used_at: now,
            execution_count: 0,
            memory_usage: None,
            timers,
            js,
            runtime,
        };
        let info = context.info(true);
        self.contexts.insert(id.to_string(), context);

        tracing::info!(
            context_id = %id,
            templates = ?info.options.as_ref().map(|o| &o.global_templates),
            total = self.contexts.len(),
            "context created"
        );
        Ok(info)
    }

    /// Look a context up and mark it used.
    pub(crate) fn get(&mut self, id: &str) -> Result<&mut Context> {
        let now = self.clock.now();
        let context = self
            .contexts
            .get_mut(id)
            .ok_or_else(|| Error::context_not_found(id))?;
        context.touch(now);
        Ok(context)
    }

    /// Look a context up without marking it used.
    pub(crate) fn lookup(&self, id: &str) -> Result<&Context> {
        self.contexts
            .get(id)
            .ok_or_else(|| Error::context_not_found(id))
    }

    /// Summary of a context, including its binding names. Counts as use.
    pub fn info(&mut self, id: &str) -> Result<ContextInfo> {
        self.get(id).map(|c| c.info(true))
    }

    /// Every live context, most recently used first (ties by id).
    pub fn list(&self, include_details: bool) -> Vec<ContextInfo> {
        let mut infos: Vec<ContextInfo> = self
            .contexts
            .values()
            .map(|c| c.info(include_details))
            .collect();
        infos.sort_by(|a, b| {
            b.last_used_at
                .cmp(&a.last_used_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        infos
    }

    /// Remove a context.
    pub fn destroy(&mut self, id: &str) -> Result<bool> {
        let context = self
            .contexts
            .remove(id)
            .ok_or_else(|| Error::context_not_found(id))?;
        let dropped = context.timers.borrow_mut().clear();
        drop(context);
        tracing::info!(context_id = %id, dropped_timers = dropped, "context destroyed");
        Ok(true)
    }

    /// A fresh id not used by any live context.
    pub fn generate_id(&self) -> String {
        loop {
            let id = format!("ctx-{}", uuid::Uuid::new_v4().simple());
            if !self.contexts.contains_key(&id) {
                return id;
            }
        }
    }

    /// Evict contexts unused for longer than the idle timeout.
    ///
    /// Returns the evicted ids, sorted.
    pub fn sweep_idle(&mut self) -> Vec<String> {
        let now = self.clock.now();
        let idle = chrono::Duration::from_std(self.config.idle_timeout)
            .unwrap_or(chrono::Duration::MAX);

        let mut evicted: Vec<String> = self
            .contexts
            .values()
            .filter(|c| now.signed_duration_since(c.last_used_at) > idle)
            .map(|c| c.id.clone())
            .collect();
        evicted.sort();

        for id in &evicted {
            if let Some(context) = self.contexts.remove(id) {
                context.timers.borrow_mut().clear();
                tracing::info!(
                    context_id = %id,
                    last_used_at = %context.last_used_at,
                    "evicted idle context"
                );
            }
        }
        evicted
    }

    /// Fail if script heap usage, summed over every context, is above the
    /// configured ceiling.
    pub fn memory_check(&self) -> Result<bool> {
        if !self.config.memory_monitoring {
            return Ok(true);
        }
        let sample = self.memory_sample();
        let limit = self.config.memory_limit_bytes();
        if sample.used_bytes > limit {
            return Err(Error::memory_exceeded(sample.used_bytes, limit));
        }
        Ok(true)
    }

    /// Heap usage summed over every context.
    pub fn memory_sample(&self) -> MemorySample {
        let now = self.clock.now();
        let empty = MemorySample {
            used_bytes: 0,
            allocated_bytes: 0,
            object_count: 0,
            sampled_at: now,
        };
        self.contexts
            .values()
            .map(|c| MemorySample::take(&c.runtime, now))
            .fold(empty, |total, s| MemorySample {
                used_bytes: total.used_bytes + s.used_bytes,
                allocated_bytes: total.allocated_bytes + s.allocated_bytes,
                object_count: total.object_count + s.object_count,
                sampled_at: now,
            })
    }

    /// Drop every context; returns how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.contexts.len();
        for context in self.contexts.values() {
            context.timers.borrow_mut().clear();
        }
        self.contexts.clear();
        if count > 0 {
            tracing::info!(count, "cleared all contexts");
        }
        count
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether no context is live.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

/// Install templates, hardening and custom globals into a fresh context.
fn populate<'js>(ctx: &Ctx<'js>, options: &ContextOptions, env: &TemplateEnv) -> Result<()> {
    let engine_error = |step: &str, e: rquickjs::Error| {
        let detail = match e {
            rquickjs::Error::Exception => crate::console::format_value(ctx, &ctx.catch()),
            other => other.to_string(),
        };
        Error::context_error(format!("failed to {}: {}", step, detail))
    };

    for template in &options.global_templates {
        template
            .install(ctx, env)
            .map_err(|e| engine_error(&format!("install template '{}'", template), e))?;
    }

    if !options.code_generation.strings {
        ctx.eval::<(), _>(DENY_CODE_GENERATION)
            .map_err(|e| engine_error("disable code generation", e))?;
    }

    let globals = ctx.globals();
    for (name, value) in &options.globals {
        let json = serde_json::to_string(value)
            .map_err(|e| Error::context_error(format!("invalid value for global '{}': {}", name, e)))?;
        let value = ctx
            .json_parse(json)
            .map_err(|e| engine_error(&format!("convert global '{}'", name), e))?;
        globals
            .set(name.as_str(), value)
            .map_err(|e| engine_error(&format!("set global '{}'", name), e))?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::templates::GlobalTemplate;

    fn registry_with(config: EngineConfig) -> (ContextRegistry, ManualClock) {
        let clock = ManualClock::default();
        let registry = ContextRegistry::new(Arc::new(config), Arc::new(clock.clone())).unwrap();
        (registry, clock)
    }

    fn registry() -> (ContextRegistry, ManualClock) {
        registry_with(EngineConfig::default())
    }

    fn global_names(registry: &ContextRegistry, id: &str) -> Vec<String> {
        let context = registry.lookup(id).unwrap();
        context.js.with(|ctx| {
            let names: Vec<String> = ctx
                .eval("Object.getOwnPropertyNames(globalThis)")
                .unwrap();
            names
        })
    }

    #[test]
    fn test_create_and_get() {
        let (mut registry, _) = registry();
        let info = registry.create("a", ContextOptions::default()).unwrap();

        assert_eq!(info.id, "a");
        assert_eq!(info.execution_count, 0);
        assert_eq!(info.created_at, info.last_used_at);
        assert_eq!(info.globals, ["console"]);
        assert!(registry.get("a").is_ok());
    }

    #[test]
    fn test_namespace_matches_template_union() {
        let (mut registry, _) = registry();
        let options = ContextOptions::default()
            .with_templates([GlobalTemplate::Timers, GlobalTemplate::Url])
            .with_global("answer", serde_json::json!(42));
        let info = registry.create("a", options).unwrap();

        let names = global_names(&registry, "a");
        for binding in &info.globals {
            assert!(names.contains(binding), "missing {}", binding);
        }
        assert!(!names.iter().any(|n| n == "console"));
        assert!(!names.iter().any(|n| n == "Buffer"));
    }

    #[test]
    fn test_duplicate_id() {
        let (mut registry, _) = registry();
        registry.create("a", ContextOptions::default()).unwrap();
        let err = registry.create("a", ContextOptions::default()).unwrap_err();

        assert_eq!(err.kind, ErrorKind::ContextExists);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_limit_reached() {
        let (mut registry, _) = registry_with(EngineConfig {
            max_contexts: 2,
            ..Default::default()
        });
        registry.create("a", ContextOptions::default()).unwrap();
        registry.create("b", ContextOptions::default()).unwrap();
        let err = registry.create("c", ContextOptions::default()).unwrap_err();

        assert_eq!(err.kind, ErrorKind::ContextLimitReached);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_denied_custom_global() {
        let (mut registry, _) = registry();
        let options = ContextOptions::default().with_global("require", serde_json::json!(null));
        let err = registry.create("a", options).unwrap_err();

        assert_eq!(err.kind, ErrorKind::SecurityViolation);
        assert!(err.message.contains("require"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_empty_id_or_global_name() {
        let (mut registry, _) = registry();
        let err = registry.create("", ContextOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContextError);

        let options = ContextOptions::default().with_global("", serde_json::json!(1));
        let err = registry.create("a", options).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ContextError);
    }

    #[test]
    fn test_custom_global_overrides_template() {
        let (mut registry, _) = registry();
        let options = ContextOptions::default()
            .with_templates([GlobalTemplate::Encoding])
            .with_global("btoa", serde_json::json!({"custom": true}));
        registry.create("a", options).unwrap();

        let custom = registry.lookup("a").unwrap().js.with(|ctx| {
            let custom: bool = ctx.eval("btoa.custom === true").unwrap();
            custom
        });
        assert!(custom);
    }

    #[test]
    fn test_destroy() {
        let (mut registry, _) = registry();
        registry.create("a", ContextOptions::default()).unwrap();

        assert!(registry.destroy("a").unwrap());
        assert_eq!(registry.get("a").unwrap_err().kind, ErrorKind::ContextNotFound);
        assert_eq!(registry.destroy("a").unwrap_err().kind, ErrorKind::ContextNotFound);
    }

    #[test]
    fn test_list_order_and_details() {
        let (mut registry, clock) = registry();
        registry.create("b", ContextOptions::default()).unwrap();
        registry.create("a", ContextOptions::default()).unwrap();
        clock.advance(chrono::Duration::seconds(5));
        registry.create("c", ContextOptions::default()).unwrap();

        let ids: Vec<String> = registry.list(false).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, ["c", "a", "b"]);

        for info in registry.list(false) {
            assert!(info.globals.is_empty());
            assert!(info.options.is_none());
        }
        for info in registry.list(true) {
            assert!(!info.globals.is_empty());
            assert!(info.options.is_some());
        }
    }

    #[test]
    fn test_get_touches_monotonically() {
        let (mut registry, clock) = registry();
        registry.create("a", ContextOptions::default()).unwrap();
        clock.advance(chrono::Duration::seconds(10));
        let touched = registry.get("a").unwrap().last_used_at;

        clock.advance(chrono::Duration::seconds(-60));
        registry.get("a").unwrap();
        assert_eq!(registry.lookup("a").unwrap().last_used_at, touched);
    }

    #[test]
    fn test_sweep_idle() {
        let (mut registry, clock) = registry_with(EngineConfig {
            idle_timeout: std::time::Duration::from_secs(60),
            ..Default::default()
        });
        registry.create("old", ContextOptions::default()).unwrap();
        clock.advance(chrono::Duration::seconds(45));
        registry.create("new", ContextOptions::default()).unwrap();
        clock.advance(chrono::Duration::seconds(30));

        assert_eq!(registry.sweep_idle(), ["old"]);
        let ids: Vec<String> = registry.list(false).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, ["new"]);
    }

    #[test]
    fn test_generate_id_is_fresh() {
        let (registry, _) = registry();
        let a = registry.generate_id();
        let b = registry.generate_id();
        assert!(a.starts_with("ctx-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_memory_check() {
        let (mut registry, _) = registry();
        registry.create("a", ContextOptions::default()).unwrap();
        assert!(registry.memory_check().unwrap());
        assert!(registry.memory_sample().used_bytes > 0);

        let (mut registry, _) = registry_with(EngineConfig {
            memory_limit_mb: 0,
            ..Default::default()
        });
        // Nothing allocated yet, nothing to exceed.
        assert!(registry.memory_check().unwrap());
        registry.create("a", ContextOptions::default()).unwrap();
        assert_eq!(
            registry.memory_check().unwrap_err().kind,
            ErrorKind::MemoryExceeded
        );

        let (registry, _) = registry_with(EngineConfig {
            memory_limit_mb: 0,
            memory_monitoring: false,
            ..Default::default()
        });
        assert!(registry.memory_check().unwrap());
    }

    #[test]
    fn test_clear() {
        let (mut registry, _) = registry();
        registry.create("a", ContextOptions::default()).unwrap();
        registry.create("b", ContextOptions::default()).unwrap();
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
    }
}
