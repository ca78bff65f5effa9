//! Contexts: isolated global namespaces plus their bookkeeping.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::templates::{GlobalTemplate, TimerQueue};

/// Runtime code generation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeGeneration {
    /// Allow `eval`, `new Function` and the other string-to-code paths
    pub strings: bool,
    /// Allow WebAssembly compilation (the embedded engine has none, so this
    /// is recorded but changes nothing)
    pub wasm: bool,
}

/// When the completion value of a run is captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MicrotaskMode {
    /// Capture the value as soon as the script body returns.
    #[default]
    Default,
    /// Capture after the first microtask drain; a settled promise is
    /// unwrapped to its value.
    AfterEvaluate,
}

/// Options fixed when a context is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextOptions {
    /// Display name
    pub name: Option<String>,
    /// Templates to install, in order
    pub global_templates: Vec<GlobalTemplate>,
    /// Custom globals, installed after the templates
    pub globals: BTreeMap<String, serde_json::Value>,
    /// Code generation switches
    pub code_generation: CodeGeneration,
    /// When the completion value is captured
    pub microtask_mode: MicrotaskMode,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            name: None,
            global_templates: vec![GlobalTemplate::Console],
            globals: BTreeMap::new(),
            code_generation: CodeGeneration::default(),
            microtask_mode: MicrotaskMode::default(),
        }
    }
}

impl ContextOptions {
    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the template selection.
    pub fn with_templates(mut self, templates: impl IntoIterator<Item = GlobalTemplate>) -> Self {
        self.global_templates = templates.into_iter().collect();
        self
    }

    /// Add a custom global.
    pub fn with_global(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Enable or disable string code generation.
    pub fn with_code_generation(mut self, strings: bool) -> Self {
        self.code_generation.strings = strings;
        self
    }

    /// Set the microtask mode.
    pub fn with_microtask_mode(mut self, mode: MicrotaskMode) -> Self {
        self.microtask_mode = mode;
        self
    }

    /// Names of every binding these options put into the namespace.
    ///
    /// Union of the selected templates' bindings and the custom global
    /// names, sorted.
    pub fn binding_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self
            .global_templates
            .iter()
            .flat_map(|t| t.bindings().iter().map(|b| b.to_string()))
            .collect();
        names.extend(self.globals.keys().cloned());
        names.into_iter().collect()
    }

    /// Options without any binding values.
    pub fn summary(&self) -> ContextOptionsSummary {
        ContextOptionsSummary {
            global_templates: self.global_templates.clone(),
            globals: self.globals.keys().cloned().collect(),
            code_generation: self.code_generation,
            microtask_mode: self.microtask_mode,
        }
    }
}

/// Options as reported back to callers: custom global names only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOptionsSummary {
    /// Installed templates, in order
    pub global_templates: Vec<GlobalTemplate>,
    /// Custom global names
    pub globals: Vec<String>,
    /// Code generation switches
    pub code_generation: CodeGeneration,
    /// Microtask mode
    pub microtask_mode: MicrotaskMode,
}

/// Heap usage of the script engine at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    /// Bytes in use by the script heap
    pub used_bytes: u64,
    /// Bytes handed out by the engine allocator
    pub allocated_bytes: u64,
    /// Live objects
    pub object_count: u64,
    /// When the sample was taken
    pub sampled_at: DateTime<Utc>,
}

impl MemorySample {
    /// Sample the engine heap.
    pub(crate) fn take(runtime: &rquickjs::Runtime, now: DateTime<Utc>) -> Self {
        let usage = runtime.memory_usage();
        Self {
            used_bytes: usage.memory_used_size.max(0) as u64,
            allocated_bytes: usage.malloc_size.max(0) as u64,
            object_count: usage.obj_count.max(0) as u64,
            sampled_at: now,
        }
    }
}

/// Serializable summary of a context. Never carries binding values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    /// Context id
    pub id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last time the context was used
    pub last_used_at: DateTime<Utc>,
    /// Completed runs
    pub execution_count: u64,
    /// Heap sample taken after the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<MemorySample>,
    /// Global binding names, sorted (details only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub globals: Vec<String>,
    /// Creation options (details only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ContextOptionsSummary>,
}

/// A live context, owned by the registry.
///
/// Fields drop in declaration order: queued timer callbacks first, then the
/// script context, then the runtime it was created on.
pub(crate) struct Context {
    pub id: String,
    pub options: ContextOptions,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub execution_count: u64,
    pub memory_usage: Option<MemorySample>,
    pub globals: Vec<String>,
    pub timers: Rc<RefCell<TimerQueue>>,
    pub js: rquickjs::Context,
    pub runtime: rquickjs::Runtime,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("execution_count", &self.execution_count)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Record use at `now`; never moves the timestamp backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used_at = self.last_used_at.max(now);
    }

    /// Heap usage of this context's runtime.
    pub fn sample(&self, now: DateTime<Utc>) -> MemorySample {
        MemorySample::take(&self.runtime, now)
    }

    /// Count a finished run.
    pub fn record_run(&mut self, now: DateTime<Utc>, sample: Option<MemorySample>) {
        self.execution_count += 1;
        self.touch(now);
        if sample.is_some() {
            self.memory_usage = sample;
        }
    }

    pub fn info(&self, include_details: bool) -> ContextInfo {
        ContextInfo {
            id: self.id.clone(),
            name: self.options.name.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            execution_count: self.execution_count,
            memory_usage: self.memory_usage,
            globals: if include_details {
                self.globals.clone()
            } else {
                Vec::new()
            },
            options: include_details.then(|| self.options.summary()),
        }
    }
}
