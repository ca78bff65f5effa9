//! Cove: named, isolated script contexts with time-bounded execution
//!
//! Cove keeps a registry of JavaScript contexts, each with its own global
//! namespace composed from a closed catalog of capability templates, and
//! runs untrusted snippets against them under a timeout. Results come back
//! as structured values with captured console output, timing and memory
//! samples; script failures are classified rather than raised.
//!
//! ```no_run
//! # async fn demo() -> cove::Result<()> {
//! use cove::{Cove, EngineConfig, RunOptions};
//!
//! let cove = Cove::start(EngineConfig::default()).await?;
//! let result = cove.run("2 + 2", RunOptions::default()).await?;
//! assert_eq!(result.result, Some(serde_json::json!(4)));
//! # Ok(())
//! # }
//! ```

mod clock;
mod config;
mod console;
mod context;
mod engine;
mod error;
mod registry;
mod runtime;
mod security;
mod templates;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use console::{ConsoleBuffer, ConsoleLevel, TRUNCATION_MARKER};
pub use context::{
    CodeGeneration, ContextInfo, ContextOptions, ContextOptionsSummary, MemorySample,
    MicrotaskMode,
};
pub use engine::{EvaluateOptions, ExecutionEngine, ExecutionResult, RunOptions};
pub use error::{Error, ErrorKind, Result};
pub use registry::ContextRegistry;
pub use runtime::Cove;
pub use security::{DENIED_CAPABILITIES, DeniedCapability, SecurityValidator, denied_binding};
pub use templates::GlobalTemplate;
