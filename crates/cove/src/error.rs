//! Error taxonomy shared by the registry, the engine and the service handle.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discriminant for every failure the sandbox can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The script did not settle before its deadline.
    Timeout,
    /// No live context has the requested id.
    ContextNotFound,
    /// A live context already uses the requested id.
    ContextExists,
    /// The registry is at its configured capacity.
    ContextLimitReached,
    /// Code or bindings touched a denied capability.
    SecurityViolation,
    /// Heap usage is above the configured ceiling.
    MemoryExceeded,
    /// Compile, syntax or runtime error raised by the script.
    ExecutionFailure,
    /// The context or the engine itself is unusable.
    ContextError,
}

impl ErrorKind {
    /// Machine-readable code exposed to callers.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ContextNotFound => "CONTEXT_NOT_FOUND",
            ErrorKind::ContextExists => "CONTEXT_EXISTS",
            ErrorKind::ContextLimitReached => "CONTEXT_LIMIT_REACHED",
            ErrorKind::SecurityViolation => "SECURITY_VIOLATION",
            ErrorKind::MemoryExceeded => "MEMORY_EXCEEDED",
            ErrorKind::ExecutionFailure => "EXECUTION_FAILURE",
            ErrorKind::ContextError => "CONTEXT_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified failure.
///
/// Only the message, the code and (optionally) the script stack trace are
/// ever exposed; host paths and internal state stay out of the payload.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct Error {
    /// What went wrong.
    #[serde(rename = "code")]
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Context the failure relates to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    /// Time spent executing before the failure, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Open, kind-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Script stack trace, when the script raised the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context_id: None,
            execution_time_ms: None,
            details: None,
            stack: None,
        }
    }

    /// The script did not finish within `timeout_ms`.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Script execution timed out after {}ms", timeout_ms),
        )
        .with_details(serde_json::json!({ "timeoutMs": timeout_ms }))
    }

    /// No context with this id.
    pub fn context_not_found(id: &str) -> Self {
        Self::new(ErrorKind::ContextNotFound, format!("Context '{}' not found", id))
            .with_context(id)
    }

    /// A context with this id is already live.
    pub fn context_exists(id: &str) -> Self {
        Self::new(ErrorKind::ContextExists, format!("Context '{}' already exists", id))
            .with_context(id)
    }

    /// The registry holds `max` contexts already.
    pub fn context_limit_reached(max: usize) -> Self {
        Self::new(
            ErrorKind::ContextLimitReached,
            format!("Maximum number of contexts ({}) reached", max),
        )
        .with_details(serde_json::json!({ "maxContexts": max }))
    }

    /// A denied capability was requested or referenced.
    pub fn security_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SecurityViolation, message)
    }

    /// Heap usage is above the ceiling.
    pub fn memory_exceeded(used_bytes: u64, limit_bytes: u64) -> Self {
        Self::new(
            ErrorKind::MemoryExceeded,
            format!(
                "Memory usage {}MB exceeds limit of {}MB",
                used_bytes / (1024 * 1024),
                limit_bytes / (1024 * 1024)
            ),
        )
        .with_details(serde_json::json!({
            "usedBytes": used_bytes,
            "limitBytes": limit_bytes,
        }))
    }

    /// The script itself failed.
    pub fn execution_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailure, message)
    }

    /// The context or engine could not be used.
    pub fn context_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContextError, message)
    }

    /// The engine thread has stopped or never started.
    pub fn engine_unavailable() -> Self {
        Self::context_error("execution engine is not running")
    }

    /// Attach the context id.
    pub fn with_context(mut self, id: impl Into<String>) -> Self {
        self.context_id = Some(id.into());
        self
    }

    /// Attach the elapsed execution time.
    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }

    /// Attach a details payload, merging object fields into existing ones.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = match (self.details.take(), details) {
            (Some(serde_json::Value::Object(mut existing)), serde_json::Value::Object(extra)) => {
                existing.extend(extra);
                Some(serde_json::Value::Object(existing))
            }
            (_, details) => Some(details),
        };
        self
    }

    /// Attach a script stack trace.
    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack.filter(|s| !s.trim().is_empty());
        self
    }

    /// Shorthand for `self.kind.code()`.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
