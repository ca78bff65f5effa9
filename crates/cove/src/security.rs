//! Denied capabilities and the optional static code scan.
//!
//! A single table drives both checks the sandbox performs:
//!
//! - **Namespace denylist**: custom globals passed at context creation may
//!   not bind any of a capability's names. Templates are the only way such
//!   names (e.g. a limited `process`) enter a namespace.
//! - **Pattern scan**: [`SecurityValidator::scan`] matches code text against
//!   each capability's pattern, in table order. It is opt-in.
//!
//! Dynamic evaluation additionally has a runtime switch: contexts are
//! created with `codeGeneration.strings = false` unless the caller opts in,
//! which replaces `eval` and the function constructors with throwers.

use regex_lite::Regex;

use crate::error::{Error, Result};

/// A capability scripts must not reach directly.
#[derive(Debug, Clone, Copy)]
pub struct DeniedCapability {
    /// Human-readable name used in violation messages.
    pub name: &'static str,
    /// Global names that may not be bound by custom globals.
    pub bindings: &'static [&'static str],
    /// Pattern matched against code text by the scanner.
    pub pattern: &'static str,
}

/// Denied capabilities, in scan order.
pub const DENIED_CAPABILITIES: &[DeniedCapability] = &[
    DeniedCapability {
        name: "module loading",
        bindings: &["require", "module", "exports", "import"],
        pattern: r"\brequire\s*\(|\bimport\s*\(|\bimport\s+[\w*{$]",
    },
    DeniedCapability {
        name: "dynamic function construction",
        bindings: &["Function"],
        pattern: r"\bFunction\s*\(",
    },
    DeniedCapability {
        name: "process access",
        bindings: &["process"],
        pattern: r"\bprocess\s*[.\[]",
    },
    DeniedCapability {
        name: "global object access",
        bindings: &["global", "globalThis"],
        pattern: r"\bglobal(This)?\b",
    },
    DeniedCapability {
        name: "module location access",
        bindings: &["__dirname", "__filename"],
        pattern: r"\b__(dirname|filename)\b",
    },
    DeniedCapability {
        name: "dynamic evaluation",
        bindings: &["eval"],
        pattern: r"\beval\s*\(",
    },
];

/// Find the capability a global name belongs to, if it is denied.
pub fn denied_binding(name: &str) -> Option<&'static DeniedCapability> {
    DENIED_CAPABILITIES
        .iter()
        .find(|cap| cap.bindings.contains(&name))
}

/// Reject a custom global name.
pub(crate) fn check_custom_global(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::context_error("custom global names must not be empty"));
    }
    if let Some(cap) = denied_binding(name) {
        return Err(Error::security_violation(format!(
            "Custom global '{}' is not allowed ({})",
            name, cap.name
        ))
        .with_details(serde_json::json!({ "key": name, "capability": cap.name })));
    }
    Ok(())
}

/// Static scan of code text.
#[derive(Debug)]
pub struct SecurityValidator {
    matchers: Vec<(&'static DeniedCapability, Regex)>,
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityValidator {
    /// Compile the matchers for [`DENIED_CAPABILITIES`].
    pub fn new() -> Self {
        let matchers = DENIED_CAPABILITIES
            .iter()
            .filter_map(|cap| match Regex::new(&format!("(?m){}", cap.pattern)) {
                Ok(re) => Some((cap, re)),
                Err(e) => {
                    tracing::error!(capability = cap.name, "invalid scan pattern: {}", e);
                    None
                }
            })
            .collect();
        Self { matchers }
    }

    /// Scan code text; the first matching capability fails the scan.
    pub fn scan(&self, code: &str) -> Result<bool> {
        for (cap, re) in &self.matchers {
            if let Some(found) = re.find(code) {
                return Err(Error::security_violation(format!(
                    "Code contains a forbidden pattern: {}",
                    cap.name
                ))
                .with_details(serde_json::json!({
                    "capability": cap.name,
                    "match": found.as_str(),
                    "offset": found.start(),
                })));
            }
        }
        Ok(true)
    }
}
