//! Unified error handling with fix hints (v0.1)
//!
//! Every runtime error carries a stable dotted kind code (`task.input`,
//! `dependency.cycle`, ...) surfaced through [`WeftError::kind`], plus an
//! optional remediation hint via the [`FixHint`] trait. Bootstrap errors
//! name the violating id, the owning resource and the requesting resource
//! so a broken tree is diagnosable from the message alone.

use thiserror::Error;

use crate::durable::DurableError;
use crate::types::{UnitId, UnitKind};

// ============================================================================
// FIX HINT TRAIT
// ============================================================================

/// Trait for errors that can provide remediation hints
///
/// All runtime errors implement this so callers can print actionable
/// guidance next to the failure.
pub trait FixHint {
    /// Get a remediation hint for this error, if available
    fn hint(&self) -> Option<&str>;
}

// ============================================================================
// VALIDATION TARGET
// ============================================================================

/// What a schema validation failure was validating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationTarget {
    TaskInput,
    TaskResult,
    ResourceConfig,
    EventPayload,
}

impl ValidationTarget {
    /// Stable dotted code for this validation kind
    pub fn code(&self) -> &'static str {
        match self {
            ValidationTarget::TaskInput => "task.input",
            ValidationTarget::TaskResult => "task.result",
            ValidationTarget::ResourceConfig => "resource.config",
            ValidationTarget::EventPayload => "event.payload",
        }
    }
}

impl std::fmt::Display for ValidationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ============================================================================
// WEFT ERROR
// ============================================================================

/// Top-level error type for the runtime
#[derive(Debug, Error)]
pub enum WeftError {
    /// Malformed unit handed to a constructor
    #[error("[definition.invalid] unit '{id}': {reason}")]
    DefinitionInvalid { id: String, reason: String },

    /// A dependency references an id no visible ancestor registers
    #[error("[registration.missing] '{required_by}' depends on '{id}', which is not registered")]
    RegistrationMissing { id: UnitId, required_by: UnitId },

    /// The id exists but is not exported along the chain to the consumer
    #[error(
        "[visibility.violation] '{consumer}' cannot reach '{target}' (registered by '{owner}', \
         not exported along the chain)"
    )]
    VisibilityViolation {
        target: UnitId,
        owner: UnitId,
        consumer: UnitId,
    },

    /// Cyclic dependency graph; the chain lists every id on the cycle
    #[error("[dependency.cycle] cyclic dependency: {}", format_chain(.chain))]
    DependencyCycle { chain: Vec<UnitId> },

    /// A schema rejected a value
    #[error("[{}] '{unit}': {message}", .target.code())]
    SchemaRejected {
        target: ValidationTarget,
        unit: UnitId,
        message: String,
    },

    /// The shipped timeout middleware hit its deadline
    #[error("[task.timeout] task '{task}' exceeded {after_ms}ms")]
    TaskTimeout { task: UnitId, after_ms: u64 },

    /// The runtime surface refused to reach a non-exported id
    #[error(
        "[runtime.accessViolation] '{target}' is not exported by root '{root}' \
         (exported: [{}])", .exported.iter().map(|i| i.as_str()).collect::<Vec<_>>().join(", ")
    )]
    AccessViolation {
        target: UnitId,
        root: UnitId,
        exported: Vec<UnitId>,
    },

    /// Disallowed re-emission of an event within one emission chain
    #[error("[event.cycle] event re-emitted within its own chain: {}", format_chain(.chain))]
    EventCycle { chain: Vec<UnitId> },

    /// `Context::require` found no ambient value
    #[error("[context.missing] no ambient context value for key '{key}'")]
    ContextMissing { key: String },

    /// Queue disposed with `cancel: true` while the task was pending
    #[error("[queue.cancelled] queue disposed before the task ran")]
    QueueCancelled,

    /// Surface call after `dispose()`
    #[error("[runtime.disposed] the runtime has been disposed")]
    Disposed,

    /// Resource value requested before its `init` ran (lazy mode or dry run)
    #[error("[resource.uninitialized] resource '{id}' has not been initialized")]
    NotInitialized { id: UnitId },

    /// A surface ref resolved to no registered unit
    #[error("[registration.missing] no {kind} registered under id '{id}'")]
    UnknownUnit { id: UnitId, kind: UnitKind },

    /// One or more resources failed to initialize (parallel init aggregates)
    #[error("[boot.initFailed] {} resource(s) failed to initialize: {}", .failures.len(),
        format_failures(.failures))]
    InitFailed { failures: Vec<(UnitId, String)> },

    /// One or more disposers rejected; all disposers were still attempted
    #[error("[runtime.disposeFailed] {} disposer(s) failed: {}", .failures.len(),
        format_failures(.failures))]
    DisposeFailed { failures: Vec<(UnitId, String)> },

    /// A named collaborator backend is not compiled in / installed
    #[error("[optionalDependency.missing] optional package '{package}' is not available")]
    OptionalDependencyMissing { package: String },

    /// A collaborator backend loaded but exposed a malformed factory
    #[error("[optionalDependency.invalidExport] package '{package}': {reason}")]
    OptionalDependencyInvalidExport { package: String, reason: String },

    /// Durable engine error
    #[error("{0}")]
    Durable(#[from] DurableError),

    /// Error raised by user code (task body, resource init, hook body)
    #[error("{0}")]
    User(#[from] anyhow::Error),
}

impl WeftError {
    /// Stable dotted kind code for this error
    pub fn kind(&self) -> &'static str {
        match self {
            WeftError::DefinitionInvalid { .. } => "definition.invalid",
            WeftError::RegistrationMissing { .. } | WeftError::UnknownUnit { .. } => {
                "registration.missing"
            }
            WeftError::VisibilityViolation { .. } => "visibility.violation",
            WeftError::DependencyCycle { .. } => "dependency.cycle",
            WeftError::SchemaRejected { target, .. } => target.code(),
            WeftError::TaskTimeout { .. } => "task.timeout",
            WeftError::AccessViolation { .. } => "runtime.accessViolation",
            WeftError::EventCycle { .. } => "event.cycle",
            WeftError::ContextMissing { .. } => "context.missing",
            WeftError::QueueCancelled => "queue.cancelled",
            WeftError::Disposed => "runtime.disposed",
            WeftError::NotInitialized { .. } => "resource.uninitialized",
            WeftError::InitFailed { .. } => "boot.initFailed",
            WeftError::DisposeFailed { .. } => "runtime.disposeFailed",
            WeftError::OptionalDependencyMissing { .. } => "optionalDependency.missing",
            WeftError::OptionalDependencyInvalidExport { .. } => "optionalDependency.invalidExport",
            WeftError::Durable(e) => e.kind(),
            WeftError::User(_) => "user",
        }
    }

    /// Recover a runtime error that traveled through `anyhow` (user code
    /// propagating `deps` failures with `?`), so its kind survives.
    pub fn from_any(err: anyhow::Error) -> Self {
        match err.downcast::<WeftError>() {
            Ok(weft) => weft,
            Err(other) => WeftError::User(other),
        }
    }

    /// Shorthand for a definition error
    pub fn definition(id: impl Into<String>, reason: impl Into<String>) -> Self {
        WeftError::DefinitionInvalid {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

impl FixHint for WeftError {
    fn hint(&self) -> Option<&str> {
        Some(match self {
            WeftError::DefinitionInvalid { .. } => {
                "Check the builder calls: every unit needs a valid id and its required fields"
            }
            WeftError::RegistrationMissing { .. } => {
                "Register the dependency in the same resource or a visible ancestor"
            }
            WeftError::UnknownUnit { .. } => {
                "Check the id spelling, and that the unit is registered under the booted root"
            }
            WeftError::VisibilityViolation { .. } => {
                "Add the id to the `exports` list of every resource between its registrar and \
                 the consumer"
            }
            WeftError::DependencyCycle { .. } => {
                "Break the cycle: extract the shared part into a resource both sides depend on"
            }
            WeftError::SchemaRejected { .. } => {
                "Make the value match the declared JSON schema, or relax the schema"
            }
            WeftError::TaskTimeout { .. } => {
                "Raise the timeout middleware budget or split the task"
            }
            WeftError::AccessViolation { .. } => {
                "Add the id to the root resource's `exports`, or omit `exports` to expose \
                 everything"
            }
            WeftError::EventCycle { .. } => {
                "Stop re-emitting the event from its own handler, or mark the hook with \
                 `emits_same_event` if the re-emission is idempotent"
            }
            WeftError::ContextMissing { .. } => {
                "Wrap the call in `Context::provide(key, value, ...)`"
            }
            WeftError::QueueCancelled => "The queue was disposed with cancel; nothing to fix here",
            WeftError::Disposed => "Boot a fresh runtime; disposed runtimes are terminal",
            WeftError::NotInitialized { .. } => {
                "Use `lazy_resource_value` in lazy mode, or boot without `dry_run`"
            }
            WeftError::InitFailed { .. } => {
                "Inspect the per-resource causes; already-initialized resources were disposed"
            }
            WeftError::DisposeFailed { .. } => {
                "Inspect the per-resource causes; all disposers were attempted"
            }
            WeftError::OptionalDependencyMissing { .. } => {
                "Install the optional package, or switch to the in-memory backend"
            }
            WeftError::OptionalDependencyInvalidExport { .. } => {
                "The backend factory is malformed; check the registered backend"
            }
            WeftError::Durable(e) => return e.hint(),
            WeftError::User(_) => return None,
        })
    }
}

fn format_chain(chain: &[UnitId]) -> String {
    chain
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_failures(failures: &[(UnitId, String)]) -> String {
    failures
        .iter()
        .map(|(id, msg)| format!("{}: {}", id, msg))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Format an error with its fix hint for display
pub fn format_error_with_hint<E: std::error::Error + FixHint>(error: &E) -> String {
    let mut result = error.to_string();
    if let Some(hint) = error.hint() {
        result.push_str("\n  Fix: ");
        result.push_str(hint);
    }
    result
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    #[test]
    fn kind_codes_are_stable() {
        let err = WeftError::SchemaRejected {
            target: ValidationTarget::TaskInput,
            unit: id("t"),
            message: "oops".into(),
        };
        assert_eq!(err.kind(), "task.input");
        assert_eq!(
            WeftError::DependencyCycle { chain: vec![] }.kind(),
            "dependency.cycle"
        );
        assert_eq!(WeftError::QueueCancelled.kind(), "queue.cancelled");
    }

    #[test]
    fn cycle_message_lists_full_chain() {
        let err = WeftError::DependencyCycle {
            chain: vec![id("a"), id("b"), id("a")],
        };
        assert_eq!(
            err.to_string(),
            "[dependency.cycle] cyclic dependency: a -> b -> a"
        );
    }

    #[test]
    fn access_violation_lists_exports() {
        let err = WeftError::AccessViolation {
            target: id("t"),
            root: id("app"),
            exported: vec![id("x"), id("y")],
        };
        let msg = err.to_string();
        assert!(msg.contains("runtime.accessViolation"));
        assert!(msg.contains("[x, y]"));
    }

    #[test]
    fn every_core_variant_has_a_hint() {
        let errors = vec![
            WeftError::definition("t", "missing id"),
            WeftError::RegistrationMissing {
                id: id("dep"),
                required_by: id("t"),
            },
            WeftError::VisibilityViolation {
                target: id("x"),
                owner: id("inner"),
                consumer: id("outer"),
            },
            WeftError::DependencyCycle { chain: vec![] },
            WeftError::TaskTimeout {
                task: id("t"),
                after_ms: 100,
            },
            WeftError::EventCycle { chain: vec![] },
            WeftError::ContextMissing { key: "user".into() },
            WeftError::QueueCancelled,
            WeftError::Disposed,
        ];
        for err in errors {
            assert!(err.hint().is_some(), "missing hint for: {:?}", err);
        }
    }

    #[test]
    fn format_with_hint_appends_fix() {
        let err = WeftError::ContextMissing { key: "user".into() };
        let formatted = format_error_with_hint(&err);
        assert!(formatted.contains("context.missing"));
        assert!(formatted.contains("Fix:"));
    }

    #[test]
    fn user_errors_pass_through() {
        let err: WeftError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind(), "user");
        assert_eq!(err.to_string(), "boom");
        assert!(err.hint().is_none());
    }
}
