//! Ambient execution context (v0.1)
//!
//! A key→value carrier scoped to an async call chain, implemented with
//! tokio task-locals. `provide` makes a value visible to all nested calls
//! of the wrapped future, across awaits on the same logical chain; each
//! top-level surface call is a fresh chain root.
//!
//! The same machinery carries the per-chain emission state the event
//! manager uses for runtime cycle detection, so concurrent emissions on
//! different chains never interfere.

use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;

use crate::error::WeftError;
use crate::types::UnitId;

tokio::task_local! {
    static AMBIENT: HashMap<String, Value>;
    static EMISSION: EmissionScope;
}

// ============================================================================
// PUBLIC CONTEXT API
// ============================================================================

/// Ambient key→value carrier for the current async chain
pub struct Context;

impl Context {
    /// Run `f` with `key = value` visible to all nested calls
    pub async fn provide<F>(key: impl Into<String>, value: Value, f: F) -> F::Output
    where
        F: Future,
    {
        let mut map = Self::snapshot();
        map.insert(key.into(), value);
        AMBIENT.scope(map, f).await
    }

    /// Run `f` with several entries visible at once
    pub async fn provide_all<F>(entries: Vec<(String, Value)>, f: F) -> F::Output
    where
        F: Future,
    {
        let mut map = Self::snapshot();
        map.extend(entries);
        AMBIENT.scope(map, f).await
    }

    /// Read a value from the current chain, if provided
    pub fn get(key: &str) -> Option<Value> {
        AMBIENT
            .try_with(|map| map.get(key).cloned())
            .ok()
            .flatten()
    }

    /// Read a required value; absent → `context.missing`
    pub fn require(key: &str) -> Result<Value, WeftError> {
        Self::get(key).ok_or_else(|| WeftError::ContextMissing {
            key: key.to_string(),
        })
    }

    /// Whether any value is provided under `key` on this chain
    pub fn has(key: &str) -> bool {
        Self::get(key).is_some()
    }

    fn snapshot() -> HashMap<String, Value> {
        AMBIENT.try_with(Clone::clone).unwrap_or_default()
    }
}

// ============================================================================
// EMISSION SCOPE (crate-internal)
// ============================================================================

/// Per-chain emission state for runtime cycle detection
#[derive(Debug, Clone, Default)]
pub(crate) struct EmissionScope {
    /// Event ids currently being emitted on this chain, outermost first
    pub chain: Vec<UnitId>,
    /// The hook currently being dispatched, if any
    pub current_hook: Option<UnitId>,
    /// Whether the current hook carries the idempotency marker
    pub hook_allows_reemit: bool,
}

impl EmissionScope {
    /// How many times `event` already appears on this chain
    pub fn occurrences(&self, event: &UnitId) -> usize {
        self.chain.iter().filter(|id| *id == event).count()
    }
}

/// Snapshot of the current chain's emission state (default at chain root)
pub(crate) fn emission_scope() -> EmissionScope {
    EMISSION.try_with(Clone::clone).unwrap_or_default()
}

/// Run `f` under the given emission scope
pub(crate) async fn with_emission_scope<F>(scope: EmissionScope, f: F) -> F::Output
where
    F: Future,
{
    EMISSION.scope(scope, f).await
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn provide_and_get() {
        assert_eq!(Context::get("user"), None);

        Context::provide("user", json!({"id": 7}), async {
            assert_eq!(Context::get("user"), Some(json!({"id": 7})));

            // Nested provide shadows without clobbering the outer chain
            Context::provide("user", json!("inner"), async {
                assert_eq!(Context::get("user"), Some(json!("inner")));
            })
            .await;

            assert_eq!(Context::get("user"), Some(json!({"id": 7})));
        })
        .await;

        assert_eq!(Context::get("user"), None);
    }

    #[tokio::test]
    async fn provide_survives_awaits() {
        Context::provide("req", json!("abc"), async {
            tokio::task::yield_now().await;
            assert_eq!(Context::get("req"), Some(json!("abc")));
        })
        .await;
    }

    #[tokio::test]
    async fn require_missing_fails() {
        let err = Context::require("absent").unwrap_err();
        assert_eq!(err.kind(), "context.missing");
    }

    #[tokio::test]
    async fn provide_all_extends() {
        Context::provide("a", json!(1), async {
            Context::provide_all(
                vec![("b".to_string(), json!(2)), ("c".to_string(), json!(3))],
                async {
                    assert_eq!(Context::get("a"), Some(json!(1)));
                    assert_eq!(Context::get("b"), Some(json!(2)));
                    assert_eq!(Context::get("c"), Some(json!(3)));
                },
            )
            .await;
        })
        .await;
    }

    #[tokio::test]
    async fn separate_chains_do_not_interfere() {
        let a = tokio::spawn(Context::provide("who", json!("a"), async {
            tokio::task::yield_now().await;
            Context::get("who")
        }));
        let b = tokio::spawn(Context::provide("who", json!("b"), async {
            tokio::task::yield_now().await;
            Context::get("who")
        }));

        assert_eq!(a.await.unwrap(), Some(json!("a")));
        assert_eq!(b.await.unwrap(), Some(json!("b")));
    }

    #[tokio::test]
    async fn emission_scope_tracks_occurrences() {
        let id = UnitId::new("ping").unwrap();
        let mut scope = emission_scope();
        assert_eq!(scope.occurrences(&id), 0);

        scope.chain.push(id.clone());
        with_emission_scope(scope, async {
            let inner = emission_scope();
            assert_eq!(inner.occurrences(&UnitId::new("ping").unwrap()), 1);
        })
        .await;
    }
}
