//! HTTP boundary (v0.1)
//!
//! The wire contract shared by the exposure server and the tunnel client:
//! `POST {base}/task/{id}` and `POST {base}/event/{id}`, token auth in a
//! configurable header, `{ok: true, result}` / `{ok: false, error}`
//! response envelopes, and the `tunnel` tag whose config drives the
//! exposure allow-list.

pub mod expose;
pub mod tunnel;

use std::collections::HashSet;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::UnitStore;
use crate::tag::Tag;
use crate::types::UnitId;

pub use expose::{serve, ExposureConfig};
pub use tunnel::TunnelClient;

/// Default shared-secret header
pub const DEFAULT_TOKEN_HEADER: &str = "x-runner-token";

/// Default route prefix
pub const DEFAULT_BASE_PATH: &str = "/__runtime";

// ============================================================================
// WIRE BODIES
// ============================================================================

/// `POST {base}/task/{id}` request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// `POST {base}/event/{id}` request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventRequestBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Multipart task calls carry the JSON manifest in this field
pub const MANIFEST_FIELD: &str = "__manifest";

// ============================================================================
// TUNNEL POLICY
// ============================================================================

static TUNNEL_TAG: Lazy<Tag> =
    Lazy::new(|| Tag::new(UnitId::new("tunnel").expect("valid built-in tag id")));

/// The built-in `tunnel` tag; attach with a [`TunnelPolicy`] config
pub fn tunnel_tag() -> Tag {
    TUNNEL_TAG.clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    Server,
    Client,
}

/// Config payload of the `tunnel` tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelPolicy {
    pub mode: TunnelMode,
    /// Only `"http"` is defined today
    pub transport: String,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

impl TunnelPolicy {
    pub fn server(tasks: Vec<String>, events: Vec<String>) -> Self {
        Self {
            mode: TunnelMode::Server,
            transport: "http".into(),
            tasks,
            events,
        }
    }

    pub fn client(tasks: Vec<String>, events: Vec<String>) -> Self {
        Self {
            mode: TunnelMode::Client,
            transport: "http".into(),
            tasks,
            events,
        }
    }

    pub fn to_config(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Union of the `tasks`/`events` declared by server-mode tunnel resources.
/// `None` when no tunnel resource exists - then nothing is restricted.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    tasks: HashSet<String>,
    events: HashSet<String>,
}

impl AllowList {
    pub fn allows_task(&self, id: &str) -> bool {
        self.tasks.contains(id)
    }

    pub fn allows_event(&self, id: &str) -> bool {
        self.events.contains(id)
    }
}

/// Compute the exposure allow-list from the store's tunnel-tagged
/// resources
pub fn server_allow_list(store: &UnitStore) -> Option<AllowList> {
    let tag = tunnel_tag();
    let mut list = AllowList::default();
    let mut found = false;

    for resource in store.resources_with_tag(&tag.id) {
        let Some(config) = tag.extract(&resource.tags) else {
            continue;
        };
        let Ok(policy) = serde_json::from_value::<TunnelPolicy>(config) else {
            continue;
        };
        if policy.mode != TunnelMode::Server {
            continue;
        }
        found = true;
        list.tasks.extend(policy.tasks);
        list.events.extend(policy.events);
    }

    found.then_some(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::resource;
    use crate::store::StoredUnit;
    use crate::unit::UnitDef;

    #[test]
    fn policy_round_trips_through_tag_config() {
        let policy = TunnelPolicy::server(vec!["t1".into()], vec!["e1".into()]);
        let tag = tunnel_tag().with(policy.to_config());

        let extracted = tunnel_tag().extract(&[tag]).unwrap();
        let back: TunnelPolicy = serde_json::from_value(extracted).unwrap();
        assert_eq!(back.mode, TunnelMode::Server);
        assert_eq!(back.tasks, vec!["t1".to_string()]);
    }

    #[test]
    fn allow_list_unions_server_policies() {
        let store = UnitStore::new();
        let server = resource("edge")
            .tag(tunnel_tag().with(TunnelPolicy::server(
                vec!["a".into()],
                vec!["e".into()],
            ).to_config()))
            .build()
            .unwrap();
        let client = resource("remote")
            .tag(tunnel_tag().with(TunnelPolicy::client(
                vec!["z".into()],
                vec![],
            ).to_config()))
            .build()
            .unwrap();
        for def in [server, client] {
            store.insert(StoredUnit {
                def: UnitDef::Resource(def),
                config: None,
                owner: None,
                depth: 0,
                exported_from: Default::default(),
            });
        }

        let allow = server_allow_list(&store).unwrap();
        assert!(allow.allows_task("a"));
        assert!(allow.allows_event("e"));
        // Client-mode declarations do not widen the server allow-list.
        assert!(!allow.allows_task("z"));
    }

    #[test]
    fn no_tunnel_resources_means_no_restriction() {
        let store = UnitStore::new();
        assert!(server_allow_list(&store).is_none());
    }
}
