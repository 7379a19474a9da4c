//! Typed labels with optional config payload (v0.1)
//!
//! Tags classify units for indexed lookup (`tasks_with_tag`) and carry a
//! JSON config payload readable back through [`Tag::extract`].

use serde_json::Value;

use crate::types::{Meta, UnitId};

/// A typed label attachable to any unit
///
/// Two tags are the "same tag" when their ids match; the config payload is
/// per-attachment, so `tag.with(config)` produces a distinct attachment of
/// the same tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub id: UnitId,
    pub meta: Meta,
    pub config: Option<Value>,
}

impl Tag {
    /// Create a bare tag
    pub fn new(id: UnitId) -> Self {
        Self {
            id,
            meta: Meta::default(),
            config: None,
        }
    }

    /// Attach a config payload, producing a distinct attachment of this tag
    pub fn with(&self, config: Value) -> Tag {
        Tag {
            id: self.id.clone(),
            meta: self.meta.clone(),
            config: Some(config),
        }
    }

    /// Read this tag's config payload back from a unit's tag list
    ///
    /// Returns `None` when the unit does not carry the tag; `Some(Value::Null)`
    /// when it carries the tag without config.
    pub fn extract(&self, tags: &[Tag]) -> Option<Value> {
        tags.iter()
            .find(|t| t.id == self.id)
            .map(|t| t.config.clone().unwrap_or(Value::Null))
    }

    /// Check whether a tag list carries this tag
    pub fn is_on(&self, tags: &[Tag]) -> bool {
        tags.iter().any(|t| t.id == self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tag(id: &str) -> Tag {
        Tag::new(UnitId::new(id).unwrap())
    }

    #[test]
    fn extract_missing_tag() {
        let cache = tag("cache");
        assert_eq!(cache.extract(&[]), None);
    }

    #[test]
    fn extract_bare_attachment() {
        let cache = tag("cache");
        let tags = vec![cache.clone()];
        assert_eq!(cache.extract(&tags), Some(Value::Null));
    }

    #[test]
    fn extract_config_payload() {
        let cache = tag("cache");
        let tags = vec![cache.with(json!({"ttl": 60}))];
        assert_eq!(cache.extract(&tags), Some(json!({"ttl": 60})));
    }

    #[test]
    fn with_preserves_identity() {
        let cache = tag("cache");
        let configured = cache.with(json!(1));
        assert_eq!(configured.id, cache.id);
        assert!(configured.is_on(&[cache]));
    }
}
