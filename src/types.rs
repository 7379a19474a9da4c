//! NewType wrappers for the unit namespace (v0.1)
//!
//! Provides zero-cost abstractions for identifiers shared by every unit
//! family, preventing type confusion and keeping validation in one place.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// UNIT ID
// ============================================================================

/// Permitted identifier shape: segments of word characters separated by
/// dots, dashes or colons (`app.tasks.send-email`, `greet:onError`).
static UNIT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.:\-]*$").expect("valid unit id pattern"));

/// Strongly-typed unit identifier
///
/// Guarantees:
/// - Non-empty, starts with a word character
/// - Valid characters (alphanumeric, dash, underscore, dot, colon)
/// - Maximum 128 characters
///
/// Backed by `Arc<str>` so clones are pointer copies; ids travel through
/// registries, dependency edges and event envelopes constantly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(Arc<str>);

impl UnitId {
    /// Maximum allowed length
    pub const MAX_LENGTH: usize = 128;

    /// Create a new UnitId with validation
    pub fn new(id: impl AsRef<str>) -> Result<Self, UnitIdError> {
        let id = id.as_ref();

        if id.is_empty() {
            return Err(UnitIdError::Empty);
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(UnitIdError::TooLong(id.len()));
        }
        if !UNIT_ID_PATTERN.is_match(id) {
            return Err(UnitIdError::InvalidCharacters(id.to_string()));
        }

        Ok(UnitId(Arc::from(id)))
    }

    /// Get as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a companion id in the same namespace (`greet` → `greet:onError`)
    pub(crate) fn companion(&self, suffix: &str) -> UnitId {
        UnitId(Arc::from(format!("{}:{}", self.0, suffix)))
    }
}

impl Deref for UnitId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UnitId {
    type Err = UnitIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UnitId::new(s)
    }
}

impl PartialEq<str> for UnitId {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for UnitId {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl Serialize for UnitId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UnitId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UnitId::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Validation errors for unit identifiers
#[derive(Debug, Clone, Error, PartialEq)]
pub enum UnitIdError {
    #[error("unit id cannot be empty")]
    Empty,

    #[error("unit id too long: {0} chars (max {})", UnitId::MAX_LENGTH)]
    TooLong(usize),

    #[error("unit id '{0}' contains invalid characters")]
    InvalidCharacters(String),
}

// ============================================================================
// UNIT KIND
// ============================================================================

/// The seven unit families of the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitKind {
    Task,
    Resource,
    Event,
    Hook,
    TaskMiddleware,
    ResourceMiddleware,
    Tag,
}

impl UnitKind {
    /// Human-readable family name used in error messages
    pub fn family(&self) -> &'static str {
        match self {
            UnitKind::Task => "task",
            UnitKind::Resource => "resource",
            UnitKind::Event => "event",
            UnitKind::Hook => "hook",
            UnitKind::TaskMiddleware => "task middleware",
            UnitKind::ResourceMiddleware => "resource middleware",
            UnitKind::Tag => "tag",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.family())
    }
}

// ============================================================================
// META
// ============================================================================

/// Free-form descriptive metadata carried by any unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl Meta {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            description: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(UnitId::new("analyze").is_ok());
        assert!(UnitId::new("app.tasks.send-email").is_ok());
        assert!(UnitId::new("greet:onError").is_ok());
        assert!(UnitId::new("step_1").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(UnitId::new(""), Err(UnitIdError::Empty));
    }

    #[test]
    fn rejects_too_long() {
        let id = "x".repeat(129);
        assert!(matches!(UnitId::new(&id), Err(UnitIdError::TooLong(129))));
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(matches!(
            UnitId::new("my task"),
            Err(UnitIdError::InvalidCharacters(_))
        ));
        assert!(matches!(
            UnitId::new("-leading-dash"),
            Err(UnitIdError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn companion_derivation() {
        let id = UnitId::new("greet").unwrap();
        assert_eq!(id.companion("onError").as_str(), "greet:onError");
    }

    #[test]
    fn clone_is_pointer_copy() {
        let id = UnitId::new("shared").unwrap();
        let copy = id.clone();
        assert_eq!(id, copy);
        assert_eq!(id.as_str() as *const str, copy.as_str() as *const str);
    }

    #[test]
    fn serde_round_trip() {
        let id = UnitId::new("app.cache").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"app.cache\"");
        let back: UnitId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn unit_kind_family_names() {
        assert_eq!(UnitKind::Task.family(), "task");
        assert_eq!(UnitKind::ResourceMiddleware.family(), "resource middleware");
    }
}
