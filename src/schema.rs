//! JSON Schema validation seam (v0.1)
//!
//! Wraps `jsonschema` compilation behind one cloneable type so unit
//! definitions can carry `inputSchema`/`resultSchema`/`payloadSchema`/
//! `configSchema` without exposing the validator crate at the API surface.

use std::fmt;
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::{ValidationTarget, WeftError};
use crate::types::UnitId;

/// A compiled JSON schema attached to a unit definition
#[derive(Clone)]
pub struct Schema {
    raw: Arc<Value>,
    compiled: Arc<JSONSchema>,
}

impl Schema {
    /// Compile a schema document
    ///
    /// Compilation failures are definition errors: the author handed a
    /// malformed schema to a constructor.
    pub fn compile(raw: Value) -> Result<Self, WeftError> {
        let compiled = JSONSchema::compile(&raw).map_err(|e| WeftError::DefinitionInvalid {
            id: "<schema>".into(),
            reason: format!("invalid JSON schema: {}", e),
        })?;
        Ok(Self {
            raw: Arc::new(raw),
            compiled: Arc::new(compiled),
        })
    }

    /// The original schema document
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Validate an instance, joining all violations into one message
    pub fn check(&self, instance: &Value) -> Result<(), String> {
        match self.compiled.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let joined = errors
                    .map(|e| format!("{} (at {})", e, e.instance_path))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(joined)
            }
        }
    }

    /// Validate and map failure to the dotted error kind for `target`
    pub fn check_for(
        &self,
        instance: &Value,
        target: ValidationTarget,
        unit: &UnitId,
    ) -> Result<(), WeftError> {
        self.check(instance)
            .map_err(|message| WeftError::SchemaRejected {
                target,
                unit: unit.clone(),
                message,
            })
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("raw", &self.raw).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compile_and_accept() {
        let schema = Schema::compile(json!({"type": "object", "required": ["v"]})).unwrap();
        assert!(schema.check(&json!({"v": 1})).is_ok());
    }

    #[test]
    fn reject_with_joined_message() {
        let schema = Schema::compile(json!({
            "type": "object",
            "properties": {"v": {"type": "number"}},
            "required": ["v"]
        }))
        .unwrap();

        let err = schema.check(&json!({"v": "x"})).unwrap_err();
        assert!(err.contains("\"x\""));
    }

    #[test]
    fn invalid_schema_is_definition_error() {
        let err = Schema::compile(json!({"type": "not-a-type"})).unwrap_err();
        assert_eq!(err.kind(), "definition.invalid");
    }

    #[test]
    fn check_for_maps_to_validation_kind() {
        let schema = Schema::compile(json!({"type": "number"})).unwrap();
        let unit = UnitId::new("t").unwrap();
        let err = schema
            .check_for(&json!("nope"), ValidationTarget::TaskInput, &unit)
            .unwrap_err();
        assert_eq!(err.kind(), "task.input");
    }
}
