//! Entity mutations as seen by cascade rules.

use serde::Serialize;
use serde_json::Value as JsonValue;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Created,
    Updated,
    Deleted,
}

/// A committed-or-about-to-commit change to one business entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mutation {
    pub entity_type: String,
    pub operation: Operation,
    /// The entity after the change (before it, for deletes).
    pub entity: JsonValue,
}

impl Mutation {
    pub fn new(entity_type: impl Into<String>, operation: Operation, entity: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            entity_type: entity_type.into(),
            operation,
            entity: serde_json::to_value(entity)?,
        })
    }

    pub fn created(entity_type: impl Into<String>, entity: &impl Serialize) -> Result<Self, serde_json::Error> {
        Self::new(entity_type, Operation::Created, entity)
    }

    pub fn updated(entity_type: impl Into<String>, entity: &impl Serialize) -> Result<Self, serde_json::Error> {
        Self::new(entity_type, Operation::Updated, entity)
    }

    pub fn deleted(entity_type: impl Into<String>, entity: &impl Serialize) -> Result<Self, serde_json::Error> {
        Self::new(entity_type, Operation::Deleted, entity)
    }
}
