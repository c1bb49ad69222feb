//! Idempotent graph writes
//!
//! A [`GraphWriter`] hands out one [`GraphSession`] per worker. Both session
//! operations are upserts keyed by a natural key, so replaying them after a
//! resume leaves the graph unchanged.

mod cypher;
mod memory;

pub use cypher::{CypherHttpWriter, Neo4jConfig};
pub use memory::{GraphSnapshot, MemoryGraph, NodeKey, RelationshipKey};

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GraphError;

/// Node properties as written to the store
pub type Properties = serde_json::Map<String, Value>;

/// A node addressed by label and natural key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub label: String,
    pub key_field: String,
    pub key_value: String,
}

impl NodeRef {
    pub fn new(
        label: impl Into<String>,
        key_field: impl Into<String>,
        key_value: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            key_field: key_field.into(),
            key_value: key_value.into(),
        }
    }
}

/// Factory for per-worker sessions
#[async_trait]
pub trait GraphWriter: Send + Sync {
    /// Open a session owned exclusively by the caller
    async fn open_session(&self) -> Result<Box<dyn GraphSession>, GraphError>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Upsert primitives; a session is never shared between workers
#[async_trait]
pub trait GraphSession: Send {
    /// Create or update the node `label` whose `key_field` equals
    /// `properties[key_field]`, merging `properties` into it.
    async fn upsert_node(
        &mut self,
        label: &str,
        key_field: &str,
        properties: &Properties,
    ) -> Result<(), GraphError>;

    /// Create the relationship if both endpoints exist; a missing endpoint
    /// leaves the graph unchanged.
    async fn upsert_relationship(
        &mut self,
        from: &NodeRef,
        to: &NodeRef,
        relation_type: &str,
    ) -> Result<(), GraphError>;

    /// The subset of `keys` for which a `label` node keyed by `key_field`
    /// already exists
    async fn existing_keys(
        &mut self,
        label: &str,
        key_field: &str,
        keys: &[String],
    ) -> Result<HashSet<String>, GraphError>;
}

/// Reject labels, keys and relation types that are not plain identifiers.
///
/// Identifiers are interpolated into statements, values never are.
pub fn validate_identifier(kind: &str, ident: &str) -> Result<(), GraphError> {
    let mut chars = ident.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(GraphError::rejected(format!("invalid {kind} '{ident}'")))
    }
}

/// Natural key of `properties[key_field]` as a string.
///
/// Numbers and strings are accepted; anything else is not a usable key.
pub fn key_value(properties: &Properties, key_field: &str) -> Option<String> {
    match properties.get(key_field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
