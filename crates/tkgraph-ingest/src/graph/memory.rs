//! In-process graph used by tests and `--dry-run`

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{key_value, validate_identifier, GraphSession, GraphWriter, NodeRef, Properties};
use crate::error::GraphError;

/// `(label, key value)`
pub type NodeKey = (String, String);

/// `(from, relation type, to)`
pub type RelationshipKey = (NodeKey, String, NodeKey);

/// Point-in-time copy of the graph, comparable with `==`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<NodeKey, Properties>,
    pub relationships: BTreeSet<RelationshipKey>,
}

impl GraphSnapshot {
    pub fn node(&self, label: &str, key: &str) -> Option<&Properties> {
        self.nodes.get(&(label.to_string(), key.to_string()))
    }

    pub fn count_label(&self, label: &str) -> usize {
        self.nodes.keys().filter(|(l, _)| l == label).count()
    }
}

#[derive(Debug, Default)]
struct GraphState {
    graph: GraphSnapshot,
    node_writes: BTreeMap<NodeKey, u64>,
    sessions_opened: u64,
}

/// Idempotent in-memory graph store
#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    state: Arc<Mutex<GraphState>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> GraphSnapshot {
        self.state.lock().await.graph.clone()
    }

    /// How many times the node was upserted
    pub async fn node_writes(&self, label: &str, key: &str) -> u64 {
        self.state
            .lock()
            .await
            .node_writes
            .get(&(label.to_string(), key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total node upserts across all keys
    pub async fn total_node_writes(&self) -> u64 {
        self.state.lock().await.node_writes.values().sum()
    }

    pub async fn sessions_opened(&self) -> u64 {
        self.state.lock().await.sessions_opened
    }
}

#[async_trait]
impl GraphWriter for MemoryGraph {
    async fn open_session(&self) -> Result<Box<dyn GraphSession>, GraphError> {
        self.state.lock().await.sessions_opened += 1;
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    state: Arc<Mutex<GraphState>>,
}

#[async_trait]
impl GraphSession for MemorySession {
    async fn upsert_node(
        &mut self,
        label: &str,
        key_field: &str,
        properties: &Properties,
    ) -> Result<(), GraphError> {
        validate_identifier("label", label)?;
        validate_identifier("key field", key_field)?;
        let key = key_value(properties, key_field).ok_or_else(|| {
            GraphError::rejected(format!("{label} node has no usable '{key_field}' value"))
        })?;

        let node_key = (label.to_string(), key);
        let mut state = self.state.lock().await;
        *state.node_writes.entry(node_key.clone()).or_default() += 1;
        let node = state.graph.nodes.entry(node_key).or_default();
        for (field, value) in properties {
            node.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn upsert_relationship(
        &mut self,
        from: &NodeRef,
        to: &NodeRef,
        relation_type: &str,
    ) -> Result<(), GraphError> {
        validate_identifier("label", &from.label)?;
        validate_identifier("label", &to.label)?;
        validate_identifier("relation type", relation_type)?;

        let from_key = (from.label.clone(), from.key_value.clone());
        let to_key = (to.label.clone(), to.key_value.clone());

        let mut state = self.state.lock().await;
        let both_exist = state.graph.nodes.contains_key(&from_key)
            && state.graph.nodes.contains_key(&to_key);
        if both_exist {
            state
                .graph
                .relationships
                .insert((from_key, relation_type.to_string(), to_key));
        }
        Ok(())
    }

    async fn existing_keys(
        &mut self,
        label: &str,
        key_field: &str,
        keys: &[String],
    ) -> Result<HashSet<String>, GraphError> {
        validate_identifier("label", label)?;
        validate_identifier("key field", key_field)?;

        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .filter(|key| {
                state
                    .graph
                    .nodes
                    .contains_key(&(label.to_string(), (*key).clone()))
            })
            .cloned()
            .collect())
    }
}
