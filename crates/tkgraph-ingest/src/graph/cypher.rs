//! Neo4j writer over the HTTP transactional endpoint
//!
//! Each upsert is a single auto-committed `MERGE` statement posted to
//! `{uri}/db/{database}/tx/commit`. Labels, key fields and relation types are
//! validated identifiers; values always travel as parameters.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tkgraph_common::env::env_string;
use tracing::{debug, info};

use super::{key_value, validate_identifier, GraphSession, GraphWriter, NodeRef, Properties};
use crate::error::GraphError;

/// Connection settings for the graph HTTP endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:7474".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
        }
    }
}

impl Neo4jConfig {
    /// Load from `NEO4J_URI`, `NEO4J_USER`, `NEO4J_PASSWORD`, `NEO4J_DATABASE`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            uri: env_string("NEO4J_URI", &defaults.uri),
            user: env_string("NEO4J_USER", &defaults.user),
            password: env_string("NEO4J_PASSWORD", &defaults.password),
            database: env_string("NEO4J_DATABASE", &defaults.database),
        }
    }

    fn commit_endpoint(&self) -> String {
        format!(
            "{}/db/{}/tx/commit",
            self.uri.trim_end_matches('/'),
            self.database
        )
    }
}

/// Graph writer that issues Cypher `MERGE` statements over HTTP
#[derive(Debug, Clone)]
pub struct CypherHttpWriter {
    client: reqwest::Client,
    config: Neo4jConfig,
}

impl CypherHttpWriter {
    pub fn new(client: reqwest::Client, config: Neo4jConfig) -> Self {
        info!(uri = %config.uri, database = %config.database, "Using Neo4j HTTP writer");
        Self { client, config }
    }
}

#[async_trait]
impl GraphWriter for CypherHttpWriter {
    async fn open_session(&self) -> Result<Box<dyn GraphSession>, GraphError> {
        Ok(Box::new(CypherSession {
            client: self.client.clone(),
            endpoint: self.config.commit_endpoint(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            statements: 0,
        }))
    }

    fn backend(&self) -> &'static str {
        "neo4j-http"
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<CypherError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    data: Vec<ResultRow>,
}

#[derive(Debug, Deserialize)]
struct ResultRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CypherError {
    code: String,
    message: String,
}

struct CypherSession {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    statements: u64,
}

impl CypherSession {
    /// Run one statement; returns the rows of its result
    async fn execute(&mut self, statement: String, parameters: Value) -> Result<Vec<Vec<Value>>, GraphError> {
        let body = json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphError::unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GraphError::SessionLost(format!(
                "authentication rejected ({status})"
            )));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(GraphError::unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(GraphError::rejected(format!("HTTP {status}")));
        }

        let parsed: CommitResponse = response
            .json()
            .await
            .map_err(|e| GraphError::unavailable(format!("unreadable response: {e}")))?;

        self.statements += 1;
        match parsed.errors.into_iter().next() {
            None => Ok(parsed
                .results
                .into_iter()
                .next()
                .map(|result| result.data.into_iter().map(|r| r.row).collect())
                .unwrap_or_default()),
            Some(err) if err.code.contains(".TransientError.") => Err(GraphError::unavailable(
                format!("{}: {}", err.code, err.message),
            )),
            Some(err) => Err(GraphError::rejected(format!("{}: {}", err.code, err.message))),
        }
    }
}

impl Drop for CypherSession {
    fn drop(&mut self) {
        debug!(statements = self.statements, "Closing Neo4j session");
    }
}

#[async_trait]
impl GraphSession for CypherSession {
    async fn upsert_node(
        &mut self,
        label: &str,
        key_field: &str,
        properties: &Properties,
    ) -> Result<(), GraphError> {
        validate_identifier("label", label)?;
        validate_identifier("key field", key_field)?;
        let key = match properties.get(key_field) {
            Some(value) if key_value(properties, key_field).is_some() => value.clone(),
            _ => {
                return Err(GraphError::rejected(format!(
                    "{label} node has no usable '{key_field}' value"
                )))
            }
        };

        self.execute(
            node_statement(label, key_field),
            json!({ "key_val": key, "props": properties }),
        )
        .await
        .map(|_| ())
    }

    async fn upsert_relationship(
        &mut self,
        from: &NodeRef,
        to: &NodeRef,
        relation_type: &str,
    ) -> Result<(), GraphError> {
        for node in [from, to] {
            validate_identifier("label", &node.label)?;
            validate_identifier("key field", &node.key_field)?;
        }
        validate_identifier("relation type", relation_type)?;

        self.execute(
            relationship_statement(from, to, relation_type),
            json!({ "from_val": from.key_value, "to_val": to.key_value }),
        )
        .await
        .map(|_| ())
    }

    async fn existing_keys(
        &mut self,
        label: &str,
        key_field: &str,
        keys: &[String],
    ) -> Result<HashSet<String>, GraphError> {
        validate_identifier("label", label)?;
        validate_identifier("key field", key_field)?;
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let rows = self
            .execute(existence_statement(label, key_field), json!({ "keys": keys }))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next()? {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect())
    }
}

fn node_statement(label: &str, key_field: &str) -> String {
    format!("MERGE (n:`{label}` {{`{key_field}`: $key_val}}) SET n += $props")
}

fn relationship_statement(from: &NodeRef, to: &NodeRef, relation_type: &str) -> String {
    format!(
        "MATCH (a:`{}` {{`{}`: $from_val}}) MATCH (b:`{}` {{`{}`: $to_val}}) MERGE (a)-[:`{}`]->(b)",
        from.label, from.key_field, to.label, to.key_field, relation_type
    )
}

fn existence_statement(label: &str, key_field: &str) -> String {
    format!("MATCH (n:`{label}`) WHERE n.`{key_field}` IN $keys RETURN n.`{key_field}`")
}
