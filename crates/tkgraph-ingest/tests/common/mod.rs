//! Shared fixtures and test doubles for ingest integration tests
//!
//! Each test file pulls this in with `mod common;` and uses what it needs.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tkgraph_ingest::checkpoint::{
    CheckpointRecord, CheckpointStore, MemoryCheckpointStore, RunRecord,
};
use tkgraph_ingest::error::{FetchError, GraphError};
use tkgraph_ingest::framework::{ItemOutcome, ItemProcessor};
use tkgraph_ingest::graph::{GraphSession, GraphWriter, MemoryGraph, NodeRef, Properties};
use tkgraph_ingest::loaders::{EntitySpec, RelationDescriptor};
use tkgraph_ingest::source::{DataSource, Item, MemorySource, Page, PageRequest};
use tokio_util::sync::CancellationToken;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tkgraph_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Natural key of the `i`-th fixture zaak (1-based)
pub fn zaak_nummer(i: usize) -> String {
    format!("2024Z{i:05}")
}

/// `n` zaak records, each embedding one document
pub fn zaak_items(n: usize) -> Vec<Item> {
    (1..=n)
        .map(|i| {
            Item::new(json!({
                "Id": format!("zaak-{i}"),
                "Nummer": zaak_nummer(i),
                "Onderwerp": format!("Onderwerp {i}"),
                "GestartOp": "2024-03-01T10:00:00+01:00",
                "Document": [{"Id": format!("doc-{i}"), "Titel": format!("Document {i}")}]
            }))
        })
        .collect()
}

/// `zaken` loader spec used across tests: keyed by `nummer`, linking to the
/// embedded documents
pub fn zaak_spec() -> EntitySpec {
    EntitySpec::new("zaken", "Zaken", "Zaak", "Zaak", "nummer")
        .date_field("GestartOp")
        .relation(RelationDescriptor::expanded(
            "Document",
            "Document",
            "HAS_DOCUMENT",
            "id",
        ))
}

pub fn zaak_source(n: usize) -> MemorySource {
    MemorySource::new().with_entity("Zaak", zaak_items(n))
}

/// Upserts each item as a `Zaak` node and records the keys it saw
#[derive(Default)]
pub struct CountingProcessor {
    seen: Mutex<Vec<String>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl CountingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` once `count` items have been processed
    pub fn cancelling_after(count: usize, token: CancellationToken) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            cancel_after: Some((count, token)),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemProcessor for CountingProcessor {
    async fn process(
        &self,
        session: &mut dyn GraphSession,
        item: &Item,
    ) -> Result<ItemOutcome, GraphError> {
        let Some(key) = item.key("nummer") else {
            return Ok(ItemOutcome::Skipped("no nummer".into()));
        };
        session
            .upsert_node("Zaak", "nummer", &item.scalar_properties())
            .await?;

        let count = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(key);
            seen.len()
        };
        if let Some((limit, token)) = &self.cancel_after {
            if count >= *limit {
                token.cancel();
            }
        }
        Ok(ItemOutcome::processed())
    }
}

/// In-memory checkpoint store that remembers every checkpoint write
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryCheckpointStore,
    saves: Mutex<Vec<(String, u64)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets written for `loader`, in order
    pub fn offsets(&self, loader: &str) -> Vec<u64> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == loader)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn load_run(&self, run_id: &str) -> tkgraph_ingest::Result<Option<RunRecord>> {
        self.inner.load_run(run_id).await
    }

    async fn save_run(&self, run: &RunRecord) -> tkgraph_ingest::Result<()> {
        self.inner.save_run(run).await
    }

    async fn list_runs(&self) -> tkgraph_ingest::Result<Vec<RunRecord>> {
        self.inner.list_runs().await
    }

    async fn load_checkpoint(
        &self,
        run_id: &str,
        loader: &str,
    ) -> tkgraph_ingest::Result<Option<CheckpointRecord>> {
        self.inner.load_checkpoint(run_id, loader).await
    }

    async fn save_checkpoint(&self, record: &CheckpointRecord) -> tkgraph_ingest::Result<()> {
        self.saves
            .lock()
            .unwrap()
            .push((record.loader_name.clone(), record.offset));
        self.inner.save_checkpoint(record).await
    }

    async fn list_checkpoints(&self, run_id: &str) -> tkgraph_ingest::Result<Vec<CheckpointRecord>> {
        self.inner.list_checkpoints(run_id).await
    }

    async fn delete_run(&self, run_id: &str) -> tkgraph_ingest::Result<bool> {
        self.inner.delete_run(run_id).await
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

/// Data source whose page fetches always fail
pub struct FailingSource {
    transient: bool,
    attempts: AtomicU32,
}

impl FailingSource {
    /// Fails with a connection error, which is retried
    pub fn transient() -> Self {
        Self {
            transient: true,
            attempts: AtomicU32::new(0),
        }
    }

    /// Fails with a rejected request, which is not retried
    pub fn client_error() -> Self {
        Self {
            transient: false,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn fail(&self) -> FetchError {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.transient {
            FetchError::transient("connection reset by peer")
        } else {
            FetchError::client("HTTP 400: malformed $filter")
        }
    }
}

#[async_trait]
impl DataSource for FailingSource {
    async fn fetch_page(&self, _request: &PageRequest, _cursor: Option<&str>) -> Result<Page, FetchError> {
        Err(self.fail())
    }

    async fn fetch_related(&self, _entity: &str, _id: &str, _navigation: &str) -> Result<Vec<Item>, FetchError> {
        Err(self.fail())
    }
}

/// Serves pages from memory but fails navigation fetches for chosen ids
pub struct FlakyRelatedSource {
    inner: MemorySource,
    failing_ids: HashSet<String>,
    related_attempts: AtomicU32,
}

impl FlakyRelatedSource {
    pub fn new(inner: MemorySource, failing_ids: &[&str]) -> Self {
        Self {
            inner,
            failing_ids: failing_ids.iter().map(|id| id.to_string()).collect(),
            related_attempts: AtomicU32::new(0),
        }
    }

    pub fn related_attempts(&self) -> u32 {
        self.related_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for FlakyRelatedSource {
    async fn fetch_page(&self, request: &PageRequest, cursor: Option<&str>) -> Result<Page, FetchError> {
        self.inner.fetch_page(request, cursor).await
    }

    async fn fetch_related(&self, entity: &str, id: &str, navigation: &str) -> Result<Vec<Item>, FetchError> {
        if self.failing_ids.contains(id) {
            self.related_attempts.fetch_add(1, Ordering::SeqCst);
            return Err(FetchError::transient("connection refused"));
        }
        self.inner.fetch_related(entity, id, navigation).await
    }
}

/// [`MemoryGraph`] with injectable faults
///
/// Upserting a node whose key is in `rejected` fails that write; one in
/// `session_lost` kills the session. Optionally cancels a token after a
/// number of node writes for one label.
#[derive(Clone, Default)]
pub struct FaultyGraph {
    pub graph: MemoryGraph,
    rejected: Arc<HashSet<String>>,
    session_lost: Arc<HashSet<String>>,
    cancel_after: Option<(String, u64, CancellationToken)>,
    writes: Arc<AtomicU64>,
}

impl FaultyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(mut self, keys: &[String]) -> Self {
        self.rejected = Arc::new(keys.iter().cloned().collect());
        self
    }

    pub fn losing_session_on(mut self, keys: &[String]) -> Self {
        self.session_lost = Arc::new(keys.iter().cloned().collect());
        self
    }

    pub fn cancelling_after(mut self, label: &str, writes: u64, token: CancellationToken) -> Self {
        self.cancel_after = Some((label.to_string(), writes, token));
        self
    }
}

#[async_trait]
impl GraphWriter for FaultyGraph {
    async fn open_session(&self) -> Result<Box<dyn GraphSession>, GraphError> {
        Ok(Box::new(FaultySession {
            inner: self.graph.open_session().await?,
            graph: self.clone(),
        }))
    }

    fn backend(&self) -> &'static str {
        "faulty-memory"
    }
}

struct FaultySession {
    inner: Box<dyn GraphSession>,
    graph: FaultyGraph,
}

#[async_trait]
impl GraphSession for FaultySession {
    async fn upsert_node(
        &mut self,
        label: &str,
        key_field: &str,
        properties: &Properties,
    ) -> Result<(), GraphError> {
        let key = tkgraph_ingest::graph::key_value(properties, key_field).unwrap_or_default();
        if self.graph.session_lost.contains(&key) {
            return Err(GraphError::SessionLost(format!("connection dropped at {key}")));
        }
        if self.graph.rejected.contains(&key) {
            return Err(GraphError::rejected(format!("constraint violated for {key}")));
        }
        self.inner.upsert_node(label, key_field, properties).await?;

        if let Some((cancel_label, limit, token)) = &self.graph.cancel_after {
            if cancel_label == label {
                let written = self.graph.writes.fetch_add(1, Ordering::SeqCst) + 1;
                if written >= *limit {
                    token.cancel();
                }
            }
        }
        Ok(())
    }

    async fn upsert_relationship(
        &mut self,
        from: &NodeRef,
        to: &NodeRef,
        relation_type: &str,
    ) -> Result<(), GraphError> {
        self.inner.upsert_relationship(from, to, relation_type).await
    }

    async fn existing_keys(
        &mut self,
        label: &str,
        key_field: &str,
        keys: &[String],
    ) -> Result<HashSet<String>, GraphError> {
        self.inner.existing_keys(label, key_field, keys).await
    }
}
