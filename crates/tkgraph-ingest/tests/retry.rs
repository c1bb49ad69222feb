//! Retry bounds for page fetches and per-item related fetches
//!
//! Time is paused, so backoff sleeps complete instantly while still being
//! measured by the loader's clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{zaak_items, FailingSource, FlakyRelatedSource};
use serde_json::json;
use tkgraph_ingest::framework::{LoadContext, Loader, LoaderConfig};
use tkgraph_ingest::graph::MemoryGraph;
use tkgraph_ingest::loaders::{EntityLoader, EntitySpec, RelationDescriptor};
use tkgraph_ingest::source::{Item, MemorySource};
use tkgraph_ingest::RetryPolicy;

fn policy(max_retries: u32, backoff_factor: f64) -> RetryPolicy {
    RetryPolicy::new(
        Duration::from_secs(15),
        Duration::from_secs(300),
        max_retries,
        backoff_factor,
    )
}

fn config() -> LoaderConfig {
    LoaderConfig {
        start_date: None,
        ..LoaderConfig::default()
    }
}

fn context() -> LoadContext {
    LoadContext::new(Arc::new(MemoryGraph::new()))
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_page_fetch_aborts_loader() {
    let source = Arc::new(FailingSource::transient());
    let loader = EntityLoader::new(common::zaak_spec(), source.clone(), policy(3, 0.5));

    let result = loader.load(&context(), &config()).await;

    assert!(!result.success);
    assert_eq!(source.attempts(), 4);
    assert_eq!(result.error_messages.len(), 1);
    assert!(result.error_messages[0].contains("Zaak"));
    assert!(result.execution_time_seconds >= 3.5);
    assert_eq!(result.processed_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_error_is_not_retried() {
    let source = Arc::new(FailingSource::client_error());
    let loader = EntityLoader::new(common::zaak_spec(), source.clone(), policy(3, 0.5));

    let result = loader.load(&context(), &config()).await;

    assert!(!result.success);
    assert_eq!(source.attempts(), 1);
    assert_eq!(result.error_messages.len(), 1);
    assert!(result.execution_time_seconds < 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_related_fetch_failure_fails_only_that_item() {
    let spec = EntitySpec::new("zaken", "Zaken", "Zaak", "Zaak", "nummer").relation(
        RelationDescriptor::navigation("Besluit", "Besluit", "HAS_BESLUIT", "id"),
    );
    let inner = MemorySource::new()
        .with_entity("Zaak", zaak_items(5))
        .with_related(
            "Zaak",
            "zaak-1",
            "Besluit",
            vec![Item::new(json!({"Id": "besluit-1", "Status": "Besluit"}))],
        );
    let source = Arc::new(FlakyRelatedSource::new(inner, &["zaak-3"]));
    let loader = EntityLoader::new(spec, source.clone(), policy(2, 0.1));
    let graph = MemoryGraph::new();

    let result = loader
        .load(&LoadContext::new(Arc::new(graph.clone())), &config())
        .await;

    assert!(result.success);
    assert_eq!(result.processed_count, 4);
    assert_eq!(result.failed_count, 1);
    assert_eq!(source.related_attempts(), 3);
    assert!(result.error_messages[0].contains("Besluit"));

    let snapshot = graph.snapshot().await;
    assert!(snapshot.node("Besluit", "besluit-1").is_some());
    assert_eq!(snapshot.relationships.len(), 1);
}
