//! Table-driven entity loaders
//!
//! Every entity type is described by an [`EntitySpec`]: where to fetch it,
//! how its node is keyed, and a table of [`RelationDescriptor`]s linking it
//! to other nodes. One generic [`EntityLoader`] runs any spec through the
//! checkpointed worker pool.

pub mod catalog;

pub use catalog::default_registry;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::GraphError;
use crate::framework::{
    CheckpointedExecution, ItemOutcome, ItemProcessor, LoadContext, Loader, LoaderCapability,
    LoaderConfig, LoaderResult, RetryPolicy,
};
use crate::graph::{GraphSession, NodeRef, Properties};
use crate::source::{fetch_all, DataSource, DateFilter, Item, PageRequest};

/// Keys per existence query
const EXISTENCE_BATCH: usize = 1000;

/// Where a relation's targets come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationSource {
    /// Embedded in the item via `$expand`
    Expanded,
    /// Fetched per item from the navigation property
    Navigation,
}

/// One row of an entity's relation table
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDescriptor {
    /// Navigation property on the source entity
    pub source_field: String,
    pub target_label: String,
    pub relation_type: String,
    /// Natural key of the target node
    pub target_key: String,
    pub source: RelationSource,
}

impl RelationDescriptor {
    pub fn expanded(field: &str, target_label: &str, relation_type: &str, target_key: &str) -> Self {
        Self {
            source_field: field.to_string(),
            target_label: target_label.to_string(),
            relation_type: relation_type.to_string(),
            target_key: target_key.to_string(),
            source: RelationSource::Expanded,
        }
    }

    pub fn navigation(field: &str, target_label: &str, relation_type: &str, target_key: &str) -> Self {
        Self {
            source: RelationSource::Navigation,
            ..Self::expanded(field, target_label, relation_type, target_key)
        }
    }
}

/// Everything that distinguishes one entity loader from another
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySpec {
    /// Loader name, e.g. `zaken`
    pub name: String,
    pub description: String,
    /// Remote entity set, e.g. `Zaak`
    pub entity: String,
    /// Graph label, e.g. `Zaak`
    pub label: String,
    /// Natural key property, e.g. `nummer`
    pub key_field: String,
    /// Field the date window applies to, if the entity is date-filtered
    pub date_field: Option<String>,
    pub capabilities: Vec<LoaderCapability>,
    pub dependencies: Vec<String>,
    pub relations: Vec<RelationDescriptor>,
}

impl EntitySpec {
    pub fn new(name: &str, description: &str, entity: &str, label: &str, key_field: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            entity: entity.to_string(),
            label: label.to_string(),
            key_field: key_field.to_string(),
            date_field: None,
            capabilities: vec![
                LoaderCapability::Threading,
                LoaderCapability::BatchProcessing,
                LoaderCapability::SkipFunctionality,
                LoaderCapability::IdChecking,
            ],
            dependencies: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn date_field(mut self, field: &str) -> Self {
        self.date_field = Some(field.to_string());
        self.capabilities.push(LoaderCapability::DateFiltering);
        self.capabilities.push(LoaderCapability::IncrementalLoading);
        self
    }

    pub fn depends_on(mut self, loader: &str) -> Self {
        self.dependencies.push(loader.to_string());
        self
    }

    pub fn relation(mut self, relation: RelationDescriptor) -> Self {
        if !self
            .capabilities
            .contains(&LoaderCapability::RelationshipProcessing)
        {
            self.capabilities
                .push(LoaderCapability::RelationshipProcessing);
        }
        self.relations.push(relation);
        self
    }

    fn page_request(&self, config: &LoaderConfig) -> PageRequest {
        let mut request = PageRequest::new(&self.entity, config.batch_size);
        if let Some(field) = &self.date_field {
            if config.start_date.is_some() || config.end_date.is_some() {
                request = request.with_date_filter(DateFilter {
                    field: field.clone(),
                    start: config.start_date,
                    end: config.end_date,
                });
            }
        }
        for relation in &self.relations {
            if relation.source == RelationSource::Expanded {
                request = request.with_expand(&relation.source_field);
            }
        }
        request
    }
}

/// Loader that ingests one [`EntitySpec`]
pub struct EntityLoader {
    spec: Arc<EntitySpec>,
    source: Arc<dyn DataSource>,
    retry: RetryPolicy,
}

impl EntityLoader {
    pub fn new(spec: EntitySpec, source: Arc<dyn DataSource>, retry: RetryPolicy) -> Self {
        Self {
            spec: Arc::new(spec),
            source,
            retry,
        }
    }

    pub fn spec(&self) -> &EntitySpec {
        &self.spec
    }

    /// Keys of `items[skip..]` whose node is already in the graph
    async fn existing_keys(
        &self,
        ctx: &LoadContext,
        items: &[Item],
        skip: u64,
    ) -> Result<HashSet<String>, GraphError> {
        let skip = usize::try_from(skip).unwrap_or(usize::MAX);
        let keys: Vec<String> = items
            .iter()
            .skip(skip)
            .filter_map(|item| item.key(&self.spec.key_field))
            .collect();
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let mut session = ctx.writer.open_session().await?;
        let mut existing = HashSet::new();
        for chunk in keys.chunks(EXISTENCE_BATCH) {
            let found = self
                .retry
                .attempt(session.existing_keys(&self.spec.label, &self.spec.key_field, chunk))
                .await?;
            existing.extend(found);
        }
        Ok(existing)
    }
}

#[async_trait]
impl Loader for EntityLoader {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn capabilities(&self) -> &[LoaderCapability] {
        &self.spec.capabilities
    }

    fn dependencies(&self) -> &[String] {
        &self.spec.dependencies
    }

    async fn load(&self, ctx: &LoadContext, config: &LoaderConfig) -> LoaderResult {
        let started = Instant::now();
        let loader = self.spec.name.as_str();
        info!(
            loader,
            entity = %self.spec.entity,
            skip_count = config.skip_count,
            workers = config.max_workers,
            "Loader starting"
        );

        let request = self.spec.page_request(config);
        let items = match fetch_all(self.source.as_ref(), &request, &self.retry, config.max_items).await {
            Ok(items) => items,
            Err(e) => {
                error!(loader, error = %e, "Fetch failed, aborting loader");
                return LoaderResult::aborted(
                    format!("Failed to fetch {}: {e}", self.spec.entity),
                    config.skip_count,
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let existing = if config.overwrite {
            HashSet::new()
        } else {
            match self.existing_keys(ctx, &items, config.skip_count).await {
                Ok(existing) => {
                    if !existing.is_empty() {
                        info!(loader, existing = existing.len(), "Skipping nodes already in the graph");
                    }
                    existing
                }
                Err(e) => {
                    warn!(loader, error = %e, "Existence check failed; processing every item");
                    HashSet::new()
                }
            }
        };

        let processor = Arc::new(EntityProcessor {
            spec: self.spec.clone(),
            source: self.source.clone(),
            retry: self.retry.clone(),
            existing,
        });

        let execution = CheckpointedExecution::for_config(config, ctx.checkpoint.clone());
        let report = execution
            .execute(items, config, processor, ctx.writer.clone(), &ctx.cancel)
            .await;

        let mut result = LoaderResult::from_tally(
            report.tally,
            report.total_items,
            report.start_offset,
            started.elapsed().as_secs_f64(),
        );
        if report.cancelled {
            result
                .warnings
                .push(format!("interrupted at offset {}", report.final_offset));
        }

        info!(
            loader,
            processed = result.processed_count,
            failed = result.failed_count,
            skipped = result.skipped_count,
            total = result.total_items,
            offset = report.final_offset,
            elapsed_secs = result.execution_time_seconds,
            "Loader finished"
        );
        result
    }
}

struct EntityProcessor {
    spec: Arc<EntitySpec>,
    source: Arc<dyn DataSource>,
    retry: RetryPolicy,
    /// Keys to leave alone; empty when overwriting
    existing: HashSet<String>,
}

enum Write<'a> {
    Node {
        label: &'a str,
        key_field: &'a str,
        properties: &'a Properties,
    },
    Relationship {
        from: &'a NodeRef,
        to: &'a NodeRef,
        relation_type: &'a str,
    },
}

impl EntityProcessor {
    /// Apply one write, retrying transient store errors under the policy
    async fn write(&self, session: &mut dyn GraphSession, write: Write<'_>) -> Result<(), GraphError> {
        let operation = match &write {
            Write::Node { label, .. } => format!("{} upsert {label}", self.spec.name),
            Write::Relationship { relation_type, .. } => {
                format!("{} upsert {relation_type}", self.spec.name)
            }
        };
        let mut attempt = 0u32;
        loop {
            let pending = match &write {
                Write::Node {
                    label,
                    key_field,
                    properties,
                } => session.upsert_node(label, key_field, properties),
                Write::Relationship {
                    from,
                    to,
                    relation_type,
                } => session.upsert_relationship(from, to, relation_type),
            };
            match self.retry.attempt(pending).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if !self.retry.retry_after(&operation, attempt, &e).await {
                        return Err(e);
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn targets(&self, item: &Item, key: &str, relation: &RelationDescriptor) -> Result<Vec<Item>, String> {
        match relation.source {
            RelationSource::Expanded => Ok(item.related(&relation.source_field)),
            RelationSource::Navigation => {
                let id = item.id().unwrap_or_else(|| key.to_string());
                let operation = format!("fetch {}.{}", self.spec.entity, relation.source_field);
                self.retry
                    .run(&operation, |_| {
                        self.source
                            .fetch_related(&self.spec.entity, &id, &relation.source_field)
                    })
                    .await
                    .map_err(|e| {
                        format!(
                            "{} {key}: fetching {} failed: {e}",
                            self.spec.label, relation.source_field
                        )
                    })
            }
        }
    }
}

#[async_trait]
impl ItemProcessor for EntityProcessor {
    async fn process(
        &self,
        session: &mut dyn GraphSession,
        item: &Item,
    ) -> Result<ItemOutcome, GraphError> {
        let spec = &self.spec;
        let Some(key) = item.key(&spec.key_field) else {
            return Ok(ItemOutcome::Skipped(format!(
                "{} item without '{}' skipped",
                spec.label, spec.key_field
            )));
        };
        if self.existing.contains(&key) {
            return Ok(ItemOutcome::AlreadyPresent);
        }

        let mut properties = item.scalar_properties();
        properties.insert(spec.key_field.clone(), Value::String(key.clone()));

        let node = Write::Node {
            label: &spec.label,
            key_field: &spec.key_field,
            properties: &properties,
        };
        match self.write(session, node).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => return Ok(ItemOutcome::Failed(format!("{} {key}: {e}", spec.label))),
        }

        let from = NodeRef::new(&spec.label, &spec.key_field, &key);
        let mut warnings = Vec::new();

        for relation in &spec.relations {
            let targets = match self.targets(item, &key, relation).await {
                Ok(targets) => targets,
                Err(message) => return Ok(ItemOutcome::Failed(message)),
            };

            for target in targets {
                let Some(target_key) = target.key(&relation.target_key) else {
                    warnings.push(format!(
                        "{} {key}: {} target without '{}'",
                        spec.label, relation.source_field, relation.target_key
                    ));
                    continue;
                };

                let mut target_props = target.scalar_properties();
                target_props.insert(relation.target_key.clone(), Value::String(target_key.clone()));
                let to = NodeRef::new(&relation.target_label, &relation.target_key, &target_key);

                let writes = [
                    Write::Node {
                        label: &relation.target_label,
                        key_field: &relation.target_key,
                        properties: &target_props,
                    },
                    Write::Relationship {
                        from: &from,
                        to: &to,
                        relation_type: &relation.relation_type,
                    },
                ];
                for write in writes {
                    match self.write(session, write).await {
                        Ok(()) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            return Ok(ItemOutcome::Failed(format!(
                                "{} {key} -[{}]-> {} {target_key}: {e}",
                                spec.label, relation.relation_type, relation.target_label
                            )))
                        }
                    }
                }
            }
        }

        Ok(ItemOutcome::Processed { warnings })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::graph::{GraphWriter, MemoryGraph};
    use crate::source::MemorySource;
    use chrono::NaiveDate;
    use serde_json::json;

    fn zaak_spec() -> EntitySpec {
        EntitySpec::new("zaken", "Zaken", "Zaak", "Zaak", "nummer")
            .date_field("GestartOp")
            .relation(RelationDescriptor::expanded("Document", "Document", "HAS_DOCUMENT", "id"))
            .relation(RelationDescriptor::navigation("Besluit", "Besluit", "HAS_BESLUIT", "id"))
    }

    #[test]
    fn test_page_request_expands_only_embedded_relations() {
        let config = LoaderConfig {
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            ..LoaderConfig::default()
        };
        let request = zaak_spec().page_request(&config);
        assert_eq!(request.expand, vec!["Document".to_string()]);
        assert_eq!(
            request.filter_expression().as_deref(),
            Some("GestartOp ge 2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_spec_capabilities() {
        let spec = zaak_spec();
        assert!(spec.capabilities.contains(&LoaderCapability::DateFiltering));
        assert_eq!(
            spec.capabilities
                .iter()
                .filter(|c| **c == LoaderCapability::RelationshipProcessing)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_processes_item_with_relations() {
        let source = MemorySource::new().with_related(
            "Zaak",
            "z1",
            "Besluit",
            vec![Item::new(json!({"Id": "b1", "BesluitTekst": "Aangenomen"}))],
        );
        let processor = EntityProcessor {
            spec: Arc::new(zaak_spec()),
            source: Arc::new(source),
            retry: RetryPolicy::no_retry(),
            existing: HashSet::new(),
        };
        let graph = MemoryGraph::new();
        let mut session = graph.open_session().await.unwrap();

        let item = Item::new(json!({
            "Id": "z1",
            "Nummer": "2024Z00001",
            "Document": [{"Id": "d1", "Titel": "Brief"}, {"Titel": "no id"}]
        }));
        let outcome = processor.process(session.as_mut(), &item).await.unwrap();

        let warnings = match outcome {
            ItemOutcome::Processed { warnings } => warnings,
            other => panic!("expected processed, got {other:?}"),
        };
        assert_eq!(warnings.len(), 1);

        let snapshot = graph.snapshot().await;
        assert_eq!(snapshot.node("Zaak", "2024Z00001").unwrap()["id"], "z1");
        assert_eq!(snapshot.node("Document", "d1").unwrap()["titel"], "Brief");
        assert_eq!(snapshot.node("Besluit", "b1").unwrap()["besluitTekst"], "Aangenomen");
        assert_eq!(snapshot.relationships.len(), 2);
    }

    #[tokio::test]
    async fn test_item_without_key_is_skipped() {
        let processor = EntityProcessor {
            spec: Arc::new(zaak_spec()),
            source: Arc::new(MemorySource::new()),
            retry: RetryPolicy::no_retry(),
            existing: HashSet::new(),
        };
        let graph = MemoryGraph::new();
        let mut session = graph.open_session().await.unwrap();

        let outcome = processor
            .process(session.as_mut(), &Item::new(json!({"Id": "z1"})))
            .await
            .unwrap();
        assert!(matches!(outcome, ItemOutcome::Skipped(_)));
        assert!(graph.snapshot().await.nodes.is_empty());
    }

    fn zaken(n: usize) -> MemorySource {
        MemorySource::new().with_entity(
            "Zaak",
            (1..=n)
                .map(|i| Item::new(json!({"Id": format!("z{i}"), "Nummer": format!("2024Z{i:05}")})))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_existing_nodes_are_skipped_unless_overwriting() {
        let spec = EntitySpec::new("zaken", "Zaken", "Zaak", "Zaak", "nummer");
        let graph = MemoryGraph::new();
        let ctx = LoadContext::new(Arc::new(graph.clone()));
        let config = LoaderConfig::default().with_max_workers(2);

        let first = EntityLoader::new(spec.clone(), Arc::new(zaken(3)), RetryPolicy::no_retry())
            .load(&ctx, &config)
            .await;
        assert_eq!(first.processed_count, 3);

        let loader = EntityLoader::new(spec, Arc::new(zaken(5)), RetryPolicy::no_retry());
        let second = loader.load(&ctx, &config).await;
        assert!(second.success);
        assert_eq!(second.processed_count, 2);
        assert_eq!(second.skipped_count, 3);
        assert!(second.warnings.is_empty());
        assert_eq!(graph.node_writes("Zaak", "2024Z00001").await, 1);
        assert_eq!(graph.node_writes("Zaak", "2024Z00005").await, 1);

        let overwrite = LoaderConfig {
            overwrite: true,
            ..config
        };
        let third = loader.load(&ctx, &overwrite).await;
        assert_eq!(third.processed_count, 5);
        assert_eq!(third.skipped_count, 0);
        assert_eq!(graph.node_writes("Zaak", "2024Z00001").await, 2);
    }
}
