//! In-memory data source for offline runs and tests

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use super::{DataSource, Item, Page, PageRequest};
use crate::error::{FetchError, IngestError};

/// Serves entities from memory, paginated like the remote API
///
/// The cursor is the offset of the next page. Only the request's date window
/// is applied; the free-form `filter` is source syntax and ignored here.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entities: HashMap<String, Vec<Item>>,
    related: HashMap<(String, String, String), Vec<Item>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: impl Into<String>, items: Vec<Item>) -> Self {
        self.entities.insert(entity.into(), items);
        self
    }

    pub fn with_related(
        mut self,
        entity: impl Into<String>,
        id: impl Into<String>,
        navigation: impl Into<String>,
        items: Vec<Item>,
    ) -> Self {
        self.related
            .insert((entity.into(), id.into(), navigation.into()), items);
        self
    }

    /// Load a fixture shaped as `{"Zaak": [{...}, ...], "Persoon": [...]}`
    pub async fn from_fixture(path: &Path) -> Result<Self, IngestError> {
        let raw = tokio::fs::read(path).await?;
        let parsed: HashMap<String, Vec<Value>> = serde_json::from_slice(&raw)?;
        Ok(Self {
            entities: parsed
                .into_iter()
                .map(|(entity, values)| (entity, values.into_iter().map(Item::new).collect()))
                .collect(),
            related: HashMap::new(),
        })
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cursor: Option<&str>,
    ) -> Result<Page, FetchError> {
        let all = self
            .entities
            .get(&request.entity)
            .ok_or_else(|| FetchError::client(format!("unknown entity '{}'", request.entity)))?;

        let offset = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| FetchError::client(format!("bad cursor '{raw}'")))?,
            None => 0,
        };

        let matching: Vec<&Item> = all
            .iter()
            .filter(|item| match &request.date_filter {
                Some(window) => item
                    .get(&window.field)
                    .and_then(Value::as_str)
                    .is_some_and(|raw| window.matches(raw)),
                None => true,
            })
            .collect();

        let page_size = request.page_size.max(1);
        let end = (offset + page_size).min(matching.len());
        let items = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|item| (*item).clone())
            .collect();
        let next = (end < matching.len()).then(|| end.to_string());

        Ok(Page { items, next })
    }

    async fn fetch_related(
        &self,
        entity: &str,
        id: &str,
        navigation: &str,
    ) -> Result<Vec<Item>, FetchError> {
        Ok(self
            .related
            .get(&(entity.to_string(), id.to_string(), navigation.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::retry::RetryPolicy;
    use crate::source::{fetch_all, DateFilter};
    use chrono::NaiveDate;
    use serde_json::json;

    fn source() -> MemorySource {
        let items = (1..=7)
            .map(|i| Item::new(json!({"Id": format!("p{i}"), "Datum": format!("2024-01-0{i}")})))
            .collect();
        MemorySource::new().with_entity("Persoon", items)
    }

    #[tokio::test]
    async fn test_paginates_until_exhausted() {
        let request = PageRequest::new("Persoon", 3);
        let items = fetch_all(&source(), &request, &RetryPolicy::no_retry(), None)
            .await
            .unwrap();
        assert_eq!(items.len(), 7);
        assert_eq!(items[6].id().as_deref(), Some("p7"));
    }

    #[tokio::test]
    async fn test_honours_max_items() {
        let request = PageRequest::new("Persoon", 3);
        let items = fetch_all(&source(), &request, &RetryPolicy::no_retry(), Some(4))
            .await
            .unwrap();
        assert_eq!(items.len(), 4);
    }

    #[tokio::test]
    async fn test_applies_date_window() {
        let request = PageRequest::new("Persoon", 10).with_date_filter(DateFilter {
            field: "Datum".into(),
            start: NaiveDate::from_ymd_opt(2024, 1, 5),
            end: None,
        });
        let items = fetch_all(&source(), &request, &RetryPolicy::no_retry(), None)
            .await
            .unwrap();
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_a_client_error() {
        let request = PageRequest::new("Onbekend", 10);
        let err = fetch_all(&source(), &request, &RetryPolicy::no_retry(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Client(_)));
    }

    #[tokio::test]
    async fn test_loads_fixture_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        std::fs::write(&path, r#"{"Fractie": [{"Id": "f1"}, {"Id": "f2"}]}"#).unwrap();

        let source = MemorySource::from_fixture(&path).await.unwrap();
        let page = source
            .fetch_page(&PageRequest::new("Fractie", 50), None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.next.is_none());
    }
}
