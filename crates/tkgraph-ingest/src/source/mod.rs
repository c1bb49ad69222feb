//! Remote data source
//!
//! Loaders read entities through [`DataSource`]. Pages are fetched one at a
//! time under a [`RetryPolicy`]; a page that still fails after the policy's
//! retries fails the whole fetch. Related sub-resources are fetched per item
//! and their failures stay with that item.

mod memory;
mod odata;

pub use memory::MemorySource;
pub use odata::{ODataSource, DEFAULT_BASE_URL};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::debug;

use crate::error::FetchError;
use crate::framework::retry::RetryPolicy;
use crate::graph::Properties;

/// Date window applied to one field of the entity
#[derive(Debug, Clone, PartialEq)]
pub struct DateFilter {
    pub field: String,
    /// Inclusive
    pub start: Option<NaiveDate>,
    /// Exclusive
    pub end: Option<NaiveDate>,
}

impl DateFilter {
    /// Whether a raw field value (`YYYY-MM-DD...`) falls inside the window
    pub fn matches(&self, raw: &str) -> bool {
        let Some(date) = raw
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            return false;
        };
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date < e)
    }
}

/// What to fetch for one entity type
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub entity: String,
    pub date_filter: Option<DateFilter>,
    /// Extra predicate in the source's own filter syntax
    pub filter: Option<String>,
    /// Navigation properties to embed in each item
    pub expand: Vec<String>,
    pub page_size: usize,
}

impl PageRequest {
    pub fn new(entity: impl Into<String>, page_size: usize) -> Self {
        Self {
            entity: entity.into(),
            date_filter: None,
            filter: None,
            expand: Vec::new(),
            page_size,
        }
    }

    pub fn with_date_filter(mut self, filter: DateFilter) -> Self {
        self.date_filter = Some(filter);
        self
    }

    pub fn with_expand(mut self, navigation: impl Into<String>) -> Self {
        self.expand.push(navigation.into());
        self
    }

    /// OData `$filter` text combining the date window and the extra predicate
    pub fn filter_expression(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(window) = &self.date_filter {
            if let Some(start) = window.start {
                clauses.push(format!("{} ge {}T00:00:00Z", window.field, start));
            }
            if let Some(end) = window.end {
                clauses.push(format!("{} lt {}T00:00:00Z", window.field, end));
            }
        }
        if let Some(extra) = &self.filter {
            clauses.push(format!("({extra})"));
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" and "))
        }
    }
}

/// One page of results plus the opaque cursor for the next one
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub next: Option<String>,
}

/// Read-only access to the remote API
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch one page; `cursor` is `None` for the first page
    async fn fetch_page(&self, request: &PageRequest, cursor: Option<&str>)
        -> Result<Page, FetchError>;

    /// Fetch a navigation property of a single entity
    async fn fetch_related(
        &self,
        entity: &str,
        id: &str,
        navigation: &str,
    ) -> Result<Vec<Item>, FetchError>;
}

/// Fetch every page of `request`, stopping once `max_items` are collected.
pub async fn fetch_all(
    source: &dyn DataSource,
    request: &PageRequest,
    retry: &RetryPolicy,
    max_items: Option<usize>,
) -> Result<Vec<Item>, FetchError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;
    let operation = format!("fetch {}", request.entity);

    loop {
        let page = retry
            .run(&operation, |_| source.fetch_page(request, cursor.as_deref()))
            .await?;
        pages += 1;
        items.extend(page.items);

        if let Some(limit) = max_items {
            if items.len() >= limit {
                items.truncate(limit);
                break;
            }
        }
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    debug!(entity = %request.entity, pages, items = items.len(), "Fetched entity");
    Ok(items)
}

/// Read-only view over a fetched JSON record
///
/// Field lookups are exact first, then case-insensitive, so graph-side names
/// (`nummer`) resolve against API names (`Nummer`).
#[derive(Debug, Clone, PartialEq)]
pub struct Item(Value);

impl Item {
    pub fn new(value: Value) -> Self {
        Item(value)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        let object = self.0.as_object()?;
        object.get(field).or_else(|| {
            object
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(field))
                .map(|(_, value)| value)
        })
    }

    /// Natural key stored in `field`, if it is a non-blank string or number
    pub fn key(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<String> {
        self.key("id")
    }

    /// Scalar fields renamed to graph style (`GestartOp` -> `gestartOp`).
    ///
    /// Nulls, nested objects and `@odata` annotations are dropped; arrays are
    /// kept only when every element is a scalar.
    pub fn scalar_properties(&self) -> Properties {
        let mut props = Properties::new();
        let Some(object) = self.0.as_object() else {
            return props;
        };
        for (name, value) in object {
            if name.contains('@') {
                continue;
            }
            let keep = match value {
                Value::Null | Value::Object(_) => false,
                Value::Array(values) => values
                    .iter()
                    .all(|v| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_))),
                _ => true,
            };
            if keep {
                props.insert(graph_name(name), value.clone());
            }
        }
        props
    }

    /// Embedded navigation property as items; empty if absent or null
    pub fn related(&self, field: &str) -> Vec<Item> {
        match self.get(field) {
            Some(Value::Array(values)) => values.iter().cloned().map(Item).collect(),
            Some(value @ Value::Object(_)) => vec![Item(value.clone())],
            _ => Vec::new(),
        }
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Item(value)
    }
}

fn graph_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn zaak() -> Item {
        Item::new(json!({
            "Id": "0f1e",
            "Nummer": "2024Z00001",
            "GestartOp": "2024-03-01T10:00:00+01:00",
            "Kabinetsappreciatie": null,
            "@odata.etag": "W/\"1\"",
            "Onderwerpen": ["zorg", "onderwijs"],
            "Document": [{"Id": "d1"}, {"Id": "d2"}],
            "Kamerstukdossier": {"Id": "k1"}
        }))
    }

    #[test]
    fn test_key_lookup_is_case_insensitive() {
        let item = zaak();
        assert_eq!(item.key("nummer").as_deref(), Some("2024Z00001"));
        assert_eq!(item.id().as_deref(), Some("0f1e"));
        assert_eq!(item.key("Missing"), None);
    }

    #[test]
    fn test_scalar_properties() {
        let props = zaak().scalar_properties();
        assert_eq!(props["nummer"], "2024Z00001");
        assert_eq!(props["gestartOp"], "2024-03-01T10:00:00+01:00");
        assert!(props.contains_key("onderwerpen"));
        assert!(!props.contains_key("kabinetsappreciatie"));
        assert!(!props.contains_key("document"));
        assert!(!props.keys().any(|k| k.contains('@')));
    }

    #[test]
    fn test_related_handles_collections_and_single_objects() {
        let item = zaak();
        assert_eq!(item.related("Document").len(), 2);
        assert_eq!(item.related("kamerstukdossier").len(), 1);
        assert!(item.related("Besluit").is_empty());
    }

    #[test]
    fn test_filter_expression() {
        let request = PageRequest::new("Zaak", 50).with_date_filter(DateFilter {
            field: "GestartOp".into(),
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: None,
        });
        assert_eq!(
            request.filter_expression().as_deref(),
            Some("GestartOp ge 2024-01-01T00:00:00Z")
        );
        assert_eq!(PageRequest::new("Persoon", 50).filter_expression(), None);
    }

    #[test]
    fn test_date_filter_window() {
        let window = DateFilter {
            field: "Datum".into(),
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: NaiveDate::from_ymd_opt(2024, 2, 1),
        };
        assert!(window.matches("2024-01-01T00:00:00Z"));
        assert!(window.matches("2024-01-31"));
        assert!(!window.matches("2024-02-01"));
        assert!(!window.matches("2023-12-31"));
        assert!(!window.matches("garbage"));
    }
}
