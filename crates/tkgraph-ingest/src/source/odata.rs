//! OData v4 client for the parliamentary open-data API

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{DataSource, Item, Page, PageRequest};
use crate::error::FetchError;

/// Default root of the public API
pub const DEFAULT_BASE_URL: &str = "https://gegevensmagazijn.tweedekamer.nl/OData/v4/2.0";

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Data source backed by an OData service
///
/// Requests carry `$top`, `$filter` and `$expand`; pagination follows
/// `@odata.nextLink` verbatim.
#[derive(Debug, Clone)]
pub struct ODataSource {
    client: reqwest::Client,
    base_url: String,
}

impl ODataSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, request: reqwest::RequestBuilder) -> Result<Value, FetchError> {
        let response = request.send().await.map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {status}: {}", truncate(&body, 200));
            return Err(if is_transient_status(status) {
                FetchError::transient(detail)
            } else {
                FetchError::client(detail)
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::client(format!("undecodable response body: {e}")))
    }
}

#[async_trait]
impl DataSource for ODataSource {
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cursor: Option<&str>,
    ) -> Result<Page, FetchError> {
        let builder = match cursor {
            Some(next_link) => self.client.get(next_link),
            None => {
                let mut query = vec![("$top", request.page_size.to_string())];
                if let Some(filter) = request.filter_expression() {
                    query.push(("$filter", filter));
                }
                if !request.expand.is_empty() {
                    query.push(("$expand", request.expand.join(",")));
                }
                self.client
                    .get(format!("{}/{}", self.base_url, request.entity))
                    .query(&query)
            }
        };

        let body = self.get_json(builder).await?;
        let collection: Collection = serde_json::from_value(body)
            .map_err(|e| FetchError::client(format!("not an OData collection: {e}")))?;

        debug!(
            entity = %request.entity,
            items = collection.value.len(),
            has_next = collection.next_link.is_some(),
            "Fetched page"
        );

        Ok(Page {
            items: collection.value.into_iter().map(Item::new).collect(),
            next: collection.next_link,
        })
    }

    async fn fetch_related(
        &self,
        entity: &str,
        id: &str,
        navigation: &str,
    ) -> Result<Vec<Item>, FetchError> {
        let url = format!("{}/{}({})/{}", self.base_url, entity, id, navigation);
        let body = self.get_json(self.client.get(url)).await?;

        Ok(match body {
            Value::Object(mut object) => match object.remove("value") {
                Some(Value::Array(values)) => values.into_iter().map(Item::new).collect(),
                Some(Value::Null) => Vec::new(),
                Some(single) => vec![Item::new(single)],
                None => vec![Item::new(Value::Object(object))],
            },
            _ => Vec::new(),
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn classify_send_error(err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::client(format!("invalid request: {err}"))
    } else {
        // connect, timeout, reset and body-read failures
        FetchError::transient(err.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
