//! OData client against a mock server

use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;
use tkgraph_ingest::error::FetchError;
use tkgraph_ingest::framework::retry::Transient;
use tkgraph_ingest::source::{fetch_all, DataSource, DateFilter, ODataSource, PageRequest};
use tkgraph_ingest::RetryPolicy;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn source(server: &MockServer) -> ODataSource {
    ODataSource::new(reqwest::Client::new(), server.uri())
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(5), max_retries, 0.0)
}

#[tokio::test]
async fn test_follows_next_link_until_exhausted() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Persoon"))
        .and(query_param("$skip", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"Id": "p3"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/Persoon"))
        .and(query_param("$top", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"Id": "p1"}, {"Id": "p2"}],
            "@odata.nextLink": format!("{}/Persoon?$skip=2", server.uri())
        })))
        .expect(1)
        .mount(&server)
        .await;

    let items = fetch_all(
        &source(&server),
        &PageRequest::new("Persoon", 2),
        &fast_retry(0),
        None,
    )
    .await
    .unwrap();

    let ids: Vec<_> = items.iter().filter_map(|item| item.id()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);
}

#[tokio::test]
async fn test_sends_filter_and_expand() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Zaak"))
        .and(query_param("$filter", "GestartOp ge 2024-01-01T00:00:00Z"))
        .and(query_param("$expand", "Document,Besluit"))
        .and(query_param("$top", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(1)
        .mount(&server)
        .await;

    let request = PageRequest::new("Zaak", 50)
        .with_date_filter(DateFilter {
            field: "GestartOp".into(),
            start: NaiveDate::from_ymd_opt(2024, 1, 1),
            end: None,
        })
        .with_expand("Document")
        .with_expand("Besluit");

    let page = source(&server).fetch_page(&request, None).await.unwrap();
    assert!(page.items.is_empty());
    assert!(page.next.is_none());
}

#[tokio::test]
async fn test_retries_service_unavailable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Fractie"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/Fractie"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"Id": "f1", "NaamNL": "Fractie"}]
        })))
        .mount(&server)
        .await;

    let items = fetch_all(
        &source(&server),
        &PageRequest::new("Fractie", 10),
        &fast_retry(3),
        None,
    )
    .await
    .unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn test_bad_request_is_a_client_error_and_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Zaak"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Invalid $filter"))
        .expect(1)
        .mount(&server)
        .await;

    let err = fetch_all(
        &source(&server),
        &PageRequest::new("Zaak", 10),
        &fast_retry(3),
        None,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FetchError::Client(_)));
    assert!(!err.is_transient());
    assert!(err.to_string().contains("400"));
}

#[tokio::test]
async fn test_max_items_stops_pagination() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Document"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"Id": "d1"}, {"Id": "d2"}, {"Id": "d3"}],
            "@odata.nextLink": format!("{}/Document?$skip=3", server.uri())
        })))
        .expect(1)
        .mount(&server)
        .await;

    let items = fetch_all(
        &source(&server),
        &PageRequest::new("Document", 3),
        &fast_retry(0),
        Some(2),
    )
    .await
    .unwrap();
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn test_fetch_related_reads_navigation_collection() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/Zaak(abc)/Besluit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"Id": "b1"}, {"Id": "b2"}]
        })))
        .mount(&server)
        .await;

    let related = source(&server)
        .fetch_related("Zaak", "abc", "Besluit")
        .await
        .unwrap();
    assert_eq!(related.len(), 2);
    assert_eq!(related[1].id().as_deref(), Some("b2"));
}
