//! Neo4j HTTP writer against a mock transactional endpoint

use serde_json::{json, Map, Value};
use tkgraph_ingest::error::GraphError;
use tkgraph_ingest::framework::retry::Transient;
use tkgraph_ingest::graph::{CypherHttpWriter, GraphWriter, Neo4jConfig, NodeRef, Properties};
use wiremock::{
    matchers::{body_string_contains, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

const COMMIT: &str = "/db/neo4j/tx/commit";

fn writer(server: &MockServer) -> CypherHttpWriter {
    CypherHttpWriter::new(
        reqwest::Client::new(),
        Neo4jConfig {
            uri: server.uri(),
            password: "secret".into(),
            ..Neo4jConfig::default()
        },
    )
}

fn zaak_props() -> Properties {
    let mut props = Map::new();
    props.insert("nummer".into(), Value::String("2024Z00001".into()));
    props.insert("onderwerp".into(), Value::String("Begroting".into()));
    props
}

fn ok_body() -> Value {
    json!({"results": [{"columns": [], "data": []}], "errors": []})
}

#[tokio::test]
async fn test_node_upsert_posts_merge_statement() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(COMMIT))
        .and(header_exists("authorization"))
        .and(body_string_contains("MERGE (n:`Zaak` {`nummer`: $key_val}) SET n += $props"))
        .and(body_string_contains("2024Z00001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = writer(&server).open_session().await.unwrap();
    session
        .upsert_node("Zaak", "nummer", &zaak_props())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_relationship_upsert_matches_both_endpoints() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(COMMIT))
        .and(body_string_contains("MATCH (a:`Zaak` {`nummer`: $from_val})"))
        .and(body_string_contains("MERGE (a)-[:`HAS_DOCUMENT`]->(b)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = writer(&server).open_session().await.unwrap();
    session
        .upsert_relationship(
            &NodeRef::new("Zaak", "nummer", "2024Z00001"),
            &NodeRef::new("Document", "id", "doc-1"),
            "HAS_DOCUMENT",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_statement_errors_are_classified() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(COMMIT))
        .and(body_string_contains("Deadlock"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "errors": [{"code": "Neo.TransientError.Transaction.DeadlockDetected", "message": "deadlock"}]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(COMMIT))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "errors": [{"code": "Neo.ClientError.Schema.ConstraintValidationFailed", "message": "exists"}]
        })))
        .mount(&server)
        .await;

    let mut session = writer(&server).open_session().await.unwrap();

    let err = session
        .upsert_node("Zaak", "nummer", &zaak_props())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Rejected(_)));
    assert!(!err.is_transient());

    let mut props = zaak_props();
    props.insert("onderwerp".into(), Value::String("Deadlock".into()));
    let err = session.upsert_node("Zaak", "nummer", &props).await.unwrap_err();
    assert!(matches!(err, GraphError::Unavailable(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_http_status_classification() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(COMMIT))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(COMMIT))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let mut session = writer(&server).open_session().await.unwrap();

    let unavailable = session
        .upsert_node("Zaak", "nummer", &zaak_props())
        .await
        .unwrap_err();
    assert!(unavailable.is_transient());
    assert!(!unavailable.is_fatal());

    let lost = session
        .upsert_node("Zaak", "nummer", &zaak_props())
        .await
        .unwrap_err();
    assert!(matches!(lost, GraphError::SessionLost(_)));
    assert!(lost.is_fatal());
}

#[tokio::test]
async fn test_existing_keys_reads_returned_rows() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(COMMIT))
        .and(body_string_contains("WHERE n.`nummer` IN $keys"))
        .and(body_string_contains("2024Z00002"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "columns": ["n.nummer"],
                "data": [{"row": ["2024Z00001"], "meta": [null]}]
            }],
            "errors": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = writer(&server).open_session().await.unwrap();
    let keys = vec!["2024Z00001".to_string(), "2024Z00002".to_string()];
    let existing = session.existing_keys("Zaak", "nummer", &keys).await.unwrap();

    assert_eq!(existing.len(), 1);
    assert!(existing.contains("2024Z00001"));

    // nothing to ask about, nothing sent
    assert!(session
        .existing_keys("Zaak", "nummer", &[])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_invalid_identifiers_never_reach_the_server() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
        .expect(0)
        .mount(&server)
        .await;

    let mut session = writer(&server).open_session().await.unwrap();
    let err = session
        .upsert_node("Zaak`) DETACH DELETE n //", "nummer", &zaak_props())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Rejected(_)));

    let err = session
        .upsert_node("Zaak", "nummer", &Properties::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Rejected(_)));
}
