/// Graph list backend against a mock HTTP server
///
/// Checks query translation, paging, bearer auth and the status mapping
/// the retry policy and sync engine depend on.

use mockito::{Matcher, Server, ServerGuard};
use rounding_sync::config::GraphConfig;
use rounding_sync::store::{ListBackend, ListKind, ListQuery};
use rounding_sync::{GraphListBackend, ListStoreAdapter, RetryPolicy, RoundingError};
use secrecy::SecretString;
use serde_json::json;
use std::time::Duration;

const ITEMS_PATH: &str = r"^/sites/site-1/lists/patients-list/items";

fn backend(server: &ServerGuard) -> GraphListBackend {
    let mut config = GraphConfig::default();
    config.base_url = server.url();
    config.site_id = "site-1".into();
    config.lists.patients = "patients-list".into();
    let backend = GraphListBackend::new(&config).unwrap();
    backend.set_access_token(SecretString::new("token-1".to_string()));
    backend
}

fn item(id: &str, mrn: &str) -> serde_json::Value {
    json!({
        "id": id,
        "lastModifiedDateTime": "2024-01-01T10:00:00Z",
        "fields": { "MRN": mrn, "Date": "2024-01-01" }
    })
}

#[tokio::test]
async fn test_query_sends_filter_and_follows_next_link() {
    let mut server = Server::new_async().await;
    let next = format!("{}/next-page", server.url());

    let first = server
        .mock("GET", Matcher::Regex(ITEMS_PATH.to_string()))
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("expand".into(), "fields".into()),
            Matcher::UrlEncoded("$filter".into(), "fields/MRN eq 'MRN1'".into()),
            Matcher::UrlEncoded("$orderby".into(), "fields/Date desc".into()),
        ]))
        .match_header("authorization", "Bearer token-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "value": [item("1", "MRN1")], "@odata.nextLink": next }).to_string())
        .create_async()
        .await;
    let second = server
        .mock("GET", "/next-page")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "value": [item("2", "MRN1")] }).to_string())
        .create_async()
        .await;

    let query = ListQuery::all().filter_eq("MRN", "MRN1").order_by_desc("Date");
    let items = backend(&server).query(ListKind::Patients, &query).await.unwrap();

    first.assert_async().await;
    second.assert_async().await;
    let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2"]);
    assert!(items[0].last_modified.is_some());
}

#[tokio::test]
async fn test_throttling_maps_to_rate_limited_with_retry_after() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", Matcher::Regex(ITEMS_PATH.to_string()))
        .with_status(429)
        .with_header("retry-after", "2")
        .create_async()
        .await;

    let result = backend(&server).query(ListKind::Patients, &ListQuery::all()).await;
    assert!(matches!(
        result,
        Err(RoundingError::RateLimited { retry_after: Some(delay) }) if delay == Duration::from_secs(2)
    ));
}

#[tokio::test]
async fn test_status_mapping() {
    let mut server = Server::new_async().await;
    let _missing = server
        .mock("DELETE", Matcher::Regex(format!("{}/41$", ITEMS_PATH)))
        .with_status(404)
        .with_body("item not found")
        .create_async()
        .await;
    let _broken = server
        .mock("DELETE", Matcher::Regex(format!("{}/42$", ITEMS_PATH)))
        .with_status(503)
        .create_async()
        .await;

    let backend = backend(&server);
    let missing = backend.delete(ListKind::Patients, "41").await;
    assert!(matches!(missing, Err(RoundingError::NotFound(_))));

    let broken = backend.delete(ListKind::Patients, "42").await.unwrap_err();
    assert!(matches!(broken, RoundingError::Remote { status: 503, .. }));
    assert!(broken.is_transient());
}

#[tokio::test]
async fn test_create_posts_fields() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Regex(ITEMS_PATH.to_string()))
        .match_body(Matcher::PartialJson(json!({ "fields": { "MRN": "MRN7" } })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(item("7", "MRN7").to_string())
        .create_async()
        .await;

    let mut fields = serde_json::Map::new();
    fields.insert("MRN".into(), json!("MRN7"));
    let created = backend(&server).create(ListKind::Patients, fields).await.unwrap();

    mock.assert_async().await;
    assert_eq!(created.id, "7");
}

#[tokio::test]
async fn test_adapter_retries_throttled_graph_calls() {
    let mut server = Server::new_async().await;
    let throttled = server
        .mock("GET", Matcher::Regex(ITEMS_PATH.to_string()))
        .with_status(429)
        .expect(3)
        .create_async()
        .await;

    let store = ListStoreAdapter::new(backend(&server), RetryPolicy::new(3, Duration::from_millis(10)));
    let result = rounding_sync::RemoteStore::fetch_patients(&store, None).await;

    assert!(matches!(result, Err(RoundingError::RateLimited { .. })));
    throttled.assert_async().await;
}
