mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use queryset::interface::QueryInterface;
use queryset::server::router;

const BASIC_SET: &str = r##"{
    "name": "QTEST_basic",
    "desc": "one station by id",
    "enabled": true,
    "params": [{"name": "stationid", "default": "42021"}],
    "queries": [{
        "name": "Basic",
        "type": "pipeline",
        "collection": "test_query",
        "return": true,
        "scripts": [
            "{\"$match\": {\"station_id\" : \"#stationid#\"}}",
            "{\"$project\": {\"_id\": 0, \"name\": 1}}"
        ]
    }]
}"##;

fn app() -> Router {
    let db = Arc::new(common::seeded());
    router(Arc::new(QueryInterface::new(db)))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

#[tokio::test]
async fn set_lifecycle_over_http() {
    let app = app();
    let (status, _) = call(&app, "PUT", "/v1/query", Some(BASIC_SET)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app, "GET", "/v1/query?names=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"["QTEST_basic"]"#);

    let (status, body) = call(&app, "GET", "/v1/query/QTEST_basic", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#""name":"QTEST_basic""#));

    let (status, _) = call(&app, "DELETE", "/v1/query/QTEST_basic", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(&app, "GET", "/v1/query/QTEST_basic", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, r#"{"error":"Set QTEST_basic not found"}"#);
}

#[tokio::test]
async fn exec_by_name_with_vars() {
    let app = app();
    call(&app, "PUT", "/v1/query", Some(BASIC_SET)).await;

    let (status, body) = call(&app, "GET", "/v1/exec/QTEST_basic", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        r#"{"results":[{"Name":"Basic","Docs":[{"name":"C14 - Pasco County Buoy, FL"}]}],"error":false}"#
    );

    let (status, body) = call(&app, "GET", "/v1/exec/QTEST_basic?stationid=XXXXXX", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"results":{"error":"No result"},"error":true}"#);

    let (status, _) = call(&app, "GET", "/v1/exec/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn exec_inline_set() {
    let app = app();
    let (status, body) = call(&app, "POST", "/v1/exec?stationid=44005", Some(BASIC_SET)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("GULF OF MAINE"));

    let (status, body) = call(&app, "POST", "/v1/exec", Some("{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.starts_with(r#"{"error":"#));
}

#[tokio::test]
async fn bad_input_is_a_400() {
    let app = app();
    let (status, _) = call(&app, "PUT", "/v1/query", Some(r#"{"name": "", "queries": []}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = BASIC_SET.replace(r#", "default": "42021""#, "");
    let (status, body) = call(&app, "POST", "/v1/exec", Some(&missing)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, r#"{"error":"Variable stationid not included with the call"}"#);
}

#[tokio::test]
async fn regex_routes() {
    let app = app();
    let (status, _) = call(&app, "PUT", "/v1/regex", Some(r#"{"name": "RTEST_digits", "expr": "^[0-9]+$"}"#)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "PUT", "/v1/regex", Some(r#"{"name": "RTEST_bad", "expr": "([0-9"}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, "GET", "/v1/regex/RTEST_digits", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"name":"RTEST_digits","desc":"","expr":"^[0-9]+$"}"#);

    let (status, _) = call(&app, "DELETE", "/v1/regex/RTEST_digits", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "DELETE", "/v1/regex/RTEST_digits", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn view_execution_without_a_runner_is_a_server_error() {
    let app = app();
    call(&app, "PUT", "/v1/query", Some(BASIC_SET)).await;
    let (status, _) = call(&app, "GET", "/v1/exec/QTEST_basic/view/comments/item-1", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}
