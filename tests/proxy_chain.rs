mod common;

use axum::extract::Request;
use axum::{Json, Router};
use serde_json::json;

use common::{client, spawn_proxy, spawn_router};

/// Upstream stub that echoes what it received.
fn echo_backend() -> Router {
    Router::new().fallback(|req: Request| async move {
        let headers: serde_json::Map<String, serde_json::Value> = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), json!(v)))
            })
            .collect();
        Json(json!({
            "method": req.method().as_str(),
            "path": req.uri().path(),
            "query": req.uri().query().unwrap_or(""),
            "headers": headers,
        }))
    })
}

#[tokio::test]
async fn plain_passthrough_preserves_path_and_query() {
    let (backend, _b) = spawn_router(echo_backend()).await;
    let config = "\
apiVersion: v1
kind: AuthProxy
metadata: {name: edge}
spec:
  listen: 127.0.0.1:0
  upstreams:
    - source: http://{proxy}
      target: http://BACKEND
  chain: []
"
    .replace("BACKEND", &backend);
    let (proxy, _p) = spawn_proxy(&config).await;

    let resp = client()
        .get(format!("http://{proxy}/foo?x=1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["method"], json!("GET"));
    assert_eq!(body["path"], json!("/foo"));
    assert_eq!(body["query"], json!("x=1"));
    // the outbound Host is the target's
    assert_eq!(body["headers"]["host"], json!(backend));
}

#[tokio::test]
async fn target_base_path_is_joined_with_one_slash() {
    let (backend, _b) = spawn_router(echo_backend()).await;
    let config = "\
apiVersion: v1
kind: AuthProxy
metadata: {name: edge}
spec:
  listen: 127.0.0.1:0
  upstreams:
    - source: http://{proxy}
      target: http://BACKEND/api
  chain: []
"
    .replace("BACKEND", &backend);
    let (proxy, _p) = spawn_proxy(&config).await;

    let resp = client()
        .get(format!("http://{proxy}/users/42"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["path"], json!("/api/users/42"));

    let resp = client()
        .get(format!("http://{proxy}/"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["path"], json!("/api"));
}

#[tokio::test]
async fn target_query_merges_before_request_query() {
    let (backend, _b) = spawn_router(echo_backend()).await;
    let config = "\
apiVersion: v1
kind: AuthProxy
metadata: {name: edge}
spec:
  listen: 127.0.0.1:0
  upstreams:
    - source: http://{proxy}
      target: http://BACKEND/api?tenant=blue
  chain: []
"
    .replace("BACKEND", &backend);
    let (proxy, _p) = spawn_proxy(&config).await;

    let resp = client()
        .get(format!("http://{proxy}/list?x=1"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["query"], json!("tenant=blue&x=1"));
}

#[tokio::test]
async fn unknown_source_origin_is_a_bad_gateway() {
    let config = "\
apiVersion: v1
kind: AuthProxy
metadata: {name: edge}
spec:
  listen: 127.0.0.1:0
  upstreams:
    - source: https://front.local
      target: http://back.local:8080
  chain: []
";
    let (proxy, _p) = spawn_proxy(config).await;

    let resp = client()
        .get(format!("http://{proxy}/anything"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    assert_eq!(resp.text().await.unwrap(), "bad gateway");
}

#[tokio::test]
async fn chain_runs_forward_on_request_and_backward_on_response() {
    let (backend, _b) = spawn_router(echo_backend()).await;
    let config = "\
apiVersion: v1
kind: CustomHeaders
metadata: {name: first}
spec:
  request:
    - {op: set, header: x-probe, value: first}
  response:
    - {op: set, header: x-resp, value: first}
---
apiVersion: v1
kind: CustomHeaders
metadata: {name: second}
spec:
  request:
    - {op: set, header: x-probe, value: second}
  response:
    - {op: set, header: x-resp, value: second}
---
apiVersion: v1
kind: AuthProxy
metadata: {name: edge}
spec:
  listen: 127.0.0.1:0
  upstreams:
    - source: http://{proxy}
      target: http://BACKEND
  chain:
    - moduleRef: {kind: CustomHeaders, name: first}
    - moduleRef: {kind: CustomHeaders, name: second}
"
    .replace("BACKEND", &backend);
    let (proxy, _p) = spawn_proxy(&config).await;

    let resp = client()
        .get(format!("http://{proxy}/probe"))
        .send()
        .await
        .unwrap();
    // director order: first, then second -> the upstream saw "second"
    let resp_headers = resp.headers().clone();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["headers"]["x-probe"], json!("second"));
    // response order: second, then first -> the client sees "first"
    assert_eq!(resp_headers.get("x-resp").unwrap(), "first");
}

#[tokio::test]
async fn request_bodies_are_forwarded() {
    let (backend, _b) = spawn_router(Router::new().fallback(
        |body: axum::body::Bytes| async move { body },
    ))
    .await;
    let config = "\
apiVersion: v1
kind: AuthProxy
metadata: {name: edge}
spec:
  listen: 127.0.0.1:0
  upstreams:
    - source: http://{proxy}
      target: http://BACKEND
  chain: []
"
    .replace("BACKEND", &backend);
    let (proxy, _p) = spawn_proxy(&config).await;

    let resp = client()
        .post(format!("http://{proxy}/submit"))
        .body("payload bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "payload bytes");
}
