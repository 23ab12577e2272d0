mod common;

use axum::Router;
use common::{client, spawn_proxy, spawn_router};

fn ok_backend() -> Router {
    Router::new().fallback(|| async { "ok" })
}

fn config(backend: &str) -> String {
    "\
apiVersion: v1
kind: Session
metadata: {name: web}
spec:
  max_age_seconds: 3600
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
    - moduleRef: {kind: Session, name: web}
"
    .replace("BACKEND", backend)
}

#[tokio::test]
async fn first_request_issues_exactly_one_cookie() {
    let (backend, _b) = spawn_router(ok_backend()).await;
    let (proxy, _p) = spawn_proxy(&config(&backend)).await;

    let resp = client()
        .get(format!("http://{proxy}/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cookies: Vec<_> = resp
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter(|v| v.starts_with("axproxy_session="))
        .collect();
    assert_eq!(cookies.len(), 1);
    let cookie = cookies[0];
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(cookie.contains("Max-Age=3600"));
    // plain HTTP request: Secure is not defaulted on
    assert!(!cookie.contains("Secure"));
}

#[tokio::test]
async fn returning_the_cookie_suppresses_reissue() {
    let (backend, _b) = spawn_router(ok_backend()).await;
    let (proxy, _p) = spawn_proxy(&config(&backend)).await;

    let first = client()
        .get(format!("http://{proxy}/"))
        .send()
        .await
        .unwrap();
    let session_cookie = first
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let second = client()
        .get(format!("http://{proxy}/again"))
        .header("cookie", &session_cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert!(second.headers().get("set-cookie").is_none());
}

#[tokio::test]
async fn forwarded_https_marks_the_cookie_secure() {
    let (backend, _b) = spawn_router(ok_backend()).await;
    // the source origin follows the forwarded scheme
    let config = "\
apiVersion: v1
kind: Session
metadata: {name: web}
spec: {}
---
apiVersion: v1
kind: AuthProxy
metadata: {name: edge}
spec:
  listen: 127.0.0.1:0
  upstreams:
    - source: https://{proxy}
      target: http://BACKEND
  chain:
    - moduleRef: {kind: Session, name: web}
"
    .replace("BACKEND", &backend);
    let (proxy, _p) = spawn_proxy(&config).await;

    let resp = client()
        .get(format!("http://{proxy}/"))
        .header("x-forwarded-proto", "https")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cookie = resp
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cookie.contains("Secure"));
}
