//! Shared helpers for the integration tests: spawn stub backends and a
//! fully wired proxy on ephemeral ports.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use gatehouse::{ManifestRegistry, ModuleRegistry};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serve a router on an ephemeral port; returns `host:port` and the
/// serving task.
pub async fn spawn_router(router: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), handle)
}

/// Decode a full manifest stream, register its modules and serve the
/// single declared proxy over plain TCP. The `{proxy}` placeholder in the
/// YAML is replaced with the bound `host:port` so upstream sources can
/// reference the proxy's own origin.
pub async fn spawn_proxy(config: &str) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let host = format!("127.0.0.1:{}", addr.port());
    let config = config.replace("{proxy}", &host);

    let registry = ManifestRegistry::builtin().unwrap();
    let proxies = registry.decode_proxies(&config).unwrap();
    assert_eq!(proxies.len(), 1, "test configs declare exactly one proxy");
    let modules = Arc::new(ModuleRegistry::default());
    for module in registry.decode_modules(&config).unwrap() {
        modules.register(module);
    }
    let router = proxies[0].build(&modules, false).unwrap();

    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (host, handle)
}

/// A reqwest client that keeps redirects visible to the test.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}
