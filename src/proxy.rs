//! The proxy engine: upstream dispatch, chain wiring, the special-route
//! mux and the TLS listener.
//!
//! A configured `AuthProxy` resolves its chain against the module
//! registry and becomes an axum `Router` with two routes: paths under the
//! special prefix go to module-contributed handlers, everything else runs
//! the admission pipeline ending in the reverse-proxy terminal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use serde::Deserialize;
use url::Url;

use crate::manifest::{DecodedObject, KindHandler, ObjectMeta, ProductKind};
use crate::module::{
    AdmissionNext, BoxResponseFuture, DirectorNext, ModifyNext, Module, ModuleRegistry,
    ProxyRequest, SpecialHandler, SpecialNext, UpstreamResponse,
};
use crate::state::State;
use crate::util::{bad_gateway, request_host, request_scheme, strip_hop_by_hop, SchemeHint};

pub const KIND_AUTH_PROXY: &str = "AuthProxy";

#[derive(Debug, Clone, Deserialize)]
pub struct Upstream {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleRef {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainStep {
    #[serde(rename = "moduleRef", default)]
    pub module_ref: ModuleRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthProxySpec {
    #[serde(default)]
    pub listen: String,
    #[serde(default = "default_special_prefix")]
    pub special_prefix: String,
    #[serde(default)]
    pub tls_crt_file: String,
    #[serde(default)]
    pub tls_key_file: String,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub chain: Vec<ChainStep>,
}

fn default_special_prefix() -> String {
    "/_".to_string()
}

impl Default for AuthProxySpec {
    fn default() -> Self {
        AuthProxySpec {
            listen: String::new(),
            special_prefix: default_special_prefix(),
            tls_crt_file: String::new(),
            tls_key_file: String::new(),
            upstreams: Vec::new(),
            chain: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthProxy {
    name: String,
    spec: AuthProxySpec,
}

impl AuthProxy {
    pub fn new(name: String, spec: AuthProxySpec) -> Self {
        AuthProxy { name, spec }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &AuthProxySpec {
        &self.spec
    }

    /// Resolve everything against the module registry and produce the
    /// router. `tls` tells handlers whether this listener terminates TLS
    /// itself (tests serve plain TCP and rely on `X-Forwarded-Proto`).
    pub fn build(&self, modules: &ModuleRegistry, tls: bool) -> Result<Router> {
        let upstreams = build_upstream_map(&self.spec.upstreams)?;

        let mut chain: Vec<Arc<dyn Module>> = Vec::with_capacity(self.spec.chain.len());
        for step in &self.spec.chain {
            let module = modules
                .get(&step.module_ref.kind, &step.module_ref.name)
                .with_context(|| format!("resolve chain of proxy {:?}", self.name))?;
            chain.push(module);
        }

        let special = collect_special_routes(&self.name, &chain)?;

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("build upstream client")?;

        let engine = Arc::new(ProxyEngine {
            name: self.name.clone(),
            prefix: self.spec.special_prefix.clone(),
            upstreams,
            chain,
            special,
            client,
            tls,
        });

        Ok(Router::new()
            .fallback(root_handler)
            .with_state(engine))
    }

    /// Bind the configured address with TLS and serve until terminated.
    pub async fn listen_and_serve(self, modules: Arc<ModuleRegistry>) -> Result<()> {
        let router = self.build(&modules, true)?;
        let addr: SocketAddr = self
            .spec
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.spec.listen))?;
        let tls = RustlsConfig::from_pem_file(&self.spec.tls_crt_file, &self.spec.tls_key_file)
            .await
            .with_context(|| {
                format!(
                    "load TLS key pair ({:?}, {:?})",
                    self.spec.tls_crt_file, self.spec.tls_key_file
                )
            })?;
        tracing::info!(proxy_name = %self.name, listen = %self.spec.listen, "proxy listening");
        axum_server::bind_rustls(addr, tls)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .with_context(|| format!("serve proxy {:?}", self.name))
    }
}

fn build_upstream_map(upstreams: &[Upstream]) -> Result<HashMap<String, Url>> {
    let mut map = HashMap::new();
    for upstream in upstreams {
        let source = upstream.source.trim().to_ascii_lowercase();
        if source.is_empty() {
            bail!("upstream with empty source");
        }
        let target = Url::parse(&upstream.target)
            .with_context(|| format!("invalid upstream target {:?}", upstream.target))?;
        if map.insert(source.clone(), target).is_some() {
            bail!("duplicate upstream source {source:?}");
        }
    }
    Ok(map)
}

fn collect_special_routes(
    proxy_name: &str,
    chain: &[Arc<dyn Module>],
) -> Result<HashMap<String, SpecialHandler>> {
    let mut routes: HashMap<String, SpecialHandler> = HashMap::new();
    let mut owners: HashMap<String, (String, String)> = HashMap::new();
    for module in chain.iter().rev() {
        for route in module.special_routes() {
            if let Some((kind, name)) = owners.get(&route.path) {
                bail!(
                    "special route already registered: {} (new {}/{}, existing {}/{})",
                    route.path,
                    module.kind(),
                    module.name(),
                    kind,
                    name
                );
            }
            tracing::info!(
                proxy_name = %proxy_name,
                path = %route.path,
                module_kind = module.kind(),
                module_name = module.name(),
                "registering special route"
            );
            owners.insert(
                route.path.clone(),
                (module.kind().to_string(), module.name().to_string()),
            );
            routes.insert(route.path, route.handler);
        }
    }
    Ok(routes)
}

struct ProxyEngine {
    name: String,
    prefix: String,
    upstreams: HashMap<String, Url>,
    chain: Vec<Arc<dyn Module>>,
    special: HashMap<String, SpecialHandler>,
    client: reqwest::Client,
    tls: bool,
}

async fn root_handler(
    axum::extract::State(engine): axum::extract::State<Arc<ProxyEngine>>,
    mut req: Request,
) -> Response {
    req.extensions_mut().insert(SchemeHint {
        https: engine.tls,
    });
    let state = Arc::new(State::new());
    let path = req.uri().path().to_string();
    if let Some(rest) = engine.strip_special(&path) {
        return engine.serve_special(&rest, req, state).await;
    }
    engine.serve_proxy(req, state).await
}

impl ProxyEngine {
    /// Paths under `{prefix}/` belong to the special mux; the returned
    /// remainder keeps its leading slash.
    fn strip_special(&self, path: &str) -> Option<String> {
        if self.prefix.is_empty() {
            return None;
        }
        path.strip_prefix(&self.prefix)
            .filter(|rest| rest.starts_with('/'))
            .map(|rest| rest.to_string())
    }

    async fn serve_special(&self, path: &str, req: Request, state: Arc<State>) -> Response {
        match self.special.get(path) {
            Some(handler) => SpecialNext::new(&self.chain, handler).run(req, state).await,
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn serve_proxy(self: Arc<Self>, req: Request, state: Arc<State>) -> Response {
        let engine = self.clone();
        let terminal = move |req: Request, state: Arc<State>| -> BoxResponseFuture {
            let engine = engine.clone();
            Box::pin(async move { engine.forward(req, state).await })
        };
        AdmissionNext::new(&self.chain, &terminal).run(req, state).await
    }

    /// The admission terminal: run the director chain over the buffered
    /// request, send it upstream, run the modify-response chain over the
    /// buffered answer.
    async fn forward(&self, req: Request, state: Arc<State>) -> Response {
        let scheme = request_scheme(&req);
        let host = request_host(&req);
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(body) => body,
            Err(err) => {
                return self.error_response(&state, anyhow!(err).context("read request body"))
            }
        };
        let url = match Url::parse(&format!("{scheme}://{host}{path_and_query}")) {
            Ok(url) => url,
            Err(err) => {
                return self
                    .error_response(&state, anyhow!(err).context("parse inbound request url"))
            }
        };

        let mut preq = ProxyRequest {
            method: parts.method.clone(),
            url,
            headers: parts.headers,
            body,
            host: host.clone(),
            routed: false,
        };

        {
            let terminal =
                |preq: &mut ProxyRequest, _state: &State| self.rewrite_to_upstream(preq);
            DirectorNext::new(&self.chain, &terminal).run(&mut preq, &state);
        }

        if !preq.routed {
            let source = format!("{scheme}://{host}").to_ascii_lowercase();
            return self.error_response(
                &state,
                anyhow!("no upstream for source origin {source:?}"),
            );
        }

        let mut headers = preq.headers.clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(CONTENT_LENGTH);
        headers.remove(HOST);
        if let Ok(value) = HeaderValue::from_str(&preq.host) {
            headers.insert(HOST, value);
        }

        let upstream = match self
            .client
            .request(preq.method.clone(), preq.url.clone())
            .headers(headers)
            .body(preq.body.clone())
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                return self.error_response(&state, anyhow!(err).context("upstream request"))
            }
        };

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut resp_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut resp_headers);
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(err) => {
                return self.error_response(&state, anyhow!(err).context("read upstream body"))
            }
        };

        let mut response = UpstreamResponse {
            status,
            headers: resp_headers,
            body,
            url: preq.url.clone(),
            method: preq.method.clone(),
        };

        {
            let terminal =
                |_resp: &mut UpstreamResponse, _state: &State| -> Result<()> { Ok(()) };
            if let Err(err) = ModifyNext::new(&self.chain, &terminal).run(&mut response, &state) {
                return self.error_response(&state, err.context("modify response"));
            }
        }

        // The body is buffered; let hyper restate its length.
        response.headers.remove(CONTENT_LENGTH);
        let mut out = Response::new(Body::from(response.body));
        *out.status_mut() = response.status;
        *out.headers_mut() = response.headers;
        out
    }

    /// The terminal director: map the source origin onto its target and
    /// rewrite the outbound URL. Unknown origins leave the request
    /// untouched.
    fn rewrite_to_upstream(&self, preq: &mut ProxyRequest) {
        let key = format!("{}://{}", preq.url.scheme(), preq.host).to_ascii_lowercase();
        let Some(target) = self.upstreams.get(&key) else {
            return;
        };

        let joined = join_paths(target.path(), preq.url.path());
        let query = merge_queries(target.query(), preq.url.query());
        let target_host = authority_of(target);
        let mut rewritten = format!("{}://{}{}", target.scheme(), target_host, joined);
        if !query.is_empty() {
            rewritten.push('?');
            rewritten.push_str(&query);
        }
        match Url::parse(&rewritten) {
            Ok(url) => {
                preq.url = url;
                preq.host = target_host;
                preq.routed = true;
            }
            Err(err) => {
                tracing::error!(
                    proxy_name = %self.name,
                    url = %rewritten,
                    error = %err,
                    "failed to build upstream url"
                );
            }
        }
    }

    fn error_response(&self, state: &State, err: anyhow::Error) -> Response {
        state.set_error(format!("{err:#}"));
        tracing::error!(
            proxy_name = %self.name,
            request_id = %state.request_id(),
            error = %format!("{err:#}"),
            "proxy error"
        );
        bad_gateway()
    }
}

fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Join the target's base path with the request path using exactly one
/// slash; a bare `/` request maps onto the target path alone.
fn join_paths(target: &str, request: &str) -> String {
    let target = if target.is_empty() { "/" } else { target };
    if request.is_empty() || request == "/" {
        return target.to_string();
    }
    match (target.ends_with('/'), request.starts_with('/')) {
        (true, true) => format!("{}{}", target, &request[1..]),
        (false, false) => format!("{target}/{request}"),
        _ => format!("{target}{request}"),
    }
}

fn merge_queries(target: Option<&str>, request: Option<&str>) -> String {
    match (
        target.filter(|q| !q.is_empty()),
        request.filter(|q| !q.is_empty()),
    ) {
        (Some(t), Some(r)) => format!("{t}&{r}"),
        (Some(t), None) => t.to_string(),
        (None, Some(r)) => r.to_string(),
        (None, None) => String::new(),
    }
}

#[derive(Debug, Deserialize)]
struct AuthProxyDocV1 {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: AuthProxySpec,
}

pub struct AuthProxyHandler;

impl KindHandler for AuthProxyHandler {
    fn kind(&self) -> &'static str {
        KIND_AUTH_PROXY
    }

    fn product(&self) -> ProductKind {
        ProductKind::Proxy
    }

    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject> {
        match api_version {
            "v1" => {
                let doc: AuthProxyDocV1 = serde_yaml::from_value(doc.clone())?;
                Ok(DecodedObject::Proxy(AuthProxy::new(
                    doc.metadata.name,
                    doc.spec,
                )))
            }
            other => bail!("unsupported apiVersion {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_join_inserts_exactly_one_slash() {
        assert_eq!(join_paths("/api", "/users/42"), "/api/users/42");
        assert_eq!(join_paths("/api/", "/users"), "/api/users");
        assert_eq!(join_paths("/api", "users"), "/api/users");
        assert_eq!(join_paths("/", "/foo"), "/foo");
        assert_eq!(join_paths("/api", "/"), "/api");
        assert_eq!(join_paths("/", "/"), "/");
    }

    #[test]
    fn queries_merge_with_ampersand() {
        assert_eq!(merge_queries(Some("a=1"), Some("b=2")), "a=1&b=2");
        assert_eq!(merge_queries(Some("a=1"), None), "a=1");
        assert_eq!(merge_queries(None, Some("b=2")), "b=2");
        assert_eq!(merge_queries(None, None), "");
    }

    #[test]
    fn upstream_sources_are_case_insensitive_and_unique() {
        let map = build_upstream_map(&[Upstream {
            source: "HTTPS://Front.Local".into(),
            target: "http://back.local:8080".into(),
        }])
        .unwrap();
        assert!(map.contains_key("https://front.local"));

        let err = build_upstream_map(&[
            Upstream {
                source: "https://front.local".into(),
                target: "http://a".into(),
            },
            Upstream {
                source: "HTTPS://FRONT.LOCAL".into(),
                target: "http://b".into(),
            },
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate upstream source"));
    }

    #[test]
    fn bad_target_url_is_a_config_error() {
        assert!(build_upstream_map(&[Upstream {
            source: "https://front.local".into(),
            target: "::not a url::".into(),
        }])
        .is_err());
    }

    #[test]
    fn authority_keeps_explicit_ports() {
        let url = Url::parse("http://back.local:8080/api").unwrap();
        assert_eq!(authority_of(&url), "back.local:8080");
        let url = Url::parse("http://back.local/api").unwrap();
        assert_eq!(authority_of(&url), "back.local");
    }
}
