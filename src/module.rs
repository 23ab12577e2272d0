//! The module contract and the chain plumbing around it.
//!
//! A module participates in up to four hook points. Each hook receives a
//! `Next` cursor over the remainder of the declared chain; the default
//! trait methods just run the cursor, which is how a module opts out of a
//! hook. A cursor is consumed by `run`, so a hook cannot invoke its
//! continuation twice.
//!
//! Chain order: the first declared module is outermost. On admission it
//! sees the request first; on modify-response implementations do their
//! work after running the cursor, so effective response order is the
//! declared chain reversed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use url::Url;

use crate::state::State;

/// The outbound request as it travels through the director chain on its
/// way to the upstream.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Absolute URL; starts as the inbound `scheme://host/path?query` and
    /// is rewritten to the upstream target by the terminal director.
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Outbound `Host`; starts as the inbound host.
    pub host: String,
    /// Set once an upstream mapping matched. Unrouted requests surface as
    /// a bad gateway when the engine tries to send them.
    pub routed: bool,
}

/// The buffered upstream response as seen by the modify-response chain.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Final outbound request URL, for cookie scoping and audit.
    pub url: Url,
    pub method: Method,
}

pub type BoxResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Handler for a module-contributed route under the proxy's special
/// prefix.
pub type SpecialHandler = Arc<dyn Fn(Request, Arc<State>) -> BoxResponseFuture + Send + Sync>;

pub struct SpecialRoute {
    pub path: String,
    pub handler: SpecialHandler,
}

pub type AdmissionTerminal = dyn Fn(Request, Arc<State>) -> BoxResponseFuture + Send + Sync;

/// Continuation cursor for the admission hook.
pub struct AdmissionNext<'a> {
    chain: &'a [Arc<dyn Module>],
    terminal: &'a AdmissionTerminal,
}

impl<'a> AdmissionNext<'a> {
    pub fn new(chain: &'a [Arc<dyn Module>], terminal: &'a AdmissionTerminal) -> Self {
        AdmissionNext { chain, terminal }
    }

    pub async fn run(self, req: Request, state: Arc<State>) -> Response {
        match self.chain.split_first() {
            Some((module, rest)) => {
                let next = AdmissionNext {
                    chain: rest,
                    terminal: self.terminal,
                };
                module.handle(req, state, next).await
            }
            None => (self.terminal)(req, state).await,
        }
    }
}

/// Continuation cursor for special-route middleware.
pub struct SpecialNext<'a> {
    chain: &'a [Arc<dyn Module>],
    terminal: &'a SpecialHandler,
}

impl<'a> SpecialNext<'a> {
    pub fn new(chain: &'a [Arc<dyn Module>], terminal: &'a SpecialHandler) -> Self {
        SpecialNext { chain, terminal }
    }

    pub async fn run(self, req: Request, state: Arc<State>) -> Response {
        match self.chain.split_first() {
            Some((module, rest)) => {
                let next = SpecialNext {
                    chain: rest,
                    terminal: self.terminal,
                };
                module.around_special(req, state, next).await
            }
            None => (self.terminal)(req, state).await,
        }
    }
}

pub type DirectorTerminal<'t> = dyn Fn(&mut ProxyRequest, &State) + Send + Sync + 't;

/// Continuation cursor for the director hook.
pub struct DirectorNext<'a> {
    chain: &'a [Arc<dyn Module>],
    terminal: &'a DirectorTerminal<'a>,
}

impl<'a> DirectorNext<'a> {
    pub fn new(chain: &'a [Arc<dyn Module>], terminal: &'a DirectorTerminal<'a>) -> Self {
        DirectorNext { chain, terminal }
    }

    pub fn run(self, req: &mut ProxyRequest, state: &State) {
        match self.chain.split_first() {
            Some((module, rest)) => {
                let next = DirectorNext {
                    chain: rest,
                    terminal: self.terminal,
                };
                module.direct(req, state, next);
            }
            None => (self.terminal)(req, state),
        }
    }
}

pub type ModifyTerminal<'t> = dyn Fn(&mut UpstreamResponse, &State) -> Result<()> + Send + Sync + 't;

/// Continuation cursor for the modify-response hook.
pub struct ModifyNext<'a> {
    chain: &'a [Arc<dyn Module>],
    terminal: &'a ModifyTerminal<'a>,
}

impl<'a> ModifyNext<'a> {
    pub fn new(chain: &'a [Arc<dyn Module>], terminal: &'a ModifyTerminal<'a>) -> Self {
        ModifyNext { chain, terminal }
    }

    pub fn run(self, resp: &mut UpstreamResponse, state: &State) -> Result<()> {
        match self.chain.split_first() {
            Some((module, rest)) => {
                let next = ModifyNext {
                    chain: rest,
                    terminal: self.terminal,
                };
                module.modify_response(resp, state, next)
            }
            None => (self.terminal)(resp, state),
        }
    }
}

/// A chain participant, uniquely identified by `(kind, name)`. Built from
/// a manifest document, registered at process start and owned by the
/// module registry for the process lifetime.
#[async_trait]
pub trait Module: Send + Sync {
    fn kind(&self) -> &'static str;

    fn name(&self) -> &str;

    /// Routes mounted under the proxy's special prefix, bypassing the
    /// upstream entirely.
    fn special_routes(&self) -> Vec<SpecialRoute> {
        Vec::new()
    }

    /// Outermost per-request hook, wrapping the reverse-proxy invocation.
    async fn handle(&self, req: Request, state: Arc<State>, next: AdmissionNext<'_>) -> Response {
        next.run(req, state).await
    }

    /// Mutate the outbound request just before it leaves to the upstream.
    fn direct(&self, req: &mut ProxyRequest, state: &State, next: DirectorNext<'_>) {
        next.run(req, state)
    }

    /// Observe or rewrite the buffered upstream response. Implementations
    /// run the cursor first so the last chain entry touches the raw
    /// response and the first touches what the client will see.
    fn modify_response(
        &self,
        resp: &mut UpstreamResponse,
        state: &State,
        next: ModifyNext<'_>,
    ) -> Result<()> {
        next.run(resp, state)
    }

    /// Wrapper applied around every mounted special route.
    async fn around_special(
        &self,
        req: Request,
        state: Arc<State>,
        next: SpecialNext<'_>,
    ) -> Response {
        next.run(req, state).await
    }
}

/// `(kind, name)` keyed store of active modules. Registration overwrites
/// silently; configuration owns uniqueness.
#[derive(Default)]
pub struct ModuleRegistry {
    inner: RwLock<HashMap<(String, String), Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn register(&self, module: Arc<dyn Module>) {
        tracing::info!(
            module_kind = module.kind(),
            module_name = module.name(),
            "module registered"
        );
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(
                (module.kind().to_string(), module.name().to_string()),
                module,
            );
        }
    }

    pub fn get(&self, kind: &str, name: &str) -> Result<Arc<dyn Module>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.get(&(kind.to_string(), name.to_string())).cloned())
            .ok_or_else(|| anyhow!("module not found, kind: {kind}, name: {name}"))
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::response::IntoResponse;
    use std::sync::Mutex;

    struct Probe {
        label: &'static str,
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Module for Probe {
        fn kind(&self) -> &'static str {
            "Probe"
        }
        fn name(&self) -> &str {
            self.label
        }
        async fn handle(
            &self,
            req: Request,
            state: Arc<State>,
            next: AdmissionNext<'_>,
        ) -> Response {
            self.order.lock().unwrap().push(format!("{}:in", self.label));
            let resp = next.run(req, state).await;
            self.order
                .lock()
                .unwrap()
                .push(format!("{}:out", self.label));
            resp
        }
        fn modify_response(
            &self,
            resp: &mut UpstreamResponse,
            state: &State,
            next: ModifyNext<'_>,
        ) -> Result<()> {
            next.run(resp, state)?;
            self.order.lock().unwrap().push(self.label.to_string());
            Ok(())
        }
    }

    fn probe_chain(order: &Arc<Mutex<Vec<String>>>) -> Vec<Arc<dyn Module>> {
        ["a", "b", "c"]
            .into_iter()
            .map(|label| {
                Arc::new(Probe {
                    label,
                    order: order.clone(),
                }) as Arc<dyn Module>
            })
            .collect()
    }

    #[tokio::test]
    async fn admission_runs_first_module_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain = probe_chain(&order);
        let terminal_order = order.clone();
        let terminal = move |_req: Request, _st: Arc<State>| -> BoxResponseFuture {
            let order = terminal_order.clone();
            Box::pin(async move {
                order.lock().unwrap().push("terminal".to_string());
                StatusCode::OK.into_response()
            })
        };

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let state = Arc::new(State::new());
        AdmissionNext::new(&chain, &terminal).run(req, state).await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["a:in", "b:in", "c:in", "terminal", "c:out", "b:out", "a:out"]
        );
    }

    #[tokio::test]
    async fn modify_response_runs_last_module_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let chain = probe_chain(&order);
        let terminal = |_resp: &mut UpstreamResponse, _st: &State| -> Result<()> { Ok(()) };

        let mut resp = UpstreamResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            url: Url::parse("http://upstream.local/").unwrap(),
            method: Method::GET,
        };
        let state = State::new();
        ModifyNext::new(&chain, &terminal)
            .run(&mut resp, &state)
            .unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn registry_get_errors_when_absent() {
        let registry = ModuleRegistry::default();
        assert!(registry.get("Probe", "missing").is_err());
    }
}
