//! Session module: binds an in-process session to a browser cookie.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::HeaderValue;
use axum::response::Response;
use serde::Deserialize;

use crate::manifest::{DecodedObject, KindHandler, ObjectMeta, ProductKind};
use crate::module::{AdmissionNext, Module, SpecialNext};
use crate::session::Session;
use crate::state::State;
use crate::util::{random_url_safe, request_scheme};

pub const KIND_SESSION: &str = "Session";

const DEFAULT_COOKIE_NAME: &str = "axproxy_session";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionSpec {
    #[serde(default)]
    pub cookie_name: Option<String>,
    #[serde(default)]
    pub cookie_path: Option<String>,
    #[serde(default)]
    pub cookie_domain: Option<String>,
    #[serde(default)]
    pub cookie_secure: Option<bool>,
    #[serde(default)]
    pub cookie_http_only: Option<bool>,
    #[serde(default)]
    pub cookie_same_site: Option<String>,
    #[serde(default)]
    pub max_age_seconds: i64,
}

pub struct SessionModule {
    name: String,
    spec: SessionSpec,
    store: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionModule {
    pub fn new(name: String, spec: SessionSpec) -> Self {
        SessionModule {
            name,
            spec,
            store: RwLock::new(HashMap::new()),
        }
    }

    fn cookie_name(&self) -> &str {
        self.spec
            .cookie_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_COOKIE_NAME)
    }

    fn cookie_path(&self) -> &str {
        self.spec
            .cookie_path
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("/")
    }

    fn cookie_same_site(&self) -> &'static str {
        match self
            .spec
            .cookie_same_site
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "strict" => "Strict",
            "none" => "None",
            _ => "Lax",
        }
    }

    fn cookie_value<B>(&self, req: &Request<B>) -> Option<String> {
        let wanted = self.cookie_name();
        for header in req.headers().get_all(COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            for cookie in raw.split(';') {
                if let Some(value) = cookie.trim().strip_prefix(wanted) {
                    if let Some(value) = value.strip_prefix('=') {
                        if !value.is_empty() {
                            return Some(value.to_string());
                        }
                    }
                }
            }
        }
        None
    }

    fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.store.read().ok()?.get(id).cloned()
    }

    fn save(&self, sess: Arc<Session>) {
        if let Ok(mut store) = self.store.write() {
            store.insert(sess.id().to_string(), sess);
        }
    }

    fn delete(&self, id: &str) {
        if let Ok(mut store) = self.store.write() {
            store.remove(id);
        }
    }

    /// Resolve the request's session: a live cookie-bound one, or a fresh
    /// one when the cookie is absent, unknown or expired. Expired entries
    /// are evicted on the way.
    fn get_or_create<B>(&self, req: &Request<B>) -> (Arc<Session>, bool) {
        if let Some(id) = self.cookie_value(req) {
            if let Some(sess) = self.lookup(&id) {
                if sess.is_expired() {
                    self.delete(&id);
                } else {
                    sess.touch();
                    return (sess, false);
                }
            }
        }
        let sess = Arc::new(Session::new(
            random_url_safe(32),
            self.spec.max_age_seconds,
        ));
        self.save(sess.clone());
        (sess, true)
    }

    fn build_set_cookie(&self, https: bool, sess: &Session) -> Option<HeaderValue> {
        let mut cookie = format!(
            "{}={}; Path={}; SameSite={}",
            self.cookie_name(),
            sess.id(),
            self.cookie_path(),
            self.cookie_same_site()
        );
        if let Some(domain) = self.spec.cookie_domain.as_deref().filter(|s| !s.is_empty()) {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if self.spec.max_age_seconds > 0 {
            cookie.push_str(&format!("; Max-Age={}", self.spec.max_age_seconds));
        }
        if self.spec.cookie_http_only.unwrap_or(true) {
            cookie.push_str("; HttpOnly");
        }
        if self.spec.cookie_secure.unwrap_or(https) {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).ok()
    }

    fn bind<B>(&self, req: &Request<B>, state: &State) -> (Arc<Session>, bool, bool) {
        let https = request_scheme(req) == "https";
        let (sess, is_new) = self.get_or_create(req);
        state.set_session(sess.clone());
        (sess, is_new, https)
    }

    fn attach_cookie(&self, resp: &mut Response, sess: &Session, https: bool) {
        if let Some(value) = self.build_set_cookie(https, sess) {
            resp.headers_mut().append(SET_COOKIE, value);
        }
    }
}

#[async_trait]
impl Module for SessionModule {
    fn kind(&self) -> &'static str {
        KIND_SESSION
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, req: Request, state: Arc<State>, next: AdmissionNext<'_>) -> Response {
        let (sess, is_new, https) = self.bind(&req, &state);
        let mut resp = next.run(req, state).await;
        if is_new {
            self.attach_cookie(&mut resp, &sess, https);
        }
        resp
    }

    async fn around_special(
        &self,
        req: Request,
        state: Arc<State>,
        next: SpecialNext<'_>,
    ) -> Response {
        let (sess, is_new, https) = self.bind(&req, &state);
        let mut resp = next.run(req, state).await;
        if is_new {
            self.attach_cookie(&mut resp, &sess, https);
        }
        resp
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionDocV1 {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: SessionSpec,
}

pub struct SessionHandler;

impl KindHandler for SessionHandler {
    fn kind(&self) -> &'static str {
        KIND_SESSION
    }

    fn product(&self) -> ProductKind {
        ProductKind::Module
    }

    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject> {
        match api_version {
            "v1" => {
                let doc: SessionDocV1 = serde_yaml::from_value(doc.clone())?;
                Ok(DecodedObject::Module(Arc::new(SessionModule::new(
                    doc.metadata.name,
                    doc.spec,
                ))))
            }
            other => bail!("unsupported apiVersion {other:?}"),
        }
    }
}
