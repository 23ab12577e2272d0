//! Cookie module: a process-wide jar for upstream cookies, merged with
//! client-supplied cookies on the way out.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::HeaderValue;
use once_cell::sync::OnceCell;
use reqwest::cookie::{CookieStore, Jar};
use serde::Deserialize;

use crate::manifest::{DecodedObject, KindHandler, ObjectMeta, ProductKind};
use crate::module::{DirectorNext, ModifyNext, Module, ProxyRequest, UpstreamResponse};
use crate::state::State;

pub const KIND_COOKIE: &str = "Cookie";

pub struct CookieModule {
    name: String,
    jar: OnceCell<Arc<Jar>>,
}

impl CookieModule {
    pub fn new(name: String) -> Self {
        CookieModule {
            name,
            jar: OnceCell::new(),
        }
    }

    fn jar(&self) -> Arc<Jar> {
        self.jar.get_or_init(|| Arc::new(Jar::default())).clone()
    }
}

fn collect_pairs(raw: &str, into: &mut BTreeMap<String, String>) {
    for cookie in raw.split(';') {
        if let Some((name, value)) = cookie.trim().split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                into.insert(name.to_string(), value.trim().to_string());
            }
        }
    }
}

impl Module for CookieModule {
    fn kind(&self) -> &'static str {
        KIND_COOKIE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn direct(&self, req: &mut ProxyRequest, state: &State, next: DirectorNext<'_>) {
        let jar = self.jar();
        let mut combined = BTreeMap::new();
        if let Some(stored) = jar.cookies(&req.url) {
            if let Ok(raw) = stored.to_str() {
                collect_pairs(raw, &mut combined);
            }
        }
        // Client cookies win on name collisions.
        for header in req.headers.get_all(COOKIE) {
            if let Ok(raw) = header.to_str() {
                collect_pairs(raw, &mut combined);
            }
        }
        if !combined.is_empty() {
            let joined = combined
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            req.headers.remove(COOKIE);
            if let Ok(value) = HeaderValue::from_str(&joined) {
                req.headers.insert(COOKIE, value);
            }
        }
        next.run(req, state)
    }

    fn modify_response(
        &self,
        resp: &mut UpstreamResponse,
        state: &State,
        next: ModifyNext<'_>,
    ) -> Result<()> {
        next.run(resp, state)?;
        let mut cookies = resp
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .peekable();
        if cookies.peek().is_some() {
            let jar = self.jar();
            for value in cookies {
                if let Ok(raw) = value.to_str() {
                    jar.add_cookie_str(raw, &resp.url);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct CookieDocV1 {
    #[serde(default)]
    metadata: ObjectMeta,
}

pub struct CookieHandler;

impl KindHandler for CookieHandler {
    fn kind(&self) -> &'static str {
        KIND_COOKIE
    }

    fn product(&self) -> ProductKind {
        ProductKind::Module
    }

    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject> {
        match api_version {
            "v1" => {
                let doc: CookieDocV1 = serde_yaml::from_value(doc.clone())?;
                Ok(DecodedObject::Module(Arc::new(CookieModule::new(
                    doc.metadata.name,
                ))))
            }
            other => bail!("unsupported apiVersion {other:?}"),
        }
    }
}
