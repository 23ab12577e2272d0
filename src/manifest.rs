//! Manifest envelope decoding and the kind→handler registry.
//!
//! Configuration is a stream of YAML documents, each carrying the
//! `{apiVersion, kind, metadata}` envelope. A handler is registered per
//! kind and produces exactly one product type; a decode pass requests one
//! product type and silently skips documents destined for the other, which
//! is how one stream yields proxies in one pass and modules in another.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::module::Module;
use crate::proxy::AuthProxy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
}

/// The product type a handler emits; decode passes filter by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductKind {
    Proxy,
    Module,
}

pub enum DecodedObject {
    Proxy(AuthProxy),
    Module(Arc<dyn Module>),
}

impl std::fmt::Debug for DecodedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodedObject::Proxy(p) => f.debug_tuple("Proxy").field(p).finish(),
            DecodedObject::Module(m) => f
                .debug_tuple("Module")
                .field(&m.kind())
                .field(&m.name())
                .finish(),
        }
    }
}

pub trait KindHandler: Send + Sync {
    fn kind(&self) -> &'static str;
    fn product(&self) -> ProductKind;
    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject>;
}

pub struct ManifestRegistry {
    handlers: HashMap<&'static str, Arc<dyn KindHandler>>,
}

impl ManifestRegistry {
    pub fn new() -> Self {
        ManifestRegistry {
            handlers: HashMap::new(),
        }
    }

    /// A registry with every built-in kind wired up.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::proxy::AuthProxyHandler))?;
        registry.register(Arc::new(crate::modules::audit::AuditHandler))?;
        registry.register(Arc::new(crate::modules::auth_oidc::AuthOidcHandler))?;
        registry.register(Arc::new(crate::modules::cookie::CookieHandler))?;
        registry.register(Arc::new(crate::modules::custom_headers::CustomHeadersHandler))?;
        registry.register(Arc::new(crate::modules::enrichment::EnrichmentHandler))?;
        registry.register(Arc::new(crate::modules::rewriter::RewriterHandler))?;
        registry.register(Arc::new(crate::modules::session::SessionHandler))?;
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn KindHandler>) -> Result<()> {
        let kind = handler.kind();
        if self.handlers.contains_key(kind) {
            bail!("duplicate handler for kind {kind}");
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn decode_proxies(&self, src: &str) -> Result<Vec<AuthProxy>> {
        Ok(self
            .decode_all(src, ProductKind::Proxy)?
            .into_iter()
            .filter_map(|obj| match obj {
                DecodedObject::Proxy(proxy) => Some(proxy),
                DecodedObject::Module(_) => None,
            })
            .collect())
    }

    pub fn decode_modules(&self, src: &str) -> Result<Vec<Arc<dyn Module>>> {
        Ok(self
            .decode_all(src, ProductKind::Module)?
            .into_iter()
            .filter_map(|obj| match obj {
                DecodedObject::Module(module) => Some(module),
                DecodedObject::Proxy(_) => None,
            })
            .collect())
    }

    /// Decode every document in the stream, keeping only objects of the
    /// requested product kind.
    pub fn decode_all(&self, src: &str, want: ProductKind) -> Result<Vec<DecodedObject>> {
        let mut out = Vec::new();
        for document in serde_yaml::Deserializer::from_str(src) {
            let value =
                serde_yaml::Value::deserialize(document).context("decode yaml document")?;
            if value.is_null() {
                continue;
            }
            let envelope: Envelope =
                serde_yaml::from_value(value.clone()).context("unmarshal envelope")?;
            if envelope.kind.is_empty() {
                bail!("missing kind");
            }
            if envelope.api_version.is_empty() {
                bail!("missing apiVersion for kind {:?}", envelope.kind);
            }
            let handler = match self.handlers.get(envelope.kind.as_str()) {
                Some(handler) => handler,
                None => bail!(
                    "no handler registered for kind {:?} (apiVersion={:?})",
                    envelope.kind,
                    envelope.api_version
                ),
            };
            if handler.product() != want {
                continue;
            }
            let obj = handler
                .parse(&envelope.api_version, &value)
                .with_context(|| {
                    format!(
                        "kind {:?} apiVersion {:?} name {:?}",
                        envelope.kind, envelope.api_version, envelope.metadata.name
                    )
                })?;
            out.push(obj);
        }
        Ok(out)
    }

    /// Like `decode_all` but requires the stream to hold exactly one
    /// object of the requested kind.
    pub fn decode_one(&self, src: &str, want: ProductKind) -> Result<DecodedObject> {
        let mut objs = self.decode_all(src, want)?;
        if objs.len() != 1 {
            bail!("unsupported number of manifests: want 1, got {}", objs.len());
        }
        Ok(objs.remove(0))
    }
}

impl Default for ManifestRegistry {
    fn default() -> Self {
        Self::new()
    }
}
