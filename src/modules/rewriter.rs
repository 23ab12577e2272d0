//! Rewriter module: string replacements over response headers and bodies,
//! transparently transcoding gzip bodies.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};
use anyhow::{bail, Context, Result};
use axum::body::Bytes;
use axum::http::header::{HeaderName, CONTENT_ENCODING, CONTENT_LENGTH};
use axum::http::HeaderValue;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;

use crate::manifest::{DecodedObject, KindHandler, ObjectMeta, ProductKind};
use crate::module::{ModifyNext, Module, UpstreamResponse};
use crate::state::State;

pub const KIND_REWRITER: &str = "Rewriter";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RewriterSpec {
    #[serde(default)]
    pub rewrite: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub body: bool,
}

pub struct RewriterModule {
    name: String,
    matcher: Option<AhoCorasick>,
    replacements: Vec<String>,
    replace_headers: bool,
    replace_body: bool,
}

impl RewriterModule {
    pub fn new(name: String, spec: RewriterSpec) -> Result<Self> {
        let (matcher, replacements) = if spec.rewrite.is_empty() {
            (None, Vec::new())
        } else {
            let patterns: Vec<String> = spec.rewrite.keys().cloned().collect();
            let replacements: Vec<String> = spec.rewrite.values().cloned().collect();
            let matcher = AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostFirst)
                .build(&patterns)
                .context("build rewrite matcher")?;
            (Some(matcher), replacements)
        };
        Ok(RewriterModule {
            name,
            matcher,
            replacements,
            replace_headers: spec.headers,
            replace_body: spec.body,
        })
    }

    fn rewrite_headers(&self, resp: &mut UpstreamResponse, matcher: &AhoCorasick) {
        let mut changes: Vec<(HeaderName, Vec<HeaderValue>)> = Vec::new();
        for name in resp.headers.keys() {
            let mut changed = false;
            let mut values = Vec::new();
            for value in resp.headers.get_all(name) {
                match value.to_str() {
                    Ok(text) => {
                        let replaced = matcher.replace_all(text, &self.replacements);
                        if replaced != text {
                            changed = true;
                        }
                        match HeaderValue::from_str(&replaced) {
                            Ok(v) => values.push(v),
                            Err(_) => values.push(value.clone()),
                        }
                    }
                    Err(_) => values.push(value.clone()),
                }
            }
            if changed {
                changes.push((name.clone(), values));
            }
        }
        for (name, values) in changes {
            resp.headers.remove(&name);
            for value in values {
                resp.headers.append(name.clone(), value);
            }
        }
    }

    fn rewrite_body(&self, resp: &mut UpstreamResponse, matcher: &AhoCorasick) -> Result<()> {
        if resp.body.is_empty() {
            return Ok(());
        }
        let encoding = resp
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match encoding.as_str() {
            "" | "identity" => {
                let replaced = matcher.replace_all_bytes(&resp.body, &self.replacements);
                resp.body = Bytes::from(replaced);
            }
            "gzip" => {
                let mut decoded = Vec::new();
                GzDecoder::new(resp.body.as_ref())
                    .read_to_end(&mut decoded)
                    .context("read gzipped body")?;
                let replaced = matcher.replace_all_bytes(&decoded, &self.replacements);
                let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
                encoder
                    .write_all(&replaced)
                    .context("write gzipped body")?;
                let encoded = encoder.finish().context("finish gzipped body")?;
                resp.body = Bytes::from(encoded);
            }
            // other encodings pass through untouched
            _ => return Ok(()),
        }

        resp.headers
            .insert(CONTENT_LENGTH, HeaderValue::from(resp.body.len()));
        Ok(())
    }
}

impl Module for RewriterModule {
    fn kind(&self) -> &'static str {
        KIND_REWRITER
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn modify_response(
        &self,
        resp: &mut UpstreamResponse,
        state: &State,
        next: ModifyNext<'_>,
    ) -> Result<()> {
        next.run(resp, state)?;
        let matcher = match &self.matcher {
            Some(matcher) => matcher,
            None => return Ok(()),
        };
        if self.replace_headers {
            self.rewrite_headers(resp, matcher);
        }
        if self.replace_body {
            self.rewrite_body(resp, matcher)
                .context("rewrite response body")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RewriterDocV1 {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: RewriterSpec,
}

pub struct RewriterHandler;

impl KindHandler for RewriterHandler {
    fn kind(&self) -> &'static str {
        KIND_REWRITER
    }

    fn product(&self) -> ProductKind {
        ProductKind::Module
    }

    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject> {
        match api_version {
            "v1" => {
                let doc: RewriterDocV1 = serde_yaml::from_value(doc.clone())?;
                Ok(DecodedObject::Module(Arc::new(RewriterModule::new(
                    doc.metadata.name,
                    doc.spec,
                )?)))
            }
            other => bail!("unsupported apiVersion {other:?}"),
        }
    }
}
