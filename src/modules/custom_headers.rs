//! CustomHeaders module: declarative set/del operations applied to the
//! outbound request and the upstream response.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::manifest::{DecodedObject, KindHandler, ObjectMeta, ProductKind};
use crate::module::{DirectorNext, ModifyNext, Module, ProxyRequest, UpstreamResponse};
use crate::state::State;

pub const KIND_CUSTOM_HEADERS: &str = "CustomHeaders";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOp {
    Set,
    Del,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderOperation {
    pub op: HeaderOp,
    pub header: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomHeadersSpec {
    #[serde(default)]
    pub request: Vec<HeaderOperation>,
    #[serde(default)]
    pub response: Vec<HeaderOperation>,
}

/// A header operation with name and value parsed once at decode time, so
/// a bad manifest fails at startup instead of mid-request.
#[derive(Debug, Clone)]
struct CompiledOperation {
    op: HeaderOp,
    name: HeaderName,
    value: Option<HeaderValue>,
}

fn compile(ops: &[HeaderOperation]) -> Result<Vec<CompiledOperation>> {
    ops.iter()
        .map(|op| {
            let name = HeaderName::from_bytes(op.header.as_bytes())
                .with_context(|| format!("invalid header name {:?}", op.header))?;
            let value = match op.op {
                HeaderOp::Set => Some(
                    HeaderValue::from_str(&op.value)
                        .with_context(|| format!("invalid value for header {:?}", op.header))?,
                ),
                HeaderOp::Del => None,
            };
            Ok(CompiledOperation {
                op: op.op,
                name,
                value,
            })
        })
        .collect()
}

fn run_ops(headers: &mut HeaderMap, ops: &[CompiledOperation]) {
    for op in ops {
        match op.op {
            HeaderOp::Set => {
                if let Some(value) = &op.value {
                    headers.insert(op.name.clone(), value.clone());
                }
            }
            HeaderOp::Del => {
                headers.remove(&op.name);
            }
        }
    }
}

pub struct CustomHeadersModule {
    name: String,
    request_ops: Vec<CompiledOperation>,
    response_ops: Vec<CompiledOperation>,
}

impl CustomHeadersModule {
    pub fn new(name: String, spec: CustomHeadersSpec) -> Result<Self> {
        Ok(CustomHeadersModule {
            name,
            request_ops: compile(&spec.request).context("request header operations")?,
            response_ops: compile(&spec.response).context("response header operations")?,
        })
    }
}

impl Module for CustomHeadersModule {
    fn kind(&self) -> &'static str {
        KIND_CUSTOM_HEADERS
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn direct(&self, req: &mut ProxyRequest, state: &State, next: DirectorNext<'_>) {
        run_ops(&mut req.headers, &self.request_ops);
        next.run(req, state)
    }

    fn modify_response(
        &self,
        resp: &mut UpstreamResponse,
        state: &State,
        next: ModifyNext<'_>,
    ) -> Result<()> {
        next.run(resp, state)?;
        run_ops(&mut resp.headers, &self.response_ops);
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct CustomHeadersDocV1 {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: CustomHeadersSpec,
}

pub struct CustomHeadersHandler;

impl KindHandler for CustomHeadersHandler {
    fn kind(&self) -> &'static str {
        KIND_CUSTOM_HEADERS
    }

    fn product(&self) -> ProductKind {
        ProductKind::Module
    }

    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject> {
        match api_version {
            "v1" => {
                let doc: CustomHeadersDocV1 = serde_yaml::from_value(doc.clone())?;
                Ok(DecodedObject::Module(Arc::new(CustomHeadersModule::new(
                    doc.metadata.name,
                    doc.spec,
                )?)))
            }
            other => bail!("unsupported apiVersion {other:?}"),
        }
    }
}
