//! Audit module: one info-level and one debug-level structured record per
//! request, with independently configured field sets, plus the request-id
//! echo header.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderValue;
use axum::response::Response;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::manifest::{DecodedObject, KindHandler, ObjectMeta, ProductKind};
use crate::mapper::context::headers_to_value;
use crate::module::{AdmissionNext, DirectorNext, ModifyNext, Module, ProxyRequest, UpstreamResponse};
use crate::state::State;
use crate::util::{request_host, request_scheme};

pub const KIND_AUDIT: &str = "Audit";

const DEFAULT_REQUEST_ID_HEADER: &str = "X-Request-Id";
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;
const TARGET_ORIGIN_KEY: &str = "audit.target_origin";

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AuditRequestFields {
    #[serde(default)]
    pub method: bool,
    #[serde(default)]
    pub path: bool,
    #[serde(default)]
    pub query: bool,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub body: bool,
    #[serde(default)]
    pub host: bool,
    #[serde(default)]
    pub origin: bool,
    #[serde(default)]
    pub remote_addr: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AuditResponseFields {
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub body: bool,
    #[serde(default)]
    pub size: bool,
    #[serde(default)]
    pub duration: bool,
    #[serde(default)]
    pub target_origin: bool,
}

impl AuditRequestFields {
    fn has_any(&self) -> bool {
        self.method
            || self.path
            || self.query
            || self.headers
            || self.body
            || self.host
            || self.origin
            || self.remote_addr
    }
}

impl AuditResponseFields {
    fn has_any(&self) -> bool {
        self.status
            || self.headers
            || self.body
            || self.size
            || self.duration
            || self.target_origin
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AuditRequestLogging {
    #[serde(default)]
    pub info: AuditRequestFields,
    #[serde(default)]
    pub debug: AuditRequestFields,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AuditResponseLogging {
    #[serde(default)]
    pub info: AuditResponseFields,
    #[serde(default)]
    pub debug: AuditResponseFields,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditSpec {
    #[serde(default)]
    pub request_id_header: Option<String>,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
    #[serde(default)]
    pub request: AuditRequestLogging,
    #[serde(default)]
    pub response: AuditResponseLogging,
}

pub struct AuditModule {
    name: String,
    spec: AuditSpec,
}

struct CapturedBody {
    preview: String,
    len: usize,
    truncated: bool,
}

impl AuditModule {
    pub fn new(name: String, spec: AuditSpec) -> Self {
        AuditModule { name, spec }
    }

    fn request_id_header(&self) -> &str {
        self.spec
            .request_id_header
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_REQUEST_ID_HEADER)
    }

    fn max_body_bytes(&self) -> usize {
        match self.spec.max_body_bytes {
            Some(n) if n > 0 => n,
            _ => DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// When no info fields are configured at all, fall back to a useful
    /// default record instead of logging nothing.
    fn info_fields(&self) -> (AuditRequestFields, AuditResponseFields) {
        if self.spec.request.info.has_any() || self.spec.response.info.has_any() {
            (self.spec.request.info, self.spec.response.info)
        } else {
            (
                AuditRequestFields {
                    method: true,
                    origin: true,
                    ..AuditRequestFields::default()
                },
                AuditResponseFields {
                    status: true,
                    duration: true,
                    target_origin: true,
                    ..AuditResponseFields::default()
                },
            )
        }
    }

    fn wants_request_body(&self) -> bool {
        self.spec.request.info.body || self.spec.request.debug.body
    }

    fn wants_response_buffer(&self) -> bool {
        let (_, info) = self.info_fields();
        info.body
            || info.size
            || self.spec.response.debug.body
            || self.spec.response.debug.size
    }

    fn capture(&self, bytes: &[u8]) -> CapturedBody {
        let max = self.max_body_bytes();
        let truncated = bytes.len() > max;
        let cut = if truncated { &bytes[..max] } else { bytes };
        CapturedBody {
            preview: String::from_utf8_lossy(cut).into_owned(),
            len: bytes.len(),
            truncated,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        req_fields: &AuditRequestFields,
        resp_fields: &AuditResponseFields,
        request: &RequestSnapshot,
        request_body: Option<&CapturedBody>,
        response: &ResponseSnapshot,
        response_body: Option<&CapturedBody>,
        state: &State,
        duration_ms: u128,
    ) -> Option<Value> {
        if !req_fields.has_any() && !resp_fields.has_any() {
            return None;
        }
        let mut record = Map::new();
        if req_fields.method {
            record.insert("method".into(), json!(request.method.as_str()));
        }
        if req_fields.path {
            record.insert("path".into(), json!(request.path.as_str()));
        }
        if req_fields.query {
            record.insert("query".into(), json!(request.query.as_str()));
        }
        if req_fields.headers {
            record.insert("request_headers".into(), request.headers.clone());
        }
        if req_fields.body {
            if let Some(body) = request_body {
                record.insert("request_body".into(), json!(body.preview.as_str()));
                record.insert("request_body_bytes".into(), json!(body.len));
                if body.truncated {
                    record.insert("request_body_truncated".into(), json!(true));
                }
            }
        }
        if req_fields.host {
            record.insert("host".into(), json!(request.host.as_str()));
        }
        if req_fields.origin {
            record.insert("source_origin".into(), json!(request.origin.as_str()));
        }
        if req_fields.remote_addr {
            if let Some(addr) = &request.remote_addr {
                record.insert("remote_addr".into(), json!(addr.as_str()));
            }
        }

        if resp_fields.status {
            record.insert("status".into(), json!(response.status));
        }
        if resp_fields.headers {
            record.insert("response_headers".into(), response.headers.clone());
        }
        if resp_fields.body {
            if let Some(body) = response_body {
                record.insert("response_body".into(), json!(body.preview.as_str()));
                record.insert("response_body_bytes".into(), json!(body.preview.len()));
                if body.truncated {
                    record.insert("response_body_truncated".into(), json!(true));
                }
            }
        }
        if resp_fields.size {
            if let Some(body) = response_body {
                record.insert("response_bytes".into(), json!(body.len));
            }
        }
        if resp_fields.duration {
            record.insert("duration_ms".into(), json!(duration_ms as u64));
        }
        if resp_fields.target_origin {
            if let Some(origin) = state.get(TARGET_ORIGIN_KEY) {
                record.insert("target_origin".into(), origin);
            }
        }
        if let Some(err) = state.error() {
            record.insert("error".into(), json!(err));
        }
        Some(Value::Object(record))
    }
}

struct RequestSnapshot {
    method: String,
    path: String,
    query: String,
    host: String,
    origin: String,
    remote_addr: Option<String>,
    headers: Value,
}

struct ResponseSnapshot {
    status: u16,
    headers: Value,
}

#[async_trait]
impl Module for AuditModule {
    fn kind(&self) -> &'static str {
        KIND_AUDIT
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        mut req: Request,
        state: Arc<State>,
        next: AdmissionNext<'_>,
    ) -> Response {
        let start = Instant::now();
        let request_id = state.request_id().to_string();

        let snapshot = RequestSnapshot {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            query: req.uri().query().unwrap_or_default().to_string(),
            host: request_host(&req),
            origin: format!("{}://{}", request_scheme(&req), request_host(&req)),
            remote_addr: req
                .extensions()
                .get::<ConnectInfo<std::net::SocketAddr>>()
                .map(|info| info.0.to_string()),
            headers: headers_to_value(req.headers()),
        };

        let request_body = if self.wants_request_body() {
            let (parts, body) = req.into_parts();
            match axum::body::to_bytes(body, usize::MAX).await {
                Ok(bytes) => {
                    let captured = self.capture(&bytes);
                    req = Request::from_parts(parts, Body::from(bytes));
                    Some(captured)
                }
                Err(err) => {
                    tracing::error!(request_id = %request_id, error = %err, "audit: failed to read request body");
                    req = Request::from_parts(parts, Body::empty());
                    None
                }
            }
        } else {
            None
        };

        let mut resp = next.run(req, state.clone()).await;

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            if let Ok(name) =
                axum::http::header::HeaderName::from_bytes(self.request_id_header().as_bytes())
            {
                resp.headers_mut().insert(name, value);
            }
        }

        let response_body = if self.wants_response_buffer() {
            let (parts, body) = resp.into_parts();
            match axum::body::to_bytes(body, usize::MAX).await {
                Ok(bytes) => {
                    let captured = self.capture(&bytes);
                    resp = Response::from_parts(parts, Body::from(bytes));
                    Some(captured)
                }
                Err(err) => {
                    tracing::error!(request_id = %request_id, error = %err, "audit: failed to read response body");
                    resp = Response::from_parts(parts, Body::empty());
                    None
                }
            }
        } else {
            None
        };

        let response_snapshot = ResponseSnapshot {
            status: resp.status().as_u16(),
            headers: headers_to_value(resp.headers()),
        };
        let duration_ms = start.elapsed().as_millis();

        let (info_req, info_resp) = self.info_fields();
        if let Some(record) = self.build_record(
            &info_req,
            &info_resp,
            &snapshot,
            request_body.as_ref(),
            &response_snapshot,
            response_body.as_ref(),
            &state,
            duration_ms,
        ) {
            tracing::info!(target: "audit", request_id = %request_id, record = %record, "request completed");
        }
        if let Some(record) = self.build_record(
            &self.spec.request.debug,
            &self.spec.response.debug,
            &snapshot,
            request_body.as_ref(),
            &response_snapshot,
            response_body.as_ref(),
            &state,
            duration_ms,
        ) {
            tracing::debug!(target: "audit", request_id = %request_id, record = %record, "request completed");
        }

        resp
    }

    fn direct(&self, req: &mut ProxyRequest, state: &State, next: DirectorNext<'_>) {
        if let (Ok(name), Ok(value)) = (
            axum::http::header::HeaderName::from_bytes(self.request_id_header().as_bytes()),
            HeaderValue::from_str(state.request_id()),
        ) {
            req.headers.insert(name, value);
        }
        next.run(req, state);
        // The terminal director has rewritten the URL by now; what it
        // points at is the target origin.
        if req.routed {
            state.set(
                TARGET_ORIGIN_KEY,
                json!(format!("{}://{}", req.url.scheme(), req.url.authority())),
            );
        }
    }

    fn modify_response(
        &self,
        resp: &mut UpstreamResponse,
        state: &State,
        next: ModifyNext<'_>,
    ) -> Result<()> {
        next.run(resp, state)?;
        if let (Ok(name), Ok(value)) = (
            axum::http::header::HeaderName::from_bytes(self.request_id_header().as_bytes()),
            HeaderValue::from_str(state.request_id()),
        ) {
            resp.headers.insert(name, value);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuditDocV1 {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: AuditSpec,
}

pub struct AuditHandler;

impl KindHandler for AuditHandler {
    fn kind(&self) -> &'static str {
        KIND_AUDIT
    }

    fn product(&self) -> ProductKind {
        ProductKind::Module
    }

    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject> {
        match api_version {
            "v1" => {
                let doc: AuditDocV1 = serde_yaml::from_value(doc.clone())?;
                Ok(DecodedObject::Module(Arc::new(AuditModule::new(
                    doc.metadata.name,
                    doc.spec,
                ))))
            }
            other => bail!("unsupported apiVersion {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_capture_respects_the_bound() {
        let module = AuditModule::new(
            "a".into(),
            AuditSpec {
                max_body_bytes: Some(4),
                ..AuditSpec::default()
            },
        );
        let captured = module.capture(b"hello world");
        assert_eq!(captured.preview, "hell");
        assert_eq!(captured.len, 11);
        assert!(captured.truncated);

        let small = module.capture(b"hi");
        assert_eq!(small.preview, "hi");
        assert!(!small.truncated);
    }

    #[test]
    fn default_info_fields_kick_in_when_unconfigured() {
        let module = AuditModule::new("a".into(), AuditSpec::default());
        let (req_fields, resp_fields) = module.info_fields();
        assert!(req_fields.method && req_fields.origin);
        assert!(resp_fields.status && resp_fields.duration && resp_fields.target_origin);
        assert!(!req_fields.body);
    }

    #[test]
    fn configured_info_fields_disable_the_defaults() {
        let spec: AuditSpec = serde_yaml::from_str(
            "request:\n  info:\n    path: true\n",
        )
        .unwrap();
        let module = AuditModule::new("a".into(), spec);
        let (req_fields, resp_fields) = module.info_fields();
        assert!(req_fields.path);
        assert!(!req_fields.method);
        assert!(!resp_fields.status);
    }
}
