//! Bridges between live HTTP objects and the mapper's value trees.
//!
//! `source_map` flattens environment, session, request and response into
//! the `{env, session, request, response}` shape that expressions walk;
//! `apply_targets` writes mapped output back onto the live objects.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use axum::http::header::HeaderName;
use axum::http::uri::Uri;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use serde_json::{json, Map, Value};

use crate::module::UpstreamResponse;
use crate::session::Session;

pub fn source_map<B>(
    sess: Option<&Session>,
    req: Option<&Request<B>>,
    resp: Option<&UpstreamResponse>,
) -> Value {
    let mut src = Map::new();
    src.insert("env".to_string(), env_map());
    if let Some(sess) = sess {
        src.insert(
            "session".to_string(),
            Value::Object(sess.values().into_iter().collect()),
        );
    }
    if let Some(req) = req {
        src.insert("request".to_string(), request_map(req));
    }
    if let Some(resp) = resp {
        src.insert("response".to_string(), response_map(resp));
    }
    Value::Object(src)
}

fn env_map() -> Value {
    let mut out = Map::new();
    for (key, value) in std::env::vars() {
        out.insert(key, Value::String(value));
    }
    Value::Object(out)
}

fn request_map<B>(req: &Request<B>) -> Value {
    json!({
        "host": crate::util::request_host(req),
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "headers": headers_to_value(req.headers()),
    })
}

fn response_map(resp: &UpstreamResponse) -> Value {
    json!({
        "status": resp.status.as_u16(),
        "headers": headers_to_value(&resp.headers),
        "host": resp.url.authority(),
        "method": resp.method.as_str(),
        "path": resp.url.path(),
    })
}

pub(crate) fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut out = Map::new();
    for key in headers.keys() {
        let values: Vec<Value> = headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| Value::String(v.to_string()))
            .collect();
        if !values.is_empty() {
            out.insert(key.as_str().to_string(), Value::Array(values));
        }
    }
    Value::Object(out)
}

/// Write a mapped output tree (top-level keys `session`, `request`,
/// `response`) back onto the live objects. Absent targets are skipped.
pub fn apply_targets<B>(
    dst: &Value,
    sess: Option<&Session>,
    req: Option<&mut Request<B>>,
    resp: Option<&mut UpstreamResponse>,
) -> Result<()> {
    let dst = match dst.as_object() {
        Some(dst) => dst,
        None => return Ok(()),
    };
    if let (Some(sess), Some(Value::Object(values))) = (sess, dst.get("session")) {
        let merged: HashMap<String, Value> =
            values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        sess.set_values(merged);
    }
    if let (Some(req), Some(Value::Object(values))) = (req, dst.get("request")) {
        apply_request(req, values).context("apply mapped request values")?;
    }
    if let (Some(resp), Some(Value::Object(values))) = (resp, dst.get("response")) {
        apply_response(resp, values).context("apply mapped response values")?;
    }
    Ok(())
}

fn apply_request<B>(req: &mut Request<B>, m: &Map<String, Value>) -> Result<()> {
    if let Some(host) = m.get("host") {
        let host = value_to_string(host);
        req.headers_mut().insert(
            axum::http::header::HOST,
            HeaderValue::from_str(&host).with_context(|| format!("invalid host {host:?}"))?,
        );
    }
    if let Some(path) = m.get("path") {
        set_uri_path(req.uri_mut(), &value_to_string(path))?;
    }
    if let Some(method) = m.get("method") {
        let method = value_to_string(method);
        *req.method_mut() = Method::from_bytes(method.as_bytes())
            .with_context(|| format!("invalid method {method:?}"))?;
    }
    if let Some(headers) = m.get("headers") {
        apply_headers(req.headers_mut(), headers)?;
    }
    Ok(())
}

fn apply_response(resp: &mut UpstreamResponse, m: &Map<String, Value>) -> Result<()> {
    if let Some(status) = m.get("status") {
        let code = value_to_u16(status).context("invalid response status")?;
        resp.status =
            StatusCode::from_u16(code).with_context(|| format!("invalid response status {code}"))?;
    }
    if let Some(headers) = m.get("headers") {
        apply_headers(&mut resp.headers, headers)?;
    }
    Ok(())
}

fn apply_headers(headers: &mut HeaderMap, update: &Value) -> Result<()> {
    let update = update
        .as_object()
        .ok_or_else(|| anyhow!("invalid headers value, expected object"))?;
    for (key, raw) in update {
        let name = HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("invalid header name {key:?}"))?;
        let values = value_to_strings(raw).with_context(|| format!("header {key:?}"))?;
        headers.remove(&name);
        for value in values {
            let value = HeaderValue::from_str(&value)
                .with_context(|| format!("invalid value for header {key:?}"))?;
            headers.append(name.clone(), value);
        }
    }
    Ok(())
}

fn set_uri_path(uri: &mut Uri, path: &str) -> Result<()> {
    let mut parts = uri.clone().into_parts();
    let path_and_query = match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    parts.path_and_query = Some(
        path_and_query
            .parse()
            .with_context(|| format!("invalid path {path:?}"))?,
    );
    *uri = Uri::from_parts(parts).context("rebuild request uri")?;
    Ok(())
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_strings(v: &Value) -> Result<Vec<String>> {
    match v {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => Ok(items
            .iter()
            .filter(|item| !item.is_null())
            .map(value_to_string)
            .filter(|s| !s.is_empty())
            .collect()),
        other => bail!("invalid header value {other}"),
    }
}

fn value_to_u16(v: &Value) -> Result<u16> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| anyhow!("out of range: {n}")),
        Value::String(s) => s.parse().with_context(|| format!("not a number: {s:?}")),
        other => bail!("unsupported status type {other}"),
    }
}
