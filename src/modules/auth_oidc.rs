//! AuthOIDC module: authorization-code login flow with JWT verification
//! against a periodically refreshed JWKS.
//!
//! Unauthenticated requests are bounced to the module's `/oidc-login`
//! special route, which stores fresh `state`/`nonce` values in the
//! session and redirects to the authorization server. The callback
//! exchanges the code, verifies the access token and records the subject
//! in the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::Response;
use josekit::jwk::Jwk;
use josekit::jws::RS256;
use josekit::jwt::JwtPayload;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use url::Url;

use crate::manifest::{DecodedObject, KindHandler, ObjectMeta, ProductKind};
use crate::module::{AdmissionNext, Module, SpecialRoute};
use crate::state::State;
use crate::util::{found, random_url_safe, request_host, request_scheme};

pub const KIND_AUTH_OIDC: &str = "AuthOIDC";

const DEFAULT_SPECIAL_PREFIX: &str = "/_";
const DEFAULT_SUBJECT_KEY: &str = "oidc_subject_id";
const DEFAULT_CLAIMS_KEY: &str = "oidc_claims";
const DEFAULT_JWKS_REFRESH_SECONDS: u64 = 300;

const STATE_KEY: &str = "oidc_state";
const NONCE_KEY: &str = "oidc_nonce";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthOidcSpec {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub authorize_url: String,
    #[serde(default)]
    pub jwks_url: String,
    #[serde(default)]
    pub special_prefix: Option<String>,
    #[serde(default)]
    pub subject_session_key: Option<String>,
    #[serde(default)]
    pub claims_session_key: Option<String>,
    #[serde(default)]
    pub jwks_refresh_seconds: Option<u64>,
}

/// Remote key set, fetched once on first use and refreshed in the
/// background until `stop` (or drop of the owning module).
pub struct JwksCache {
    url: String,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, Jwk>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl JwksCache {
    pub async fn start(url: String, http: reqwest::Client, every: Duration) -> Arc<Self> {
        let cache = Arc::new(JwksCache {
            url,
            http,
            keys: RwLock::new(HashMap::new()),
            refresher: Mutex::new(None),
        });
        if let Err(err) = cache.refresh().await {
            tracing::warn!(jwks_url = %cache.url, error = %err, "initial JWKS fetch failed");
        }
        let weak = Arc::downgrade(&cache);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                if let Err(err) = cache.refresh().await {
                    tracing::warn!(jwks_url = %cache.url, error = %err, "JWKS refresh failed");
                }
            }
        });
        if let Ok(mut slot) = cache.refresher.lock() {
            *slot = Some(handle);
        }
        cache
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.refresher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    async fn refresh(&self) -> Result<()> {
        let doc: Value = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("fetch jwks")?
            .error_for_status()
            .context("fetch jwks")?
            .json()
            .await
            .context("parse jwks")?;
        let mut keys = HashMap::new();
        for entry in doc
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("jwks document has no keys array"))?
        {
            let map = entry
                .as_object()
                .ok_or_else(|| anyhow!("jwks entry is not an object"))?;
            let jwk = Jwk::from_map(map.clone()).context("parse jwk")?;
            if let Some(kid) = jwk.key_id() {
                keys.insert(kid.to_string(), jwk);
            }
        }
        if let Ok(mut stored) = self.keys.write() {
            *stored = keys;
        }
        Ok(())
    }

    fn key(&self, kid: &str) -> Option<Jwk> {
        self.keys.read().ok()?.get(kid).cloned()
    }

    /// Verify signature and expiry of `token` against the cached key set
    /// and hand back its payload.
    pub fn verify(&self, token: &str) -> Result<JwtPayload> {
        let header = josekit::jwt::decode_header(token).context("decode token header")?;
        let kid = header
            .claim("kid")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("token has no kid"))?;
        let jwk = self
            .key(kid)
            .ok_or_else(|| anyhow!("no JWKS key for kid {kid:?}"))?;
        let verifier = RS256
            .verifier_from_jwk(&jwk)
            .context("build token verifier")?;
        let (payload, _) =
            josekit::jwt::decode_with_verifier(token, &verifier).context("verify token")?;
        if let Some(expires_at) = payload.expires_at() {
            if expires_at <= SystemTime::now() {
                bail!("token expired");
            }
        }
        Ok(payload)
    }
}

struct OidcInner {
    spec: AuthOidcSpec,
    http: reqwest::Client,
    jwks: tokio::sync::OnceCell<Arc<JwksCache>>,
}

impl Drop for OidcInner {
    fn drop(&mut self) {
        if let Some(cache) = self.jwks.get() {
            cache.stop();
        }
    }
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: u64,
}

impl OidcInner {
    fn prefix(&self) -> &str {
        self.spec
            .special_prefix
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SPECIAL_PREFIX)
    }

    fn subject_key(&self) -> &str {
        self.spec
            .subject_session_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SUBJECT_KEY)
    }

    fn claims_key(&self) -> &str {
        self.spec
            .claims_session_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_CLAIMS_KEY)
    }

    async fn jwks(&self) -> Arc<JwksCache> {
        self.jwks
            .get_or_init(|| {
                let every = Duration::from_secs(
                    self.spec
                        .jwks_refresh_seconds
                        .filter(|s| *s > 0)
                        .unwrap_or(DEFAULT_JWKS_REFRESH_SECONDS),
                );
                JwksCache::start(self.spec.jwks_url.clone(), self.http.clone(), every)
            })
            .await
            .clone()
    }

    fn callback_url<B>(&self, req: &Request<B>, entrypoint: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}://{}{}/oidc-callback",
            request_scheme(req),
            request_host(req),
            self.prefix()
        ))
        .context("build callback url")?;
        if let Some(entrypoint) = entrypoint.filter(|s| !s.is_empty()) {
            url.query_pairs_mut()
                .append_pair("entrypoint_url", entrypoint);
        }
        Ok(url)
    }

    async fn login(&self, req: Request, state: Arc<State>) -> Response {
        let Some(sess) = state.session() else {
            tracing::error!("oidc login requires a session module earlier in the chain");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "session required");
        };
        let entrypoint = query_param(&req, "entrypoint_url");
        let callback = match self.callback_url(&req, entrypoint.as_deref()) {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(error = %err, "oidc login failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "could not connect to authorization server",
                );
            }
        };

        let oidc_state = random_url_safe(32);
        let oidc_nonce = random_url_safe(32);
        sess.set_value(STATE_KEY, Value::String(oidc_state.clone()));
        sess.set_value(NONCE_KEY, Value::String(oidc_nonce.clone()));

        let mut authorize = match Url::parse(&self.spec.authorize_url) {
            Ok(url) => url,
            Err(err) => {
                tracing::error!(error = %err, authorize_url = %self.spec.authorize_url, "invalid authorize url");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "could not connect to authorization server",
                );
            }
        };
        authorize
            .query_pairs_mut()
            .append_pair("redirect_uri", callback.as_str())
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.spec.client_id)
            .append_pair("scope", &self.spec.scope)
            .append_pair("state", &oidc_state)
            .append_pair("nonce", &oidc_nonce);
        found(authorize.as_str())
    }

    async fn callback(&self, req: Request, state: Arc<State>) -> Response {
        match self.exchange_and_verify(req, &state).await {
            Ok(entrypoint) => found(entrypoint.as_deref().unwrap_or("/")),
            Err(err) => {
                tracing::error!(request_id = %state.request_id(), error = %format!("{err:#}"), "oidc callback failed");
                error_response(StatusCode::UNAUTHORIZED, "could not verify token")
            }
        }
    }

    /// The whole callback pipeline: code exchange, JWT verification,
    /// nonce/state checks, session subject update. Any failure maps to a
    /// 401 without touching the subject key.
    async fn exchange_and_verify(
        &self,
        req: Request,
        state: &Arc<State>,
    ) -> Result<Option<String>> {
        let code = query_param(&req, "code").ok_or_else(|| anyhow!("missing authorization code"))?;
        let sess = state
            .session()
            .ok_or_else(|| anyhow!("no session bound to callback request"))?;

        let stored_state = sess
            .get_value(STATE_KEY)
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| anyhow!("session has no pending login"))?;
        let query_state =
            query_param(&req, "state").ok_or_else(|| anyhow!("missing state parameter"))?;
        if stored_state != query_state {
            bail!("state parameter does not match session");
        }

        let entrypoint = query_param(&req, "entrypoint_url");
        let callback = self.callback_url(&req, entrypoint.as_deref())?;

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("state", stored_state.as_str()),
            ("redirect_uri", callback.as_str()),
            ("client_id", self.spec.client_id.as_str()),
            ("client_secret", self.spec.client_secret.as_str()),
        ];
        let token_resp = self
            .http
            .post(&self.spec.token_url)
            .form(&form)
            .send()
            .await
            .context("token request")?;
        if token_resp.status() != reqwest::StatusCode::OK {
            bail!("token endpoint returned {}", token_resp.status());
        }
        let token: TokenResponse = token_resp.json().await.context("parse token response")?;

        let payload = self.jwks().await.verify(&token.access_token)?;

        let expected_nonce = sess
            .get_value(NONCE_KEY)
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| anyhow!("session has no pending nonce"))?;
        match payload.claim("nonce").and_then(Value::as_str) {
            Some(nonce) if nonce == expected_nonce => {}
            Some(_) => bail!("nonce claim does not match session"),
            None => bail!("token has no nonce claim"),
        }

        let subject = payload
            .subject()
            .map(String::from)
            .ok_or_else(|| anyhow!("token has no subject"))?;
        sess.set_value(self.subject_key(), json!(subject));
        sess.set_value(
            self.claims_key(),
            Value::Object(payload.claims_set().clone()),
        );
        Ok(entrypoint)
    }
}

pub struct AuthOidcModule {
    name: String,
    inner: Arc<OidcInner>,
}

impl AuthOidcModule {
    pub fn new(name: String, spec: AuthOidcSpec) -> Self {
        AuthOidcModule {
            name,
            inner: Arc::new(OidcInner {
                spec,
                http: reqwest::Client::new(),
                jwks: tokio::sync::OnceCell::new(),
            }),
        }
    }
}

#[async_trait]
impl Module for AuthOidcModule {
    fn kind(&self) -> &'static str {
        KIND_AUTH_OIDC
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn special_routes(&self) -> Vec<SpecialRoute> {
        let login_inner = self.inner.clone();
        let callback_inner = self.inner.clone();
        vec![
            SpecialRoute {
                path: "/oidc-login".to_string(),
                handler: Arc::new(move |req, state| {
                    let inner = login_inner.clone();
                    Box::pin(async move { inner.login(req, state).await })
                }),
            },
            SpecialRoute {
                path: "/oidc-callback".to_string(),
                handler: Arc::new(move |req, state| {
                    let inner = callback_inner.clone();
                    Box::pin(async move { inner.callback(req, state).await })
                }),
            },
        ]
    }

    async fn handle(&self, req: Request, state: Arc<State>, next: AdmissionNext<'_>) -> Response {
        let authenticated = state
            .session()
            .and_then(|sess| sess.get_value(self.inner.subject_key()))
            .is_some();
        if authenticated {
            return next.run(req, state).await;
        }
        let current = format!(
            "{}://{}{}",
            request_scheme(&req),
            request_host(&req),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        let encoded: String = url::form_urlencoded::byte_serialize(current.as_bytes()).collect();
        found(&format!(
            "{}/oidc-login?entrypoint_url={}",
            self.inner.prefix(),
            encoded
        ))
    }
}

fn query_param<B>(req: &Request<B>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = status;
            resp
        })
}

#[derive(Debug, Default, Deserialize)]
struct AuthOidcDocV1 {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: AuthOidcSpec,
}

pub struct AuthOidcHandler;

impl KindHandler for AuthOidcHandler {
    fn kind(&self) -> &'static str {
        KIND_AUTH_OIDC
    }

    fn product(&self) -> ProductKind {
        ProductKind::Module
    }

    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject> {
        match api_version {
            "v1" => {
                let doc: AuthOidcDocV1 = serde_yaml::from_value(doc.clone())?;
                Ok(DecodedObject::Module(Arc::new(AuthOidcModule::new(
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
    use crate::session::Session;

    fn module() -> AuthOidcModule {
        AuthOidcModule::new(
            "sso".into(),
            AuthOidcSpec {
                scope: "openid profile".into(),
                client_id: "gatehouse".into(),
                client_secret: "secret".into(),
                authorize_url: "https://idp.local/authorize".into(),
                token_url: "https://idp.local/token".into(),
                jwks_url: "https://idp.local/jwks".into(),
                ..AuthOidcSpec::default()
            },
        )
    }

    fn state_with_session() -> (Arc<State>, Arc<Session>) {
        let state = Arc::new(State::new());
        let sess = Arc::new(Session::new("sid".into(), 0));
        state.set_session(sess.clone());
        (state, sess)
    }

    #[tokio::test]
    async fn login_stores_state_and_nonce_and_redirects() {
        let module = module();
        let (state, sess) = state_with_session();
        let req = Request::builder()
            .uri("/oidc-login?entrypoint_url=https%3A%2F%2Ffront.local%2Fapp")
            .header("host", "front.local")
            .body(Body::empty())
            .unwrap();

        let resp = module.inner.login(req, state).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers().get("location").unwrap().to_str().unwrap();
        let url = Url::parse(location).unwrap();
        assert!(location.starts_with("https://idp.local/authorize?"));

        let params: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "gatehouse");
        assert_eq!(params["scope"], "openid profile");
        assert_eq!(
            sess.get_value("oidc_state").unwrap().as_str().unwrap(),
            params["state"]
        );
        assert_eq!(
            sess.get_value("oidc_nonce").unwrap().as_str().unwrap(),
            params["nonce"]
        );
        // each value carries at least 32 bytes of entropy
        assert!(params["state"].len() >= 43);
        let redirect = Url::parse(&params["redirect_uri"]).unwrap();
        assert_eq!(redirect.path(), "/_/oidc-callback");
        assert_eq!(
            redirect
                .query_pairs()
                .find(|(k, _)| k == "entrypoint_url")
                .unwrap()
                .1,
            "https://front.local/app"
        );
    }

    #[tokio::test]
    async fn callback_without_code_is_unauthorized() {
        let module = module();
        let (state, _sess) = state_with_session();
        let req = Request::builder()
            .uri("/oidc-callback")
            .header("host", "front.local")
            .body(Body::empty())
            .unwrap();
        let resp = module.inner.callback(req, state).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn callback_with_wrong_state_is_unauthorized() {
        let module = module();
        let (state, sess) = state_with_session();
        sess.set_value("oidc_state", json!("expected"));
        sess.set_value("oidc_nonce", json!("n"));
        let req = Request::builder()
            .uri("/oidc-callback?code=abc&state=forged")
            .header("host", "front.local")
            .body(Body::empty())
            .unwrap();
        let resp = module.inner.callback(req, state).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
