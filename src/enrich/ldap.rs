//! LDAP enrichment source: one long-lived bound connection with a cheap
//! liveness probe and a single reconnect+retry on network failures.
//!
//! Attribute names in lookup inputs are validated before anything touches
//! the wire, and values are filter-escaped, so search filters cannot be
//! injected through enrichment data.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ldap3::{
    ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry,
    SearchOptions,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::EnrichmentSource;

const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
const SERVER_TIME_LIMIT_SECONDS: i32 = 10;

/// Attribute names must stay inside this alphabet so a key can never
/// smuggle filter syntax.
static ATTRIBUTE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("attribute name pattern"));

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LdapSourceConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub bind_dn: String,
    #[serde(default)]
    pub bind_password: String,
    #[serde(default)]
    pub base_dn: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default)]
    pub starttls: bool,
    #[serde(default)]
    pub tls_server_name: Option<String>,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    #[serde(default)]
    pub tls_ca_file: Option<String>,
    #[serde(default)]
    pub tls_client_cert_file: Option<String>,
    #[serde(default)]
    pub tls_client_key_file: Option<String>,
}

impl LdapSourceConfig {
    fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeout_seconds
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        )
    }

    fn needs_tls_connector(&self) -> bool {
        self.tls_insecure_skip_verify
            || self.tls_server_name.is_some()
            || self.tls_ca_file.is_some()
            || self.tls_client_cert_file.is_some()
            || self.tls_client_key_file.is_some()
    }
}

pub struct LdapEnrichmentSource {
    cfg: LdapSourceConfig,
    conn: RwLock<Option<Ldap>>,
}

impl LdapEnrichmentSource {
    /// The connection itself is dialed lazily; a source can be built at
    /// manifest load without the directory being reachable yet.
    pub fn new(cfg: LdapSourceConfig) -> Self {
        LdapEnrichmentSource {
            cfg,
            conn: RwLock::new(None),
        }
    }

    async fn dial_and_bind(cfg: &LdapSourceConfig) -> Result<Ldap> {
        let addr = cfg.addr.to_ascii_lowercase();
        let mut settings = LdapConnSettings::new().set_conn_timeout(cfg.timeout());
        if cfg.starttls {
            if !addr.starts_with("ldap://") {
                bail!("starttls requires ldap:// address");
            }
            settings = settings.set_starttls(true);
        }
        if cfg.needs_tls_connector() {
            settings = settings.set_connector(build_tls_connector(cfg)?);
        }

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &cfg.addr)
            .await
            .context("ldap dial")?;
        ldap3::drive!(conn);

        ldap.with_timeout(cfg.timeout());
        ldap.simple_bind(&cfg.bind_dn, &cfg.bind_password)
            .await
            .context("bind failed")?
            .success()
            .context("bind failed")?;
        Ok(ldap)
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.conn.write().await;
        let ldap = Self::dial_and_bind(&self.cfg).await?;
        *guard = Some(ldap);
        Ok(())
    }

    /// Make sure the connection is live: a RootDSE base search doubles as
    /// the ping, and network errors trigger one reconnect.
    async fn ensure_conn(&self) -> Result<()> {
        let existing = { self.conn.read().await.clone() };
        let mut ldap = match existing {
            Some(ldap) => ldap,
            None => return self.reconnect().await,
        };

        ldap.with_timeout(self.cfg.timeout());
        ldap.with_search_options(SearchOptions::new().sizelimit(1));
        let ping = ldap
            .search(
                "",
                Scope::Base,
                "(objectClass=*)",
                vec!["supportedLDAPVersion"],
            )
            .await;
        match ping {
            Ok(result) => match result.success() {
                Ok(_) => Ok(()),
                Err(err) if is_network_error(&err) => self.reconnect().await,
                Err(err) => Err(anyhow!(err).context("ldap ping failed")),
            },
            Err(err) if is_network_error(&err) => self.reconnect().await,
            Err(err) => Err(anyhow!(err).context("ldap ping failed")),
        }
    }

    async fn search_once(
        &self,
        mut ldap: Ldap,
        filter: &str,
        attrs: &[String],
    ) -> Result<Vec<SearchEntry>, LdapError> {
        ldap.with_timeout(self.cfg.timeout());
        // SizeLimit=2 so more than one match is detectable without
        // pulling the whole subtree.
        ldap.with_search_options(
            SearchOptions::new()
                .sizelimit(2)
                .timelimit(SERVER_TIME_LIMIT_SECONDS),
        );
        let result = ldap
            .search(&self.cfg.base_dn, Scope::Subtree, filter, attrs.to_vec())
            .await?;
        let (entries, ldap_result) = (result.0, result.1);
        // 4 = sizeLimitExceeded: the entries we did get are still usable
        // for the "more than one match" check.
        if ldap_result.rc != 4 {
            ldap_result.success()?;
        }
        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    async fn do_search(&self, filter: &str, attrs: &[String]) -> Result<Vec<SearchEntry>> {
        self.ensure_conn().await?;
        let ldap = { self.conn.read().await.clone() }
            .ok_or_else(|| anyhow!("ldap connection not initialized"))?;

        match self.search_once(ldap, filter, attrs).await {
            Ok(entries) => Ok(entries),
            Err(err) if is_network_error(&err) => {
                self.reconnect()
                    .await
                    .with_context(|| format!("reconnect failed after network error: {err}"))?;
                let ldap = { self.conn.read().await.clone() }
                    .ok_or_else(|| anyhow!("ldap connection not initialized"))?;
                self.search_once(ldap, filter, attrs)
                    .await
                    .context("ldap search error after reconnect")
            }
            Err(err) => Err(anyhow!(err).context("ldap search error")),
        }
    }
}

fn build_filter(inputs: &BTreeMap<String, String>) -> Result<String> {
    let mut filter = String::from("(&");
    for (name, value) in inputs {
        if !ATTRIBUTE_NAME.is_match(name) {
            bail!("invalid input name: {name:?}");
        }
        filter.push('(');
        filter.push_str(name);
        filter.push('=');
        filter.push_str(&ldap_escape(value));
        filter.push(')');
    }
    filter.push(')');
    Ok(filter)
}

fn build_tls_connector(cfg: &LdapSourceConfig) -> Result<native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    if cfg.tls_insecure_skip_verify {
        builder.danger_accept_invalid_certs(true);
    }
    if let Some(server_name) = cfg.tls_server_name.as_deref() {
        // native-tls offers no SNI override; verification against a name
        // other than the dialed host has to be relaxed instead.
        tracing::debug!(server_name, "ldap tls server name override requested");
        builder.danger_accept_invalid_hostnames(true);
    }
    if let Some(ca_file) = cfg.tls_ca_file.as_deref() {
        let pem = std::fs::read(ca_file)
            .with_context(|| format!("read tls ca file {ca_file:?}"))?;
        let cert =
            native_tls::Certificate::from_pem(&pem).context("parse tls ca certificate")?;
        builder.add_root_certificate(cert);
    }
    match (
        cfg.tls_client_cert_file.as_deref(),
        cfg.tls_client_key_file.as_deref(),
    ) {
        (Some(cert_file), Some(key_file)) => {
            let cert = std::fs::read(cert_file)
                .with_context(|| format!("read tls client cert {cert_file:?}"))?;
            let key = std::fs::read(key_file)
                .with_context(|| format!("read tls client key {key_file:?}"))?;
            let identity =
                native_tls::Identity::from_pkcs8(&cert, &key).context("load tls client cert")?;
            builder.identity(identity);
        }
        (None, None) => {}
        _ => bail!("tls client cert and key files must both be set"),
    }
    builder.build().context("build tls connector")
}

fn is_network_error(err: &LdapError) -> bool {
    if matches!(err, LdapError::Io { .. } | LdapError::EndOfStream) {
        return true;
    }
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("connection closed")
        || msg.contains("broken pipe")
        || msg.contains("channel closed")
        || msg.contains("timed out")
        || msg.contains("timeout")
}

#[async_trait]
impl EnrichmentSource for LdapEnrichmentSource {
    async fn lookup(
        &self,
        inputs: &BTreeMap<String, String>,
        outputs: &[String],
    ) -> Result<HashMap<String, Value>> {
        // Validation first: nothing reaches the wire for bad input names.
        let filter = build_filter(inputs)?;

        let entries = self.do_search(&filter, outputs).await?;
        if entries.len() != 1 {
            if entries.is_empty() {
                bail!("no records found");
            }
            bail!("expected exactly 1 record, got {}", entries.len());
        }

        let entry = &entries[0];
        let mut results = HashMap::new();
        for name in outputs {
            let value = entry
                .attrs
                .get(name)
                .and_then(|values| values.first())
                .cloned()
                .unwrap_or_default();
            results.insert(name.clone(), Value::String(value));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn filter_is_conjunction_of_escaped_terms() {
        let filter =
            build_filter(&inputs(&[("uid", "alice"), ("ou", "people")])).unwrap();
        assert_eq!(filter, "(&(ou=people)(uid=alice))");
    }

    #[test]
    fn values_are_filter_escaped() {
        let filter = build_filter(&inputs(&[("uid", "ali(ce)*")])).unwrap();
        assert!(!filter.contains("ali(ce)*"));
        assert!(filter.contains("\\28"));
        assert!(filter.contains("\\29"));
        assert!(filter.contains("\\2a"));
    }

    #[test]
    fn bad_attribute_names_are_rejected() {
        for name in ["uid)(objectClass=*", "a b", "x=y", ""] {
            let err = build_filter(&inputs(&[(name, "v")])).unwrap_err();
            assert!(err.to_string().contains("invalid input name"), "{name}");
        }
    }

    #[tokio::test]
    async fn injection_attempt_fails_before_any_network_use() {
        // Unroutable address: if validation did not come first, lookup
        // would fail with a connect error instead.
        let source = LdapEnrichmentSource::new(LdapSourceConfig {
            addr: "ldap://203.0.113.1:389".into(),
            timeout_seconds: Some(1),
            ..LdapSourceConfig::default()
        });
        let err = source
            .lookup(&inputs(&[("uid)(cn=*", "x")]), &["mail".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid input name"));
    }

    #[test]
    fn starttls_requires_plain_scheme() {
        let cfg = LdapSourceConfig {
            addr: "ldaps://dir.local:636".into(),
            starttls: true,
            ..LdapSourceConfig::default()
        };
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(LdapEnrichmentSource::dial_and_bind(&cfg))
            .unwrap_err();
        assert!(err.to_string().contains("starttls requires ldap://"));
    }
}
