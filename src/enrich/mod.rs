//! Enrichment sources: uniform lookup interface over external directories.

pub mod ldap;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

/// A directory-like backend the Enrichment module can query. `inputs`
/// identify the record, `outputs` name the attributes to fetch.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    async fn lookup(
        &self,
        inputs: &BTreeMap<String, String>,
        outputs: &[String],
    ) -> Result<HashMap<String, Value>>;
}

/// Echoes its arguments back; exists for tests and wiring dry runs.
#[derive(Debug, Default)]
pub struct DummySource;

#[async_trait]
impl EnrichmentSource for DummySource {
    async fn lookup(
        &self,
        inputs: &BTreeMap<String, String>,
        outputs: &[String],
    ) -> Result<HashMap<String, Value>> {
        let mut results = HashMap::new();
        results.insert(
            "inputs".to_string(),
            Value::Object(
                inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect(),
            ),
        );
        results.insert("outputs".to_string(), json!(outputs));
        Ok(results)
    }
}
