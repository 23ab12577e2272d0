//! Enrichment module: conditional lookups against external sources, with
//! mapper expressions shaping both the lookup inputs and where the
//! results land.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use serde::Deserialize;
use serde_json::Value;

use crate::enrich::ldap::{LdapEnrichmentSource, LdapSourceConfig};
use crate::enrich::{DummySource, EnrichmentSource};
use crate::manifest::{DecodedObject, KindHandler, ObjectMeta, ProductKind};
use crate::mapper;
use crate::mapper::conditions::{self, Condition};
use crate::mapper::context::{apply_targets, source_map};
use crate::module::{AdmissionNext, Module};
use crate::state::State;
use crate::util::bad_gateway;

pub const KIND_ENRICHMENT: &str = "Enrichment";

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentSourceSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub ldap: LdapSourceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentLookupSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "source")]
    pub source_name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnrichmentSpec {
    #[serde(default)]
    pub when: Option<Condition>,
    #[serde(default)]
    pub sources: Vec<EnrichmentSourceSpec>,
    #[serde(default)]
    pub lookups: Vec<EnrichmentLookupSpec>,
}

pub struct EnrichmentModule {
    name: String,
    when: Option<Condition>,
    lookups: Vec<EnrichmentLookupSpec>,
    sources: HashMap<String, Arc<dyn EnrichmentSource>>,
}

impl EnrichmentModule {
    pub fn new(name: String, spec: EnrichmentSpec) -> Result<Self> {
        let mut sources: HashMap<String, Arc<dyn EnrichmentSource>> = HashMap::new();
        for source in &spec.sources {
            let built: Arc<dyn EnrichmentSource> = match source.kind.as_str() {
                "ldap" => Arc::new(LdapEnrichmentSource::new(source.ldap.clone())),
                "dummy" => Arc::new(DummySource),
                other => bail!(
                    "could not initialize enrichment source ({other}:{}): unknown source type",
                    source.name
                ),
            };
            sources.insert(source.name.clone(), built);
        }
        for lookup in &spec.lookups {
            if !sources.contains_key(&lookup.source_name) {
                bail!(
                    "undefined enrichment source {:?} in lookup {:?}",
                    lookup.source_name,
                    lookup.name
                );
            }
        }
        Ok(EnrichmentModule {
            name,
            when: spec.when,
            lookups: spec.lookups,
            sources,
        })
    }

    /// Build the string-valued inputs of one lookup from the current
    /// `{env, session, request}` source map.
    fn lookup_inputs(
        &self,
        lookup: &EnrichmentLookupSpec,
        src: &Value,
    ) -> Result<BTreeMap<String, String>> {
        let mut dst = Value::Object(serde_json::Map::new());
        mapper::apply(&mut dst, src, &lookup.inputs).with_context(|| {
            format!(
                "enrichment mapping inputs (source:{}, lookup:{})",
                lookup.source_name, lookup.name
            )
        })?;
        let mut inputs = BTreeMap::new();
        if let Some(obj) = dst.as_object() {
            for (key, value) in obj {
                let value = value
                    .as_str()
                    .ok_or_else(|| anyhow!("lookup input {key:?} is not a string: {value}"))?;
                inputs.insert(key.clone(), value.to_string());
            }
        }
        Ok(inputs)
    }

    async fn enrich(&self, req: &mut Request, state: &Arc<State>) -> Result<()> {
        let session = state.session();
        for lookup in &self.lookups {
            let source = self
                .sources
                .get(&lookup.source_name)
                .ok_or_else(|| anyhow!("undefined enrichment source {}", lookup.source_name))?;

            // Rebuilt per lookup: earlier lookups may have written
            // session values later ones read.
            let src = source_map(session.as_deref(), Some(&*req), None);
            let inputs = self.lookup_inputs(lookup, &src)?;

            let outputs = source
                .lookup(&inputs, &lookup.outputs)
                .await
                .with_context(|| {
                    format!(
                        "enrichment lookup (source:{}, lookup:{}) failed",
                        lookup.source_name, lookup.name
                    )
                })?;

            let outputs = Value::Object(outputs.into_iter().collect());
            let mut dst = Value::Object(serde_json::Map::new());
            mapper::apply(&mut dst, &outputs, &lookup.mappings).with_context(|| {
                format!(
                    "enrichment mapping (source:{}, lookup:{}) failed",
                    lookup.source_name, lookup.name
                )
            })?;
            apply_targets(&dst, session.as_deref(), Some(req), None)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Module for EnrichmentModule {
    fn kind(&self) -> &'static str {
        KIND_ENRICHMENT
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
        if let Some(when) = &self.when {
            let session = state.session();
            let src = source_map(session.as_deref(), Some(&req), None);
            match conditions::eval(when, &src) {
                Ok(true) => {}
                Ok(false) => return next.run(req, state).await,
                Err(err) => {
                    state.set_error(format!("{err:#}"));
                    tracing::error!(
                        request_id = %state.request_id(),
                        module_kind = KIND_ENRICHMENT,
                        module_name = %self.name,
                        error = %format!("{err:#}"),
                        "enrichment condition failed"
                    );
                    return bad_gateway();
                }
            }
        }

        if let Err(err) = self.enrich(&mut req, &state).await {
            state.set_error(format!("{err:#}"));
            tracing::error!(
                request_id = %state.request_id(),
                module_kind = KIND_ENRICHMENT,
                module_name = %self.name,
                error = %format!("{err:#}"),
                "enrichment failed"
            );
            return bad_gateway();
        }
        next.run(req, state).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct EnrichmentDocV1 {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: EnrichmentSpec,
}

pub struct EnrichmentHandler;

impl KindHandler for EnrichmentHandler {
    fn kind(&self) -> &'static str {
        KIND_ENRICHMENT
    }

    fn product(&self) -> ProductKind {
        ProductKind::Module
    }

    fn parse(&self, api_version: &str, doc: &serde_yaml::Value) -> Result<DecodedObject> {
        match api_version {
            "v1" => {
                let doc: EnrichmentDocV1 = serde_yaml::from_value(doc.clone())?;
                Ok(DecodedObject::Module(Arc::new(EnrichmentModule::new(
                    doc.metadata.name,
                    doc.spec,
                )?)))
            }
            other => bail!("unsupported apiVersion {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{BoxResponseFuture, Module};
    use crate::session::Session;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use serde_json::json;

    fn module(spec_yaml: &str) -> EnrichmentModule {
        let spec: EnrichmentSpec = serde_yaml::from_str(spec_yaml).unwrap();
        EnrichmentModule::new("enrich".into(), spec).unwrap()
    }

    fn state_with_user(user: &str) -> Arc<State> {
        let state = Arc::new(State::new());
        let sess = Arc::new(Session::new("sid".into(), 0));
        sess.set_value("user", json!(user));
        state.set_session(sess);
        state
    }

    async fn run(module: &EnrichmentModule, state: Arc<State>) -> StatusCode {
        let chain: Vec<Arc<dyn Module>> = Vec::new();
        let terminal = |_req: Request, _st: Arc<State>| -> BoxResponseFuture {
            Box::pin(async { StatusCode::OK.into_response() })
        };
        let req = Request::builder()
            .uri("/data")
            .header("host", "front.local")
            .body(Body::empty())
            .unwrap();
        module
            .handle(req, state, AdmissionNext::new(&chain, &terminal))
            .await
            .status()
    }

    #[tokio::test]
    async fn lookup_maps_outputs_into_the_session() {
        let module = module(
            "sources:\n- {type: dummy, name: echo}\nlookups:\n- name: mail\n  source: echo\n  inputs: {uid: '${session.user}'}\n  outputs: [mail]\n  mappings: {'session.email': '${inputs.uid}'}\n",
        );
        let state = state_with_user("alice");
        assert_eq!(run(&module, state.clone()).await, StatusCode::OK);
        let sess = state.session().unwrap();
        assert_eq!(sess.get_value("email"), Some(json!("alice")));
    }

    #[tokio::test]
    async fn false_condition_skips_lookups() {
        let module = module(
            "when: {left: '${session.user}', op: eq, right: bob}\n\
             sources:\n\
             - {type: dummy, name: echo}\n\
             lookups:\n\
             - {name: mail, source: echo, inputs: {uid: '${session.user}'}, outputs: [mail], mappings: {'session.email': '${inputs.uid}'}}\n",
        );
        let state = state_with_user("alice");
        assert_eq!(run(&module, state.clone()).await, StatusCode::OK);
        assert_eq!(state.session().unwrap().get_value("email"), None);
    }

    #[tokio::test]
    async fn broken_condition_is_a_bad_gateway() {
        let module = module(
            "when: {left: '${session.user}', op: frob, right: x}\n\
             sources: []\n\
             lookups: []\n",
        );
        let state = state_with_user("alice");
        assert_eq!(run(&module, state).await, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn non_string_input_is_a_bad_gateway() {
        let module = module(
            "sources:\n\
             - {type: dummy, name: echo}\n\
             lookups:\n\
             - {name: mail, source: echo, inputs: {uid: '${session.groups}'}, outputs: [mail], mappings: {}}\n",
        );
        let state = state_with_user("alice");
        state
            .session()
            .unwrap()
            .set_value("groups", json!(["a", "b"]));
        assert_eq!(run(&module, state).await, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn unknown_source_type_fails_at_build() {
        let spec: EnrichmentSpec =
            serde_yaml::from_str("sources:\n- {type: carrier-pigeon, name: coo}\n").unwrap();
        assert!(EnrichmentModule::new("enrich".into(), spec).is_err());
    }

    #[test]
    fn dangling_lookup_source_fails_at_build() {
        let spec: EnrichmentSpec = serde_yaml::from_str(
            "lookups:\n- {name: x, source: nowhere, inputs: {}, outputs: [], mappings: {}}\n",
        )
        .unwrap();
        assert!(EnrichmentModule::new("enrich".into(), spec).is_err());
    }
}
