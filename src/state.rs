//! Per-request state threaded through every module hook.
//!
//! One `Arc<State>` is created by the root handler before the chain runs
//! and keeps its identity for the whole request. Modules communicate
//! through the scratch value map and the session slot instead of request
//! extensions, so everything a hook can touch is visible in its signature.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::session::Session;
use crate::util::random_url_safe;

pub struct State {
    request_id: String,
    values: Mutex<HashMap<String, Value>>,
    session: Mutex<Option<Arc<Session>>>,
    error: Mutex<Option<String>>,
}

impl State {
    pub fn new() -> Self {
        State {
            request_id: random_url_safe(16),
            values: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn set(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().ok()?.clone()
    }

    pub fn set_session(&self, session: Arc<Session>) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session);
        }
    }

    /// Record the last error seen for this request; the proxy error handler
    /// stores it so audit records can pick it up.
    pub fn set_error(&self, err: impl ToString) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(err.to_string());
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().ok()?.clone()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scratch_values_round_trip() {
        let st = State::new();
        assert!(st.get("missing").is_none());
        st.set("k", json!("v"));
        assert_eq!(st.get("k"), Some(json!("v")));
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(State::new().request_id(), State::new().request_id());
    }

    #[test]
    fn session_slot_starts_empty() {
        let st = State::new();
        assert!(st.session().is_none());
        st.set_session(Arc::new(Session::new("sid".into(), 0)));
        assert_eq!(st.session().unwrap().id(), "sid");
    }
}
