//! Session objects handed out by the Session module and shared with any
//! module that enriches or reads per-user data.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    updated_at: Mutex<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    values: RwLock<HashMap<String, Value>>,
}

impl Session {
    /// A session with `max_age_seconds <= 0` never expires.
    pub fn new(id: String, max_age_seconds: i64) -> Self {
        let now = Utc::now();
        let expires_at = if max_age_seconds > 0 {
            Some(now + Duration::seconds(max_age_seconds))
        } else {
            None
        };
        Session {
            id,
            created_at: now,
            updated_at: Mutex::new(now),
            expires_at,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
            .lock()
            .map(|t| *t)
            .unwrap_or(self.created_at)
    }

    pub fn touch(&self) {
        if let Ok(mut t) = self.updated_at.lock() {
            *t = Utc::now();
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() >= at,
            None => false,
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    pub fn set_value(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value);
        }
    }

    /// Merge `values` into the session, overwriting existing keys.
    pub fn set_values(&self, values: HashMap<String, Value>) {
        if let Ok(mut stored) = self.values.write() {
            stored.extend(values);
        }
    }

    /// Snapshot of the value map. Callers get a copy; the backing map is
    /// only ever touched under the lock.
    pub fn values(&self) -> HashMap<String, Value> {
        self.values
            .read()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}
