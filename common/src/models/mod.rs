// Typed snapshots of backend job records

pub mod job;
pub mod recurring;

pub use job::{
    CompleteNext, Job, PerformOutcome, RequeueOptions, DEFAULT_PERFORM_METHOD, FATAL_GROUP,
    PERFORM_METHOD_KEY,
};
pub use recurring::{RecurField, RecurringJob};

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::ops::{Deref, DerefMut};

// ============================================================================
// Serde helpers for the Lua JSON encoder
// ============================================================================

// The Lua encoder cannot tell an empty array from an empty table and emits `{}`
fn deserialize_lua_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) if map.is_empty() => Ok(Vec::new()),
        value @ Value::Array(_) => serde_json::from_value(value).map_err(de::Error::custom),
        other => Err(de::Error::custom(format!("expected a list, got {other}"))),
    }
}

// Missing and null both mean "use the zero value"
fn deserialize_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Job data arrives as an embedded JSON string from the backend, or as an
// object when a snapshot is handed from the master to a child
fn deserialize_job_data<'de, D>(deserializer: D) -> Result<JobData, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(JobData::default()),
        Value::String(raw) => JobData::from_json_str(&raw).map_err(de::Error::custom),
        other => JobData::try_from(other).map_err(de::Error::custom),
    }
}

// ============================================================================
// Job data
// ============================================================================

/// Opaque job payload: a JSON object whose key order carries no meaning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobData(Map<String, Value>);

impl JobData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the string form used on the wire; blank input is an empty object
    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        Self::try_from(value)
    }

    pub fn to_json_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl TryFrom<Value> for JobData {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Array(items) if items.is_empty() => Ok(Self::default()),
            Value::Null => Ok(Self::default()),
            other => Err(format!("job data must be a JSON object, got {other}")),
        }
    }
}

impl From<Map<String, Value>> for JobData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl Deref for JobData {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for JobData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// ============================================================================
// Records
// ============================================================================

/// One transition in a job's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub when: f64,
    pub what: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

/// Job record as returned by `pop`/`get`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jid: String,
    pub klass: String,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub queue: String,
    #[serde(default, deserialize_with = "deserialize_job_data")]
    pub data: JobData,
    #[serde(default, deserialize_with = "deserialize_lua_list")]
    pub history: Vec<HistoryEntry>,
    #[serde(default, deserialize_with = "deserialize_lua_list")]
    pub dependencies: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_lua_list")]
    pub dependents: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub priority: i64,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub worker: String,
    #[serde(default, deserialize_with = "deserialize_lua_list")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub expires: f64,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub remaining: i64,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub retries: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub tracked: bool,
}

impl JobRecord {
    /// Minimal record, mostly useful for tests and for `put`
    pub fn new(jid: impl Into<String>, klass: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            klass: klass.into(),
            queue: queue.into(),
            data: JobData::default(),
            history: Vec::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            priority: 0,
            worker: String::new(),
            tags: Vec::new(),
            expires: 0.0,
            remaining: 5,
            retries: 5,
            state: None,
            tracked: false,
        }
    }
}

/// Recurring job template as returned by `recur.get`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringRecord {
    pub jid: String,
    pub klass: String,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub queue: String,
    #[serde(default, deserialize_with = "deserialize_job_data")]
    pub data: JobData,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub priority: i64,
    #[serde(default, deserialize_with = "deserialize_lua_list")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub retries: i64,
    #[serde(default = "default_interval")]
    pub interval: i64,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub count: i64,
    #[serde(default, deserialize_with = "deserialize_or_default")]
    pub backlog: i64,
}

fn default_interval() -> i64 {
    60
}

/// Per-queue counters as returned by `queues`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCounts {
    pub name: String,
    pub waiting: u64,
    pub running: u64,
    pub scheduled: u64,
    pub stalled: u64,
    pub depends: u64,
    pub recurring: u64,
    pub paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_decodes_lua_quirks() {
        let raw = json!({
            "jid": "jid-1",
            "klass": "Sample",
            "queue": "default",
            "data": "{\"payload\":\"x\"}",
            "history": {},
            "dependencies": {},
            "dependents": ["jid-2"],
            "worker": "w-1",
            "tags": {},
            "expires": 1700000000.5,
            "remaining": 4,
            "retries": 5,
            "state": "running"
        });

        let record: JobRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.data.get("payload"), Some(&json!("x")));
        assert!(record.history.is_empty());
        assert!(record.tags.is_empty());
        assert_eq!(record.dependents, vec!["jid-2"]);
        assert_eq!(record.expires, 1700000000.5);
    }

    #[test]
    fn test_missing_or_null_priority_defaults_to_zero() {
        let missing: JobRecord =
            serde_json::from_value(json!({"jid": "a", "klass": "K"})).unwrap();
        let null: JobRecord =
            serde_json::from_value(json!({"jid": "a", "klass": "K", "priority": null})).unwrap();
        assert_eq!(missing.priority, 0);
        assert_eq!(null.priority, 0);
    }

    #[test]
    fn test_snapshot_survives_handoff_to_child() {
        let mut record = JobRecord::new("jid-1", "Sample", "default");
        record.data.insert("n".to_string(), json!(3));
        let wire = serde_json::to_string(&record).unwrap();
        let back: JobRecord = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_job_data_rejects_scalars() {
        assert!(JobData::from_json_str("42").is_err());
        assert!(JobData::from_json_str("").unwrap().is_empty());
        assert!(JobData::from_json_str("[]").unwrap().is_empty());
    }

    #[test]
    fn test_recurring_interval_defaults_to_sixty() {
        let record: RecurringRecord =
            serde_json::from_value(json!({"jid": "r", "klass": "K"})).unwrap();
        assert_eq!(record.interval, 60);
        assert_eq!(record.count, 0);
    }
}
