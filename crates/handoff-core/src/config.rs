//! Task configuration: label, teardown bound, worker stack size.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-task settings.
///
/// The default never bounds teardown: `stop_thread` waits for the producer
/// however long it takes. Producers that talk to hardware which can hang
/// should set `teardown_timeout`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    /// Name used in logs and for the worker thread. May be empty.
    pub label: String,

    /// Upper bound on how long `stop_thread` blocks waiting for the worker.
    #[serde(rename = "teardown_timeout_ms", with = "opt_millis")]
    pub teardown_timeout: Option<Duration>,

    /// Worker thread stack size in bytes (OS default when unset).
    pub stack_size: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid task config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl TaskConfig {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = Some(timeout);
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Parse a JSON object, e.g. `{"label": "pin", "teardown_timeout_ms": 500}`.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// OS thread name for this task.
    pub(crate) fn thread_name(&self) -> String {
        if self.label.is_empty() {
            "handoff-worker".to_string()
        } else {
            format!("handoff-{}", self.label)
        }
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_timeout() {
        let cfg = TaskConfig::default();
        assert!(cfg.label.is_empty());
        assert_eq!(cfg.teardown_timeout, None);
        assert_eq!(cfg.stack_size, None);
        assert_eq!(cfg.thread_name(), "handoff-worker");
    }

    #[test]
    fn parses_json_with_defaults() {
        let cfg = TaskConfig::from_json_str(r#"{"label": "pin", "teardown_timeout_ms": 250}"#)
            .unwrap();
        assert_eq!(cfg.label, "pin");
        assert_eq!(cfg.teardown_timeout, Some(Duration::from_millis(250)));
        assert_eq!(cfg.stack_size, None);
        assert_eq!(cfg.thread_name(), "handoff-pin");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = TaskConfig::from_json_str(r#"{"retries": 3}"#).unwrap_err();
        assert!(err.to_string().starts_with("invalid task config"));
    }

    #[test]
    fn serializes_timeout_as_millis() {
        let cfg = TaskConfig::labeled("x").with_teardown_timeout(Duration::from_secs(2));
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["teardown_timeout_ms"], 2000);
    }

    #[test]
    fn oversized_timeout_saturates() {
        let cfg = TaskConfig::default().with_teardown_timeout(Duration::MAX);
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["teardown_timeout_ms"], u64::MAX);
    }
}
