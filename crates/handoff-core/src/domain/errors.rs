//! Errors - エラー型と分類
//!
//! producer / consumer の失敗はスレッド境界を越えて unwind させず、
//! すべて `TaskError` の値として呼び出し側スレッドに届けます。

use std::sync::Arc;
use std::time::Duration;

/// Failures surfaced by a TaskHandle.
///
/// `Clone` so the same failure can be logged, passed to the `on_error`
/// callback, and returned in a `Dispatch`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// The producer returned an error or panicked on the worker thread.
    #[error("producer failed for task '{label}': {message}")]
    ProducerFailure { label: String, message: String },

    /// The consumer panicked while handling the delivered envelope.
    #[error("consumer failed for task '{label}': {message}")]
    ConsumerFailure { label: String, message: String },

    /// `stop_thread` waited longer than the configured bound.
    #[error("teardown of task '{label}' timed out after {waited:?}; the producer has not returned")]
    TeardownTimeout { label: String, waited: Duration },

    /// Labels name the OS thread, which cannot carry a NUL byte.
    #[error("invalid task label {0:?}: labels must not contain NUL bytes")]
    InvalidLabel(String),

    #[error("failed to spawn worker thread for task '{label}': {source}")]
    Spawn {
        label: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// An ExecutionContext is single use.
    #[error("execution context for task '{0}' was already started")]
    AlreadyStarted(String),
}

impl TaskError {
    pub fn is_producer_failure(&self) -> bool {
        matches!(self, TaskError::ProducerFailure { .. })
    }

    pub fn is_consumer_failure(&self) -> bool {
        matches!(self, TaskError::ConsumerFailure { .. })
    }

    pub fn is_teardown_timeout(&self) -> bool {
        matches!(self, TaskError::TeardownTimeout { .. })
    }
}

/// Human-readable message from a `catch_unwind` payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}
