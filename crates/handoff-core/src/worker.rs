//! WorkerUnit: runs the producer once, off the caller's thread.

use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};

use crate::domain::errors::panic_message;
use crate::domain::{DataEnvelope, TaskError, TaskId};

/// What a producer may return.
///
/// Infallible producers return a `DataEnvelope`; producers that talk to
/// something that can fail return `Result<DataEnvelope, E>` and the error
/// becomes a `TaskError::ProducerFailure`.
pub trait ProducerOutput {
    fn into_result(self) -> Result<DataEnvelope, String>;
}

impl ProducerOutput for DataEnvelope {
    fn into_result(self) -> Result<DataEnvelope, String> {
        Ok(self)
    }
}

impl<E: Display> ProducerOutput for Result<DataEnvelope, E> {
    fn into_result(self) -> Result<DataEnvelope, String> {
        self.map_err(|e| e.to_string())
    }
}

pub(crate) type Producer = Box<dyn FnOnce() -> Result<DataEnvelope, String> + Send + 'static>;

/// Events a worker sends to the caller's event loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The producer returned (or failed). Always sent before `Done`.
    ResultReady {
        task_id: TaskId,
        result: Result<DataEnvelope, TaskError>,
    },

    /// The worker has nothing left to do; its context may exit.
    Done { task_id: TaskId },
}

impl WorkerEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            WorkerEvent::ResultReady { task_id, .. } | WorkerEvent::Done { task_id } => *task_id,
        }
    }
}

/// Single-use wrapper around a producer.
///
/// `run` consumes the unit, so the producer cannot be invoked twice.
pub struct WorkerUnit {
    task_id: TaskId,
    label: String,
    producer: Producer,
    events: UnboundedSender<WorkerEvent>,
}

impl WorkerUnit {
    pub(crate) fn new(
        task_id: TaskId,
        label: String,
        producer: Producer,
        events: UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            task_id,
            label,
            producer,
            events,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Invoke the producer, then emit `ResultReady` followed by `Done`.
    ///
    /// Blocks for as long as the producer does. A panic inside the producer
    /// is caught here and reported as `ProducerFailure`.
    pub fn run(self) {
        let Self {
            task_id,
            label,
            producer,
            events,
        } = self;

        debug!(%task_id, label = %label, "producer started");

        let result = match catch_unwind(AssertUnwindSafe(producer)) {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(message)) => Err(message),
            Err(payload) => Err(panic_message(payload)),
        };

        let result = result.map_err(|message| {
            error!(%task_id, label = %label, %message, "producer failed");
            TaskError::ProducerFailure {
                label: label.clone(),
                message,
            }
        });

        // 受信側（EventLoop）が先に drop されていても worker は静かに終わる
        if events
            .send(WorkerEvent::ResultReady { task_id, result })
            .is_err()
        {
            debug!(%task_id, label = %label, "event loop gone; result dropped");
            return;
        }
        let _ = events.send(WorkerEvent::Done { task_id });
        debug!(%task_id, label = %label, "worker done");
    }
}
