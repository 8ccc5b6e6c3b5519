//! TaskHandle: run a producer on its own thread, deliver the result to the
//! caller's event loop, tear the thread down deterministically.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::TaskConfig;
use crate::context::ExecutionContext;
use crate::domain::errors::panic_message;
use crate::domain::{DataEnvelope, TaskError, TaskId, TaskState};
use crate::event_loop::{Dispatch, LoopHandle, Registry};
use crate::owner::TaskOwner;
use crate::worker::{Producer, ProducerOutput, WorkerUnit};

type Consumer = Box<dyn FnOnce(DataEnvelope) + Send + 'static>;
type ErrorHook = Box<dyn FnOnce(&TaskError) + Send + 'static>;

/// State shared between a TaskHandle and the event loop's registry.
pub(crate) struct TaskSlot {
    id: TaskId,
    label: String,
    /// Serializes whole `stop_thread` calls, including the join.
    stop_lock: Mutex<()>,
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    state: TaskState,
    consumer: Option<Consumer>,
    on_error: Option<ErrorHook>,
    context: ExecutionContext,
    delivered: bool,
}

impl SlotInner {
    fn transition(&mut self, id: TaskId, next: TaskState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!(task_id = %id, from = %self.state, to = %next, "task state");
        self.state = next;
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskSlot {
    pub(crate) fn awaiting_delivery(&self) -> bool {
        let inner = lock(&self.inner);
        !inner.delivered && !inner.state.is_tearing_down()
    }

    /// Handle `ResultReady` on the event loop's thread.
    ///
    /// The consumer runs with the slot lock held, so it excludes a concurrent
    /// `stop_thread`. It must not call back into its own TaskHandle.
    pub(crate) fn deliver(&self, result: Result<DataEnvelope, TaskError>) -> Option<Dispatch> {
        let mut inner = lock(&self.inner);
        if inner.state.is_tearing_down() {
            debug!(task_id = %self.id, label = %self.label, "result arrived after teardown; discarded");
            return None;
        }
        if inner.delivered {
            return None;
        }
        inner.delivered = true;

        let outcome = match result {
            Ok(data) => match inner.consumer.take() {
                Some(consumer) => catch_unwind(AssertUnwindSafe(move || consumer(data)))
                    .map_err(|payload| TaskError::ConsumerFailure {
                        label: self.label.clone(),
                        message: panic_message(payload),
                    }),
                None => Ok(()),
            },
            Err(err) => {
                inner.consumer = None;
                Err(err)
            }
        };

        if let Err(err) = &outcome {
            if err.is_consumer_failure() {
                error!(task_id = %self.id, label = %self.label, %err, "consumer failed");
            }
            if let Some(hook) = inner.on_error.take() {
                if catch_unwind(AssertUnwindSafe(|| hook(err))).is_err() {
                    warn!(task_id = %self.id, label = %self.label, "error hook panicked");
                }
            }
        }
        inner.on_error = None;

        Some(Dispatch {
            task_id: self.id,
            label: self.label.clone(),
            outcome,
            delivered_on: std::thread::current().id(),
        })
    }

    /// Handle `Done`: the worker is finished and its thread is on the way out.
    pub(crate) fn worker_done(&self) {
        let mut inner = lock(&self.inner);
        inner.context.request_quit();
        if inner.state == TaskState::Running {
            inner.transition(self.id, TaskState::Completed);
        }
    }
}

/// A producer running on its own thread, with its consumer waiting on the
/// caller's event loop.
///
/// Dropping the handle stops the thread: the drop blocks until the producer
/// has returned and the thread has been joined (or until the configured
/// teardown timeout, after which the thread is detached).
///
/// The consumer must not stop or drop its own handle: it runs under the
/// handle's lock.
pub struct TaskHandle {
    slot: Arc<TaskSlot>,
    registry: Registry,
    teardown_timeout: Option<Duration>,
    finalized: bool,
}

impl TaskHandle {
    /// Spawn with default settings.
    pub fn spawn<P, O, C>(
        loop_handle: &LoopHandle,
        producer: P,
        consumer: C,
    ) -> Result<TaskHandle, TaskError>
    where
        P: FnOnce() -> O + Send + 'static,
        O: ProducerOutput,
        C: FnOnce(DataEnvelope) + Send + 'static,
    {
        Self::builder(producer, consumer).spawn(loop_handle)
    }

    pub fn builder<P, O, C>(producer: P, consumer: C) -> TaskBuilder
    where
        P: FnOnce() -> O + Send + 'static,
        O: ProducerOutput,
        C: FnOnce(DataEnvelope) + Send + 'static,
    {
        TaskBuilder {
            producer: Box::new(move || producer().into_result()),
            consumer: Box::new(consumer),
            on_error: None,
            config: TaskConfig::default(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.slot.id
    }

    pub fn label(&self) -> &str {
        &self.slot.label
    }

    pub fn state(&self) -> TaskState {
        lock(&self.slot.inner).state
    }

    /// Has the result (or failure) been handed to the caller yet?
    pub fn is_delivered(&self) -> bool {
        lock(&self.slot.inner).delivered
    }

    /// True once the worker thread has returned.
    pub fn is_finished(&self) -> bool {
        lock(&self.slot.inner).context.is_finished()
    }

    /// Stop the worker thread and wait for it.
    ///
    /// Idempotent. Blocks until the producer has returned and the thread has
    /// been joined, or until the teardown timeout elapses, in which case
    /// `TeardownTimeout` is returned and a later call may try again. After
    /// this starts, a pending result is discarded and the consumer never runs.
    pub fn stop_thread(&self) -> Result<(), TaskError> {
        let _serial = lock(&self.slot.stop_lock);

        let joiner = {
            let mut inner = lock(&self.slot.inner);
            match inner.state {
                TaskState::Stopped => return Ok(()),
                TaskState::Destroying => {}
                _ => inner.transition(self.slot.id, TaskState::Destroying),
            }
            inner.consumer = None;
            inner.on_error = None;
            inner.context.request_quit();
            inner.context.take_joiner()
        };
        self.registry.wake();

        if let Some(joiner) = joiner {
            if let Err((joiner, err)) = joiner.wait(self.teardown_timeout) {
                warn!(task_id = %self.slot.id, label = %self.slot.label, %err, "teardown timed out");
                lock(&self.slot.inner).context.restore_joiner(joiner);
                return Err(err);
            }
        }

        let mut inner = lock(&self.slot.inner);
        inner.context.mark_stopped();
        inner.transition(self.slot.id, TaskState::Stopped);
        Ok(())
    }

    /// Stop the thread and release the handle, reporting any teardown error.
    ///
    /// A worker that is still running after the timeout is detached.
    pub fn shutdown(mut self) -> Result<(), TaskError> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<(), TaskError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let result = self.stop_thread();
        if result.is_err() {
            if let Some(joiner) = lock(&self.slot.inner).context.take_joiner() {
                joiner.detach();
            }
        }
        self.registry.remove(self.slot.id);
        result
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            warn!(task_id = %self.slot.id, label = %self.slot.label, %err, "task dropped without a clean stop");
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.slot.id)
            .field("label", &self.slot.label)
            .field("state", &self.state())
            .finish()
    }
}

/// Optional settings for a TaskHandle, ending in `spawn` or `spawn_owned`.
pub struct TaskBuilder {
    producer: Producer,
    consumer: Consumer,
    on_error: Option<ErrorHook>,
    config: TaskConfig,
}

impl TaskBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = label.into();
        self
    }

    pub fn config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn teardown_timeout(mut self, timeout: Duration) -> Self {
        self.config.teardown_timeout = Some(timeout);
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = Some(bytes);
        self
    }

    /// Called on the event loop's thread when the producer or consumer fails.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Validate, register with the loop, and start the worker thread.
    pub fn spawn(self, loop_handle: &LoopHandle) -> Result<TaskHandle, TaskError> {
        let TaskBuilder {
            producer,
            consumer,
            on_error,
            config,
        } = self;

        if config.label.contains('\0') {
            return Err(TaskError::InvalidLabel(config.label));
        }

        let id = TaskId::generate();
        let worker = WorkerUnit::new(id, config.label.clone(), producer, loop_handle.sender.clone());
        let slot = Arc::new(TaskSlot {
            id,
            label: config.label.clone(),
            stop_lock: Mutex::new(()),
            inner: Mutex::new(SlotInner {
                state: TaskState::Created,
                consumer: Some(consumer),
                on_error,
                context: ExecutionContext::new(&config),
                delivered: false,
            }),
        });

        // start より前に登録しておけば、どんなに速い producer のイベントも取りこぼさない
        loop_handle.registry.insert(id, Arc::downgrade(&slot));
        {
            let mut inner = lock(&slot.inner);
            if let Err(err) = inner.context.start(worker) {
                drop(inner);
                loop_handle.registry.remove(id);
                error!(task_id = %id, label = %config.label, %err, "worker thread did not start");
                return Err(err);
            }
            inner.transition(id, TaskState::Running);
        }
        debug!(task_id = %id, label = %config.label, "task spawned");

        Ok(TaskHandle {
            slot,
            registry: loop_handle.registry.clone(),
            teardown_timeout: config.teardown_timeout,
            finalized: false,
        })
    }

    /// Spawn and hand the handle to `owner`, which tears it down on drop.
    pub fn spawn_owned(
        self,
        loop_handle: &LoopHandle,
        owner: &mut TaskOwner,
    ) -> Result<TaskId, TaskError> {
        let handle = self.spawn(loop_handle)?;
        Ok(owner.adopt(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    /// Pump until `n` deliveries happen or the deadline passes.
    fn pump_until(event_loop: &mut EventLoop, n: usize) -> Vec<Dispatch> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.len() < n && Instant::now() < deadline {
            out.extend(event_loop.pump());
            std::thread::sleep(Duration::from_millis(1));
        }
        out
    }

    #[test]
    fn consumer_runs_once_with_producer_data() {
        let mut event_loop = EventLoop::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(None));

        let handle = {
            let calls = Arc::clone(&calls);
            let received = Arc::clone(&received);
            TaskHandle::builder(
                || DataEnvelope::new().with("x", 1),
                move |data| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    *received.lock().unwrap() = Some(data);
                },
            )
            .label("read-x")
            .spawn(&event_loop.handle())
            .unwrap()
        };

        let dispatched = pump_until(&mut event_loop, 1);
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].label, "read-x");

        // Done も処理させて Completed まで進める
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.state() != TaskState::Completed && Instant::now() < deadline {
            event_loop.pump();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.state(), TaskState::Completed);

        handle.stop_thread().unwrap();
        handle.stop_thread().unwrap();
        assert_eq!(handle.state(), TaskState::Stopped);
        assert!(event_loop.pump().is_empty());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            received.lock().unwrap().take(),
            Some(DataEnvelope::new().with("x", 1))
        );
    }

    #[test]
    fn producer_error_skips_consumer_and_calls_hook() {
        let mut event_loop = EventLoop::new();
        let consumed = Arc::new(AtomicUsize::new(0));
        let (err_tx, err_rx) = mpsc::channel();

        let consumed_in = Arc::clone(&consumed);
        let _handle = TaskHandle::builder(
            || -> Result<DataEnvelope, String> { Err("device locked".to_string()) },
            move |_| {
                consumed_in.fetch_add(1, Ordering::SeqCst);
            },
        )
        .label("locked")
        .on_error(move |err| {
            let _ = err_tx.send(err.clone());
        })
        .spawn(&event_loop.handle())
        .unwrap();

        let dispatched = pump_until(&mut event_loop, 1);
        assert_eq!(dispatched.len(), 1);
        assert!(dispatched[0].outcome.as_ref().unwrap_err().is_producer_failure());
        assert_eq!(consumed.load(Ordering::SeqCst), 0);

        let hooked = err_rx.try_recv().unwrap();
        assert!(hooked.to_string().contains("device locked"));
    }

    #[test]
    fn consumer_panic_is_reported() {
        let mut event_loop = EventLoop::new();
        let _handle = TaskHandle::spawn(
            &event_loop.handle(),
            || DataEnvelope::new(),
            |_| panic!("render failed"),
        )
        .unwrap();

        let dispatched = pump_until(&mut event_loop, 1);
        let err = dispatched[0].outcome.clone().unwrap_err();
        assert!(err.is_consumer_failure());
        assert!(err.to_string().contains("render failed"));
    }

    #[test]
    fn stop_while_running_blocks_until_joined_and_discards_result() {
        let mut event_loop = EventLoop::new();
        let (started_tx, started_rx) = mpsc::channel();
        let consumed = Arc::new(AtomicUsize::new(0));

        let consumed_in = Arc::clone(&consumed);
        let handle = TaskHandle::spawn(
            &event_loop.handle(),
            move || {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(100));
                DataEnvelope::new().with("late", true)
            },
            move |_| {
                consumed_in.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        started_rx.recv().unwrap();
        let begun = Instant::now();
        handle.stop_thread().unwrap();
        assert!(begun.elapsed() >= Duration::from_millis(50));
        assert!(handle.is_finished());
        assert_eq!(handle.state(), TaskState::Stopped);

        assert!(event_loop.pump().is_empty());
        assert_eq!(consumed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn teardown_timeout_is_reported_and_retryable() {
        let event_loop = EventLoop::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let handle = TaskHandle::builder(
            move || {
                let _ = release_rx.recv();
                DataEnvelope::new()
            },
            |_| {},
        )
        .label("hung")
        .teardown_timeout(Duration::from_millis(250))
        .spawn(&event_loop.handle())
        .unwrap();

        let err = handle.stop_thread().unwrap_err();
        assert!(err.is_teardown_timeout());
        assert_eq!(handle.state(), TaskState::Destroying);

        release_tx.send(()).unwrap();
        handle.stop_thread().unwrap();
        assert_eq!(handle.state(), TaskState::Stopped);
    }

    #[test]
    fn label_with_nul_is_rejected() {
        let event_loop = EventLoop::new();
        let err = TaskHandle::builder(|| DataEnvelope::new(), |_| {})
            .label("bad\0label")
            .spawn(&event_loop.handle())
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidLabel(_)));
        assert_eq!(event_loop.handle().registered(), 0);
    }

    #[test]
    fn dropping_loop_first_still_tears_down() {
        let event_loop = EventLoop::new();
        let handle =
            TaskHandle::spawn(&event_loop.handle(), || DataEnvelope::new(), |_| {}).unwrap();
        drop(event_loop);
        handle.shutdown().unwrap();
    }

    #[test]
    fn handle_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<TaskHandle>();
        assert_send::<LoopHandle>();
    }
}
