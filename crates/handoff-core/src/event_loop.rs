//! EventLoop - 呼び出し側スレッドで worker のイベントを処理する
//!
//! worker スレッドは結果を channel に送るだけで、consumer は呼びません。
//! consumer は必ず `EventLoop::pump` / `dispatch_next` を回しているスレッドで実行されます。
//!
//! # 使用例
//! ```ignore
//! let mut event_loop = EventLoop::new();
//! let handle = TaskHandle::spawn(&event_loop.handle(), read_device, show_result)?;
//! loop {
//!     for dispatch in event_loop.pump() { /* ... */ }
//!     // render a frame, poll input, ...
//! }
//! ```

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::ThreadId;

use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

use crate::domain::{TaskError, TaskId};
use crate::handle::TaskSlot;
use crate::worker::WorkerEvent;

/// Record of one result delivery performed by the event loop.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub label: String,
    /// `Ok` when the consumer ran to completion.
    pub outcome: Result<(), TaskError>,
    /// Thread the consumer (or error hook) ran on.
    pub delivered_on: ThreadId,
}

impl Dispatch {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// task_id -> slot. Weak, so the TaskHandle stays the only owner.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    slots: Arc<Mutex<HashMap<TaskId, Weak<TaskSlot>>>>,
    // 別スレッドでの stop / 登録解除を待機中のループに知らせる
    wake: Arc<Notify>,
}

impl Registry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Weak<TaskSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, id: TaskId, slot: Weak<TaskSlot>) {
        self.lock().insert(id, slot);
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.lock().remove(&id);
        self.wake();
    }

    /// A task stopped awaiting delivery without producing an event.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn lookup(&self, id: TaskId) -> Option<Arc<TaskSlot>> {
        self.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Live slots. Dead entries are pruned on the way.
    fn live(&self) -> Vec<Arc<TaskSlot>> {
        let mut slots = self.lock();
        slots.retain(|_, weak| weak.strong_count() > 0);
        slots.values().filter_map(Weak::upgrade).collect()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Cloneable, `Send` handle used to spawn tasks onto an `EventLoop`.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) sender: UnboundedSender<WorkerEvent>,
    pub(crate) registry: Registry,
}

impl LoopHandle {
    /// Number of TaskHandles currently registered with the loop.
    pub fn registered(&self) -> usize {
        self.registry.len()
    }
}

/// Caller-side pump for worker events.
///
/// Not `Send`: the loop stays on the thread that created it, and that
/// thread is where every consumer runs.
pub struct EventLoop {
    handle: LoopHandle,
    events: UnboundedReceiver<WorkerEvent>,
    _pinned: PhantomData<*const ()>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (sender, events) = unbounded_channel();
        Self {
            handle: LoopHandle {
                sender,
                registry: Registry::default(),
            },
            events,
            _pinned: PhantomData,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Live tasks whose result has not been delivered yet.
    pub fn pending(&self) -> usize {
        self.handle
            .registry
            .live()
            .iter()
            .filter(|slot| slot.awaiting_delivery())
            .count()
    }

    /// Process every event already queued, without blocking.
    pub fn pump(&mut self) -> Vec<Dispatch> {
        let mut dispatched = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let Some(dispatch) = self.handle_event(event) {
                dispatched.push(dispatch);
            }
        }
        dispatched
    }

    /// Wait for the next result delivery.
    ///
    /// Returns `None` as soon as no live task is awaiting delivery, including
    /// when the last one is stopped or dropped (from any thread) while this
    /// waits. Events left in the queue are handled by the next `pump`.
    pub async fn dispatch_next(&mut self) -> Option<Dispatch> {
        let wake = Arc::clone(&self.handle.registry.wake);
        loop {
            if self.pending() == 0 {
                return None;
            }
            let event = tokio::select! {
                event = self.events.recv() => Some(event?),
                () = wake.notified() => None,
            };
            if let Some(dispatch) = event.and_then(|event| self.handle_event(event)) {
                return Some(dispatch);
            }
        }
    }

    /// Dispatch until no registered task is still awaiting delivery.
    pub async fn run_until_idle(&mut self) -> Vec<Dispatch> {
        let mut dispatched = Vec::new();
        while let Some(dispatch) = self.dispatch_next().await {
            dispatched.push(dispatch);
        }
        dispatched.extend(self.pump());
        dispatched
    }

    fn handle_event(&mut self, event: WorkerEvent) -> Option<Dispatch> {
        let task_id = event.task_id();
        let Some(slot) = self.handle.registry.lookup(task_id) else {
            debug!(%task_id, "event for a dropped task discarded");
            return None;
        };

        match event {
            WorkerEvent::ResultReady { result, .. } => slot.deliver(result),
            WorkerEvent::Done { .. } => {
                slot.worker_done();
                None
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DataEnvelope;
    use crate::handle::TaskHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn dispatch_next_delivers_on_loop_thread() {
        let mut event_loop = EventLoop::new();
        let loop_thread = std::thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_consumer = Arc::clone(&seen);

        let handle = TaskHandle::spawn(
            &event_loop.handle(),
            || DataEnvelope::new().with("x", 1),
            move |data| {
                *seen_in_consumer.lock().unwrap() = Some((data, std::thread::current().id()));
            },
        )
        .unwrap();

        let dispatch = tokio::time::timeout(Duration::from_secs(5), event_loop.dispatch_next())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(dispatch.task_id, handle.id());
        assert!(dispatch.is_ok());
        assert_eq!(dispatch.delivered_on, loop_thread);

        let (data, thread) = seen.lock().unwrap().take().unwrap();
        assert_eq!(data, DataEnvelope::new().with("x", 1));
        assert_eq!(thread, loop_thread);
    }

    #[tokio::test]
    async fn run_until_idle_drains_every_task() {
        let mut event_loop = EventLoop::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<TaskHandle> = (0..4)
            .map(|i| {
                let calls = Arc::clone(&calls);
                TaskHandle::spawn(
                    &event_loop.handle(),
                    move || DataEnvelope::new().with("slot", i),
                    move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap()
            })
            .collect();

        assert_eq!(event_loop.handle().registered(), 4);
        let dispatched = tokio::time::timeout(Duration::from_secs(5), event_loop.run_until_idle())
            .await
            .unwrap();

        assert_eq!(dispatched.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(event_loop.pending(), 0);

        drop(handles);
        assert_eq!(event_loop.handle().registered(), 0);
    }

    #[test]
    fn pump_without_events_is_empty() {
        let mut event_loop = EventLoop::new();
        assert!(event_loop.pump().is_empty());
        assert_eq!(event_loop.pending(), 0);
    }
}
