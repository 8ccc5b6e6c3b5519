//! ExecutionContext: the dedicated OS thread hosting one WorkerUnit run.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::TaskConfig;
use crate::domain::TaskError;
use crate::worker::WorkerUnit;

static LIVE_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Number of execution-context threads that have started and not yet exited.
pub fn live_threads() -> usize {
    LIVE_THREADS.load(Ordering::SeqCst)
}

/// Decrements `LIVE_THREADS` when the worker thread unwinds or returns.
struct LiveGuard;

impl LiveGuard {
    fn enter() -> Self {
        LIVE_THREADS.fetch_add(1, Ordering::SeqCst);
        LiveGuard
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        LIVE_THREADS.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    NotStarted,
    Running,
    Stopped,
}

/// The half of a running context needed to wait for it.
///
/// Split out so a TaskHandle can release its lock before blocking.
pub(crate) struct Joiner {
    label: String,
    thread: JoinHandle<()>,
    /// Disconnects when the thread's closure has been dropped.
    exited: mpsc::Receiver<()>,
}

impl Joiner {
    /// Block until the thread has terminated, or until `timeout` elapses.
    ///
    /// On timeout the joiner is handed back so the caller can retry later.
    pub(crate) fn wait(self, timeout: Option<Duration>) -> Result<(), (Self, TaskError)> {
        if let Some(limit) = timeout {
            let started = Instant::now();
            match self.exited.recv_timeout(limit) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => {
                    let err = TaskError::TeardownTimeout {
                        label: self.label.clone(),
                        waited: started.elapsed(),
                    };
                    return Err((self, err));
                }
            }
        }

        // producer の panic は WorkerUnit で捕捉済みなので、ここでの Err は想定外
        if self.thread.join().is_err() {
            warn!(label = %self.label, "worker thread terminated by an uncaught panic");
        }
        Ok(())
    }

    /// Give up on the thread. It keeps running until its producer returns.
    pub(crate) fn detach(self) {
        warn!(label = %self.label, "detaching unresponsive worker thread");
        drop(self.thread);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// One dedicated thread, started once, never restarted.
pub struct ExecutionContext {
    label: String,
    thread_name: String,
    stack_size: Option<usize>,
    phase: ContextPhase,
    quit_requested: Arc<AtomicBool>,
    joiner: Option<Joiner>,
}

impl ExecutionContext {
    pub fn new(config: &TaskConfig) -> Self {
        Self {
            label: config.label.clone(),
            thread_name: config.thread_name(),
            stack_size: config.stack_size,
            phase: ContextPhase::NotStarted,
            quit_requested: Arc::new(AtomicBool::new(false)),
            joiner: None,
        }
    }

    pub fn phase(&self) -> ContextPhase {
        self.phase
    }

    /// Spawn the thread and hand it the worker. The worker is dropped when
    /// the thread exits.
    pub fn start(&mut self, worker: WorkerUnit) -> Result<(), TaskError> {
        if self.phase != ContextPhase::NotStarted {
            return Err(TaskError::AlreadyStarted(self.label.clone()));
        }

        let mut builder = thread::Builder::new().name(self.thread_name.clone());
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }

        let (exited_tx, exited_rx) = mpsc::channel::<()>();
        let thread = builder
            .spawn(move || {
                let _live = LiveGuard::enter();
                let _exited = exited_tx;
                // 一回きりの実行なので、run() が戻ればスレッドも終わる
                worker.run();
            })
            .map_err(|e| TaskError::Spawn {
                label: self.label.clone(),
                source: Arc::new(e),
            })?;

        self.joiner = Some(Joiner {
            label: self.label.clone(),
            thread,
            exited: exited_rx,
        });
        self.phase = ContextPhase::Running;
        Ok(())
    }

    /// Record that the owner wants the context gone. Non-blocking.
    ///
    /// Advisory only: a context runs exactly one worker, and its thread exits
    /// as soon as that worker returns, whether or not quit was requested. A
    /// producer in flight is never interrupted. The flag lets callers and
    /// tests see that teardown (or `Done`) has been observed.
    pub fn request_quit(&self) {
        self.quit_requested.store(true, Ordering::Release);
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested.load(Ordering::Acquire)
    }

    /// True once the thread has returned (or was never started).
    pub fn is_finished(&self) -> bool {
        self.joiner.as_ref().is_none_or(Joiner::is_finished)
    }

    pub(crate) fn take_joiner(&mut self) -> Option<Joiner> {
        self.joiner.take()
    }

    pub(crate) fn restore_joiner(&mut self, joiner: Joiner) {
        self.joiner = Some(joiner);
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.phase = ContextPhase::Stopped;
    }

    /// Request quit and block until the thread has terminated.
    pub fn quit_and_wait(&mut self, timeout: Option<Duration>) -> Result<(), TaskError> {
        self.request_quit();
        let Some(joiner) = self.take_joiner() else {
            self.mark_stopped();
            return Ok(());
        };
        match joiner.wait(timeout) {
            Ok(()) => {
                self.mark_stopped();
                Ok(())
            }
            Err((joiner, err)) => {
                self.restore_joiner(joiner);
                Err(err)
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Some(joiner) = self.joiner.take() {
            if joiner.is_finished() {
                let _ = joiner.wait(None);
            } else {
                joiner.detach();
            }
        }
    }
}
