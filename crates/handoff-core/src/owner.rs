//! TaskOwner - 明示的な所有ツリー
//!
//! owner は子の TaskHandle と子 owner を排他的に所有し、
//! 自分が drop されるときに全員の stop_thread を順番に実行します。
//! owner の drop が返った時点で、配下のスレッドはすべて停止済みです。

use tracing::{debug, warn};

use crate::domain::{OwnerId, TaskError, TaskId};
use crate::handle::TaskHandle;

/// A node in the ownership tree.
///
/// # 使用例
/// ```ignore
/// let mut window = TaskOwner::new("settings-window");
/// TaskHandle::builder(read_pin_status, show_pin_status)
///     .label("pin-status")
///     .spawn_owned(&event_loop.handle(), &mut window)?;
/// drop(window); // joins the pin-status thread before returning
/// ```
pub struct TaskOwner {
    id: OwnerId,
    label: String,
    tasks: Vec<TaskHandle>,
    children: Vec<TaskOwner>,
}

impl TaskOwner {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: OwnerId::generate(),
            label: label.into(),
            tasks: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Take ownership of a task. It is stopped when this owner is.
    pub fn adopt(&mut self, handle: TaskHandle) -> TaskId {
        let id = handle.id();
        debug!(owner_id = %self.id, owner = %self.label, task_id = %id, "task adopted");
        self.tasks.push(handle);
        id
    }

    /// Take ownership of a sub-owner (and, through it, of its tasks).
    pub fn adopt_owner(&mut self, owner: TaskOwner) -> OwnerId {
        let id = owner.id;
        self.children.push(owner);
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskHandle> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    pub fn get_owner(&self, id: OwnerId) -> Option<&TaskOwner> {
        self.children.iter().find(|o| o.id == id)
    }

    /// Give a task back to the caller; this owner no longer stops it.
    pub fn release(&mut self, id: TaskId) -> Option<TaskHandle> {
        let pos = self.tasks.iter().position(|t| t.id() == id)?;
        Some(self.tasks.remove(pos))
    }

    pub fn release_owner(&mut self, id: OwnerId) -> Option<TaskOwner> {
        let pos = self.children.iter().position(|o| o.id == id)?;
        Some(self.children.remove(pos))
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(TaskHandle::id).collect()
    }

    /// Direct entries: tasks plus sub-owners. `total_tasks` counts through
    /// the whole tree.
    pub fn len(&self) -> usize {
        self.tasks.len() + self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks in this owner and every sub-owner.
    pub fn total_tasks(&self) -> usize {
        self.tasks.len() + self.children.iter().map(TaskOwner::total_tasks).sum::<usize>()
    }

    /// Drop direct tasks whose result was delivered and whose thread has
    /// returned. Returns how many were dropped.
    ///
    /// Long-lived owners that spawn many tasks call this from their event
    /// loop so finished handles do not pile up.
    pub fn reap_finished(&mut self) -> usize {
        let before = self.tasks.len();
        let (done, live): (Vec<_>, Vec<_>) = self
            .tasks
            .drain(..)
            .partition(|t| t.is_delivered() && t.is_finished());
        self.tasks = live;
        for handle in done {
            if let Err(err) = handle.shutdown() {
                warn!(owner = %self.label, %err, "reaped task did not stop cleanly");
            }
        }
        before - self.tasks.len()
    }

    /// Stop every task (in adoption order), then every sub-owner.
    ///
    /// Each thread is stopped exactly once. Returns the teardown errors;
    /// the owner is empty afterwards either way.
    pub fn shutdown(&mut self) -> Vec<TaskError> {
        let mut errors = Vec::new();
        for handle in self.tasks.drain(..) {
            if let Err(err) = handle.shutdown() {
                errors.push(err);
            }
        }
        for mut child in self.children.drain(..) {
            errors.extend(child.shutdown());
        }
        if !errors.is_empty() {
            warn!(owner_id = %self.id, owner = %self.label, failures = errors.len(), "owner shutdown had failures");
        }
        errors
    }
}

impl Drop for TaskOwner {
    fn drop(&mut self) {
        if self.tasks.is_empty() && self.children.is_empty() {
            return;
        }
        debug!(owner_id = %self.id, owner = %self.label, tasks = self.total_tasks(), "owner dropped; stopping tasks");
        for err in self.shutdown() {
            warn!(owner = %self.label, %err, "task did not stop cleanly");
        }
    }
}

impl std::fmt::Debug for TaskOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOwner")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("tasks", &self.tasks.len())
            .field("children", &self.children.len())
            .finish()
    }
}
