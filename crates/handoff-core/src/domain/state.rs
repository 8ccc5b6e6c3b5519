//! State - TaskHandle の状態
//!
//! # 状態遷移
//! - Created → Running: コンテキスト起動
//! - Running → Completed: worker が done を通知
//! - Running / Completed → Destroying: stop_thread 開始
//! - Destroying → Stopped: スレッドの join 完了
//!
//! Stopped は終端で、再起動はしません。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Inputs validated, thread not spawned yet.
    Created,

    /// Producer is (or may still be) running on the background thread.
    Running,

    /// The worker reported done; the thread is exiting or has exited.
    Completed,

    /// Teardown requested; waiting for the thread to join.
    Destroying,

    /// Thread joined. Terminal.
    Stopped,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Stopped)
    }

    /// Has teardown begun? Results arriving in these states are discarded.
    pub fn is_tearing_down(self) -> bool {
        matches!(self, TaskState::Destroying | TaskState::Stopped)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Completed)
                | (Running, Destroying)
                | (Completed, Destroying)
                | (Destroying, Stopped)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Destroying => "destroying",
            TaskState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(TaskState::Created, TaskState::Running)]
    #[case::done(TaskState::Running, TaskState::Completed)]
    #[case::stop_running(TaskState::Running, TaskState::Destroying)]
    #[case::stop_completed(TaskState::Completed, TaskState::Destroying)]
    #[case::joined(TaskState::Destroying, TaskState::Stopped)]
    fn allowed_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case::restart(TaskState::Stopped, TaskState::Running)]
    #[case::skip_start(TaskState::Created, TaskState::Completed)]
    #[case::destroy_before_start(TaskState::Created, TaskState::Destroying)]
    #[case::back_to_running(TaskState::Completed, TaskState::Running)]
    #[case::stopped_again(TaskState::Stopped, TaskState::Stopped)]
    #[case::skip_teardown(TaskState::Completed, TaskState::Stopped)]
    fn rejected_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn only_stopped_is_terminal() {
        assert!(TaskState::Stopped.is_terminal());
        assert!(!TaskState::Destroying.is_terminal());
        assert!(TaskState::Destroying.is_tearing_down());
        assert!(!TaskState::Completed.is_tearing_down());
    }

    #[test]
    fn serializes_snake_case() {
        let s = serde_json::to_string(&TaskState::Destroying).unwrap();
        assert_eq!(s, "\"destroying\"");
    }
}
