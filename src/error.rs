//! Error types for the task engine.
//!
//! All variants carry string payloads only, so a failure captured by a
//! terminated task can be cloned out to any number of observers after the
//! run. Contract violations (re-entrant `run()`, mutating a running task)
//! are returned directly to the caller; execution failures are captured into
//! task state and never propagate out of `run()`.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// `run()` was invoked while the task was already processing.
    #[error("task '{0}' is already processing")]
    AlreadyProcessing(String),

    /// The task was mutated (children added, monitor changed) while processing.
    #[error("task '{0}' cannot be modified while processing")]
    ModifiedWhileProcessing(String),

    /// `count_steps()` was invoked on a task whose body cannot pre-count.
    #[error("task '{0}' does not support step counting")]
    CountStepsUnsupported(String),

    /// A failure escaping a work body.
    #[error("{0}")]
    Execution(String),

    /// A child of a composite terminated with a captured failure.
    #[error("child task '{name}' failed: {message}")]
    ChildFailed { name: String, message: String },

    /// A child's thread ended without the child terminating cleanly
    /// (the body panicked, or the child was already running elsewhere).
    #[error("child task '{0}' ended abnormally")]
    ChildAborted(String),
}

impl TaskError {
    /// Wrap an arbitrary displayable error as an execution failure.
    pub fn execution(err: impl std::fmt::Display) -> Self {
        TaskError::Execution(err.to_string())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Execution(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text() {
        assert_eq!(
            TaskError::AlreadyProcessing("fetch".into()).to_string(),
            "task 'fetch' is already processing"
        );
        assert_eq!(
            TaskError::ChildFailed {
                name: "rebuild".into(),
                message: "row 17 unreadable".into(),
            }
            .to_string(),
            "child task 'rebuild' failed: row 17 unreadable"
        );
    }

    #[test]
    fn execution_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: TaskError = io.into();
        assert_eq!(err, TaskError::Execution("disk gone".into()));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = TaskError::execution("boom");
        let copy = err.clone();
        assert_eq!(err, copy);
    }
}
