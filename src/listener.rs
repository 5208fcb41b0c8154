//! Observer contract — how a task reports itself and how observers talk back.
//!
//! A `TaskListener` receives lifecycle and step notifications from the task
//! it is attached to, and answers the task's request polls: the task
//! periodically asks its listeners whether anyone wants it cancelled, paused,
//! or resumed. This inversion is what makes cancellation and pausing
//! cooperative — a task that never polls cannot be stopped.
//!
//! Listener methods may be invoked concurrently from several child threads
//! of a composite; implementations must be `Send + Sync` and tolerate that.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::state::TaskState;

/// Callbacks through which a task reports lifecycle and progress events,
/// and request polls through which observers ask for cancel/pause/resume.
///
/// All methods have defaults, so a listener only implements what it needs.
#[allow(unused_variables)]
pub trait TaskListener: Send + Sync {
    /// The task entered processing (start of a `run()`).
    fn processing(&self, task: &TaskState) {}

    /// The task was cancelled. Fires before `terminated`, only when the run
    /// ended through the cancellation path.
    fn cancelled(&self, task: &TaskState) {}

    /// The task confirmed a pause request.
    fn paused(&self, task: &TaskState) {}

    /// The task resumed from a pause.
    fn resumed(&self, task: &TaskState) {}

    /// The run ended. Fires exactly once per `run()`, regardless of outcome.
    fn terminated(&self, task: &TaskState) {}

    /// The task started counting its steps.
    fn counting(&self, task: &TaskState) {}

    /// The task fixed (or grew) its total step count.
    fn step_count(&self, task: &TaskState, total: u64) {}

    /// A step notification passed the throttle.
    fn step_started(&self, task: &TaskState, step: u64, label: Option<&str>) {}

    /// The step whose start passed the throttle finished.
    fn step_done(&self, task: &TaskState) {}

    /// The task emitted a side-channel trace label.
    fn label_added(&self, task: &TaskState, label: &str) {}

    /// Poll: does this listener want the task cancelled?
    fn cancel_requested(&self) -> bool {
        false
    }

    /// Poll: does this listener want the task paused?
    fn pause_requested(&self) -> bool {
        false
    }

    /// Poll: does this listener want the task resumed?
    fn resume_requested(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// TaskController
// ---------------------------------------------------------------------------

/// A concrete listener holding request latches, for code that wants to drive
/// a task rather than observe it (a cancel button, a test harness).
///
/// Attach it with `add_listener` and call the `request_*` methods; the task
/// picks the request up at its next poll. A pause request clears any pending
/// resume request and vice versa.
#[derive(Debug, Default)]
pub struct TaskController {
    cancel: AtomicBool,
    pause: AtomicBool,
    resume: AtomicBool,
}

impl TaskController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the task to cancel at its next cancel poll.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Ask the task to pause at its next pause poll.
    pub fn request_pause(&self) {
        self.resume.store(false, Ordering::SeqCst);
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Ask a paused task to resume.
    pub fn request_resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
        self.resume.store(true, Ordering::SeqCst);
    }
}

impl TaskListener for TaskController {
    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    fn resume_requested(&self) -> bool {
        self.resume.load(Ordering::SeqCst)
    }
}
