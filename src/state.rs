//! Shared per-task state — lifecycle flags, step accounting, listener fan-out.
//!
//! Every runner owns one `TaskState` behind an `Arc`. Monitors, listeners and
//! parent composites hold the same `Arc` and query it from other threads, so
//! all mutable fields are atomics or mutex-guarded. The notification helpers
//! snapshot the listener list before invoking callbacks, which keeps a
//! callback free to register listeners or query the task without deadlocking
//! the notifying thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::listener::TaskListener;
use crate::monitor::TaskMonitor;

/// Process-unique task id source.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Lock a mutex, recovering the guard if a panicking body poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a work body declares it can do. Snapshotted into `TaskState` so
/// status queries never contend with a running body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The body polls `check_cancel` and honors it.
    pub cancel: bool,
    /// The body polls `check_pause` and honors it.
    pub pause: bool,
    /// The body can report its total step count before executing.
    pub count_steps: bool,
    /// The body can never report a total step count, even while running.
    pub indeterminate: bool,
}

// ---------------------------------------------------------------------------
// TaskStatus / TaskSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time lifecycle classification of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Processing,
    Cancelling,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

/// Serializable status report for one task, for UIs and registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: u64,
    pub name: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub step: u64,
    /// Total step count, if fixed.
    pub steps: Option<u64>,
    pub labels: Vec<String>,
    /// Captured fatal error, if the run failed.
    pub error: Option<String>,
    /// Non-fatal errors recorded while processing.
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// The shared, thread-safe state block of one task.
pub struct TaskState {
    id: u64,
    name: String,
    description: Mutex<Option<String>>,

    // Lifecycle flags.
    processing: AtomicBool,
    cancelling: AtomicBool,
    cancelled: AtomicBool,
    paused: AtomicBool,
    terminated: AtomicBool,

    // Request latches used by composite runners to forward pause/resume to
    // children: a child's bridge listener answers its polls from these.
    pause_wanted: AtomicBool,
    resume_wanted: AtomicBool,

    // Capability snapshot.
    cancel_supported: AtomicBool,
    pause_supported: AtomicBool,
    count_steps_supported: AtomicBool,
    indeterminate: AtomicBool,

    // Step accounting.
    steps: AtomicU64,
    steps_known: AtomicBool,
    step: AtomicU64,
    /// Last step that passed the throttle and was notified.
    step_prev: AtomicU64,
    step_increase: AtomicU64,
    /// Whether the most recent step-start passed the throttle (pairs step-end).
    step_passed: AtomicBool,
    notify_modulus: AtomicU64,

    // Failures.
    error: Mutex<Option<TaskError>>,
    errors: Mutex<Vec<TaskError>>,

    // Observers.
    listeners: Mutex<Vec<Arc<dyn TaskListener>>>,
    monitor: Mutex<Option<Arc<dyn TaskMonitor>>>,
    remove_from_monitor_when_terminated: AtomicBool,

    // Tree.
    parent: Mutex<Weak<TaskState>>,

    // Side-channel trace labels.
    labels: Mutex<Vec<String>>,
}

impl TaskState {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(TaskState {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            description: Mutex::new(None),
            processing: AtomicBool::new(false),
            cancelling: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            pause_wanted: AtomicBool::new(false),
            resume_wanted: AtomicBool::new(false),
            cancel_supported: AtomicBool::new(false),
            pause_supported: AtomicBool::new(false),
            count_steps_supported: AtomicBool::new(false),
            indeterminate: AtomicBool::new(false),
            steps: AtomicU64::new(0),
            steps_known: AtomicBool::new(false),
            step: AtomicU64::new(0),
            step_prev: AtomicU64::new(0),
            step_increase: AtomicU64::new(0),
            step_passed: AtomicBool::new(false),
            notify_modulus: AtomicU64::new(1),
            error: Mutex::new(None),
            errors: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
            remove_from_monitor_when_terminated: AtomicBool::new(false),
            parent: Mutex::new(Weak::new()),
            labels: Mutex::new(Vec::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<String> {
        lock(&self.description).clone()
    }

    pub fn set_description(&self, text: &str) {
        *lock(&self.description) = Some(text.to_string());
    }

    // -----------------------------------------------------------------------
    // Status predicates
    // -----------------------------------------------------------------------

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Whether a cancel request was acknowledged but the run has not yet
    /// wound down.
    pub fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn is_exception(&self) -> bool {
        lock(&self.error).is_some()
    }

    pub fn is_cancel_supported(&self) -> bool {
        self.cancel_supported.load(Ordering::SeqCst)
    }

    pub fn is_pause_supported(&self) -> bool {
        self.pause_supported.load(Ordering::SeqCst)
    }

    pub fn is_count_steps_supported(&self) -> bool {
        self.count_steps_supported.load(Ordering::SeqCst)
    }

    pub fn is_indeterminate(&self) -> bool {
        self.indeterminate.load(Ordering::SeqCst)
    }

    /// Classify the task into exactly one status.
    pub fn status(&self) -> TaskStatus {
        if self.is_processing() {
            if self.is_paused() {
                TaskStatus::Paused
            } else if self.is_cancelling() {
                TaskStatus::Cancelling
            } else {
                TaskStatus::Processing
            }
        } else if self.is_terminated() {
            if self.is_cancelled() {
                TaskStatus::Cancelled
            } else if self.is_exception() {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            }
        } else {
            TaskStatus::Idle
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            description: self.description(),
            status: self.status(),
            step: self.step(),
            steps: self.steps(),
            labels: self.labels(),
            error: self.error().map(|e| e.to_string()),
            errors: self.errors().iter().map(|e| e.to_string()).collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Step accounting
    // -----------------------------------------------------------------------

    /// Current step position.
    pub fn step(&self) -> u64 {
        self.step.load(Ordering::SeqCst)
    }

    /// Fixed total step count, if known.
    pub fn steps(&self) -> Option<u64> {
        if self.steps_known.load(Ordering::SeqCst) {
            Some(self.steps.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Delta between the last two notified steps (the notified step itself
    /// on the first notification of a run).
    pub fn step_increase(&self) -> u64 {
        self.step_increase.load(Ordering::SeqCst)
    }

    pub fn notify_modulus(&self) -> u64 {
        self.notify_modulus.load(Ordering::SeqCst)
    }

    /// Throttle factor: only every Nth step (plus the final step) reaches
    /// listeners. Values below 1 are treated as 1.
    pub fn set_notify_modulus(&self, modulus: u64) {
        self.notify_modulus.store(modulus.max(1), Ordering::SeqCst);
    }

    /// Fix the total step count and notify listeners.
    pub fn notify_step_count(&self, total: u64) {
        self.steps.store(total, Ordering::SeqCst);
        self.steps_known.store(true, Ordering::SeqCst);
        for l in self.listener_snapshot() {
            l.step_count(self, total);
        }
    }

    /// Grow the total step count by `by` and notify listeners with the new
    /// total. Used by pool composites whose children report counts as they
    /// start.
    pub fn grow_steps(&self, by: u64) -> u64 {
        let total = self.steps.fetch_add(by, Ordering::SeqCst) + by;
        self.steps_known.store(true, Ordering::SeqCst);
        for l in self.listener_snapshot() {
            l.step_count(self, total);
        }
        total
    }

    /// Record that work reached `step` and notify listeners if the step
    /// passes the throttle (far enough from the last notified step, or the
    /// final step). Returns whether listeners were notified.
    pub fn notify_step_started(&self, step: u64, label: Option<&str>) -> bool {
        self.step.store(step, Ordering::SeqCst);
        self.throttle_notify(step, label)
    }

    /// Advance the current step by a delta and notify under the same
    /// throttle rule. Returns whether listeners were notified.
    pub fn advance_step(&self, by: u64, label: Option<&str>) -> bool {
        let step = self.step.fetch_add(by, Ordering::SeqCst) + by;
        self.throttle_notify(step, label)
    }

    fn throttle_notify(&self, step: u64, label: Option<&str>) -> bool {
        let prev = self.step_prev.load(Ordering::SeqCst);
        let modulus = self.notify_modulus.load(Ordering::SeqCst).max(1);
        let is_final =
            self.steps_known.load(Ordering::SeqCst) && step >= self.steps.load(Ordering::SeqCst);
        if step.saturating_sub(prev) < modulus && !is_final {
            self.step_passed.store(false, Ordering::SeqCst);
            return false;
        }
        self.step_prev.store(step, Ordering::SeqCst);
        self.step_increase
            .store(step.saturating_sub(prev), Ordering::SeqCst);
        self.step_passed.store(true, Ordering::SeqCst);
        for l in self.listener_snapshot() {
            l.step_started(self, step, label);
        }
        true
    }

    /// End the current step. Fires listeners only when the paired step-start
    /// passed the throttle.
    pub fn notify_step_done(&self) {
        if self.step_passed.swap(false, Ordering::SeqCst) {
            for l in self.listener_snapshot() {
                l.step_done(self);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancel / pause polls
    // -----------------------------------------------------------------------

    /// Poll for a cancel request. Intended to be called at loop boundaries
    /// inside work bodies. Latches an acknowledged request; the `cancelled`
    /// flag itself is only resolved when the run winds down.
    pub fn check_cancel(&self) -> bool {
        if !self.cancelling.load(Ordering::SeqCst)
            && self.is_cancel_supported()
            && self.poll_cancel_requested()
        {
            self.latch_cancelling();
        }
        self.cancelling.load(Ordering::SeqCst)
    }

    /// Poll for a pause or resume request. Returns true while the task is
    /// paused (the caller should loop without advancing); no blocking
    /// primitive is used so cancel requests stay pollable while paused.
    pub fn check_pause(&self) -> bool {
        if !self.is_paused() {
            if self.is_pause_supported() && self.poll_pause_requested() {
                self.mark_paused();
                return true;
            }
            false
        } else {
            if self.poll_resume_requested() {
                self.mark_resumed();
                return false;
            }
            std::thread::yield_now();
            true
        }
    }

    pub(crate) fn poll_cancel_requested(&self) -> bool {
        self.listener_snapshot().iter().any(|l| l.cancel_requested())
    }

    pub(crate) fn poll_pause_requested(&self) -> bool {
        self.listener_snapshot().iter().any(|l| l.pause_requested())
    }

    pub(crate) fn poll_resume_requested(&self) -> bool {
        self.listener_snapshot().iter().any(|l| l.resume_requested())
    }

    pub(crate) fn latch_cancelling(&self) -> bool {
        self.cancelling.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn pause_wanted(&self) -> bool {
        self.pause_wanted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_pause_wanted(&self, wanted: bool) {
        self.pause_wanted.store(wanted, Ordering::SeqCst);
    }

    pub(crate) fn resume_wanted(&self) -> bool {
        self.resume_wanted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_resume_wanted(&self, wanted: bool) {
        self.resume_wanted.store(wanted, Ordering::SeqCst);
    }

    pub(crate) fn mark_paused(&self) {
        self.paused.store(true, Ordering::SeqCst);
        for l in self.listener_snapshot() {
            l.paused(self);
        }
    }

    pub(crate) fn mark_resumed(&self) {
        self.paused.store(false, Ordering::SeqCst);
        for l in self.listener_snapshot() {
            l.resumed(self);
        }
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    /// Captured fatal error from the last run, if any.
    pub fn error(&self) -> Option<TaskError> {
        lock(&self.error).clone()
    }

    /// Non-fatal errors recorded during the current or last run.
    pub fn errors(&self) -> Vec<TaskError> {
        lock(&self.errors).clone()
    }

    /// Accumulate a non-fatal error without terminating the task. Supports
    /// "continue past row-level errors" processing.
    pub fn record_error(&self, err: TaskError) {
        lock(&self.errors).push(err);
    }

    pub(crate) fn capture_error(&self, err: TaskError) {
        *lock(&self.error) = Some(err);
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        lock(&self.listeners).push(listener);
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn TaskListener>> {
        lock(&self.listeners).clone()
    }

    /// Install the monitor this task registers with while running. Fails if
    /// the task is processing.
    pub fn set_monitor(&self, monitor: Arc<dyn TaskMonitor>) -> Result<(), TaskError> {
        if self.is_processing() {
            return Err(TaskError::ModifiedWhileProcessing(self.name.clone()));
        }
        *lock(&self.monitor) = Some(monitor);
        Ok(())
    }

    pub(crate) fn monitor(&self) -> Option<Arc<dyn TaskMonitor>> {
        lock(&self.monitor).clone()
    }

    pub fn has_monitor(&self) -> bool {
        lock(&self.monitor).is_some()
    }

    pub fn remove_from_monitor_when_terminated(&self) -> bool {
        self.remove_from_monitor_when_terminated.load(Ordering::SeqCst)
    }

    pub fn set_remove_from_monitor_when_terminated(&self, remove: bool) {
        self.remove_from_monitor_when_terminated
            .store(remove, Ordering::SeqCst);
    }

    // -----------------------------------------------------------------------
    // Tree
    // -----------------------------------------------------------------------

    /// The owning composite's state, if this task was added to one.
    pub fn parent(&self) -> Option<Arc<TaskState>> {
        lock(&self.parent).upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Weak<TaskState>) {
        *lock(&self.parent) = parent;
    }

    // -----------------------------------------------------------------------
    // Labels
    // -----------------------------------------------------------------------

    /// Record a side-channel trace label and notify listeners.
    pub fn add_label(&self, label: &str) {
        lock(&self.labels).push(label.to_string());
        for l in self.listener_snapshot() {
            l.label_added(self, label);
        }
    }

    pub fn labels(&self) -> Vec<String> {
        lock(&self.labels).clone()
    }

    // -----------------------------------------------------------------------
    // Run bookkeeping (driven by the runner)
    // -----------------------------------------------------------------------

    pub(crate) fn set_capabilities(&self, caps: Capabilities) {
        self.cancel_supported.store(caps.cancel, Ordering::SeqCst);
        self.pause_supported.store(caps.pause, Ordering::SeqCst);
        self.count_steps_supported
            .store(caps.count_steps, Ordering::SeqCst);
        self.indeterminate.store(caps.indeterminate, Ordering::SeqCst);
    }

    /// Re-entrancy gate: flips `processing` on, failing if it already was.
    pub(crate) fn begin_processing(&self) -> Result<(), TaskError> {
        if self.processing.swap(true, Ordering::SeqCst) {
            return Err(TaskError::AlreadyProcessing(self.name.clone()));
        }
        Ok(())
    }

    /// Clear control state so the task can execute again.
    pub(crate) fn reset_for_run(&self) {
        self.cancelling.store(false, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        self.terminated.store(false, Ordering::SeqCst);
        self.pause_wanted.store(false, Ordering::SeqCst);
        self.resume_wanted.store(false, Ordering::SeqCst);
        self.step.store(0, Ordering::SeqCst);
        self.step_prev.store(0, Ordering::SeqCst);
        self.step_increase.store(0, Ordering::SeqCst);
        self.step_passed.store(false, Ordering::SeqCst);
        *lock(&self.error) = None;
        lock(&self.errors).clear();
        lock(&self.labels).clear();
    }

    /// Wind down a run: order matters so listeners never observe
    /// `terminated` while `processing` is still true.
    pub(crate) fn finish_processing(&self) {
        self.processing.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        if !self.is_exception() && self.cancelling.load(Ordering::SeqCst) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn notify_processing(&self) {
        for l in self.listener_snapshot() {
            l.processing(self);
        }
    }

    pub(crate) fn notify_cancelled(&self) {
        for l in self.listener_snapshot() {
            l.cancelled(self);
        }
    }

    pub(crate) fn notify_terminated(&self) {
        for l in self.listener_snapshot() {
            l.terminated(self);
        }
    }

    pub(crate) fn notify_counting(&self) {
        for l in self.listener_snapshot() {
            l.counting(self);
        }
    }
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("step", &self.step())
            .field("steps", &self.steps())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every notification it receives as a compact string.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl TaskListener for Recorder {
        fn step_count(&self, _task: &TaskState, total: u64) {
            self.push(format!("count:{}", total));
        }

        fn step_started(&self, _task: &TaskState, step: u64, label: Option<&str>) {
            self.push(format!("start:{}:{}", step, label.unwrap_or("")));
        }

        fn step_done(&self, _task: &TaskState) {
            self.push("done".into());
        }

        fn label_added(&self, _task: &TaskState, label: &str) {
            self.push(format!("label:{}", label));
        }
    }

    fn state_with_recorder() -> (Arc<TaskState>, Arc<Recorder>) {
        let state = TaskState::new("t");
        let rec = Arc::new(Recorder::default());
        state.add_listener(rec.clone());
        (state, rec)
    }

    #[test]
    fn ids_are_unique() {
        let a = TaskState::new("a");
        let b = TaskState::new("b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn step_increase_arithmetic() {
        let (state, _rec) = state_with_recorder();
        state.notify_step_started(4, None);
        assert_eq!(state.step_increase(), 4); // first notification: the step itself
        state.notify_step_started(7, None);
        assert_eq!(state.step_increase(), 3);
        assert_eq!(state.step(), 7);
    }

    #[test]
    fn modulus_throttles_intermediate_steps() {
        let (state, rec) = state_with_recorder();
        state.set_notify_modulus(5);
        state.notify_step_count(12);

        for step in 1..=12 {
            state.notify_step_started(step, None);
            state.notify_step_done();
        }

        // Every 5th step plus the final step.
        assert_eq!(
            rec.events(),
            vec![
                "count:12",
                "start:5:",
                "done",
                "start:10:",
                "done",
                "start:12:",
                "done"
            ]
        );
    }

    #[test]
    fn step_done_silent_when_start_was_throttled() {
        let (state, rec) = state_with_recorder();
        state.set_notify_modulus(10);
        state.notify_step_count(100);

        state.notify_step_started(3, None);
        state.notify_step_done();
        assert!(rec.events().iter().all(|e| !e.starts_with("done")));
    }

    #[test]
    fn final_step_always_notified() {
        let (state, rec) = state_with_recorder();
        state.set_notify_modulus(1000);
        state.notify_step_count(8);
        state.notify_step_started(8, Some("last"));
        assert!(rec.events().contains(&"start:8:last".to_string()));
    }

    #[test]
    fn advance_step_accumulates_past_throttle() {
        let (state, rec) = state_with_recorder();
        state.set_notify_modulus(3);
        for _ in 0..7 {
            state.advance_step(1, None);
        }
        assert_eq!(state.step(), 7);
        // Notifications at 3 and 6; 7 is below the next threshold.
        assert_eq!(rec.events(), vec!["start:3:", "start:6:"]);
    }

    #[test]
    fn grow_steps_accumulates_total() {
        let (state, rec) = state_with_recorder();
        assert_eq!(state.steps(), None);
        state.grow_steps(5);
        state.grow_steps(7);
        assert_eq!(state.steps(), Some(12));
        assert_eq!(rec.events(), vec!["count:5", "count:12"]);
    }

    #[test]
    fn modulus_floor_is_one() {
        let state = TaskState::new("t");
        state.set_notify_modulus(0);
        assert_eq!(state.notify_modulus(), 1);
    }

    #[test]
    fn labels_recorded_and_notified() {
        let (state, rec) = state_with_recorder();
        state.add_label("retrying row 40");
        assert_eq!(state.labels(), vec!["retrying row 40"]);
        assert_eq!(rec.events(), vec!["label:retrying row 40"]);
    }

    #[test]
    fn non_fatal_errors_accumulate() {
        let state = TaskState::new("t");
        state.record_error(TaskError::execution("row 1 bad"));
        state.record_error(TaskError::execution("row 9 bad"));
        assert_eq!(state.errors().len(), 2);
        assert!(!state.is_exception());
    }

    #[test]
    fn status_classification() {
        let state = TaskState::new("t");
        assert_eq!(state.status(), TaskStatus::Idle);

        state.begin_processing().unwrap();
        assert_eq!(state.status(), TaskStatus::Processing);

        state.mark_paused();
        assert_eq!(state.status(), TaskStatus::Paused);
        state.mark_resumed();

        state.latch_cancelling();
        assert_eq!(state.status(), TaskStatus::Cancelling);

        state.finish_processing();
        assert_eq!(state.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn exception_wins_over_pending_cancel() {
        let state = TaskState::new("t");
        state.begin_processing().unwrap();
        state.latch_cancelling();
        state.capture_error(TaskError::execution("boom"));
        state.finish_processing();

        assert!(state.is_terminated());
        assert!(state.is_exception());
        assert!(!state.is_cancelled());
        assert_eq!(state.status(), TaskStatus::Failed);
    }

    #[test]
    fn begin_processing_rejects_reentry() {
        let state = TaskState::new("t");
        state.begin_processing().unwrap();
        assert_eq!(
            state.begin_processing(),
            Err(TaskError::AlreadyProcessing("t".into()))
        );
    }

    #[test]
    fn reset_clears_control_state() {
        let state = TaskState::new("t");
        state.begin_processing().unwrap();
        state.latch_cancelling();
        state.notify_step_started(9, None);
        state.capture_error(TaskError::execution("boom"));
        state.record_error(TaskError::execution("soft"));
        state.add_label("trace");
        state.finish_processing();

        state.reset_for_run();
        assert!(!state.is_cancelling());
        assert!(!state.is_terminated());
        assert_eq!(state.step(), 0);
        assert!(state.error().is_none());
        assert!(state.errors().is_empty());
        assert!(state.labels().is_empty());
    }

    #[test]
    fn snapshot_serde_round_trip() {
        let state = TaskState::new("ingest");
        state.set_description("pull rows from upstream");
        state.notify_step_count(40);
        state.notify_step_started(10, None);
        state.add_label("batch 1 ok");

        let snap = state.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: TaskSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "ingest");
        assert_eq!(back.status, TaskStatus::Idle);
        assert_eq!(back.step, 10);
        assert_eq!(back.steps, Some(40));
        assert_eq!(back.labels, vec!["batch 1 ok"]);
    }

    #[test]
    fn status_serde_format() {
        let json = serde_json::to_string(&TaskStatus::Cancelling).unwrap();
        assert_eq!(json, "\"cancelling\"");
    }

    #[test]
    fn parent_link_is_weak() {
        let child = TaskState::new("child");
        {
            let parent = TaskState::new("parent");
            child.set_parent(Arc::downgrade(&parent));
            assert_eq!(child.parent().unwrap().name(), "parent");
        }
        assert!(child.parent().is_none());
    }
}
