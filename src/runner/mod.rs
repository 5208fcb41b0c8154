//! Runners — the state machines that execute work.
//!
//! `TaskRunner` drives a single `Work` body through the lifecycle
//! Idle → Processing → {Cancelling → Cancelled | Failed | Completed} →
//! Terminated, with Paused as a sub-state of Processing. The body receives a
//! `TaskContext` and is expected to poll `check_cancel` / `check_pause` at
//! its loop boundaries; the runner owns everything else (re-entrancy
//! guarding, flag resets, monitor registration, listener notification,
//! error capture).
//!
//! Composite bodies live in the submodules: `sequence` runs children one at
//! a time, `pool` runs them across a bounded set of threads.

pub mod pool;
pub mod sequence;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TaskError;
use crate::listener::TaskListener;
use crate::monitor::TaskMonitor;
use crate::state::{lock, Capabilities, TaskSnapshot, TaskState};

/// Sleep between scheduling-loop passes. Short enough that cancel/pause
/// requests feel immediate, long enough not to spin a core.
pub(crate) const SCHED_POLL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Work
// ---------------------------------------------------------------------------

/// The externally supplied body of a task.
///
/// `execute` does the actual work and should poll `ctx.check_cancel()` and
/// `ctx.check_pause()` at loop boundaries; a body that never polls cannot be
/// cancelled or paused. Capabilities declare which of those polls the body
/// honors and whether it can pre-count its steps.
pub trait Work: Send {
    fn execute(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError>;

    /// Report the total step count without executing. Only called when
    /// `capabilities().count_steps` is true.
    fn count_steps(&mut self, ctx: &TaskContext<'_>) -> Result<u64, TaskError> {
        Err(TaskError::CountStepsUnsupported(
            ctx.state().name().to_string(),
        ))
    }

    fn capabilities(&self, _ctx: &TaskContext<'_>) -> Capabilities {
        Capabilities::default()
    }
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// Handed to a `Work` body for the duration of one `run()` or
/// `count_steps()` call: the cancellation/pause token, the progress
/// reporting surface, and (for composite bodies) the child list.
pub struct TaskContext<'a> {
    state: &'a Arc<TaskState>,
    children: &'a [Arc<TaskRunner>],
}

impl TaskContext<'_> {
    pub fn state(&self) -> &Arc<TaskState> {
        self.state
    }

    pub fn children(&self) -> &[Arc<TaskRunner>] {
        self.children
    }

    /// Poll for a cancel request; see [`TaskState::check_cancel`].
    pub fn check_cancel(&self) -> bool {
        self.state.check_cancel()
    }

    /// Poll for a pause/resume request; see [`TaskState::check_pause`].
    pub fn check_pause(&self) -> bool {
        self.state.check_pause()
    }

    pub fn is_cancelling(&self) -> bool {
        self.state.is_cancelling()
    }

    pub fn notify_step_count(&self, total: u64) {
        self.state.notify_step_count(total);
    }

    pub fn notify_step_started(&self, step: u64, label: Option<&str>) -> bool {
        self.state.notify_step_started(step, label)
    }

    pub fn notify_step_done(&self) {
        self.state.notify_step_done();
    }

    pub fn advance_step(&self, by: u64, label: Option<&str>) -> bool {
        self.state.advance_step(by, label)
    }

    /// Record a non-fatal error and keep processing.
    pub fn record_error(&self, err: TaskError) {
        self.state.record_error(err);
    }

    /// Emit a side-channel trace label.
    pub fn set_label(&self, label: &str) {
        self.state.add_label(label);
    }
}

// ---------------------------------------------------------------------------
// FnWork
// ---------------------------------------------------------------------------

/// Closure-backed work, for tasks simple enough not to deserve a type.
pub struct FnWork<F> {
    body: F,
    capabilities: Capabilities,
}

impl<F> FnWork<F>
where
    F: FnMut(&TaskContext<'_>) -> Result<(), TaskError> + Send,
{
    pub fn new(body: F) -> Self {
        FnWork {
            body,
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_capabilities(body: F, capabilities: Capabilities) -> Self {
        FnWork { body, capabilities }
    }
}

impl<F> Work for FnWork<F>
where
    F: FnMut(&TaskContext<'_>) -> Result<(), TaskError> + Send,
{
    fn execute(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        (self.body)(ctx)
    }

    fn capabilities(&self, _ctx: &TaskContext<'_>) -> Capabilities {
        self.capabilities
    }
}

// ---------------------------------------------------------------------------
// TaskRunner
// ---------------------------------------------------------------------------

/// A runnable, monitorable, cancellable/pausable task: one `Work` body plus
/// the shared state observers see. Composite tasks are `TaskRunner`s whose
/// body schedules the child runners.
pub struct TaskRunner {
    state: Arc<TaskState>,
    work: Mutex<Box<dyn Work>>,
    children: Mutex<Vec<Arc<TaskRunner>>>,
}

impl TaskRunner {
    pub fn new(name: &str, work: impl Work + 'static) -> Arc<TaskRunner> {
        let runner = Arc::new(TaskRunner {
            state: TaskState::new(name),
            work: Mutex::new(Box::new(work)),
            children: Mutex::new(Vec::new()),
        });
        runner.refresh_capabilities();
        runner
    }

    /// A composite that runs its children strictly one at a time.
    pub fn sequence(name: &str) -> Arc<TaskRunner> {
        Self::new(name, sequence::SequenceWork::new())
    }

    /// A composite that runs its children across at most `max_concurrent`
    /// threads.
    pub fn pool(name: &str, max_concurrent: usize) -> Arc<TaskRunner> {
        Self::new(name, pool::PoolWork::new(max_concurrent))
    }

    pub fn state(&self) -> &Arc<TaskState> {
        &self.state
    }

    pub fn id(&self) -> u64 {
        self.state.id()
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn set_description(&self, text: &str) {
        self.state.set_description(text);
    }

    // -----------------------------------------------------------------------
    // Status and capability predicates (delegated to state)
    // -----------------------------------------------------------------------

    pub fn is_processing(&self) -> bool {
        self.state.is_processing()
    }

    pub fn is_cancelling(&self) -> bool {
        self.state.is_cancelling()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    pub fn is_exception(&self) -> bool {
        self.state.is_exception()
    }

    pub fn is_cancel_supported(&self) -> bool {
        self.state.is_cancel_supported()
    }

    pub fn is_pause_supported(&self) -> bool {
        self.state.is_pause_supported()
    }

    pub fn is_count_steps_supported(&self) -> bool {
        self.state.is_count_steps_supported()
    }

    pub fn is_indeterminate(&self) -> bool {
        self.state.is_indeterminate()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.state.snapshot()
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        self.state.add_listener(listener);
    }

    pub fn set_monitor(&self, monitor: Arc<dyn TaskMonitor>) -> Result<(), TaskError> {
        self.state.set_monitor(monitor)
    }

    pub fn set_notify_modulus(&self, modulus: u64) {
        self.state.set_notify_modulus(modulus);
    }

    pub fn set_remove_from_monitor_when_terminated(&self, remove: bool) {
        self.state.set_remove_from_monitor_when_terminated(remove);
    }

    // -----------------------------------------------------------------------
    // Tree
    // -----------------------------------------------------------------------

    /// Add a child task. Children may only be added before the runner starts
    /// processing; composite bodies pick them up at the start of execution.
    pub fn add_child(self: &Arc<Self>, child: Arc<TaskRunner>) -> Result<(), TaskError> {
        if self.state.is_processing() {
            return Err(TaskError::ModifiedWhileProcessing(
                self.state.name().to_string(),
            ));
        }
        child.state.set_parent(Arc::downgrade(&self.state));
        lock(&self.children).push(child);
        self.refresh_capabilities();
        Ok(())
    }

    pub fn children(&self) -> Vec<Arc<TaskRunner>> {
        lock(&self.children).clone()
    }

    /// Recompute the capability snapshot from the body and current children.
    fn refresh_capabilities(&self) {
        let children = lock(&self.children).clone();
        let work = lock(&self.work);
        let ctx = TaskContext {
            state: &self.state,
            children: &children,
        };
        let caps = work.capabilities(&ctx);
        drop(work);
        self.state.set_capabilities(caps);
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Count the total steps without executing. Fires the `counting`
    /// notification, fixes the total, and returns it.
    pub fn count_steps(&self) -> Result<u64, TaskError> {
        if self.state.is_processing() {
            return Err(TaskError::AlreadyProcessing(self.state.name().to_string()));
        }
        if !self.state.is_count_steps_supported() {
            return Err(TaskError::CountStepsUnsupported(
                self.state.name().to_string(),
            ));
        }
        self.state.notify_counting();
        let children = lock(&self.children).clone();
        let mut work = lock(&self.work);
        let ctx = TaskContext {
            state: &self.state,
            children: &children,
        };
        let total = work.count_steps(&ctx)?;
        drop(work);
        self.state.notify_step_count(total);
        Ok(total)
    }

    /// Execute the task through one full lifecycle.
    ///
    /// Returns `Err` only for the re-entrancy contract violation. A failure
    /// escaping the body is captured into the task state — query
    /// `is_exception()` / `error()` after termination — and the run still
    /// winds down normally: exactly one `terminated` notification, after
    /// `processing` has been cleared.
    pub fn run(&self) -> Result<(), TaskError> {
        self.state.begin_processing()?;
        self.state.reset_for_run();

        let children = lock(&self.children).clone();
        let mut work = lock(&self.work);
        let ctx = TaskContext {
            state: &self.state,
            children: &children,
        };
        self.state.set_capabilities(work.capabilities(&ctx));

        if let Some(monitor) = self.state.monitor() {
            monitor.add(&self.state);
        }
        debug!(task = %self.state.name(), id = self.state.id(), "task starting");
        self.state.notify_processing();

        let result = work.execute(&ctx);
        drop(work);
        if let Err(err) = result {
            debug!(task = %self.state.name(), error = %err, "task failed");
            self.state.capture_error(err);
        }

        self.state.finish_processing();
        if self.state.is_cancelled() {
            self.state.notify_cancelled();
        }
        self.state.notify_terminated();
        debug!(task = %self.state.name(), status = ?self.state.status(), "task terminated");

        if self.state.remove_from_monitor_when_terminated() {
            if let Some(monitor) = self.state.monitor() {
                monitor.remove(&self.state);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared composite plumbing
// ---------------------------------------------------------------------------

/// Install the composite's monitor on every child that has none of its own.
pub(crate) fn propagate_monitor(ctx: &TaskContext<'_>) {
    let Some(monitor) = ctx.state().monitor() else {
        return;
    };
    for child in ctx.children() {
        if !child.state().has_monitor() {
            if let Err(err) = child.set_monitor(monitor.clone()) {
                warn!(child = %child.name(), error = %err, "could not propagate monitor");
            }
        }
    }
}

/// Start a child on its own thread.
pub(crate) fn spawn_child(child: &Arc<TaskRunner>) -> thread::JoinHandle<()> {
    let c = child.clone();
    thread::spawn(move || {
        if let Err(err) = c.run() {
            warn!(child = %c.name(), error = %err, "child task could not start");
        }
    })
}

/// Reap a finished child thread: record a failure or an abnormal end as a
/// non-fatal error on the composite.
pub(crate) fn record_child_outcome(
    ctx: &TaskContext<'_>,
    child: &TaskRunner,
    joined: thread::Result<()>,
) {
    if joined.is_err() || !child.is_terminated() {
        warn!(child = %child.name(), "child ended abnormally");
        ctx.record_error(TaskError::ChildAborted(child.name().to_string()));
    } else if let Some(err) = child.state().error() {
        warn!(child = %child.name(), error = %err, "child failed");
        ctx.record_error(TaskError::ChildFailed {
            name: child.name().to_string(),
            message: err.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::TaskController;
    use crate::monitor::MonitorRegistry;
    use crate::state::TaskStatus;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Poll `cond` for up to five seconds.
    pub(crate) fn wait_until(cond: impl Fn() -> bool) -> bool {
        for _ in 0..5000 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Records lifecycle notifications as compact strings.
    #[derive(Default)]
    pub(crate) struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        pub(crate) fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl TaskListener for Recorder {
        fn processing(&self, _task: &TaskState) {
            self.push("processing".into());
        }

        fn cancelled(&self, _task: &TaskState) {
            self.push("cancelled".into());
        }

        fn paused(&self, _task: &TaskState) {
            self.push("paused".into());
        }

        fn resumed(&self, _task: &TaskState) {
            self.push("resumed".into());
        }

        fn terminated(&self, task: &TaskState) {
            self.push(format!("terminated:processing={}", task.is_processing()));
        }

        fn counting(&self, _task: &TaskState) {
            self.push("counting".into());
        }

        fn step_count(&self, _task: &TaskState, total: u64) {
            self.push(format!("count:{}", total));
        }

        fn step_started(&self, _task: &TaskState, step: u64, label: Option<&str>) {
            self.push(format!("start:{}:{}", step, label.unwrap_or("")));
        }
    }

    /// Cooperative body that loops until released, cancelled, or (optionally)
    /// paused.
    pub(crate) struct GateWork {
        pub release: Arc<AtomicBool>,
        pub caps: Capabilities,
    }

    impl GateWork {
        pub(crate) fn new(caps: Capabilities) -> (Self, Arc<AtomicBool>) {
            let release = Arc::new(AtomicBool::new(false));
            (
                GateWork {
                    release: release.clone(),
                    caps,
                },
                release,
            )
        }
    }

    impl Work for GateWork {
        fn execute(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
            loop {
                if ctx.check_cancel() {
                    break;
                }
                if ctx.check_pause() {
                    continue;
                }
                if self.release.load(Ordering::SeqCst) {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }

        fn capabilities(&self, _ctx: &TaskContext<'_>) -> Capabilities {
            self.caps
        }
    }

    fn all_caps() -> Capabilities {
        Capabilities {
            cancel: true,
            pause: true,
            count_steps: false,
            indeterminate: false,
        }
    }

    #[test]
    fn run_completes_normally() {
        let hit = Arc::new(AtomicU64::new(0));
        let h = hit.clone();
        let task = TaskRunner::new(
            "noop",
            FnWork::new(move |_ctx| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        task.run().unwrap();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert!(task.is_terminated());
        assert!(!task.is_processing());
        assert!(!task.is_cancelled());
        assert!(!task.is_exception());
        assert_eq!(task.state().status(), TaskStatus::Completed);
    }

    #[test]
    fn body_failure_is_captured_not_returned() {
        let task = TaskRunner::new("bad", FnWork::new(|_ctx| Err(TaskError::execution("boom"))));

        task.run().unwrap();
        assert!(task.is_terminated());
        assert!(task.is_exception());
        assert!(!task.is_cancelled());
        assert_eq!(task.state().error(), Some(TaskError::Execution("boom".into())));
    }

    #[test]
    fn terminated_fires_once_after_processing_clears() {
        let rec = Arc::new(Recorder::default());
        let task = TaskRunner::new("noop", FnWork::new(|_ctx| Ok(())));
        task.add_listener(rec.clone());

        task.run().unwrap();
        let events = rec.events();
        let terminations: Vec<_> = events.iter().filter(|e| e.starts_with("terminated")).collect();
        assert_eq!(terminations, vec!["terminated:processing=false"]);
        assert_eq!(events.first().map(String::as_str), Some("processing"));
    }

    #[test]
    fn reentrant_run_fails_fast() {
        let (work, release) = GateWork::new(all_caps());
        let task = TaskRunner::new("gate", work);

        let t = task.clone();
        let handle = thread::spawn(move || t.run());
        assert!(wait_until(|| task.is_processing()));

        assert_eq!(
            task.run(),
            Err(TaskError::AlreadyProcessing("gate".into()))
        );

        release.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
        assert!(task.is_terminated());
    }

    #[test]
    fn rerun_after_termination_resets_state() {
        let fail_first = Arc::new(AtomicBool::new(true));
        let f = fail_first.clone();
        let task = TaskRunner::new(
            "flaky",
            FnWork::new(move |_ctx| {
                if f.swap(false, Ordering::SeqCst) {
                    Err(TaskError::execution("first run fails"))
                } else {
                    Ok(())
                }
            }),
        );

        task.run().unwrap();
        assert!(task.is_exception());

        task.run().unwrap();
        assert!(!task.is_exception());
        assert_eq!(task.state().status(), TaskStatus::Completed);
    }

    #[test]
    fn cancel_resolves_after_body_acknowledges() {
        let (work, _release) = GateWork::new(all_caps());
        let task = TaskRunner::new("gate", work);
        let rec = Arc::new(Recorder::default());
        task.add_listener(rec.clone());
        let controller = Arc::new(TaskController::new());
        task.add_listener(controller.clone());

        let t = task.clone();
        let handle = thread::spawn(move || t.run());
        assert!(wait_until(|| task.is_processing()));

        controller.request_cancel();
        handle.join().unwrap().unwrap();

        assert!(task.is_cancelled());
        assert!(!task.is_exception());
        assert_eq!(task.state().status(), TaskStatus::Cancelled);

        // "cancelled" precedes "terminated".
        let events = rec.events();
        let cancel_at = events.iter().position(|e| e == "cancelled").unwrap();
        let term_at = events.iter().position(|e| e.starts_with("terminated")).unwrap();
        assert!(cancel_at < term_at);
    }

    #[test]
    fn cancel_ignored_when_unsupported() {
        let caps = Capabilities {
            cancel: false,
            ..all_caps()
        };
        let (work, release) = GateWork::new(caps);
        let task = TaskRunner::new("stubborn", work);
        let controller = Arc::new(TaskController::new());
        task.add_listener(controller.clone());

        let t = task.clone();
        let handle = thread::spawn(move || t.run());
        assert!(wait_until(|| task.is_processing()));

        controller.request_cancel();
        thread::sleep(Duration::from_millis(20));
        assert!(task.is_processing()); // still running

        release.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
        assert!(!task.is_cancelled());
    }

    #[test]
    fn pause_and_resume() {
        let (work, release) = GateWork::new(all_caps());
        let task = TaskRunner::new("gate", work);
        let rec = Arc::new(Recorder::default());
        task.add_listener(rec.clone());
        let controller = Arc::new(TaskController::new());
        task.add_listener(controller.clone());

        let t = task.clone();
        let handle = thread::spawn(move || t.run());
        assert!(wait_until(|| task.is_processing()));

        controller.request_pause();
        assert!(wait_until(|| task.is_paused()));

        controller.request_resume();
        assert!(wait_until(|| !task.is_paused()));

        release.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();

        let events = rec.events();
        assert!(events.contains(&"paused".to_string()));
        assert!(events.contains(&"resumed".to_string()));
        assert_eq!(task.state().status(), TaskStatus::Completed);
    }

    #[test]
    fn count_steps_fixes_total_and_notifies() {
        struct Counted;
        impl Work for Counted {
            fn execute(&mut self, _ctx: &TaskContext<'_>) -> Result<(), TaskError> {
                Ok(())
            }
            fn count_steps(&mut self, _ctx: &TaskContext<'_>) -> Result<u64, TaskError> {
                Ok(42)
            }
            fn capabilities(&self, _ctx: &TaskContext<'_>) -> Capabilities {
                Capabilities {
                    count_steps: true,
                    ..Capabilities::default()
                }
            }
        }

        let task = TaskRunner::new("counted", Counted);
        let rec = Arc::new(Recorder::default());
        task.add_listener(rec.clone());

        assert_eq!(task.count_steps().unwrap(), 42);
        assert_eq!(task.state().steps(), Some(42));
        assert_eq!(rec.events(), vec!["counting", "count:42"]);
    }

    #[test]
    fn count_steps_unsupported() {
        let task = TaskRunner::new("plain", FnWork::new(|_ctx| Ok(())));
        assert_eq!(
            task.count_steps(),
            Err(TaskError::CountStepsUnsupported("plain".into()))
        );
    }

    #[test]
    fn monitor_sees_run_and_auto_remove() {
        let registry = Arc::new(MonitorRegistry::new());
        let task = TaskRunner::new("watched", FnWork::new(|_ctx| Ok(())));
        task.set_monitor(registry.clone()).unwrap();

        task.run().unwrap();
        assert!(registry.contains(task.state())); // stays after termination

        task.set_remove_from_monitor_when_terminated(true);
        task.run().unwrap();
        assert!(!registry.contains(task.state()));
    }

    #[test]
    fn set_monitor_while_processing_fails() {
        let (work, release) = GateWork::new(all_caps());
        let task = TaskRunner::new("gate", work);

        let t = task.clone();
        let handle = thread::spawn(move || t.run());
        assert!(wait_until(|| task.is_processing()));

        let registry = Arc::new(MonitorRegistry::new());
        assert_eq!(
            task.set_monitor(registry),
            Err(TaskError::ModifiedWhileProcessing("gate".into()))
        );

        release.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn add_child_links_parent() {
        let seq = TaskRunner::sequence("parent");
        let child = TaskRunner::new("child", FnWork::new(|_ctx| Ok(())));
        seq.add_child(child.clone()).unwrap();

        assert_eq!(seq.children().len(), 1);
        assert_eq!(child.state().parent().unwrap().name(), "parent");
    }

    #[test]
    fn add_child_while_processing_fails() {
        let (work, release) = GateWork::new(all_caps());
        let task = TaskRunner::new("gate", work);

        let t = task.clone();
        let handle = thread::spawn(move || t.run());
        assert!(wait_until(|| task.is_processing()));

        let child = TaskRunner::new("late", FnWork::new(|_ctx| Ok(())));
        assert_eq!(
            task.add_child(child),
            Err(TaskError::ModifiedWhileProcessing("gate".into()))
        );

        release.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn capabilities_snapshot_matches_body() {
        let (work, _release) = GateWork::new(all_caps());
        let task = TaskRunner::new("gate", work);
        assert!(task.is_cancel_supported());
        assert!(task.is_pause_supported());
        assert!(!task.is_count_steps_supported());
        assert!(!task.is_indeterminate());
    }
}
