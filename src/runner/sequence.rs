//! Sequential composite — runs child tasks strictly one at a time.
//!
//! Each child runs on its own thread while the composite's body loops,
//! polling. A bridge listener attached to every child answers the child's
//! cancel/pause/resume polls from the composite's own request latches; that
//! is the whole forwarding mechanism. Progress is step-per-child: the total
//! is the child count and one step is notified per child termination,
//! labelled with the child's name.
//!
//! The composite always claims cancel and pause support, whatever its
//! children can do: it can at minimum stop launching further children after
//! the current one terminates.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::TaskError;
use crate::listener::TaskListener;
use crate::state::{Capabilities, TaskState};

use super::{
    propagate_monitor, record_child_outcome, spawn_child, TaskContext, TaskRunner, Work,
    SCHED_POLL,
};

/// Bridge attached to each child: the child polls its listeners, and this
/// one answers from the composite's request latches.
struct SeqBridge {
    parent: Arc<TaskState>,
}

impl TaskListener for SeqBridge {
    fn cancel_requested(&self) -> bool {
        self.parent.is_cancelling()
    }

    fn pause_requested(&self) -> bool {
        self.parent.pause_wanted()
    }

    fn resume_requested(&self) -> bool {
        self.parent.resume_wanted()
    }
}

/// Work body of a sequential composite. Children come from the runner.
pub(crate) struct SequenceWork {
    /// Child ids that already carry a bridge, so re-runs do not stack
    /// duplicate listeners.
    bridged: HashSet<u64>,
}

impl SequenceWork {
    pub(crate) fn new() -> Self {
        SequenceWork {
            bridged: HashSet::new(),
        }
    }
}

impl Work for SequenceWork {
    fn capabilities(&self, _ctx: &TaskContext<'_>) -> Capabilities {
        Capabilities {
            cancel: true,
            pause: true,
            count_steps: true,
            indeterminate: false,
        }
    }

    fn count_steps(&mut self, ctx: &TaskContext<'_>) -> Result<u64, TaskError> {
        Ok(ctx.children().len() as u64)
    }

    fn execute(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        let state = ctx.state();
        let children = ctx.children().to_vec();
        ctx.notify_step_count(children.len() as u64);
        propagate_monitor(ctx);

        for child in &children {
            if self.bridged.insert(child.id()) {
                child.add_listener(Arc::new(SeqBridge {
                    parent: state.clone(),
                }));
            }
        }

        let mut pending: VecDeque<Arc<TaskRunner>> = children.into_iter().collect();
        let mut running: Option<(Arc<TaskRunner>, JoinHandle<()>)> = None;
        let mut done: u64 = 0;
        let mut paused = false;

        loop {
            // Reap the running child once its thread finishes.
            if let Some((child, handle)) = running.take() {
                if handle.is_finished() {
                    record_child_outcome(ctx, &child, handle.join());
                    done += 1;
                    ctx.notify_step_started(done, Some(child.name()));
                    ctx.notify_step_done();
                } else {
                    running = Some((child, handle));
                }
            }

            // Latch cancellation every pass so child bridges see it promptly.
            let cancelling = ctx.check_cancel();
            if running.is_none() && (cancelling || pending.is_empty()) {
                break;
            }

            if !cancelling {
                if !paused {
                    // Forward a pause request and wait for the child to
                    // confirm before reporting the composite as paused.
                    if state.pause_wanted() || state.poll_pause_requested() {
                        state.set_pause_wanted(true);
                        let confirmed = running
                            .as_ref()
                            .map_or(true, |(c, h)| c.is_paused() || h.is_finished());
                        if confirmed {
                            debug!(task = %state.name(), "sequence paused");
                            state.mark_paused();
                            paused = true;
                        }
                    }
                } else {
                    if state.poll_resume_requested() {
                        state.set_resume_wanted(true);
                    }
                    if state.resume_wanted() {
                        let resumed = running
                            .as_ref()
                            .map_or(true, |(c, h)| !c.is_paused() || h.is_finished());
                        if resumed {
                            state.set_resume_wanted(false);
                            state.set_pause_wanted(false);
                            debug!(task = %state.name(), "sequence resumed");
                            state.mark_resumed();
                            paused = false;
                        }
                    }
                }
            }

            if running.is_none() && !cancelling && !paused && !state.pause_wanted() {
                if let Some(child) = pending.pop_front() {
                    debug!(task = %state.name(), child = %child.name(), "launching child");
                    let handle = spawn_child(&child);
                    running = Some((child, handle));
                }
            }

            thread::sleep(SCHED_POLL);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
