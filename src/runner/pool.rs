//! Bounded-concurrency composite — runs children across a pool of threads.
//!
//! At most `max_concurrent` children execute at once, each on its own
//! thread. The composite picks one of three progress strategies at the start
//! of a run by inspecting child capabilities, then relays a single monotonic
//! progress stream to its own listeners instead of exposing N interleaved
//! child streams.
//!
//! Cancel and pause capability is the AND of all children: with several
//! children in flight, the pool cannot promise an orderly stop unless every
//! child cooperates. Pause is a barrier — the pool reports itself paused
//! only once every executing child has confirmed, and resumed only once
//! every one of them is running again.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::TaskError;
use crate::listener::TaskListener;
use crate::state::{lock, Capabilities, TaskState};

use super::{
    propagate_monitor, record_child_outcome, spawn_child, TaskContext, TaskRunner, Work,
    SCHED_POLL,
};

// ---------------------------------------------------------------------------
// NotifyStrategy
// ---------------------------------------------------------------------------

/// How a pool composite accounts progress units across its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStrategy {
    /// Some child is indeterminate: one unit per child, total = child count.
    Tasks,
    /// No child is indeterminate but not all can pre-count: the total grows
    /// as each child reports its own count when it starts.
    StepsUnknown,
    /// Every child can pre-count: the total is summed up front and children
    /// are fed to the pool smallest-count-first.
    StepsKnown,
}

/// Pure, deterministic strategy choice from child capability snapshots.
pub(crate) fn select_strategy(children: &[Arc<TaskRunner>]) -> NotifyStrategy {
    if children.iter().any(|c| c.is_indeterminate()) {
        NotifyStrategy::Tasks
    } else if children.iter().any(|c| !c.is_count_steps_supported()) {
        NotifyStrategy::StepsUnknown
    } else {
        NotifyStrategy::StepsKnown
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// State shared between the pool body and the bridges on its children. The
/// strategy mutex doubles as the progress lock: every aggregated update from
/// a child thread happens under it, so concurrent terminations can never
/// lose an update or relay a non-monotonic counter.
struct PoolShared {
    strategy: Mutex<NotifyStrategy>,
}

/// Attached to each child: relays progress into the composite's stream and
/// answers the child's cancel/pause/resume polls from the composite latches.
struct PoolBridge {
    parent: Arc<TaskState>,
    shared: Arc<PoolShared>,
}

impl TaskListener for PoolBridge {
    fn processing(&self, child: &TaskState) {
        let strategy = lock(&self.shared.strategy);
        if *strategy == NotifyStrategy::Tasks {
            self.parent.advance_step(1, Some(child.name()));
        }
    }

    fn step_count(&self, _child: &TaskState, total: u64) {
        let strategy = lock(&self.shared.strategy);
        if *strategy == NotifyStrategy::StepsUnknown {
            self.parent.grow_steps(total);
        }
    }

    fn step_started(&self, child: &TaskState, _step: u64, label: Option<&str>) {
        let strategy = lock(&self.shared.strategy);
        if matches!(
            *strategy,
            NotifyStrategy::StepsUnknown | NotifyStrategy::StepsKnown
        ) {
            self.parent.advance_step(child.step_increase(), label);
        }
    }

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

// ---------------------------------------------------------------------------
// PoolWork
// ---------------------------------------------------------------------------

/// Work body of a bounded-concurrency composite.
pub(crate) struct PoolWork {
    max_concurrent: usize,
    shared: Arc<PoolShared>,
    /// Child ids that already carry a bridge, so re-runs do not stack
    /// duplicate listeners.
    bridged: HashSet<u64>,
}

impl PoolWork {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        PoolWork {
            max_concurrent: max_concurrent.max(1),
            shared: Arc::new(PoolShared {
                strategy: Mutex::new(NotifyStrategy::Tasks),
            }),
            bridged: HashSet::new(),
        }
    }
}

impl Work for PoolWork {
    fn capabilities(&self, ctx: &TaskContext<'_>) -> Capabilities {
        let children = ctx.children();
        Capabilities {
            cancel: children.iter().all(|c| c.is_cancel_supported()),
            pause: children.iter().all(|c| c.is_pause_supported()),
            count_steps: false,
            indeterminate: false,
        }
    }

    fn execute(&mut self, ctx: &TaskContext<'_>) -> Result<(), TaskError> {
        let state = ctx.state();
        let children = ctx.children().to_vec();
        propagate_monitor(ctx);

        let strategy = select_strategy(&children);
        *lock(&self.shared.strategy) = strategy;
        debug!(task = %state.name(), ?strategy, children = children.len(), "pool starting");

        // Prepare the pending queue per strategy.
        let mut pending: VecDeque<Arc<TaskRunner>> = match strategy {
            NotifyStrategy::Tasks => {
                ctx.notify_step_count(children.len() as u64);
                children.into_iter().collect()
            }
            NotifyStrategy::StepsUnknown => children.into_iter().collect(),
            NotifyStrategy::StepsKnown => {
                // Pre-count sequentially; the pre-count itself honors pause
                // and cancel requests.
                let mut counted: Vec<(u64, Arc<TaskRunner>)> = Vec::with_capacity(children.len());
                let mut total: u64 = 0;
                for child in &children {
                    while ctx.check_pause() {
                        if ctx.check_cancel() {
                            break;
                        }
                    }
                    if ctx.check_cancel() {
                        break;
                    }
                    let count = child.count_steps()?;
                    total += count;
                    counted.push((count, child.clone()));
                }
                ctx.notify_step_count(total);
                // Smallest units first; stable sort keeps insertion order on
                // ties.
                counted.sort_by_key(|(count, _)| *count);
                counted.into_iter().map(|(_, child)| child).collect()
            }
        };

        let bridge = Arc::new(PoolBridge {
            parent: state.clone(),
            shared: self.shared.clone(),
        });

        let mut executing: Vec<(Arc<TaskRunner>, JoinHandle<()>)> = Vec::new();
        let mut paused = false;

        loop {
            // Reap children whose threads finished.
            let mut i = 0;
            while i < executing.len() {
                if executing[i].1.is_finished() {
                    let (child, handle) = executing.remove(i);
                    record_child_outcome(ctx, &child, handle.join());
                } else {
                    i += 1;
                }
            }

            // Cancellation stops admission but never the children already in
            // flight; the pool exits once they have drained. Without a
            // cancel, exit when everything has been run.
            let cancelling = ctx.check_cancel();
            if executing.is_empty() && (cancelling || pending.is_empty()) {
                break;
            }

            // Barrier pause: report paused only when every executing child
            // agrees, resumed only when all of them run again.
            if !cancelling && state.is_pause_supported() {
                if !paused {
                    if state.pause_wanted() || state.poll_pause_requested() {
                        state.set_pause_wanted(true);
                        let all_confirmed = executing
                            .iter()
                            .all(|(c, h)| c.is_paused() || h.is_finished());
                        if all_confirmed {
                            debug!(task = %state.name(), "pool paused");
                            state.mark_paused();
                            paused = true;
                        }
                    }
                } else {
                    if state.poll_resume_requested() {
                        state.set_resume_wanted(true);
                    }
                    if state.resume_wanted() {
                        let all_resumed = executing
                            .iter()
                            .all(|(c, h)| !c.is_paused() || h.is_finished());
                        if all_resumed {
                            state.set_resume_wanted(false);
                            state.set_pause_wanted(false);
                            debug!(task = %state.name(), "pool resumed");
                            state.mark_resumed();
                            paused = false;
                        }
                    }
                }
            }

            // Admit as many pending children as fit under the bound.
            if !cancelling && !paused && !state.pause_wanted() {
                while executing.len() < self.max_concurrent {
                    let Some(child) = pending.pop_front() else {
                        break;
                    };
                    if self.bridged.insert(child.id()) {
                        child.add_listener(bridge.clone());
                    }
                    debug!(task = %state.name(), child = %child.name(), "admitting child");
                    let handle = spawn_child(&child);
                    executing.push((child, handle));
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
