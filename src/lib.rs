//! Task execution and progress-monitoring engine.
//!
//! `taskwell` runs potentially long, cancellable, pausable units of work —
//! singly or as composites — while aggregating and throttling progress
//! notifications to external observers. Cancellation and pausing are
//! cooperative: a work body polls `check_cancel` / `check_pause` at its loop
//! boundaries, and the engine only ever stops admitting new work; it never
//! preempts work already in flight.
//!
//! The pieces:
//!
//! - [`Work`] — the externally supplied body of a task, with its capability
//!   declaration (cancel / pause / pre-count / indeterminate).
//! - [`TaskRunner`] — the state machine that drives one body through
//!   Idle → Processing → {Cancelled | Failed | Completed} → Terminated.
//!   [`TaskRunner::sequence`] and [`TaskRunner::pool`] build composite tasks
//!   that run child runners one at a time or across a bounded thread pool.
//! - [`TaskListener`] — observer callbacks plus the request polls through
//!   which observers ask for cancel / pause / resume; [`TaskController`] is
//!   a ready-made requester.
//! - [`TaskMonitor`] / [`MonitorRegistry`] — an external registry of live
//!   tasks, for progress panels.
//!
//! ```
//! use taskwell::{FnWork, TaskRunner};
//!
//! let task = TaskRunner::new(
//!     "greet",
//!     FnWork::new(|ctx| {
//!         ctx.notify_step_count(3);
//!         for step in 1..=3 {
//!             ctx.notify_step_started(step, Some("greeting"));
//!             ctx.notify_step_done();
//!         }
//!         Ok(())
//!     }),
//! );
//! task.run().unwrap();
//! assert!(task.is_terminated());
//! ```

pub mod error;
pub mod listener;
pub mod monitor;
pub mod runner;
pub mod state;

pub use error::TaskError;
pub use listener::{TaskController, TaskListener};
pub use monitor::{MonitorRegistry, RegistryStats, TaskMonitor};
pub use runner::pool::NotifyStrategy;
pub use runner::{FnWork, TaskContext, TaskRunner, Work};
pub use state::{Capabilities, TaskSnapshot, TaskState, TaskStatus};
