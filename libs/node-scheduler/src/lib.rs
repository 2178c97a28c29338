//! Node Scheduler - cooperative fixed-interval task table
//!
//! A small fixed set of named periodic tasks, driven by repeated calls to
//! [`TaskScheduler::tick`] from a single control loop.
//!
//! ```text
//!   tick(now)
//!     │
//!     ├─ refresh   Config(key)    ← IntervalProvider (None / 0 ignored)
//!     ├─ couple    CoupledTo(t)   ← interval of t
//!     └─ dispatch  enabled && now - last_run >= interval → TaskRunner::run
//! ```

mod scheduler;
mod task;

pub use common::clock::Millis;
pub use scheduler::{
    IntervalProvider, NoOverrides, SchedulerStatus, TaskRunner, TaskScheduler, TickReport,
};
pub use task::{IntervalSource, Task, TaskSpec, TaskTable};
