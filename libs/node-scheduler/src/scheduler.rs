//! Task Scheduler - cooperative periodic task execution
//!
//! One tick pass:
//! 1. refresh config-sourced intervals from the [`IntervalProvider`]
//! 2. copy each leader's interval onto the tasks coupled to it
//! 3. run every enabled, due task once, in table order

use std::collections::HashMap;

use common::clock::Millis;
use errors::NodeResult;
use tracing::{debug, error, info};

use crate::task::{IntervalSource, Task, TaskSpec, TaskTable};

/// Supplies interval overrides by key
pub trait IntervalProvider {
    /// `None` while the configuration is not yet initialised
    fn interval_ms(&self, key: &str) -> Option<Millis>;
}

impl IntervalProvider for HashMap<String, Millis> {
    fn interval_ms(&self, key: &str) -> Option<Millis> {
        self.get(key).copied()
    }
}

/// Provider with no overrides; every task keeps its current interval
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOverrides;

impl IntervalProvider for NoOverrides {
    fn interval_ms(&self, _key: &str) -> Option<Millis> {
        None
    }
}

/// Executes task bodies
///
/// Bodies get mutable access to the table so they can enable, disable or
/// retime other tasks within the same pass.
pub trait TaskRunner {
    fn run(&mut self, task: &str, now: Millis, table: &mut TaskTable) -> NodeResult<()>;
}

impl<F> TaskRunner for F
where
    F: FnMut(&str, Millis, &mut TaskTable) -> NodeResult<()>,
{
    fn run(&mut self, task: &str, now: Millis, table: &mut TaskTable) -> NodeResult<()> {
        self(task, now, table)
    }
}

/// Outcome of one tick pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub now: Millis,
    /// Tasks whose body ran, in execution order
    pub fired: Vec<String>,
    /// Subset of `fired` whose body returned an error
    pub failed: Vec<String>,
}

impl TickReport {
    pub fn fired(&self, task: &str) -> bool {
        self.fired.iter().any(|t| t == task)
    }
}

/// Scheduler status information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub total_tasks: usize,
    pub enabled_tasks: usize,
    pub ticks: u64,
    pub runs: u64,
    pub failures: u64,
}

/// Task Scheduler - owns the task table
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    table: TaskTable,
    ticks: u64,
    runs: u64,
    failures: u64,
}

impl TaskScheduler {
    pub fn new(specs: Vec<TaskSpec>) -> NodeResult<Self> {
        let table = TaskTable::new(specs)?;
        info!("Scheduler created with {} tasks", table.len());
        Ok(Self {
            table,
            ticks: 0,
            runs: 0,
            failures: 0,
        })
    }

    pub fn table(&self) -> &TaskTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut TaskTable {
        &mut self.table
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.table.get(name)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> NodeResult<()> {
        self.table.set_enabled(name, enabled)
    }

    pub fn set_interval(&mut self, name: &str, interval_ms: Millis) -> NodeResult<()> {
        self.table.set_interval(name, interval_ms)
    }

    pub fn set_coupling(&mut self, name: &str, leader: Option<&str>) -> NodeResult<()> {
        self.table.set_coupling(name, leader)
    }

    /// Treat every task as having just run at `now`
    pub fn reset_last_run(&mut self, now: Millis) {
        for task in self.table.tasks_mut() {
            task.last_run_ms = Some(now);
        }
        debug!("All task timers reset at {}", now);
    }

    /// Apply provider intervals, then couplings
    ///
    /// Zero or missing values keep the last known-good interval.
    pub fn refresh_intervals<P>(&mut self, provider: &P)
    where
        P: IntervalProvider + ?Sized,
    {
        for task in self.table.tasks_mut() {
            let IntervalSource::Config(key) = &task.source else {
                continue;
            };
            match provider.interval_ms(key) {
                Some(0) => {
                    debug!("Task {}: ignoring zero interval from {}", task.name, key);
                },
                Some(ms) if ms != task.interval_ms => {
                    info!(task = %task.name, interval_ms = ms, "Task interval updated");
                    task.interval_ms = ms;
                },
                _ => {},
            }
        }

        for index in 0..self.table.len() {
            let Some(leader) = self.table.task_at(index).coupled_leader() else {
                continue;
            };
            let Some(leader_ms) = self.table.interval_of(leader) else {
                continue;
            };
            if leader_ms == 0 {
                continue;
            }
            let task = self.table.task_at_mut(index);
            if task.interval_ms != leader_ms {
                debug!(task = %task.name, interval_ms = leader_ms, "Coupled interval applied");
                task.interval_ms = leader_ms;
            }
        }
    }

    /// Run one scheduler pass at `now`
    ///
    /// Each due task fires at most once per pass; missed intervals are not
    /// caught up. A failing body is logged and the pass continues.
    pub fn tick<P, R>(&mut self, now: Millis, provider: &P, runner: &mut R) -> TickReport
    where
        P: IntervalProvider + ?Sized,
        R: TaskRunner + ?Sized,
    {
        self.ticks += 1;
        self.refresh_intervals(provider);

        let mut report = TickReport {
            now,
            ..Default::default()
        };

        for index in 0..self.table.len() {
            let task = self.table.task_at(index);
            if !task.enabled || !task.is_due(now) {
                continue;
            }
            let name = task.name.clone();

            let task = self.table.task_at_mut(index);
            task.last_run_ms = Some(now);
            task.run_count += 1;
            self.runs += 1;

            debug!("Running task: {}", name);
            if let Err(e) = runner.run(&name, now, &mut self.table) {
                error!("Task {} execution error: {}", name, e);
                self.failures += 1;
                report.failed.push(name.clone());
            }
            report.fired.push(name);
        }

        report
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            total_tasks: self.table.len(),
            enabled_tasks: self.table.iter().filter(|t| t.is_enabled()).count(),
            ticks: self.ticks,
            runs: self.runs,
            failures: self.failures,
        }
    }
}
