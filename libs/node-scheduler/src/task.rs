//! Task definitions and the owned task table

use common::clock::{elapsed_ms, Millis};
use errors::{NodeError, NodeResult};
use tracing::debug;

/// Where a task's interval comes from at the start of every tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalSource {
    /// Only changed through `set_interval`
    Fixed,
    /// Refreshed from the interval provider under this key
    Config(String),
    /// Mirrors another task's current interval
    CoupledTo(String),
}

/// Declaration of one task slot
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub interval_ms: Millis,
    pub enabled: bool,
    pub source: IntervalSource,
}

impl TaskSpec {
    /// Enabled task with a fixed interval
    pub fn new(name: impl Into<String>, interval_ms: Millis) -> Self {
        Self {
            name: name.into(),
            interval_ms,
            enabled: true,
            source: IntervalSource::Fixed,
        }
    }

    /// Refresh the interval from the provider key `key`
    pub fn from_config(mut self, key: impl Into<String>) -> Self {
        self.source = IntervalSource::Config(key.into());
        self
    }

    /// Always run at `leader`'s interval
    pub fn coupled_to(mut self, leader: impl Into<String>) -> Self {
        self.source = IntervalSource::CoupledTo(leader.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Runtime state of one task slot
///
/// `interval_ms` is never zero; it always holds the last known-good interval.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) name: String,
    pub(crate) enabled: bool,
    pub(crate) interval_ms: Millis,
    pub(crate) last_run_ms: Option<Millis>,
    pub(crate) source: IntervalSource,
    pub(crate) run_count: u64,
}

impl Task {
    fn from_spec(spec: TaskSpec) -> Self {
        Self {
            name: spec.name,
            enabled: spec.enabled,
            interval_ms: spec.interval_ms,
            last_run_ms: None,
            source: spec.source,
            run_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval_ms(&self) -> Millis {
        self.interval_ms
    }

    pub fn last_run_ms(&self) -> Option<Millis> {
        self.last_run_ms
    }

    pub fn source(&self) -> &IntervalSource {
        &self.source
    }

    /// Number of times the body has been started
    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    /// A task that never ran is due immediately
    pub fn is_due(&self, now: Millis) -> bool {
        match self.last_run_ms {
            None => true,
            Some(last) => elapsed_ms(now, last) >= self.interval_ms,
        }
    }

    pub fn coupled_leader(&self) -> Option<&str> {
        match &self.source {
            IntervalSource::CoupledTo(leader) => Some(leader),
            _ => None,
        }
    }
}

/// Fixed set of named tasks, in execution order
#[derive(Debug, Clone)]
pub struct TaskTable {
    tasks: Vec<Task>,
}

impl TaskTable {
    /// Build a table, rejecting duplicate names, zero intervals and bad couplings
    pub fn new(specs: Vec<TaskSpec>) -> NodeResult<Self> {
        let mut table = Self {
            tasks: Vec::with_capacity(specs.len()),
        };

        for spec in specs {
            if spec.name.is_empty() {
                return Err(NodeError::Scheduler("Task name must not be empty".into()));
            }
            if table.position(&spec.name).is_some() {
                return Err(NodeError::Scheduler(format!(
                    "Duplicate task name: {}",
                    spec.name
                )));
            }
            if spec.interval_ms == 0 {
                return Err(NodeError::Scheduler(format!(
                    "Task {} has a zero interval",
                    spec.name
                )));
            }
            table.tasks.push(Task::from_spec(spec));
        }

        for task in &table.tasks {
            if let Some(leader) = task.coupled_leader() {
                table.check_leader(&task.name, leader)?;
            }
        }

        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| t.enabled)
    }

    pub fn interval_of(&self, name: &str) -> Option<Millis> {
        self.get(name).map(|t| t.interval_ms)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> NodeResult<()> {
        let task = self.get_mut(name)?;
        if task.enabled != enabled {
            debug!("Task {} {}", name, if enabled { "enabled" } else { "disabled" });
        }
        task.enabled = enabled;
        Ok(())
    }

    /// Set an interval directly; zero is rejected
    ///
    /// Config-sourced and coupled tasks get overwritten again on the next tick.
    pub fn set_interval(&mut self, name: &str, interval_ms: Millis) -> NodeResult<()> {
        if interval_ms == 0 {
            return Err(NodeError::Validation(format!(
                "Interval for task {} must be greater than 0",
                name
            )));
        }
        self.get_mut(name)?.interval_ms = interval_ms;
        Ok(())
    }

    /// Couple `name` to `leader`, or decouple it (back to a fixed interval) with `None`
    pub fn set_coupling(&mut self, name: &str, leader: Option<&str>) -> NodeResult<()> {
        self.index_of(name)?;
        match leader {
            Some(leader) => {
                self.check_leader(name, leader)?;
                if self.tasks.iter().any(|t| t.coupled_leader() == Some(name)) {
                    return Err(NodeError::Scheduler(format!(
                        "Task {} leads other tasks and cannot be coupled",
                        name
                    )));
                }
                self.get_mut(name)?.source = IntervalSource::CoupledTo(leader.to_string());
            },
            None => {
                let task = self.get_mut(name)?;
                if matches!(task.source, IntervalSource::CoupledTo(_)) {
                    task.source = IntervalSource::Fixed;
                }
            },
        }
        Ok(())
    }

    pub(crate) fn task_at(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub(crate) fn task_at_mut(&mut self, index: usize) -> &mut Task {
        &mut self.tasks[index]
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut [Task] {
        &mut self.tasks
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name == name)
    }

    fn index_of(&self, name: &str) -> NodeResult<usize> {
        self.position(name)
            .ok_or_else(|| NodeError::UnknownTask(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> NodeResult<&mut Task> {
        let index = self.index_of(name)?;
        Ok(&mut self.tasks[index])
    }

    fn check_leader(&self, name: &str, leader: &str) -> NodeResult<()> {
        if leader == name {
            return Err(NodeError::Scheduler(format!(
                "Task {} cannot be coupled to itself",
                name
            )));
        }
        let leader_task = self.get(leader).ok_or_else(|| {
            NodeError::Scheduler(format!("Task {} coupled to unknown task {}", name, leader))
        })?;
        if leader_task.coupled_leader().is_some() {
            return Err(NodeError::Scheduler(format!(
                "Task {} coupled to {}, which is itself coupled",
                name, leader
            )));
        }
        Ok(())
    }
}
