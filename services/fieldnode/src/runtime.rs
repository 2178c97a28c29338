//! Main loop
//!
//! One scheduler pass per loop delay until shutdown. Task bodies are
//! synchronous; a slow pass delays the next one instead of bunching up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use boot_guard::{FirmwareStore, KvStore};
use common::shutdown::wait_for_shutdown;
use common::Clock;
use node_scheduler::{SchedulerStatus, TaskScheduler, TickReport};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::bus::BusTransport;
use crate::config::RuntimeIntervals;
use crate::tasks::NodeTasks;
use crate::uplink::Uplink;

/// Scheduler plus task bodies, driven by a clock
pub struct Node<B, U, S, F>
where
    B: BusTransport,
    U: Uplink,
    S: KvStore,
    F: FirmwareStore,
{
    scheduler: TaskScheduler,
    tasks: NodeTasks<B, U, S, F>,
    intervals: RuntimeIntervals,
    clock: Arc<dyn Clock>,
}

impl<B, U, S, F> Node<B, U, S, F>
where
    B: BusTransport,
    U: Uplink,
    S: KvStore,
    F: FirmwareStore,
{
    /// `intervals` must be the instance the task bodies update
    pub fn new(
        scheduler: TaskScheduler,
        tasks: NodeTasks<B, U, S, F>,
        intervals: RuntimeIntervals,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scheduler,
            tasks,
            intervals,
            clock,
        }
    }

    /// One scheduler pass at the current clock reading
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now_ms();
        let report = self.scheduler.tick(now, &self.intervals, &mut self.tasks);
        if !report.fired.is_empty() {
            debug!(now, fired = ?report.fired, "Scheduler pass");
        }
        report
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn tasks(&self) -> &NodeTasks<B, U, S, F> {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut NodeTasks<B, U, S, F> {
        &mut self.tasks
    }

    pub fn intervals(&self) -> &RuntimeIntervals {
        &self.intervals
    }
}

/// Run until Ctrl+C or SIGTERM
pub async fn run<B, U, S, F>(node: &mut Node<B, U, S, F>, loop_delay: Duration) -> SchedulerStatus
where
    B: BusTransport,
    U: Uplink,
    S: KvStore,
    F: FirmwareStore,
{
    let shutdown = async {
        let reason = wait_for_shutdown().await;
        info!("{} received", reason);
    };
    run_until(node, loop_delay, shutdown).await
}

/// Run until `shutdown` completes
pub async fn run_until<B, U, S, F, Fut>(
    node: &mut Node<B, U, S, F>,
    loop_delay: Duration,
    shutdown: Fut,
) -> SchedulerStatus
where
    B: BusTransport,
    U: Uplink,
    S: KvStore,
    F: FirmwareStore,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(loop_delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!("Main loop started, pass every {:?}", loop_delay);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Stopping main loop");
                break;
            }
            _ = ticker.tick() => {
                node.tick();
            }
        }
    }

    let status = node.scheduler().status();
    info!(
        ticks = status.ticks,
        runs = status.runs,
        failures = status.failures,
        "Main loop stopped"
    );
    status
}
