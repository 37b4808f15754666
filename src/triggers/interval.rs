use super::{BackupTrigger, TaskSlot, TriggerContext};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Backs up every fixed period
///
/// The first backup happens one full period after registration. Ticks missed
/// while a slow backup was running are skipped rather than replayed.
#[derive(Debug)]
pub struct IntervalTrigger {
    period: Duration,
    task: TaskSlot,
}

impl IntervalTrigger {
    /// Create an inactive trigger; a zero period is raised to one millisecond
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            task: TaskSlot::default(),
        }
    }

    /// Time between backups
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl BackupTrigger for IntervalTrigger {
    fn register(&self, ctx: TriggerContext) {
        let period = self.period;
        let started = self.task.start(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                ctx.fire("interval").await;
            }
        });
        if started {
            debug!("Interval trigger registered ({:?})", period);
        }
    }

    fn unregister(&self) {
        self.task.stop();
    }

    fn is_active(&self) -> bool {
        self.task.is_active()
    }

    fn name(&self) -> &'static str {
        "interval"
    }
}
