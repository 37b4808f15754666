use super::{BackupTrigger, TaskSlot, TriggerContext};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Backs up once saves have stopped for a quiet period
///
/// Keeps a single pending deadline. Every save of the file pushes the deadline
/// back to `now + quiet_period`; when it passes without another save, one
/// backup runs.
#[derive(Debug)]
pub struct OnModifiedTrigger {
    quiet_period: Duration,
    task: TaskSlot,
}

impl OnModifiedTrigger {
    /// Create an inactive trigger
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            task: TaskSlot::default(),
        }
    }

    /// Debounce window
    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }
}

impl BackupTrigger for OnModifiedTrigger {
    fn register(&self, ctx: TriggerContext) {
        if self.task.is_active() {
            return;
        }
        let quiet = self.quiet_period;
        let mut events = ctx.events.subscribe();
        self.task.start(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) if event.is_save_of(&ctx.path) => {
                            deadline = Some(Instant::now() + quiet);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!("On-modified trigger for {:?} missed {} events", ctx.path, missed);
                            deadline = Some(Instant::now() + quiet);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        ctx.fire("on_modified").await;
                    }
                }
            }
        });
        debug!("On-modified trigger registered (quiet period {:?})", quiet);
    }

    fn unregister(&self) {
        self.task.stop();
    }

    fn is_active(&self) -> bool {
        self.task.is_active()
    }

    fn name(&self) -> &'static str {
        "on_modified"
    }
}
