use super::{BackupTrigger, TaskSlot, TriggerContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Backs up once, shortly after the file is first registered
///
/// Registering again while the backup is pending, or after it ran, does
/// nothing. Unregistering before the delay elapses cancels the pending backup
/// and a later registration schedules it again.
#[derive(Debug)]
pub struct OnStartupTrigger {
    delay: Duration,
    fired: Arc<AtomicBool>,
    task: TaskSlot,
}

impl OnStartupTrigger {
    /// Create an inactive trigger
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fired: Arc::new(AtomicBool::new(false)),
            task: TaskSlot::default(),
        }
    }

    /// Whether the startup backup already ran
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl BackupTrigger for OnStartupTrigger {
    fn register(&self, ctx: TriggerContext) {
        if self.has_fired() {
            return;
        }
        let delay = self.delay;
        let fired = self.fired.clone();
        let started = self.task.start(async move {
            tokio::time::sleep(delay).await;
            if !fired.swap(true, Ordering::SeqCst) {
                ctx.fire("on_startup").await;
            }
        });
        if started {
            debug!("Startup backup scheduled in {:?}", delay);
        }
    }

    fn unregister(&self) {
        self.task.stop();
    }

    fn is_active(&self) -> bool {
        self.task.is_active()
    }

    fn name(&self) -> &'static str {
        "on_startup"
    }
}
