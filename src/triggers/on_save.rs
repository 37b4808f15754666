use super::{BackupTrigger, TaskSlot, TriggerContext};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Backs up after every save of the file
///
/// Saves arriving while a backup runs queue up on the event bus and each get
/// their own backup.
#[derive(Debug, Default)]
pub struct OnSaveTrigger {
    task: TaskSlot,
}

impl OnSaveTrigger {
    /// Create an inactive trigger
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackupTrigger for OnSaveTrigger {
    fn register(&self, ctx: TriggerContext) {
        if self.task.is_active() {
            return;
        }
        // Subscribe before returning so a save right after registration is seen
        let mut events = ctx.events.subscribe();
        self.task.start(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.is_save_of(&ctx.path) => ctx.fire("on_save").await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!("On-save trigger for {:?} missed {} events", ctx.path, missed);
                        ctx.fire("on_save").await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        debug!("On-save trigger registered");
    }

    fn unregister(&self) {
        self.task.stop();
    }

    fn is_active(&self) -> bool {
        self.task.is_active()
    }

    fn name(&self) -> &'static str {
        "on_save"
    }
}
