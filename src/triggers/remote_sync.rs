use super::{BackupTrigger, TaskSlot, TriggerContext};
use crate::remote::RemoteSync;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Polls a remote repository and syncs the file
///
/// Unlike the other triggers this one does not call the backup callback: the
/// sync takes its own safety backup before overwriting. Network failures are
/// logged and retried on the next poll.
#[derive(Debug)]
pub struct RemoteSyncTrigger {
    sync: Arc<RemoteSync>,
    task: TaskSlot,
}

impl RemoteSyncTrigger {
    /// Create an inactive trigger polling at the sync's configured interval
    pub fn new(sync: Arc<RemoteSync>) -> Self {
        Self {
            sync,
            task: TaskSlot::default(),
        }
    }

    /// Sync driven by this trigger
    pub fn sync(&self) -> &Arc<RemoteSync> {
        &self.sync
    }
}

impl BackupTrigger for RemoteSyncTrigger {
    fn register(&self, _ctx: TriggerContext) {
        let sync = self.sync.clone();
        let period = sync.config().polling_interval;
        let started = self.task.start(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let cancel = CancellationToken::new();
            loop {
                ticks.tick().await;
                if let Err(e) = sync.check_and_sync(&cancel).await {
                    warn!("Remote sync of {:?} failed: {}", sync.path(), e);
                }
            }
        });
        if started {
            debug!("Remote sync trigger registered (every {:?})", period);
        }
    }

    fn unregister(&self) {
        self.task.stop();
    }

    fn is_active(&self) -> bool {
        self.task.is_active()
    }

    fn name(&self) -> &'static str {
        "remote_sync"
    }
}
