use super::{BackupTrigger, TaskSlot, TriggerContext};
use chrono::{DateTime, Datelike, Days, Local, NaiveTime, TimeZone, Weekday};
use std::time::Duration;
use tracing::{debug, trace};

/// Backs up at a local time of day, optionally on a single weekday
///
/// The next firing is recomputed from the wall clock after every firing, so
/// clock adjustments and DST changes are picked up within a day.
#[derive(Debug)]
pub struct ScheduledTimeTrigger {
    time: NaiveTime,
    weekday: Option<Weekday>,
    task: TaskSlot,
}

impl ScheduledTimeTrigger {
    /// Create an inactive trigger
    pub fn new(time: NaiveTime, weekday: Option<Weekday>) -> Self {
        Self {
            time,
            weekday,
            task: TaskSlot::default(),
        }
    }

    /// Time of day
    pub fn time(&self) -> NaiveTime {
        self.time
    }

    /// Weekday restriction, if any
    pub fn weekday(&self) -> Option<Weekday> {
        self.weekday
    }
}

/// First instant strictly after `now` that falls on `time` (and `weekday`)
///
/// A local time skipped by a DST transition resolves to the same wall-clock
/// time one hour later; an ambiguous one resolves to its earlier instant.
pub fn next_occurrence<Tz: TimeZone>(
    now: &DateTime<Tz>,
    time: NaiveTime,
    weekday: Option<Weekday>,
) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    for offset in 0..=8u64 {
        let Some(date) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        if weekday.is_some_and(|w| date.weekday() != w) {
            continue;
        }
        let naive = date.and_time(time);
        let resolved = tz.from_local_datetime(&naive).earliest().or_else(|| {
            tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        });
        if let Some(candidate) = resolved {
            if candidate > *now {
                return candidate;
            }
        }
    }

    now.clone() + chrono::Duration::days(1)
}

impl BackupTrigger for ScheduledTimeTrigger {
    fn register(&self, ctx: TriggerContext) {
        let time = self.time;
        let weekday = self.weekday;
        let started = self.task.start(async move {
            let mut after = Local::now();
            loop {
                let next = next_occurrence(&after, time, weekday);
                let wait = (next.clone() - Local::now()).to_std().unwrap_or(Duration::ZERO);
                trace!("Scheduled trigger sleeping {:?} until {}", wait, next);
                tokio::time::sleep(wait).await;
                ctx.fire("scheduled_time").await;
                // Never fire twice for the same occurrence
                after = Local::now().max(next);
            }
        });
        if started {
            debug!("Scheduled trigger registered ({} {:?})", time, weekday);
        }
    }

    fn unregister(&self) {
        self.task.stop();
    }

    fn is_active(&self) -> bool {
        self.task.is_active()
    }

    fn name(&self) -> &'static str {
        "scheduled_time"
    }
}
