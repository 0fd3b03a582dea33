use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use tracing::info;

use crate::engine::{Engine, EngineError};

/// One step of the nightly batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    MembershipExpiry,
    GuestListReminders,
    BumpPromotion,
    Completion,
    JournalCompaction,
}

impl MaintenanceTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceTask::MembershipExpiry => "membership_expiry",
            MaintenanceTask::GuestListReminders => "guest_list_reminders",
            MaintenanceTask::BumpPromotion => "bump_promotion",
            MaintenanceTask::Completion => "completion",
            MaintenanceTask::JournalCompaction => "journal_compaction",
        }
    }
}

/// Run order of the nightly batch.
pub const NIGHTLY_TASKS: [MaintenanceTask; 5] = [
    MaintenanceTask::MembershipExpiry,
    MaintenanceTask::GuestListReminders,
    MaintenanceTask::BumpPromotion,
    MaintenanceTask::Completion,
    MaintenanceTask::JournalCompaction,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub date: NaiveDate,
    pub outcomes: Vec<(MaintenanceTask, TaskOutcome)>,
}

impl MaintenanceReport {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TaskOutcome::Failed(_)))
            .count()
    }

    pub fn outcome(&self, task: MaintenanceTask) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|(t, _)| *t == task).map(|(_, o)| o)
    }
}

async fn run_task(
    engine: Arc<Engine>,
    task: MaintenanceTask,
    today: NaiveDate,
    compact_threshold: u64,
) -> Result<String, EngineError> {
    match task {
        MaintenanceTask::MembershipExpiry => {
            let sweep = engine.expire_memberships(today).await?;
            Ok(format!(
                "{} reminders sent, {} households deactivated",
                sweep.reminders_sent, sweep.deactivated
            ))
        }
        MaintenanceTask::GuestListReminders => {
            let sent = engine.guest_list_reminders(today).await;
            Ok(format!("{sent} reminders sent"))
        }
        MaintenanceTask::BumpPromotion => {
            let promoted = engine.promote_expired_bump_windows(today).await?;
            Ok(format!("{promoted} reservations confirmed"))
        }
        MaintenanceTask::Completion => {
            let completed = engine.complete_past_reservations(today).await?;
            Ok(format!("{completed} reservations completed"))
        }
        MaintenanceTask::JournalCompaction => {
            let appends = engine.journal_appends_since_compact().await;
            if appends < compact_threshold {
                return Ok(format!("{appends} appends, below threshold"));
            }
            engine.compact_journal().await?;
            Ok(format!("compacted after {appends} appends"))
        }
    }
}

/// Run every nightly task for `today`. Each task runs on its own spawned
/// task so an error or panic in one does not stop the rest.
pub async fn run_nightly(
    engine: Arc<Engine>,
    today: NaiveDate,
    compact_threshold: u64,
) -> MaintenanceReport {
    let mut outcomes = Vec::with_capacity(NIGHTLY_TASKS.len());
    for task in NIGHTLY_TASKS {
        let started = Instant::now();
        let handle = tokio::spawn(run_task(engine.clone(), task, today, compact_threshold));
        let outcome = match handle.await {
            Ok(Ok(summary)) => {
                info!("nightly {}: {summary}", task.as_str());
                TaskOutcome::Done(summary)
            }
            Ok(Err(e)) => {
                tracing::error!("nightly {} failed: {e}", task.as_str());
                TaskOutcome::Failed(e.to_string())
            }
            Err(e) => {
                tracing::error!("nightly {} aborted: {e}", task.as_str());
                TaskOutcome::Failed(e.to_string())
            }
        };
        if matches!(outcome, TaskOutcome::Failed(_)) {
            metrics::counter!(
                crate::observability::MAINTENANCE_FAILURES_TOTAL,
                "task" => task.as_str()
            )
            .increment(1);
        }
        metrics::histogram!(
            crate::observability::MAINTENANCE_DURATION_SECONDS,
            "task" => task.as_str()
        )
        .record(started.elapsed().as_secs_f64());
        outcomes.push((task, outcome));
    }
    MaintenanceReport { date: today, outcomes }
}

/// Time from `now` until the next `hour:00`. An hour already passed today
/// means tomorrow.
pub fn until_next(now: NaiveDateTime, hour: u32) -> Duration {
    let time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let mut next = now.date().and_time(time);
    if next <= now {
        next += TimeDelta::days(1);
    }
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Background task that runs the nightly batch once a day at `hour` local.
pub async fn run_nightly_scheduler(engine: Arc<Engine>, hour: u32, compact_threshold: u64) {
    loop {
        tokio::time::sleep(until_next(engine.local_now(), hour)).await;
        let today = engine.local_today();
        let report = run_nightly(engine.clone(), today, compact_threshold).await;
        info!(
            "nightly maintenance for {today}: {} tasks, {} failed",
            report.outcomes.len(),
            report.failures()
        );
    }
}

/// Background task that sends the security officer's summary daily at `hour`.
pub async fn run_summary_scheduler(engine: Arc<Engine>, hour: u32) {
    loop {
        tokio::time::sleep(until_next(engine.local_now(), hour)).await;
        engine.send_daily_summary(engine.local_today()).await;
    }
}

/// Background task that compacts the journal whenever enough appends pile up
/// between nightly runs.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.journal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact_journal().await {
            tracing::error!("journal compaction failed: {e}");
        }
    }
}
