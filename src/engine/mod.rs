mod conflict;
mod directory;
mod error;
mod lifecycle;
mod nightly;
mod policy;
mod queries;
mod records;
mod usage;
#[cfg(test)]
mod tests;

pub use conflict::find_conflict;
pub use directory::Directory;
pub use error::{EngineError, ErrorKind, CONFLICT_MESSAGE, PERSISTENCE_MESSAGE};
pub use lifecycle::{BookingOutcome, BookingRequest};
pub use nightly::MembershipSweep;
pub use policy::{check_limits, LimitCheck};
pub use queries::{DailySummary, SummaryEntry};
pub use usage::{UsageWindow, USAGE_STATUSES};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, NaiveDateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::calendar::HolidayCalendar;
use crate::config::{BookingPolicy, Contacts, EngineOptions};
use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedGroupState = Arc<RwLock<GroupState>>;

// ── Group-commit journal channel ─────────────────────────────

pub(super) enum JournalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. Single flush_sync for the whole batch, discarding it on failure.
/// 5. Respond to every sender with the batch result.
async fn journal_writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            JournalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(JournalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut journal, &batch);
                metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("journal flush failed for {} records: {e}", batch.len());
                }
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut journal, other);
                }
            }
            other => handle_non_append(&mut journal, other),
        }
    }
}

fn flush_batch(
    journal: &mut Journal,
    batch: &[(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| journal.append_buffered(event))
        .and_then(|()| journal.flush_sync());
    if result.is_err() {
        // Every caller in the batch is told the write failed, so none of it
        // may surface on a later flush or on replay.
        if let Err(e) = journal.discard_pending() {
            tracing::error!("journal rollback failed: {e}");
        }
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let result = Journal::write_snapshot(journal.path(), &events)
                .and_then(|()| journal.swap_snapshot());
            let _ = response.send(result);
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { event, response } => {
            let batch = vec![(event, response)];
            let result = flush_batch(journal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// The booking store: reservations partitioned by quota group, each group
/// behind its own lock, plus the household/member directory.
///
/// Every check-then-write on reservations happens under the write lock of
/// the reservation's quota group, so the conflict check and usage count a
/// booking decision is based on cannot change before the decision is
/// persisted.
pub struct Engine {
    tennis: SharedGroupState,
    leobo: SharedGroupState,
    pub(super) journal_tx: mpsc::Sender<JournalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → quota group.
    pub(super) reservation_groups: DashMap<Ulid, QuotaGroup>,
    pub(super) directory: Directory,
    /// Serializes directory writes against compaction snapshots.
    pub(super) directory_lock: Mutex<()>,
    pub(super) policy: BookingPolicy,
    pub(super) contacts: Contacts,
    pub(super) utc_offset: FixedOffset,
    holidays: RwLock<Arc<HolidayCalendar>>,
}

/// Apply a reservation save to its group (caller holds the lock).
fn apply_reservation(
    gs: &mut GroupState,
    reservation: Reservation,
    index: &DashMap<Ulid, QuotaGroup>,
) {
    index.insert(reservation.id, gs.group);
    gs.upsert(reservation);
}

impl Engine {
    pub fn new(
        journal_path: PathBuf,
        notify: Arc<NotifyHub>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let events = Journal::replay(&journal_path)?;
        let journal = Journal::open(&journal_path)?;
        let (journal_tx, journal_rx) = mpsc::channel(4096);
        tokio::spawn(journal_writer_loop(journal, journal_rx));

        let directory = Directory::new();
        let reservation_groups = DashMap::new();
        let mut tennis = GroupState::new(QuotaGroup::Tennis);
        let mut leobo = GroupState::new(QuotaGroup::Leobo);

        let replayed = events.len();
        for event in events {
            match event {
                Event::ReservationSaved { reservation } => {
                    let gs = match reservation.facility.group() {
                        QuotaGroup::Tennis => &mut tennis,
                        QuotaGroup::Leobo => &mut leobo,
                    };
                    apply_reservation(gs, reservation, &reservation_groups);
                }
                other => directory.apply(&other),
            }
        }
        tracing::info!(
            "journal replayed: {replayed} events, {} households, {} reservations",
            directory.household_count(),
            reservation_groups.len()
        );

        Ok(Self {
            tennis: Arc::new(RwLock::new(tennis)),
            leobo: Arc::new(RwLock::new(leobo)),
            journal_tx,
            notify,
            reservation_groups,
            directory,
            directory_lock: Mutex::new(()),
            policy: options.policy,
            contacts: options.contacts,
            utc_offset: options.utc_offset,
            holidays: RwLock::new(Arc::new(options.holidays)),
        })
    }

    /// Write an event to the journal via the background group-commit writer.
    pub(super) async fn journal_append(&self, event: Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Append {
                event,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    /// Journal a reservation save, then apply it. Nothing is applied if the
    /// journal write fails.
    pub(super) async fn persist_and_apply(
        &self,
        gs: &mut GroupState,
        reservation: Reservation,
    ) -> Result<(), EngineError> {
        self.journal_append(Event::ReservationSaved {
            reservation: reservation.clone(),
        })
        .await?;
        apply_reservation(gs, reservation, &self.reservation_groups);
        Ok(())
    }

    pub fn group(&self, group: QuotaGroup) -> &SharedGroupState {
        match group {
            QuotaGroup::Tennis => &self.tennis,
            QuotaGroup::Leobo => &self.leobo,
        }
    }

    pub fn group_for_reservation(&self, id: &Ulid) -> Option<QuotaGroup> {
        self.reservation_groups.get(id).map(|e| *e.value())
    }

    /// Lookup reservation → group, acquire that group's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<GroupState>, EngineError> {
        let group = self
            .group_for_reservation(id)
            .ok_or(EngineError::NotFound(*id))?;
        Ok(self.group(group).clone().write_owned().await)
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn contacts(&self) -> &Contacts {
        &self.contacts
    }

    pub async fn holidays(&self) -> Arc<HolidayCalendar> {
        self.holidays.read().await.clone()
    }

    /// Swap in a new holiday calendar. Deadlines already stored on
    /// reservations are not recomputed.
    pub async fn replace_holidays(&self, calendar: HolidayCalendar) {
        let count = calendar.len();
        *self.holidays.write().await = Arc::new(calendar);
        tracing::info!("holiday calendar replaced: {count} active holidays");
    }

    /// Wall-clock time in the association's time zone.
    pub fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.utc_offset).naive_local()
    }

    pub fn local_today(&self) -> NaiveDate {
        self.local_now().date()
    }

    /// Rewrite the journal with one whole-record save per live entity.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        // Hold every write path off until the snapshot has replaced the file.
        let _directory = self.directory_lock.lock().await;
        let tennis = self.tennis.read().await;
        let leobo = self.leobo.read().await;

        let mut events: Vec<Event> = self
            .directory
            .households()
            .into_iter()
            .map(|household| Event::HouseholdSaved { household })
            .collect();
        events.extend(
            self.directory
                .members()
                .into_iter()
                .map(|member| Event::MemberSaved { member }),
        );
        for gs in [&*tennis, &*leobo] {
            events.extend(gs.reservations.iter().map(|r| Event::ReservationSaved {
                reservation: r.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.journal_tx
            .send(JournalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))?;
        tracing::info!("journal compacted to {count} records");
        Ok(())
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .journal_tx
            .send(JournalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
