use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::add_days;
use crate::model::*;
use crate::notify::{AuditAction, AuditEntry, Notification, Template};

use super::lifecycle::{format_date, reservation_vars};
use super::{Engine, EngineError};

/// Counts from one membership sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipSweep {
    pub reminders_sent: usize,
    pub deactivated: usize,
}

fn bump_window_passed(r: &Reservation, today: NaiveDate) -> bool {
    r.status == ReservationStatus::Tentative && r.bump_window_deadline.is_some_and(|d| today > d)
}

fn past_event(r: &Reservation, today: NaiveDate) -> bool {
    matches!(
        r.status,
        ReservationStatus::Approved | ReservationStatus::Tentative | ReservationStatus::Confirmed
    ) && r.event_date < today
}

impl Engine {
    async fn collect_matching(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Ulid> {
        let mut ids = Vec::new();
        for group in QuotaGroup::ALL {
            let guard = self.group(group).read().await;
            ids.extend(guard.reservations.iter().filter(|r| pred(r)).map(|r| r.id));
        }
        ids
    }

    /// Tentative reservations whose bump window closed before `today`.
    pub async fn collect_bump_candidates(&self, today: NaiveDate) -> Vec<Ulid> {
        self.collect_matching(|r| bump_window_passed(r, today)).await
    }

    /// Confirm one tentative reservation if its bump window has passed.
    /// Re-checked under the lock; returns `false` when there is nothing to do.
    pub async fn promote_reservation(&self, id: Ulid, today: NaiveDate) -> Result<bool, EngineError> {
        let system = Actor::system();
        let result = self
            .update_reservation(
                id,
                Some(Transition::Promote),
                &system,
                |r| {
                    if bump_window_passed(r, today) {
                        Ok(())
                    } else {
                        Err(EngineError::Rejected("bump window still open".into()))
                    }
                },
                |_| Ok(()),
            )
            .await;
        match result {
            Ok(_) => {
                tracing::info!("reservation {id} auto-confirmed: bump window passed");
                self.notify.record(AuditEntry::new(
                    &system.email,
                    AuditAction::ReservationApproved,
                    "Reservation",
                    id,
                    "Auto-confirmed: bump window passed",
                ));
                Ok(true)
            }
            Err(EngineError::Rejected(_) | EngineError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Promote every tentative reservation whose bump window has passed.
    /// Keeps going past individual failures and reports the first one.
    pub async fn promote_expired_bump_windows(&self, today: NaiveDate) -> Result<usize, EngineError> {
        let mut promoted = 0;
        let mut first_err = None;
        for id in self.collect_bump_candidates(today).await {
            match self.promote_reservation(id, today).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("promoting reservation {id} failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(promoted),
        }
    }

    /// Mark active reservations whose event date is before `today` completed.
    pub async fn complete_past_reservations(&self, today: NaiveDate) -> Result<usize, EngineError> {
        let system = Actor::system();
        let mut completed = 0;
        let mut first_err = None;
        for id in self.collect_matching(|r| past_event(r, today)).await {
            let result = self
                .update_reservation(
                    id,
                    Some(Transition::Complete),
                    &system,
                    |r| {
                        if past_event(r, today) {
                            Ok(())
                        } else {
                            Err(EngineError::Rejected("event not yet past".into()))
                        }
                    },
                    |_| Ok(()),
                )
                .await;
            match result {
                Ok(_) => {
                    completed += 1;
                    self.notify.record(AuditEntry::new(
                        &system.email,
                        AuditAction::ReservationCompleted,
                        "Reservation",
                        id,
                        "Event date passed",
                    ));
                }
                Err(EngineError::Rejected(_) | EngineError::InvalidTransition { .. }) => {}
                Err(e) => {
                    tracing::error!("completing reservation {id} failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        if completed > 0 {
            tracing::info!("{completed} reservations completed");
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    /// Remind households whose guest list is due tomorrow and not yet in.
    pub async fn guest_list_reminders(&self, today: NaiveDate) -> usize {
        let tomorrow = add_days(today, 1);
        let mut due = Vec::new();
        for group in QuotaGroup::ALL {
            let guard = self.group(group).read().await;
            due.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| {
                        r.status.holds_slot()
                            && r.has_guests
                            && !r.guest_list_submitted
                            && r.guest_list_deadline == Some(tomorrow)
                    })
                    .cloned(),
            );
        }

        for r in &due {
            self.notify.send(
                Notification::new(Template::GuestListReminder, &r.primary_email)
                    .vars(&reservation_vars(r, &self.primary_first_name(&r.household_id))),
            );
        }
        if !due.is_empty() {
            tracing::info!("{} guest list reminders sent", due.len());
        }
        due.len()
    }

    /// Renewal reminders ahead of expiry; deactivation once the expiration
    /// date is reached.
    pub async fn expire_memberships(&self, today: NaiveDate) -> Result<MembershipSweep, EngineError> {
        let system = Actor::system();
        let mut sweep = MembershipSweep::default();
        let mut first_err = None;

        for household in self.directory.households() {
            let Some(expires) = household.expiration_date.filter(|_| household.active) else {
                continue;
            };
            let email = self.primary_email(&household.id);
            let notice = |template| {
                email.as_ref().map(|to| {
                    Notification::new(template, to)
                        .var("FIRST_NAME", self.primary_first_name(&household.id))
                        .var("FULL_NAME", &household.name)
                        .var("MEMBERSHIP_LEVEL", &household.membership_type)
                        .var("EXPIRATION_DATE", format_date(expires))
                })
            };

            for (i, days) in self.policy.renewal_reminder_days.iter().enumerate() {
                if expires != add_days(today, *days) {
                    continue;
                }
                let template = if i == 0 {
                    Template::RenewalReminder30
                } else {
                    Template::RenewalReminder7
                };
                if let Some(n) = notice(template) {
                    self.notify.send(n);
                    sweep.reminders_sent += 1;
                }
            }

            if expires <= today {
                match self
                    .deactivate_household(household.id, &system, "Membership expired")
                    .await
                {
                    Ok(true) => {
                        sweep.deactivated += 1;
                        if let Some(n) = notice(Template::MembershipExpired) {
                            self.notify.send(n);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!("deactivating household {} failed: {e}", household.id);
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(sweep),
        }
    }
}
