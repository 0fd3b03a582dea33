use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use ulid::Ulid;

use crate::calendar::{add_days, week_start};
use crate::limits::*;
use crate::model::*;
use crate::notify::{AuditAction, AuditEntry, Notification, Template};

use super::conflict::{find_conflict, validate_span};
use super::policy::{check_limits, LimitCheck};
use super::{Engine, EngineError};

/// A member's request to book a facility. Identity has been verified
/// upstream; everything else is checked here.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingRequest {
    pub household_id: Ulid,
    pub facility: Facility,
    pub event_date: NaiveDate,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Taken as given; not derived from `end - start`.
    pub duration_hours: f64,
    pub event_name: String,
    pub has_guests: bool,
    pub guest_count: u32,
    pub no_fundraising_confirmed: bool,
}

impl BookingRequest {
    /// Parse a facility name as submitted by a client.
    pub fn parse_facility(name: &str) -> Result<Facility, EngineError> {
        name.parse().map_err(EngineError::Validation)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookingOutcome {
    pub reservation: Reservation,
    pub limits: LimitCheck,
}

pub(super) fn format_date(date: NaiveDate) -> String {
    date.format("%-d %B %Y").to_string()
}

pub(super) fn format_time(time: NaiveDateTime) -> String {
    time.format("%H:%M").to_string()
}

/// Template variables every reservation email shares.
pub(super) fn reservation_vars(r: &Reservation, first_name: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    let mut put = |k: &str, v: String| {
        vars.insert(k.to_string(), v);
    };
    put("FIRST_NAME", first_name.to_string());
    put("FACILITY", r.facility.to_string());
    put("RESERVATION_DATE", format_date(r.event_date));
    put("START_TIME", format_time(r.start));
    put("END_TIME", format_time(r.end));
    put("EVENT_NAME", r.event_name.clone());
    put("RESERVATION_ID", r.id.to_string());
    put("IF_GUESTS", if r.has_guests { "true" } else { "" }.to_string());
    put("GUEST_COUNT", r.guest_count.to_string());
    put(
        "GUEST_LIST_DEADLINE",
        r.guest_list_deadline.map(format_date).unwrap_or_default(),
    );
    vars
}

/// Whether a guest list with this deadline may still be submitted at `now`.
pub(super) fn guest_list_open(deadline: NaiveDate, cutoff_hour: u32, now: NaiveDateTime) -> bool {
    let cutoff = NaiveTime::from_hms_opt(cutoff_hour, 0, 0).unwrap_or(NaiveTime::MIN);
    now <= deadline.and_time(cutoff)
}

fn check_note(note: Option<&str>) -> Result<Option<String>, EngineError> {
    match note.map(str::trim) {
        Some(n) if n.len() > MAX_NOTE_LEN => Err(EngineError::LimitExceeded("note too long")),
        Some("") | None => Ok(None),
        Some(n) => Ok(Some(n.to_string())),
    }
}

fn require_right(
    allowed: bool,
    actor: &Actor,
    r: &Reservation,
    verb: &str,
) -> Result<(), EngineError> {
    if allowed {
        return Ok(());
    }
    Err(EngineError::Unauthorized(format!(
        "{} may not {verb} {} reservations",
        actor.email, r.facility
    )))
}

fn require_owner_or_committee(actor: &Actor, r: &Reservation) -> Result<(), EngineError> {
    match actor.role {
        Role::Board | Role::Mgt => Ok(()),
        Role::Member if actor.household_id == Some(r.household_id) => Ok(()),
        Role::Member | Role::System => Err(EngineError::Unauthorized(format!(
            "{} does not own reservation {}",
            actor.email, r.id
        ))),
    }
}

impl Engine {
    // ── Creation ─────────────────────────────────────────────

    /// Validate, check conflict and quota, and store a new reservation.
    ///
    /// Excess bookings succeed with `Pending` status; hard caps and slot
    /// clashes are rejected and nothing is stored.
    pub async fn create_reservation(
        &self,
        request: BookingRequest,
        actor: &Actor,
    ) -> Result<BookingOutcome, EngineError> {
        let facility = request.facility;
        match self.try_create(request, actor).await {
            Ok(outcome) => {
                let r = &outcome.reservation;
                metrics::counter!(
                    crate::observability::RESERVATIONS_CREATED_TOTAL,
                    "facility" => facility.label(),
                    "status" => r.status.as_str(),
                    "excess" => if r.is_excess { "true" } else { "false" }
                )
                .increment(1);
                tracing::info!(
                    "reservation {} created: {} on {} for household {} ({}{})",
                    r.id,
                    r.facility,
                    r.event_date,
                    r.household_id,
                    r.status,
                    if r.is_excess { ", excess" } else { "" }
                );
                self.notify.record(AuditEntry::new(
                    &actor.email,
                    AuditAction::ReservationCreated,
                    "Reservation",
                    r.id,
                    format!("{} on {}", r.facility, format_date(r.event_date)),
                ));
                self.send_creation_notices(&outcome);
                Ok(outcome)
            }
            Err(e) => {
                metrics::counter!(
                    crate::observability::RESERVATIONS_REJECTED_TOTAL,
                    "reason" => e.label()
                )
                .increment(1);
                match &e {
                    EngineError::JournalError(detail) => {
                        tracing::error!("reservation on {facility} not saved: {detail}")
                    }
                    other => tracing::debug!("reservation on {facility} rejected: {other}"),
                }
                Err(e)
            }
        }
    }

    async fn try_create(
        &self,
        request: BookingRequest,
        actor: &Actor,
    ) -> Result<BookingOutcome, EngineError> {
        let span = self.validate_request(&request)?;
        let household = self.authorize_booking(&request, actor)?;

        let holidays = self.holidays().await;
        let bump_window_deadline = |is_excess: bool| {
            is_excess.then(|| match request.facility.group() {
                QuotaGroup::Tennis => add_days(
                    request.event_date,
                    -i64::from(self.policy.tennis_bump_window_days),
                ),
                QuotaGroup::Leobo => holidays
                    .business_day_deadline(request.event_date, self.policy.leobo_bump_window_days),
            })
        };
        let guest_list_deadline = request.has_guests.then(|| {
            holidays.business_day_deadline(request.event_date, self.policy.guest_list_deadline_days)
        });

        let mut guard = self.group(request.facility.group()).write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_GROUP {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }
        if find_conflict(&guard, request.facility, &span).is_some() {
            return Err(EngineError::Conflict(request.facility));
        }
        let limits = check_limits(
            &self.policy,
            &guard,
            request.household_id,
            request.facility,
            request.event_date,
            request.duration_hours,
        );
        if !limits.allowed {
            return Err(EngineError::Rejected(limits.reason));
        }

        let status = if self.policy.requires_approval(request.facility) || limits.is_excess {
            ReservationStatus::Pending
        } else {
            ReservationStatus::Confirmed
        };
        let now = Utc::now();
        let reservation = Reservation {
            id: Ulid::new(),
            household_id: household.id,
            household_name: household.name.clone(),
            primary_email: self
                .primary_email(&household.id)
                .unwrap_or_else(|| actor.email.clone()),
            facility: request.facility,
            event_date: request.event_date,
            start: request.start,
            end: request.end,
            duration_hours: request.duration_hours,
            event_name: request.event_name.trim().to_string(),
            status,
            is_excess: limits.is_excess,
            bump_window_deadline: bump_window_deadline(limits.is_excess),
            has_guests: request.has_guests,
            guest_count: request.guest_count,
            guest_list_deadline,
            guest_list_submitted: false,
            no_fundraising_confirmed: request.no_fundraising_confirmed,
            approved: None,
            denied: None,
            cancelled: None,
            bumped_by_household: None,
            bumped_date: None,
            created_date: now,
            last_modified_date: now,
            last_modified_by: actor.email.clone(),
        };
        self.persist_and_apply(&mut guard, reservation.clone()).await?;
        Ok(BookingOutcome { reservation, limits })
    }

    fn validate_request(&self, request: &BookingRequest) -> Result<Span, EngineError> {
        let name = request.event_name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("Missing required field: event_name".into()));
        }
        if name.len() > MAX_EVENT_NAME_LEN {
            return Err(EngineError::LimitExceeded("event name too long"));
        }
        let span = validate_span(request.start, request.end)?;
        if request.start.date() != request.event_date {
            return Err(EngineError::Validation(
                "Start time must fall on the event date.".into(),
            ));
        }
        if !request.duration_hours.is_finite() || request.duration_hours <= 0.0 {
            return Err(EngineError::Validation("Duration must be a positive number of hours.".into()));
        }
        if request.duration_hours > MAX_DURATION_HOURS {
            return Err(EngineError::LimitExceeded("duration too long"));
        }
        let today = self.local_today();
        if request.event_date <= today {
            return Err(EngineError::Validation(
                "Event date must be after today.".into(),
            ));
        }
        if request.event_date > add_days(today, MAX_BOOKING_HORIZON_DAYS) {
            return Err(EngineError::LimitExceeded("event date too far ahead"));
        }
        if request.guest_count > MAX_GUEST_COUNT {
            return Err(EngineError::LimitExceeded("too many guests"));
        }
        if !request.has_guests && request.guest_count > 0 {
            return Err(EngineError::Validation(
                "Guest count given for a reservation without guests.".into(),
            ));
        }
        Ok(span)
    }

    /// The household being booked for, if `actor` may book for it.
    fn authorize_booking(
        &self,
        request: &BookingRequest,
        actor: &Actor,
    ) -> Result<Household, EngineError> {
        let household = self
            .directory
            .household(&request.household_id)
            .ok_or(EngineError::NotFound(request.household_id))?;
        if !household.active {
            return Err(EngineError::Validation(
                "Your GEA membership is not active. Please renew your membership to make reservations."
                    .into(),
            ));
        }
        match actor.role {
            Role::Board | Role::Mgt => Ok(household),
            Role::System => Err(EngineError::Unauthorized("system cannot book facilities".into())),
            Role::Member => {
                let member = self.directory.member_by_email(&actor.email).ok_or_else(|| {
                    EngineError::Unauthorized(format!("{} is not a registered member", actor.email))
                })?;
                if member.household_id != household.id || actor.household_id != Some(household.id) {
                    return Err(EngineError::Unauthorized(format!(
                        "{} cannot book for household {}",
                        actor.email, household.id
                    )));
                }
                if member.is_staff() {
                    return Err(EngineError::Unauthorized(
                        "Household staff cannot make facility reservations.".into(),
                    ));
                }
                if !member.active {
                    return Err(EngineError::Unauthorized(format!("{} is not active", actor.email)));
                }
                Ok(household)
            }
        }
    }

    fn send_creation_notices(&self, outcome: &BookingOutcome) {
        let r = &outcome.reservation;
        let limits = &outcome.limits;
        let household = self.directory.household(&r.household_id);
        let mut base = reservation_vars(r, &self.primary_first_name(&r.household_id));
        base.insert("FULL_NAME".into(), r.household_name.clone());
        base.insert("MEMBER_EMAIL".into(), r.primary_email.clone());
        base.insert("SUBMISSION_TIMESTAMP".into(), format_date(r.created_date.date_naive()));

        if r.status == ReservationStatus::Confirmed {
            self.notify
                .send(Notification::new(Template::ReservationConfirmed, &r.primary_email).vars(&base));
            return;
        }

        let leobo = r.facility.group() == QuotaGroup::Leobo;
        let approval_reason = if r.is_excess {
            "your household has exceeded the booking limit"
        } else {
            "board and Management Officer approval"
        };
        self.notify.send(
            Notification::new(Template::ReservationReceived, &r.primary_email)
                .vars(&base)
                .var("APPROVAL_REASON", approval_reason)
                .flag("IF_LEOBO", leobo),
        );

        let (template, recipient) = match (r.facility.group(), r.is_excess) {
            (QuotaGroup::Tennis, true) => (Template::TennisExcessReview, &self.contacts.board),
            (QuotaGroup::Tennis, false) => (Template::ApprovalRequest, &self.contacts.board),
            (QuotaGroup::Leobo, true) => (Template::LeoboExcessReview, &self.contacts.mgt),
            (QuotaGroup::Leobo, false) => (Template::LeoboApprovalRequest, &self.contacts.mgt),
        };
        self.notify.send(
            Notification::new(template, recipient)
                .vars(&base)
                .var(
                    "MEMBERSHIP_LEVEL",
                    household.as_ref().map(|h| h.membership_type.as_str()).unwrap_or_default(),
                )
                .var(
                    "MEMBERSHIP_STATUS",
                    if household.as_ref().is_some_and(|h| h.active) { "Active" } else { "Inactive" },
                )
                .var("HOUSEHOLD_NAME", &r.household_name)
                .var("LEOBO_USAGE", limits.count_used.unwrap_or(0))
                .var("LEOBO_MONTHLY_LIMIT", self.policy.leobo_monthly_limit)
                .var("HOURS_USED", limits.hours_used)
                .var("TENNIS_WEEKLY_LIMIT_HOURS", self.policy.tennis_weekly_limit_hours)
                .var("LEOBO_MAX_HOURS", self.policy.leobo_max_hours)
                .var(
                    "BUMP_DEADLINE",
                    r.bump_window_deadline.map(format_date).unwrap_or_default(),
                ),
        );

        if !r.is_excess {
            return;
        }
        let notice = if leobo {
            Notification::new(Template::LeoboLimitReached, &r.primary_email)
                .vars(&base)
                .var("CURRENT_MONTH", r.event_date.format("%B"))
                .var("LEOBO_USAGE", limits.count_used.unwrap_or(0))
                .var("LEOBO_MAX_HOURS", self.policy.leobo_max_hours)
                .var("LEOBO_BUMP_WINDOW_DAYS", self.policy.leobo_bump_window_days)
        } else {
            let monday = week_start(r.event_date);
            Notification::new(Template::TennisLimitReached, &r.primary_email)
                .vars(&base)
                .var("WEEK_START", format_date(monday))
                .var("WEEK_END", format_date(add_days(monday, 6)))
                .var("TENNIS_BUMP_WINDOW_DAYS", self.policy.tennis_bump_window_days)
        };
        self.notify.send(notice);
    }

    // ── Status transitions ───────────────────────────────────

    /// Load, authorize, move through `transition` (if any), edit, stamp and
    /// persist one reservation under its group's write lock.
    pub(super) async fn update_reservation(
        &self,
        id: Ulid,
        transition: Option<Transition>,
        actor: &Actor,
        authorize: impl FnOnce(&Reservation) -> Result<(), EngineError>,
        edit: impl FnOnce(&mut Reservation) -> Result<(), EngineError>,
    ) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let mut updated = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        authorize(&updated)?;
        if let Some(transition) = transition {
            updated.status = updated
                .status
                .apply(transition, updated.is_excess)
                .ok_or(EngineError::InvalidTransition {
                    id,
                    status: updated.status,
                    transition,
                })?;
        }
        edit(&mut updated)?;
        updated.last_modified_date = Utc::now();
        updated.last_modified_by = actor.email.clone();
        self.persist_and_apply(&mut guard, updated.clone()).await?;
        drop(guard);

        if let Some(transition) = transition {
            metrics::counter!(
                crate::observability::TRANSITIONS_TOTAL,
                "transition" => transition.as_str()
            )
            .increment(1);
        }
        Ok(updated)
    }

    /// `Pending → Confirmed`, or `Pending → Tentative` for excess bookings.
    pub async fn approve_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        notes: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let note = check_note(notes)?;
        let r = self
            .update_reservation(
                id,
                Some(Transition::Approve),
                actor,
                |r| require_right(actor.can_approve(), actor, r, "approve"),
                |r| {
                    r.approved = Some(Decision {
                        by: actor.email.clone(),
                        at: Utc::now(),
                        note,
                    });
                    Ok(())
                },
            )
            .await?;

        tracing::info!("reservation {id} approved by {} -> {}", actor.email, r.status);
        self.notify.record(AuditEntry::new(
            &actor.email,
            AuditAction::ReservationApproved,
            "Reservation",
            id,
            format!("Approved → {}", r.status),
        ));
        if let Some(email) = self.primary_email(&r.household_id) {
            let pending_list = r.has_guests && !r.guest_list_submitted;
            self.notify.send(
                Notification::new(Template::ReservationApproved, email)
                    .vars(&reservation_vars(&r, &self.primary_first_name(&r.household_id)))
                    .var("APPROVED_BY", &actor.email)
                    .flag("IF_GUEST_LIST_SUBMITTED", r.guest_list_submitted)
                    .flag("IF_GUEST_LIST_PENDING", pending_list),
            );
        }
        Ok(r)
    }

    /// `Pending → Cancelled` with a reason.
    pub async fn deny_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        reason: &str,
    ) -> Result<Reservation, EngineError> {
        let note = check_note(Some(reason))?;
        let r = self
            .update_reservation(
                id,
                Some(Transition::Deny),
                actor,
                |r| require_right(actor.can_deny(), actor, r, "deny"),
                |r| {
                    r.denied = Some(Decision {
                        by: actor.email.clone(),
                        at: Utc::now(),
                        note: note.clone(),
                    });
                    Ok(())
                },
            )
            .await?;

        tracing::info!("reservation {id} denied by {}", actor.email);
        self.notify.record(AuditEntry::new(
            &actor.email,
            AuditAction::ReservationDenied,
            "Reservation",
            id,
            format!("Denied: {}", note.as_deref().unwrap_or("")),
        ));
        if let Some(email) = self.primary_email(&r.household_id) {
            self.notify.send(
                Notification::new(Template::ReservationDenied, email)
                    .vars(&reservation_vars(&r, &self.primary_first_name(&r.household_id)))
                    .var("DENIAL_REASON", note.as_deref().unwrap_or("No reason provided")),
            );
        }
        Ok(r)
    }

    /// Any non-terminal status → `Cancelled`. The owning household or the
    /// committee may cancel.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let note = check_note(reason)?;
        let r = self
            .update_reservation(
                id,
                Some(Transition::Cancel),
                actor,
                |r| require_owner_or_committee(actor, r),
                |r| {
                    r.cancelled = Some(Decision {
                        by: actor.email.clone(),
                        at: Utc::now(),
                        note: note.clone(),
                    });
                    Ok(())
                },
            )
            .await?;

        tracing::info!("reservation {id} cancelled by {}", actor.email);
        self.notify.record(AuditEntry::new(
            &actor.email,
            AuditAction::ReservationCancelled,
            "Reservation",
            id,
            format!("Cancelled: {}", note.as_deref().unwrap_or("no reason given")),
        ));
        if let Some(email) = self.primary_email(&r.household_id) {
            self.notify.send(
                Notification::new(Template::ReservationCancelled, email)
                    .vars(&reservation_vars(&r, &self.primary_first_name(&r.household_id)))
                    .var("CANCELLED_BY", &actor.email)
                    .flag("IF_REASON", note.is_some())
                    .var("CANCELLATION_REASON", note.as_deref().unwrap_or(""))
                    .flag("IF_BOARD_CANCELLED", actor.role != Role::Member),
            );
        }
        Ok(r)
    }

    /// Displace a `Tentative` excess reservation in favour of another
    /// household while its bump window is open.
    pub async fn bump_reservation(
        &self,
        id: Ulid,
        bumping_household: Ulid,
        actor: &Actor,
    ) -> Result<Reservation, EngineError> {
        let bumper = self
            .directory
            .household(&bumping_household)
            .ok_or(EngineError::NotFound(bumping_household))?;
        let today = self.local_today();
        let r = self
            .update_reservation(
                id,
                Some(Transition::Bump),
                actor,
                |r| {
                    require_right(actor.can_approve(), actor, r, "bump")?;
                    if r.household_id == bumping_household {
                        return Err(EngineError::Validation(
                            "A household cannot bump its own reservation.".into(),
                        ));
                    }
                    let window_open = r.bump_window_deadline.is_some_and(|d| today <= d);
                    if !window_open {
                        return Err(EngineError::InvalidTransition {
                            id,
                            status: r.status,
                            transition: Transition::Bump,
                        });
                    }
                    Ok(())
                },
                |r| {
                    r.bumped_by_household = Some(bumping_household);
                    r.bumped_date = Some(today);
                    r.cancelled = Some(Decision {
                        by: actor.email.clone(),
                        at: Utc::now(),
                        note: Some(format!("Bumped by {}", bumper.name)),
                    });
                    Ok(())
                },
            )
            .await?;

        tracing::info!("reservation {id} bumped by household {bumping_household}");
        self.notify.record(AuditEntry::new(
            &actor.email,
            AuditAction::ReservationBumped,
            "Reservation",
            id,
            format!("Bumped by household {}", bumper.name),
        ));
        if let Some(email) = self.primary_email(&r.household_id) {
            self.notify.send(
                Notification::new(Template::ReservationBumped, email)
                    .vars(&reservation_vars(&r, &self.primary_first_name(&r.household_id)))
                    .var("BUMPED_BY", &bumper.name),
            );
        }
        Ok(r)
    }

    // ── Guest lists ──────────────────────────────────────────

    /// Whether a guest list for an event on `event_date` is still on time at
    /// `now` (local time).
    pub async fn is_guest_list_deadline_met(&self, event_date: NaiveDate, now: NaiveDateTime) -> bool {
        let deadline = self
            .holidays()
            .await
            .business_day_deadline(event_date, self.policy.guest_list_deadline_days);
        guest_list_open(deadline, self.policy.guest_list_cutoff_hour, now)
    }

    /// Mark the guest list of an active reservation as submitted.
    pub async fn submit_guest_list(&self, id: Ulid, actor: &Actor) -> Result<Reservation, EngineError> {
        let now = self.local_now();
        let cutoff_hour = self.policy.guest_list_cutoff_hour;
        let late = EngineError::Rejected(format!(
            "Guest lists must be submitted at least {} business days before your event. \
             Please contact {} for assistance.",
            self.policy.guest_list_deadline_days, self.contacts.board
        ));
        let r = self
            .update_reservation(
                id,
                None,
                actor,
                |r| require_owner_or_committee(actor, r),
                |r| {
                    if !r.status.holds_slot() {
                        return Err(EngineError::Validation(format!(
                            "Reservation is {}; guest lists are only accepted for active reservations.",
                            r.status
                        )));
                    }
                    if !r.has_guests {
                        return Err(EngineError::Validation(
                            "This reservation has no guests.".into(),
                        ));
                    }
                    let on_time = r
                        .guest_list_deadline
                        .is_some_and(|d| guest_list_open(d, cutoff_hour, now));
                    if !on_time {
                        return Err(late);
                    }
                    r.guest_list_submitted = true;
                    Ok(())
                },
            )
            .await?;

        tracing::info!("guest list submitted for reservation {id}");
        self.notify.record(AuditEntry::new(
            &actor.email,
            AuditAction::GuestListSubmitted,
            "Reservation",
            id,
            format!("{} guests", r.guest_count),
        ));
        Ok(r)
    }
}
