use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` in local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_hours(&self) -> f64 {
        (self.end - self.start).num_minutes() as f64 / 60.0
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Facilities ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Facility {
    #[serde(rename = "Tennis Court")]
    Tennis,
    #[serde(rename = "Leobo")]
    Leobo,
    #[serde(rename = "Whole Facility")]
    WholeFacility,
}

impl Facility {
    pub const ALL: [Facility; 3] = [Facility::Tennis, Facility::Leobo, Facility::WholeFacility];

    pub fn as_str(&self) -> &'static str {
        match self {
            Facility::Tennis => "Tennis Court",
            Facility::Leobo => "Leobo",
            Facility::WholeFacility => "Whole Facility",
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Facility::Tennis => "tennis",
            Facility::Leobo => "leobo",
            Facility::WholeFacility => "whole_facility",
        }
    }

    pub fn group(&self) -> QuotaGroup {
        match self {
            Facility::Tennis => QuotaGroup::Tennis,
            Facility::Leobo | Facility::WholeFacility => QuotaGroup::Leobo,
        }
    }
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Facility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Facility::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Invalid facility name: {s}"))
    }
}

/// Facilities that share one usage quota. Leobo and the whole facility are
/// accounted together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuotaGroup {
    Tennis,
    Leobo,
}

impl QuotaGroup {
    pub const ALL: [QuotaGroup; 2] = [QuotaGroup::Tennis, QuotaGroup::Leobo];

    pub fn facilities(&self) -> &'static [Facility] {
        match self {
            QuotaGroup::Tennis => &[Facility::Tennis],
            QuotaGroup::Leobo => &[Facility::Leobo, Facility::WholeFacility],
        }
    }
}

// ── Reservation status ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Awaiting approval.
    Pending,
    /// Approved standard reservation.
    Approved,
    /// Approved excess reservation, still open to bumping.
    Tentative,
    /// Locked in.
    Confirmed,
    Cancelled,
    /// Event date has passed.
    Completed,
    Waitlisted,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "Pending",
            ReservationStatus::Approved => "Approved",
            ReservationStatus::Tentative => "Tentative",
            ReservationStatus::Confirmed => "Confirmed",
            ReservationStatus::Cancelled => "Cancelled",
            ReservationStatus::Completed => "Completed",
            ReservationStatus::Waitlisted => "Waitlisted",
        }
    }

    /// Occupies its time slot for conflict purposes.
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending
                | ReservationStatus::Approved
                | ReservationStatus::Tentative
                | ReservationStatus::Confirmed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Completed)
    }

    /// Next status for `transition`, or `None` if the move is not allowed
    /// from the current status.
    pub fn apply(self, transition: Transition, is_excess: bool) -> Option<ReservationStatus> {
        use ReservationStatus::*;
        match (self, transition) {
            (Pending, Transition::Approve) if is_excess => Some(Tentative),
            (Pending, Transition::Approve) => Some(Confirmed),
            (Pending, Transition::Deny) => Some(Cancelled),
            (Pending | Approved | Tentative | Confirmed | Waitlisted, Transition::Cancel) => {
                Some(Cancelled)
            }
            (Tentative, Transition::Promote) => Some(Confirmed),
            (Tentative, Transition::Bump) if is_excess => Some(Cancelled),
            (Approved | Tentative | Confirmed, Transition::Complete) => Some(Completed),
            (
                Pending | Approved | Tentative | Confirmed | Cancelled | Completed | Waitlisted,
                _,
            ) => None,
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status-changing operations on an existing reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Approve,
    Deny,
    Cancel,
    Promote,
    Bump,
    Complete,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Approve => "approve",
            Transition::Deny => "deny",
            Transition::Cancel => "cancel",
            Transition::Promote => "promote",
            Transition::Bump => "bump",
            Transition::Complete => "complete",
        }
    }
}

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Member,
    Board,
    Mgt,
    System,
}

/// A caller whose identity has already been verified upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub email: String,
    pub role: Role,
    pub household_id: Option<Ulid>,
}

impl Actor {
    pub fn member(email: impl Into<String>, household_id: Ulid) -> Self {
        Self {
            email: email.into(),
            role: Role::Member,
            household_id: Some(household_id),
        }
    }

    pub fn board(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            role: Role::Board,
            household_id: None,
        }
    }

    pub fn mgt(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            role: Role::Mgt,
            household_id: None,
        }
    }

    pub fn system() -> Self {
        Self {
            email: "system".into(),
            role: Role::System,
            household_id: None,
        }
    }

    /// Board and management may approve on any facility.
    pub fn can_approve(&self) -> bool {
        matches!(self.role, Role::Board | Role::Mgt)
    }

    /// Denials are Board-only.
    pub fn can_deny(&self) -> bool {
        self.role == Role::Board
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Household {
    pub id: Ulid,
    pub name: String,
    pub membership_type: String,
    pub active: bool,
    pub expiration_date: Option<NaiveDate>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relationship {
    Primary,
    Spouse,
    Child,
    Staff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Ulid,
    pub household_id: Ulid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub relationship: Relationship,
    pub date_of_birth: Option<NaiveDate>,
    pub active: bool,
    pub last_modified: DateTime<Utc>,
}

impl Member {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn is_staff(&self) -> bool {
        self.relationship == Relationship::Staff
    }

    /// Whole years as of `today`.
    pub fn age_on(&self, today: NaiveDate) -> Option<u32> {
        self.date_of_birth.and_then(|dob| today.years_since(dob))
    }
}

/// Who decided a reservation, when, and with what note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub by: String,
    pub at: DateTime<Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub household_id: Ulid,
    pub household_name: String,
    pub primary_email: String,
    pub facility: Facility,
    pub event_date: NaiveDate,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    /// Stored as submitted; not reconciled against `end - start`.
    pub duration_hours: f64,
    pub event_name: String,
    pub status: ReservationStatus,
    pub is_excess: bool,
    pub bump_window_deadline: Option<NaiveDate>,
    pub has_guests: bool,
    pub guest_count: u32,
    pub guest_list_deadline: Option<NaiveDate>,
    pub guest_list_submitted: bool,
    pub no_fundraising_confirmed: bool,
    pub approved: Option<Decision>,
    pub denied: Option<Decision>,
    pub cancelled: Option<Decision>,
    pub bumped_by_household: Option<Ulid>,
    pub bumped_date: Option<NaiveDate>,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    pub last_modified_by: String,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// All reservations of one quota group, sorted by `start`.
#[derive(Debug, Clone)]
pub struct GroupState {
    pub group: QuotaGroup,
    pub reservations: Vec<Reservation>,
}

impl GroupState {
    pub fn new(group: QuotaGroup) -> Self {
        Self {
            group,
            reservations: Vec::new(),
        }
    }

    /// Insert or replace by id, keeping sort order by `start`.
    pub fn upsert(&mut self, reservation: Reservation) {
        if let Some(pos) = self.reservations.iter().position(|r| r.id == reservation.id) {
            if self.reservations[pos].start == reservation.start {
                self.reservations[pos] = reservation;
                return;
            }
            self.reservations.remove(pos);
        }
        let pos = self
            .reservations
            .partition_point(|r| r.start <= reservation.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| &r.id == id)
    }

    /// Reservations whose span overlaps the query window, any status.
    /// Everything at index >= right_bound starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self.reservations.partition_point(|r| r.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.end > query.start)
    }
}

/// Journal record format. Every write is a whole-record save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    HouseholdSaved { household: Household },
    MemberSaved { member: Member },
    ReservationSaved { reservation: Reservation },
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 4).unwrap()
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(at(day(), 9, 0), at(day(), 10, 0));
        let b = Span::new(at(day(), 9, 30), at(day(), 11, 0));
        let c = Span::new(at(day(), 10, 0), at(day(), 11, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_duration_in_hours() {
        let s = Span::new(at(day(), 9, 0), at(day(), 10, 30));
        assert_eq!(s.duration_hours(), 1.5);
    }

    #[test]
    fn facility_parse_and_group() {
        assert_eq!("Tennis Court".parse::<Facility>(), Ok(Facility::Tennis));
        assert_eq!("whole facility".parse::<Facility>(), Ok(Facility::WholeFacility));
        assert!("Swimming Pool".parse::<Facility>().is_err());
        assert_eq!(Facility::Leobo.group(), Facility::WholeFacility.group());
        assert_ne!(Facility::Tennis.group(), Facility::Leobo.group());
    }

    #[test]
    fn approve_depends_on_excess() {
        use ReservationStatus::*;
        assert_eq!(Pending.apply(Transition::Approve, false), Some(Confirmed));
        assert_eq!(Pending.apply(Transition::Approve, true), Some(Tentative));
        assert_eq!(Confirmed.apply(Transition::Approve, false), None);
        assert_eq!(Tentative.apply(Transition::Approve, true), None);
    }

    #[test]
    fn terminal_states_reject_everything() {
        use ReservationStatus::*;
        for t in [
            Transition::Approve,
            Transition::Deny,
            Transition::Cancel,
            Transition::Promote,
            Transition::Bump,
            Transition::Complete,
        ] {
            assert_eq!(Cancelled.apply(t, true), None);
            assert_eq!(Completed.apply(t, true), None);
        }
    }

    #[test]
    fn bump_only_for_tentative_excess() {
        use ReservationStatus::*;
        assert_eq!(Tentative.apply(Transition::Bump, true), Some(Cancelled));
        assert_eq!(Tentative.apply(Transition::Bump, false), None);
        assert_eq!(Confirmed.apply(Transition::Bump, true), None);
    }

    #[test]
    fn mgt_approves_but_only_board_denies() {
        let mgt = Actor::mgt("mgt@example.org");
        let board = Actor::board("b@example.org");
        let member = Actor::member("m@example.org", Ulid::new());
        assert!(mgt.can_approve());
        assert!(!mgt.can_deny());
        assert!(board.can_approve());
        assert!(board.can_deny());
        assert!(!member.can_approve());
        assert!(!member.can_deny());
        assert!(!Actor::system().can_approve());
    }

    #[test]
    fn group_state_keeps_start_order() {
        let hh = Ulid::new();
        let mut gs = GroupState::new(QuotaGroup::Tennis);
        gs.upsert(reservation(hh, Facility::Tennis, day(), 14, 15, ReservationStatus::Confirmed));
        gs.upsert(reservation(hh, Facility::Tennis, day(), 8, 9, ReservationStatus::Confirmed));
        gs.upsert(reservation(hh, Facility::Tennis, day(), 11, 12, ReservationStatus::Pending));
        let hours: Vec<_> = gs.reservations.iter().map(|r| r.start).collect();
        assert_eq!(hours, vec![at(day(), 8, 0), at(day(), 11, 0), at(day(), 14, 0)]);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let hh = Ulid::new();
        let mut gs = GroupState::new(QuotaGroup::Tennis);
        let mut r = reservation(hh, Facility::Tennis, day(), 8, 9, ReservationStatus::Pending);
        gs.upsert(r.clone());
        r.status = ReservationStatus::Confirmed;
        gs.upsert(r.clone());
        assert_eq!(gs.reservations.len(), 1);
        assert_eq!(gs.get(&r.id).unwrap().status, ReservationStatus::Confirmed);
    }

    #[test]
    fn overlapping_skips_adjacent_and_distant() {
        let hh = Ulid::new();
        let mut gs = GroupState::new(QuotaGroup::Tennis);
        gs.upsert(reservation(hh, Facility::Tennis, day(), 8, 9, ReservationStatus::Confirmed));
        gs.upsert(reservation(hh, Facility::Tennis, day(), 9, 11, ReservationStatus::Confirmed));
        gs.upsert(reservation(hh, Facility::Tennis, day(), 12, 13, ReservationStatus::Confirmed));

        let query = Span::new(at(day(), 10, 0), at(day(), 12, 0));
        let hits: Vec<_> = gs.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, at(day(), 9, 0));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let r = reservation(
            Ulid::new(),
            Facility::Leobo,
            day(),
            18,
            22,
            ReservationStatus::Pending,
        );
        let event = Event::ReservationSaved { reservation: r };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
