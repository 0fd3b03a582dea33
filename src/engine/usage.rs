use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::{add_days, month_start, next_month_start, week_start};
use crate::model::*;

use super::Engine;

/// Statuses that consume quota.
pub const USAGE_STATUSES: [ReservationStatus; 3] = [
    ReservationStatus::Approved,
    ReservationStatus::Tentative,
    ReservationStatus::Confirmed,
];

/// Half-open range of event dates `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl UsageWindow {
    /// Monday of the week containing `date` to the following Monday.
    pub fn weekly(date: NaiveDate) -> Self {
        let start = week_start(date);
        Self {
            start,
            end: add_days(start, 7),
        }
    }

    /// First of the month containing `date` to the first of the next.
    pub fn monthly(date: NaiveDate) -> Self {
        Self {
            start: month_start(date),
            end: next_month_start(date),
        }
    }

    pub fn for_group(group: QuotaGroup, date: NaiveDate) -> Self {
        match group {
            QuotaGroup::Tennis => Self::weekly(date),
            QuotaGroup::Leobo => Self::monthly(date),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

fn matching<'a>(
    state: &'a GroupState,
    household_id: Ulid,
    facilities: &'a [Facility],
    window: UsageWindow,
    statuses: &'a [ReservationStatus],
) -> impl Iterator<Item = &'a Reservation> {
    state.reservations.iter().filter(move |r| {
        r.household_id == household_id
            && facilities.contains(&r.facility)
            && statuses.contains(&r.status)
            && window.contains(r.event_date)
    })
}

/// Sum of stored durations for the household's matching reservations.
pub fn sum_hours(
    state: &GroupState,
    household_id: Ulid,
    facilities: &[Facility],
    window: UsageWindow,
    statuses: &[ReservationStatus],
) -> f64 {
    matching(state, household_id, facilities, window, statuses)
        .map(|r| r.duration_hours)
        .sum()
}

pub fn count(
    state: &GroupState,
    household_id: Ulid,
    facilities: &[Facility],
    window: UsageWindow,
    statuses: &[ReservationStatus],
) -> u32 {
    matching(state, household_id, facilities, window, statuses).count() as u32
}

impl Engine {
    /// Tennis hours the household has used in the week of `date`.
    pub async fn tennis_hours_in_week(&self, household_id: Ulid, date: NaiveDate) -> f64 {
        let guard = self.group(QuotaGroup::Tennis).read().await;
        sum_hours(
            &guard,
            household_id,
            QuotaGroup::Tennis.facilities(),
            UsageWindow::weekly(date),
            &USAGE_STATUSES,
        )
    }

    /// Leobo and whole-facility reservations in the month of `date`.
    pub async fn leobo_count_in_month(&self, household_id: Ulid, date: NaiveDate) -> u32 {
        let guard = self.group(QuotaGroup::Leobo).read().await;
        count(
            &guard,
            household_id,
            QuotaGroup::Leobo.facilities(),
            UsageWindow::monthly(date),
            &USAGE_STATUSES,
        )
    }

    pub async fn leobo_hours_in_month(&self, household_id: Ulid, date: NaiveDate) -> f64 {
        let guard = self.group(QuotaGroup::Leobo).read().await;
        sum_hours(
            &guard,
            household_id,
            QuotaGroup::Leobo.facilities(),
            UsageWindow::monthly(date),
            &USAGE_STATUSES,
        )
    }
}
