use chrono::NaiveDate;
use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::model::*;

use super::usage::{count, sum_hours, UsageWindow, USAGE_STATUSES};
use super::Engine;

/// Outcome of a quota check for one prospective booking.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitCheck {
    /// False only for hard caps.
    pub allowed: bool,
    /// Over a soft cap: the booking goes to review.
    pub is_excess: bool,
    /// Human-readable, empty when neither cap applies.
    pub reason: String,
    pub hours_used: f64,
    pub hours_limit: f64,
    /// Leobo group only.
    pub count_used: Option<u32>,
    pub count_limit: Option<u32>,
}

impl LimitCheck {
    fn within(hours_used: f64, hours_limit: f64) -> Self {
        Self {
            allowed: true,
            is_excess: false,
            reason: String::new(),
            hours_used,
            hours_limit,
            count_used: None,
            count_limit: None,
        }
    }
}

/// Decide whether a booking of `duration_hours` on `event_date` is allowed,
/// allowed as excess, or refused. `state` must be the facility's group.
pub fn check_limits(
    policy: &BookingPolicy,
    state: &GroupState,
    household_id: Ulid,
    facility: Facility,
    event_date: NaiveDate,
    duration_hours: f64,
) -> LimitCheck {
    let group = facility.group();
    let window = UsageWindow::for_group(group, event_date);
    let hours_used = sum_hours(state, household_id, group.facilities(), window, &USAGE_STATUSES);

    match group {
        QuotaGroup::Tennis => {
            let mut check = LimitCheck::within(hours_used, policy.tennis_weekly_limit_hours);
            if duration_hours > policy.tennis_session_max_hours {
                check.allowed = false;
                check.reason = format!(
                    "A single tennis session cannot exceed {} hours.",
                    policy.tennis_session_max_hours
                );
            } else if hours_used >= policy.tennis_weekly_limit_hours {
                check.is_excess = true;
                check.reason = format!(
                    "Your household has reached the weekly tennis court booking limit of {} hours. \
                     Additional bookings this week require board approval.",
                    policy.tennis_weekly_limit_hours
                );
            }
            check
        }
        QuotaGroup::Leobo => {
            let count_used = count(state, household_id, group.facilities(), window, &USAGE_STATUSES);
            let mut check = LimitCheck::within(hours_used, policy.leobo_max_hours);
            check.count_used = Some(count_used);
            check.count_limit = Some(policy.leobo_monthly_limit);
            if duration_hours > policy.leobo_max_hours {
                check.allowed = false;
                check.reason = format!(
                    "A single leobo reservation cannot exceed {} hours.",
                    policy.leobo_max_hours
                );
            } else if count_used >= policy.leobo_monthly_limit {
                check.is_excess = true;
                check.reason = "Your household has reached the monthly leobo booking limit. \
                                Additional bookings this month require Management Officer approval."
                    .to_string();
            }
            check
        }
    }
}

impl Engine {
    /// Quota check against current state, without booking anything.
    pub async fn check_limits(
        &self,
        household_id: Ulid,
        facility: Facility,
        event_date: NaiveDate,
        duration_hours: f64,
    ) -> LimitCheck {
        let guard = self.group(facility.group()).read().await;
        check_limits(&self.policy, &guard, household_id, facility, event_date, duration_hours)
    }
}
