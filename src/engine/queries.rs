use std::fmt::Write as _;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, Template};

use super::lifecycle::{format_date, format_time};
use super::Engine;

/// One reservation on the security officer's daily sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEntry {
    pub reservation: Reservation,
    pub membership_type: Option<String>,
    /// Non-staff household members, with age when known.
    pub attending: Vec<String>,
}

/// Everything booked for one day, in start order.
#[derive(Debug, Clone, PartialEq)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub entries: Vec<SummaryEntry>,
    pub total_members: usize,
    pub total_guests: u32,
}

impl DailySummary {
    /// Plain-text listing used as the body of the summary email.
    pub fn render_block(&self) -> String {
        let mut block = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            let r = &entry.reservation;
            let _ = writeln!(block, "--- RESERVATION #{} ---", i + 1);
            let _ = writeln!(block, "Facility: {}", r.facility);
            let _ = writeln!(block, "Time: {} - {}", format_time(r.start), format_time(r.end));
            if !r.event_name.is_empty() {
                let _ = writeln!(block, "Event: {}", r.event_name);
            }
            let _ = writeln!(block, "Reserved By: {}", r.household_name);
            let _ = writeln!(block, "Contact: {}", r.primary_email);
            let _ = writeln!(
                block,
                "Membership: {}",
                entry.membership_type.as_deref().unwrap_or("")
            );
            let _ = writeln!(block, "Household Attending: {}", entry.attending.join(", "));
            if r.has_guests {
                let _ = writeln!(block, "Guests: {} guests", r.guest_count);
            } else {
                let _ = writeln!(block, "Guests: None");
            }
            block.push('\n');
        }
        block
    }
}

impl Engine {
    pub async fn get_reservation(&self, id: &Ulid) -> Option<Reservation> {
        let group = self.group_for_reservation(id)?;
        let guard = self.group(group).read().await;
        guard.get(id).cloned()
    }

    /// All reservations, both groups, matching `pred`.
    async fn reservations_where(&self, pred: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for group in QuotaGroup::ALL {
            let guard = self.group(group).read().await;
            out.extend(guard.reservations.iter().filter(|r| pred(r)).cloned());
        }
        out
    }

    /// Reservations awaiting a decision, oldest request first.
    pub async fn pending_reservations(&self) -> Vec<Reservation> {
        let mut out = self
            .reservations_where(|r| r.status == ReservationStatus::Pending)
            .await;
        out.sort_by_key(|r| (r.created_date, r.id));
        out
    }

    /// Every reservation of a household, any status, by event date.
    pub async fn household_reservations(&self, household_id: Ulid) -> Vec<Reservation> {
        let mut out = self
            .reservations_where(|r| r.household_id == household_id)
            .await;
        out.sort_by_key(|r| (r.event_date, r.start));
        out
    }

    /// Slot-holding reservations of a household from `today` on.
    pub async fn upcoming_reservations(&self, household_id: Ulid, today: NaiveDate) -> Vec<Reservation> {
        let mut out = self
            .reservations_where(|r| {
                r.household_id == household_id && r.status.holds_slot() && r.event_date >= today
            })
            .await;
        out.sort_by_key(|r| (r.event_date, r.start));
        out
    }

    /// Every reservation on `date`, any status, by start time.
    pub async fn reservations_on(&self, date: NaiveDate) -> Vec<Reservation> {
        let mut out = self.reservations_where(|r| r.event_date == date).await;
        out.sort_by_key(|r| (r.start, r.id));
        out
    }

    pub async fn daily_summary(&self, date: NaiveDate) -> DailySummary {
        let entries: Vec<SummaryEntry> = self
            .reservations_on(date)
            .await
            .into_iter()
            .filter(|r| r.status != ReservationStatus::Cancelled)
            .map(|reservation| {
                let attending = self
                    .directory
                    .members_of(&reservation.household_id)
                    .into_iter()
                    .filter(|m| m.active && !m.is_staff())
                    .map(|m| match m.age_on(date) {
                        Some(age) => format!("{} (age {age})", m.full_name()),
                        None => m.full_name(),
                    })
                    .collect();
                SummaryEntry {
                    membership_type: self
                        .directory
                        .household(&reservation.household_id)
                        .map(|h| h.membership_type),
                    attending,
                    reservation,
                }
            })
            .collect();

        DailySummary {
            date,
            total_members: entries.iter().map(|e| e.attending.len()).sum(),
            total_guests: entries
                .iter()
                .filter(|e| e.reservation.has_guests)
                .map(|e| e.reservation.guest_count)
                .sum(),
            entries,
        }
    }

    /// Build the day's summary and send it to the security officer.
    pub async fn send_daily_summary(&self, date: NaiveDate) -> DailySummary {
        let summary = self.daily_summary(date).await;
        self.notify.send(
            Notification::new(Template::DailySummary, &self.contacts.rso)
                .var("TODAY_DATE", format_date(date))
                .flag("IF_NO_RESERVATIONS", summary.entries.is_empty())
                .var("RESERVATIONS_BLOCK", summary.render_block())
                .var("TOTAL_RESERVATIONS", summary.entries.len())
                .var("TOTAL_MEMBERS", summary.total_members)
                .var("TOTAL_GUESTS", summary.total_guests),
        );
        tracing::info!(
            "daily summary for {date} sent: {} reservations",
            summary.entries.len()
        );
        summary
    }
}
