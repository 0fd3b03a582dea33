//! Weekday and holiday-aware date arithmetic.
//!
//! Holidays are matched by their *observed* date: a holiday that falls on a
//! Saturday is stored under the Friday it is observed on, and the Saturday
//! itself is not a holiday.

use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HolidayKind {
    #[serde(rename = "US Federal")]
    UsFederal,
    #[serde(rename = "Botswana Public")]
    BotswanaPublic,
    #[serde(rename = "One-Off")]
    OneOff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    /// Observed date.
    pub date: NaiveDate,
    pub name: String,
    pub kind: HolidayKind,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Immutable set of observed holidays. Inactive entries are dropped on
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HolidayCalendar {
    by_date: BTreeMap<NaiveDate, Holiday>,
}

impl HolidayCalendar {
    pub fn new(holidays: impl IntoIterator<Item = Holiday>) -> Self {
        let mut by_date = BTreeMap::new();
        for holiday in holidays.into_iter().filter(|h| h.active) {
            by_date.entry(holiday.date).or_insert(holiday);
        }
        Self { by_date }
    }

    /// Parse a JSON array of holiday entries.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let holidays: Vec<Holiday> = serde_json::from_str(json)?;
        Ok(Self::new(holidays))
    }

    pub fn len(&self) -> usize {
        self.by_date.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.by_date.contains_key(&date)
    }

    pub fn holiday_on(&self, date: NaiveDate) -> Option<&Holiday> {
        self.by_date.get(&date)
    }

    pub fn holidays_in_year(&self, year: i32) -> impl Iterator<Item = &Holiday> {
        self.by_date.values().filter(move |h| h.date.year() == year)
    }

    /// Not a Saturday, Sunday or holiday.
    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.is_holiday(date)
    }

    /// Walk back from `event_date` one calendar day at a time until
    /// `days_back` business days have been counted. The event date itself
    /// never counts; `days_back == 0` returns it unchanged.
    pub fn business_day_deadline(&self, event_date: NaiveDate, days_back: u32) -> NaiveDate {
        let mut current = event_date;
        let mut counted = 0;
        while counted < days_back {
            current = add_days(current, -1);
            if self.is_business_day(current) {
                counted += 1;
            }
        }
        current
    }
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Negative `days` walks backwards.
pub fn add_days(date: NaiveDate, days: i64) -> NaiveDate {
    date + Duration::days(days)
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    add_days(date, -(date.weekday().num_days_from_monday() as i64))
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    add_days(date, -(date.day0() as i64))
}

/// First day of the month after the one containing `date`.
pub fn next_month_start(date: NaiveDate) -> NaiveDate {
    // Any day-1 plus 31 days lands in the following month.
    month_start(add_days(month_start(date), 31))
}
