use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::HolidayCalendar;
use crate::model::Facility;

/// Booking rules of the association. Loaded from JSON; missing fields fall
/// back to the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingPolicy {
    /// Soft cap: hours per household per Monday-to-Sunday week.
    pub tennis_weekly_limit_hours: f64,
    /// Hard cap: hours in a single tennis session.
    pub tennis_session_max_hours: f64,
    /// Calendar days before the event during which an excess tennis booking
    /// can be bumped.
    pub tennis_bump_window_days: u32,
    /// Soft cap: leobo/whole-facility reservations per household per month.
    pub leobo_monthly_limit: u32,
    /// Hard cap: hours in a single leobo reservation.
    pub leobo_max_hours: f64,
    /// Business days before the event during which an excess leobo booking
    /// can be bumped.
    pub leobo_bump_window_days: u32,
    /// Business days before the event the guest list is due.
    pub guest_list_deadline_days: u32,
    /// Local hour on the deadline day after which guest lists are late.
    pub guest_list_cutoff_hour: u32,
    pub approval_required: Vec<Facility>,
    /// Days before membership expiry on which renewal reminders go out.
    pub renewal_reminder_days: Vec<i64>,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            tennis_weekly_limit_hours: 3.0,
            tennis_session_max_hours: 2.0,
            tennis_bump_window_days: 1,
            leobo_monthly_limit: 1,
            leobo_max_hours: 6.0,
            leobo_bump_window_days: 5,
            guest_list_deadline_days: 3,
            guest_list_cutoff_hour: 17,
            approval_required: vec![Facility::Leobo, Facility::WholeFacility],
            renewal_reminder_days: vec![30, 7],
        }
    }
}

impl BookingPolicy {
    pub fn requires_approval(&self, facility: Facility) -> bool {
        self.approval_required.contains(&facility)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Where notifications for the committee go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contacts {
    pub board: String,
    pub mgt: String,
    pub rso: String,
}

impl Default for Contacts {
    fn default() -> Self {
        Self {
            board: "board@geabotswana.org".into(),
            mgt: "mgt-notify@geabotswana.org".into(),
            rso: "treasurer@geabotswana.org".into(),
        }
    }
}

/// Everything the engine needs besides its journal.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub policy: BookingPolicy,
    pub holidays: HolidayCalendar,
    pub contacts: Contacts,
    /// Local time zone of the association.
    pub utc_offset: FixedOffset,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy: BookingPolicy::default(),
            holidays: HolidayCalendar::default(),
            contacts: Contacts::default(),
            utc_offset: default_offset(),
        }
    }
}

fn default_offset() -> FixedOffset {
    // Africa/Gaborone, no DST
    FixedOffset::east_opt(2 * 3600).unwrap_or_else(|| Utc.fix())
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: serde_json::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::Io { path, source } => write!(f, "cannot read {}: {source}", path.display()),
            ConfigError::Parse { path, source } => {
                write!(f, "cannot parse {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Daemon settings from `GATEHOUSE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub policy_file: Option<PathBuf>,
    pub holidays_file: Option<PathBuf>,
    pub utc_offset: FixedOffset,
    pub nightly_hour: u32,
    pub rso_summary_hour: u32,
    pub compact_threshold: u64,
    pub contacts: Contacts,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Contacts::default();
        let offset_hours: i32 = parse_or(&lookup, "GATEHOUSE_UTC_OFFSET_HOURS", 2)?;
        let utc_offset = FixedOffset::east_opt(offset_hours * 3600).ok_or(ConfigError::Invalid {
            key: "GATEHOUSE_UTC_OFFSET_HOURS",
            value: offset_hours.to_string(),
        })?;
        let nightly_hour = hour(&lookup, "GATEHOUSE_NIGHTLY_HOUR", 2)?;
        let rso_summary_hour = hour(&lookup, "GATEHOUSE_RSO_SUMMARY_HOUR", 6)?;

        Ok(Self {
            data_dir: lookup("GATEHOUSE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: lookup("GATEHOUSE_METRICS_PORT")
                .map(|v| {
                    v.parse().map_err(|_| ConfigError::Invalid {
                        key: "GATEHOUSE_METRICS_PORT",
                        value: v,
                    })
                })
                .transpose()?,
            policy_file: lookup("GATEHOUSE_POLICY_FILE").map(PathBuf::from),
            holidays_file: lookup("GATEHOUSE_HOLIDAYS_FILE").map(PathBuf::from),
            utc_offset,
            nightly_hour,
            rso_summary_hour,
            compact_threshold: parse_or(&lookup, "GATEHOUSE_COMPACT_THRESHOLD", 1000)?,
            contacts: Contacts {
                board: lookup("GATEHOUSE_BOARD_EMAIL").unwrap_or(defaults.board),
                mgt: lookup("GATEHOUSE_MGT_EMAIL").unwrap_or(defaults.mgt),
                rso: lookup("GATEHOUSE_RSO_EMAIL").unwrap_or(defaults.rso),
            },
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("gatehouse.journal")
    }

    /// Policy from `policy_file`, or the defaults when unset.
    pub fn load_policy(&self) -> Result<BookingPolicy, ConfigError> {
        match &self.policy_file {
            Some(path) => read_json(path, BookingPolicy::from_json),
            None => Ok(BookingPolicy::default()),
        }
    }

    /// Holidays from `holidays_file`, or an empty calendar when unset.
    pub fn load_holidays(&self) -> Result<HolidayCalendar, ConfigError> {
        match &self.holidays_file {
            Some(path) => read_json(path, HolidayCalendar::from_json),
            None => Ok(HolidayCalendar::default()),
        }
    }

    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        Ok(EngineOptions {
            policy: self.load_policy()?,
            holidays: self.load_holidays()?,
            contacts: self.contacts.clone(),
            utc_offset: self.utc_offset,
        })
    }
}

fn read_json<T>(
    path: &Path,
    parse: impl FnOnce(&str) -> Result<T, serde_json::Error>,
) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid { key, value: v }),
        None => Ok(default),
    }
}

fn hour<F>(lookup: &F, key: &'static str, default: u32) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let h = parse_or(lookup, key, default)?;
    if h > 23 {
        return Err(ConfigError::Invalid { key, value: h.to_string() });
    }
    Ok(h)
}
