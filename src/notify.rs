use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

/// Email templates the engine asks for. Rendering lives elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    RenewalReminder30,
    RenewalReminder7,
    MembershipExpired,
    ReservationConfirmed,
    ReservationReceived,
    ApprovalRequest,
    ReservationApproved,
    ReservationDenied,
    ReservationCancelled,
    GuestListReminder,
    DailySummary,
    LeoboApprovalRequest,
    TennisLimitReached,
    LeoboLimitReached,
    TennisExcessReview,
    LeoboExcessReview,
    ReservationBumped,
}

impl Template {
    pub fn key(&self) -> &'static str {
        match self {
            Template::RenewalReminder30 => "tpl_004",
            Template::RenewalReminder7 => "tpl_005",
            Template::MembershipExpired => "tpl_006",
            Template::ReservationConfirmed => "tpl_007",
            Template::ReservationReceived => "tpl_008",
            Template::ApprovalRequest => "tpl_009",
            Template::ReservationApproved => "tpl_010",
            Template::ReservationDenied => "tpl_011",
            Template::ReservationCancelled => "tpl_012",
            Template::GuestListReminder => "tpl_013",
            Template::DailySummary => "tpl_014",
            Template::LeoboApprovalRequest => "tpl_019",
            Template::TennisLimitReached => "tpl_028",
            Template::LeoboLimitReached => "tpl_029",
            Template::TennisExcessReview => "tpl_030",
            Template::LeoboExcessReview => "tpl_031",
            Template::ReservationBumped => "tpl_032",
        }
    }
}

/// A request to send one templated email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub template: Template,
    pub recipients: Vec<String>,
    pub vars: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(template: Template, recipient: impl Into<String>) -> Self {
        Self {
            template,
            recipients: vec![recipient.into()],
            vars: BTreeMap::new(),
        }
    }

    pub fn var(mut self, key: &str, value: impl ToString) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Set a template flag: `"true"` when on, empty when off.
    pub fn flag(self, key: &str, on: bool) -> Self {
        self.var(key, if on { "true" } else { "" })
    }

    pub fn vars(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.vars.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    ReservationCreated,
    ReservationApproved,
    ReservationDenied,
    ReservationCancelled,
    ReservationBumped,
    ReservationCompleted,
    GuestListSubmitted,
    HouseholdSaved,
    MemberSaved,
    HouseholdDeactivated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ReservationCreated => "RESERVATION_CREATED",
            AuditAction::ReservationApproved => "RESERVATION_APPROVED",
            AuditAction::ReservationDenied => "RESERVATION_DENIED",
            AuditAction::ReservationCancelled => "RESERVATION_CANCELLED",
            AuditAction::ReservationBumped => "RESERVATION_BUMPED",
            AuditAction::ReservationCompleted => "RESERVATION_COMPLETED",
            AuditAction::GuestListSubmitted => "GUEST_LIST_SUBMITTED",
            AuditAction::HouseholdSaved => "HOUSEHOLD_SAVED",
            AuditAction::MemberSaved => "MEMBER_SAVED",
            AuditAction::HouseholdDeactivated => "MEMBER_DEACTIVATED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub actor: String,
    pub action: AuditAction,
    pub target_type: &'static str,
    pub target_id: Ulid,
    pub details: String,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: &str,
        action: AuditAction,
        target_type: &'static str,
        target_id: Ulid,
        details: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.to_string(),
            action,
            target_type,
            target_id,
            details: details.into(),
            at: Utc::now(),
        }
    }
}

/// Fan-out of notification requests and audit entries to whoever delivers
/// them. Sending never fails from the caller's side.
pub struct NotifyHub {
    notifications: broadcast::Sender<Notification>,
    audit: broadcast::Sender<AuditEntry>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            notifications: broadcast::channel(CHANNEL_CAPACITY).0,
            audit: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn subscribe_audit(&self) -> broadcast::Receiver<AuditEntry> {
        self.audit.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        metrics::counter!(
            crate::observability::NOTIFICATIONS_TOTAL,
            "template" => notification.template.key()
        )
        .increment(1);
        let _ = self.notifications.send(notification);
    }

    /// No-op if nobody is listening.
    pub fn record(&self, entry: AuditEntry) {
        let _ = self.audit.send(entry);
    }
}
