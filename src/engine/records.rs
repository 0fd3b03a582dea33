use chrono::Utc;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{AuditAction, AuditEntry};

use super::{Engine, EngineError};

fn require_name(value: &str, what: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{what} is required.")));
    }
    if value.len() > MAX_EVENT_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    /// Create or replace a household record.
    pub async fn save_household(
        &self,
        mut household: Household,
        actor: &Actor,
    ) -> Result<Household, EngineError> {
        require_name(&household.name, "Household name")?;
        let _guard = self.directory_lock.lock().await;
        if !self.directory.contains_household(&household.id)
            && self.directory.household_count() >= MAX_HOUSEHOLDS
        {
            return Err(EngineError::LimitExceeded("too many households"));
        }

        household.last_modified = Utc::now();
        let event = Event::HouseholdSaved {
            household: household.clone(),
        };
        self.journal_append(event.clone()).await?;
        self.directory.apply(&event);

        self.notify.record(AuditEntry::new(
            &actor.email,
            AuditAction::HouseholdSaved,
            "Household",
            household.id,
            &household.name,
        ));
        Ok(household)
    }

    /// Create or replace a member record. The household must exist.
    pub async fn save_member(&self, mut member: Member, actor: &Actor) -> Result<Member, EngineError> {
        require_name(&member.first_name, "First name")?;
        require_name(&member.last_name, "Last name")?;
        if let Some(email) = &member.email
            && !email.contains('@')
        {
            return Err(EngineError::Validation(format!("Invalid email address: {email}")));
        }
        let _guard = self.directory_lock.lock().await;
        if !self.directory.contains_household(&member.household_id) {
            return Err(EngineError::NotFound(member.household_id));
        }
        if let Some(email) = &member.email
            && let Some(existing) = self.directory.member_by_email(email)
            && existing.id != member.id
        {
            return Err(EngineError::Validation(format!(
                "Email address already registered: {email}"
            )));
        }

        member.last_modified = Utc::now();
        let event = Event::MemberSaved {
            member: member.clone(),
        };
        self.journal_append(event.clone()).await?;
        self.directory.apply(&event);

        self.notify.record(AuditEntry::new(
            &actor.email,
            AuditAction::MemberSaved,
            "Member",
            member.id,
            member.full_name(),
        ));
        Ok(member)
    }

    /// Mark a household inactive. Already-inactive households are left
    /// untouched and reported as `false`.
    pub async fn deactivate_household(
        &self,
        household_id: Ulid,
        actor: &Actor,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let _guard = self.directory_lock.lock().await;
        let mut household = self
            .directory
            .household(&household_id)
            .ok_or(EngineError::NotFound(household_id))?;
        if !household.active {
            return Ok(false);
        }

        household.active = false;
        household.last_modified = Utc::now();
        let event = Event::HouseholdSaved { household };
        self.journal_append(event.clone()).await?;
        self.directory.apply(&event);

        tracing::info!("household {household_id} deactivated: {reason}");
        self.notify.record(AuditEntry::new(
            &actor.email,
            AuditAction::HouseholdDeactivated,
            "Household",
            household_id,
            reason,
        ));
        Ok(true)
    }

    pub fn get_household(&self, id: &Ulid) -> Option<Household> {
        self.directory.household(id)
    }

    pub fn households(&self) -> Vec<Household> {
        self.directory.households()
    }

    pub fn get_member(&self, id: &Ulid) -> Option<Member> {
        self.directory.member(id)
    }

    pub fn member_by_email(&self, email: &str) -> Option<Member> {
        self.directory.member_by_email(email)
    }

    pub fn household_members(&self, household_id: &Ulid) -> Vec<Member> {
        self.directory.members_of(household_id)
    }

    /// Email of the household's primary member, if one is on file.
    pub fn primary_email(&self, household_id: &Ulid) -> Option<String> {
        self.directory
            .primary_member(household_id)
            .and_then(|m| m.email)
    }

    pub(super) fn primary_first_name(&self, household_id: &Ulid) -> String {
        self.directory
            .primary_member(household_id)
            .map(|m| m.first_name)
            .unwrap_or_default()
    }
}
