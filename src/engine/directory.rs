use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Households and members, with the indexes booking decisions need.
pub struct Directory {
    households: DashMap<Ulid, Household>,
    members: DashMap<Ulid, Member>,
    /// Household → member ids, in insertion order.
    household_members: DashMap<Ulid, Vec<Ulid>>,
    /// Lowercased email → member id.
    emails: DashMap<String, Ulid>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            households: DashMap::new(),
            members: DashMap::new(),
            household_members: DashMap::new(),
            emails: DashMap::new(),
        }
    }

    // ── Households ───────────────────────────────────────────

    pub fn household_count(&self) -> usize {
        self.households.len()
    }

    pub fn contains_household(&self, id: &Ulid) -> bool {
        self.households.contains_key(id)
    }

    pub fn household(&self, id: &Ulid) -> Option<Household> {
        self.households.get(id).map(|e| e.value().clone())
    }

    pub fn households(&self) -> Vec<Household> {
        let mut all: Vec<Household> = self.households.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|h| h.id);
        all
    }

    // ── Members ──────────────────────────────────────────────

    pub fn member(&self, id: &Ulid) -> Option<Member> {
        self.members.get(id).map(|e| e.value().clone())
    }

    pub fn members(&self) -> Vec<Member> {
        let mut all: Vec<Member> = self.members.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|m| m.id);
        all
    }

    pub fn member_by_email(&self, email: &str) -> Option<Member> {
        let id = *self.emails.get(&email.trim().to_lowercase())?.value();
        self.member(&id)
    }

    /// Members of a household, active or not, in the order they were added.
    pub fn members_of(&self, household_id: &Ulid) -> Vec<Member> {
        let ids = self
            .household_members
            .get(household_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.member(id)).collect()
    }

    pub fn primary_member(&self, household_id: &Ulid) -> Option<Member> {
        self.members_of(household_id)
            .into_iter()
            .find(|m| m.relationship == Relationship::Primary)
    }

    // ── Event application ────────────────────────────────────

    pub fn apply(&self, event: &Event) {
        match event {
            Event::HouseholdSaved { household } => {
                self.households.insert(household.id, household.clone());
            }
            Event::MemberSaved { member } => self.apply_member(member),
            Event::ReservationSaved { .. } => {}
        }
    }

    fn apply_member(&self, member: &Member) {
        if let Some(previous) = self.members.insert(member.id, member.clone()) {
            if previous.household_id != member.household_id
                && let Some(mut ids) = self.household_members.get_mut(&previous.household_id)
            {
                ids.retain(|id| id != &member.id);
            }
            if let Some(old) = previous.email
                && Some(&old) != member.email.as_ref()
            {
                self.emails
                    .remove_if(&old.to_lowercase(), |_, owner| owner == &member.id);
            }
        }
        let mut ids = self.household_members.entry(member.household_id).or_default();
        if !ids.contains(&member.id) {
            ids.push(member.id);
        }
        drop(ids);
        if let Some(email) = &member.email {
            self.emails.insert(email.trim().to_lowercase(), member.id);
        }
    }
}
