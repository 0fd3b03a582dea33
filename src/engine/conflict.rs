use chrono::NaiveDateTime;

use crate::model::*;

use super::{Engine, EngineError};

/// First slot-holding reservation on `facility` that overlaps `span`.
/// Touching endpoints do not conflict; inactive statuses never do.
pub fn find_conflict<'a>(
    state: &'a GroupState,
    facility: Facility,
    span: &Span,
) -> Option<&'a Reservation> {
    state
        .overlapping(span)
        .find(|r| r.facility == facility && r.status.holds_slot())
}

pub(crate) fn validate_span(start: NaiveDateTime, end: NaiveDateTime) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation(
            "End time must be after start time.".into(),
        ));
    }
    Ok(Span::new(start, end))
}

impl Engine {
    pub async fn has_conflict(
        &self,
        facility: Facility,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<bool, EngineError> {
        let span = validate_span(start, end)?;
        let guard = self.group(facility.group()).read().await;
        Ok(find_conflict(&guard, facility, &span).is_some())
    }
}
