use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc, Weekday};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::calendar::add_days;
use crate::model::fixtures::at;
use crate::notify::{AuditAction, AuditEntry, Notification, Template};

fn test_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("gatehouse_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: &PathBuf) -> Engine {
    Engine::new(path.clone(), Arc::new(NotifyHub::new()), EngineOptions::default()).unwrap()
}

fn board() -> Actor {
    Actor::board("board@example.org")
}

async fn register(engine: &Engine, name: &str) -> (Household, Actor) {
    register_with(engine, name, Relationship::Primary, None).await
}

async fn register_with(
    engine: &Engine,
    name: &str,
    relationship: Relationship,
    expiration_date: Option<NaiveDate>,
) -> (Household, Actor) {
    let household = engine
        .save_household(
            Household {
                id: Ulid::new(),
                name: name.into(),
                membership_type: "Full".into(),
                active: true,
                expiration_date,
                last_modified: Utc::now(),
            },
            &board(),
        )
        .await
        .unwrap();
    let email = format!("{}@example.org", name.to_lowercase());
    engine
        .save_member(
            Member {
                id: Ulid::new(),
                household_id: household.id,
                first_name: name.into(),
                last_name: "Family".into(),
                email: Some(email.clone()),
                relationship,
                date_of_birth: None,
                active: true,
                last_modified: Utc::now(),
            },
            &board(),
        )
        .await
        .unwrap();
    let actor = Actor::member(email, household.id);
    (household, actor)
}

/// A Wednesday at least two weeks out.
fn wednesday_ahead(engine: &Engine) -> NaiveDate {
    let mut d = add_days(engine.local_today(), 14);
    while d.weekday() != Weekday::Wed {
        d = add_days(d, 1);
    }
    d
}

fn request(household_id: Ulid, facility: Facility, date: NaiveDate, start: u32, end: u32) -> BookingRequest {
    BookingRequest {
        household_id,
        facility,
        event_date: date,
        start: at(date, start, 0),
        end: at(date, end, 0),
        duration_hours: (end - start) as f64,
        event_name: "Doubles".into(),
        has_guests: false,
        guest_count: 0,
        no_fundraising_confirmed: true,
    }
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

fn templates(notes: &[Notification]) -> Vec<Template> {
    notes.iter().map(|n| n.template).collect()
}

// ── Creation ─────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_tennis_within_limit_confirms() {
    let path = test_path("scenario_a.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Molefe").await;
    let mut notes = engine.notify.subscribe_notifications();
    let date = wednesday_ahead(&engine);

    let outcome = assert_ok!(
        engine
            .create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member)
            .await
    );
    assert!(outcome.limits.allowed);
    assert!(!outcome.limits.is_excess);
    assert_eq!(outcome.reservation.status, ReservationStatus::Confirmed);
    assert_eq!(outcome.reservation.bump_window_deadline, None);
    assert_eq!(outcome.reservation.primary_email, "molefe@example.org");

    let sent = drain(&mut notes);
    assert_eq!(templates(&sent), vec![Template::ReservationConfirmed]);
    assert_eq!(sent[0].vars["FIRST_NAME"], "Molefe");
    assert_eq!(engine.tennis_hours_in_week(hh.id, date).await, 1.0);
}

#[tokio::test]
async fn scenario_b_tennis_excess_goes_tentative_on_approval() {
    let path = test_path("scenario_b.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Kgosi").await;
    let date = wednesday_ahead(&engine);

    assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 8, 10), &member).await);
    assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 12, 13), &member).await);
    assert_eq!(engine.tennis_hours_in_week(hh.id, date).await, 3.0);

    let mut notes = engine.notify.subscribe_notifications();
    let outcome = assert_ok!(
        engine
            .create_reservation(request(hh.id, Facility::Tennis, date, 15, 16), &member)
            .await
    );
    assert!(outcome.limits.allowed);
    assert!(outcome.limits.is_excess);
    assert_eq!(outcome.limits.hours_used, 3.0);
    let r = outcome.reservation;
    assert_eq!(r.status, ReservationStatus::Pending);
    assert!(r.is_excess);
    assert_eq!(r.bump_window_deadline, Some(add_days(date, -1)));
    assert_eq!(
        templates(&drain(&mut notes)),
        vec![
            Template::ReservationReceived,
            Template::TennisExcessReview,
            Template::TennisLimitReached
        ]
    );

    let approved = assert_ok!(engine.approve_reservation(r.id, &board(), Some("ok")).await);
    assert_eq!(approved.status, ReservationStatus::Tentative);
    assert_eq!(approved.bump_window_deadline, Some(add_days(date, -1)));
    assert_eq!(approved.approved.as_ref().map(|d| d.by.as_str()), Some("board@example.org"));
    assert_eq!(approved.approved.as_ref().and_then(|d| d.note.as_deref()), Some("ok"));
    assert_eq!(templates(&drain(&mut notes)), vec![Template::ReservationApproved]);
    // Pending excess booking did not count; tentative does.
    assert_eq!(engine.tennis_hours_in_week(hh.id, date).await, 4.0);
}

#[tokio::test]
async fn scenario_c_hard_cap_rejects_and_persists_nothing() {
    let path = test_path("scenario_c.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Sebina").await;
    let date = wednesday_ahead(&engine);

    let err = assert_err!(
        engine
            .create_reservation(request(hh.id, Facility::Tennis, date, 9, 12), &member)
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert_eq!(err.public_message(), "A single tennis session cannot exceed 2 hours.");
    assert!(engine.household_reservations(hh.id).await.is_empty());
    assert!(engine.reservations_on(date).await.is_empty());
}

#[tokio::test]
async fn scenario_e_leobo_overlap_conflicts() {
    let path = test_path("scenario_e.journal");
    let engine = open(&path);
    let (a, member_a) = register(&engine, "Modise").await;
    let (b, member_b) = register(&engine, "Tau").await;
    let date = wednesday_ahead(&engine);

    let first = assert_ok!(
        engine
            .create_reservation(request(a.id, Facility::Leobo, date, 14, 18), &member_a)
            .await
    );
    assert_eq!(first.reservation.status, ReservationStatus::Pending);
    let confirmed = assert_ok!(
        engine
            .approve_reservation(first.reservation.id, &Actor::mgt("mgt@example.org"), None)
            .await
    );
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);

    let err = assert_err!(
        engine
            .create_reservation(request(b.id, Facility::Leobo, date, 17, 20), &member_b)
            .await
    );
    assert!(matches!(err, EngineError::Conflict(Facility::Leobo)));
    assert_eq!(err.public_message(), CONFLICT_MESSAGE);
    assert!(engine.household_reservations(b.id).await.is_empty());
    assert_eq!(engine.reservations_on(date).await.len(), 1);

    // Touching the end is fine.
    assert_ok!(
        engine
            .create_reservation(request(b.id, Facility::Leobo, date, 18, 20), &member_b)
            .await
    );
}

#[tokio::test]
async fn cancelled_slot_can_be_rebooked() {
    let path = test_path("rebook.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Phiri").await;
    let date = wednesday_ahead(&engine);

    let r = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member).await);
    assert_err!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member).await);
    assert_ok!(engine.cancel_reservation(r.reservation.id, &member, Some("rain")).await);
    assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member).await);
    assert!(engine.has_conflict(Facility::Tennis, at(date, 9, 30), at(date, 9, 45)).await.unwrap());
    assert!(!engine.has_conflict(Facility::Tennis, at(date, 10, 0), at(date, 11, 0)).await.unwrap());
}

#[tokio::test]
async fn leobo_standard_request_goes_to_management() {
    let path = test_path("leobo_standard.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Dube").await;
    let mut notes = engine.notify.subscribe_notifications();
    let date = wednesday_ahead(&engine);

    let mut req = request(hh.id, Facility::WholeFacility, date, 10, 14);
    req.has_guests = true;
    req.guest_count = 25;
    let outcome = assert_ok!(engine.create_reservation(req, &member).await);
    let r = &outcome.reservation;
    assert_eq!(r.status, ReservationStatus::Pending);
    assert!(!r.is_excess);
    assert_eq!(outcome.limits.count_used, Some(0));
    let deadline = engine.holidays().await.business_day_deadline(date, 3);
    assert_eq!(r.guest_list_deadline, Some(deadline));

    let sent = drain(&mut notes);
    assert_eq!(
        templates(&sent),
        vec![Template::ReservationReceived, Template::LeoboApprovalRequest]
    );
    assert_eq!(sent[0].vars["IF_LEOBO"], "true");
    assert_eq!(sent[1].recipients, vec![engine.contacts().mgt.clone()]);
    assert_eq!(sent[1].vars["GUEST_COUNT"], "25");
}

#[tokio::test]
async fn second_leobo_in_month_is_excess_with_business_day_window() {
    let path = test_path("leobo_excess.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Ntsima").await;
    let date = wednesday_ahead(&engine);
    let other_day = if date.day() > 14 { add_days(date, -7) } else { add_days(date, 7) };

    let first = assert_ok!(engine.create_reservation(request(hh.id, Facility::Leobo, date, 18, 22), &member).await);
    assert_ok!(engine.approve_reservation(first.reservation.id, &board(), None).await);
    assert_eq!(engine.leobo_count_in_month(hh.id, date).await, 1);
    assert_eq!(engine.leobo_hours_in_month(hh.id, date).await, 4.0);

    let mut notes = engine.notify.subscribe_notifications();
    let second = assert_ok!(
        engine
            .create_reservation(request(hh.id, Facility::WholeFacility, other_day, 10, 12), &member)
            .await
    );
    assert!(second.reservation.is_excess);
    assert_eq!(second.limits.count_used, Some(1));
    let expected = engine.holidays().await.business_day_deadline(other_day, 5);
    assert_eq!(second.reservation.bump_window_deadline, Some(expected));
    assert_eq!(
        templates(&drain(&mut notes)),
        vec![
            Template::ReservationReceived,
            Template::LeoboExcessReview,
            Template::LeoboLimitReached
        ]
    );
}

// ── Validation and authorization ─────────────────────────────────

#[tokio::test]
async fn invalid_requests_are_validation_errors() {
    let path = test_path("validation.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Ramotswe").await;
    let date = wednesday_ahead(&engine);

    let mut reversed = request(hh.id, Facility::Tennis, date, 9, 10);
    std::mem::swap(&mut reversed.start, &mut reversed.end);
    let mut unnamed = request(hh.id, Facility::Tennis, date, 9, 10);
    unnamed.event_name = "  ".into();
    let mut zero = request(hh.id, Facility::Tennis, date, 9, 10);
    zero.duration_hours = 0.0;
    let past = request(hh.id, Facility::Tennis, add_days(engine.local_today(), -1), 9, 10);
    let same_day = request(hh.id, Facility::Tennis, engine.local_today(), 22, 23);
    let mut stray_guests = request(hh.id, Facility::Tennis, date, 9, 10);
    stray_guests.guest_count = 4;
    // Times this week, usage date a week later.
    let mut shifted = request(hh.id, Facility::Tennis, date, 9, 10);
    shifted.event_date = add_days(date, 7);

    for bad in [reversed, unnamed, zero, past, same_day, stray_guests, shifted] {
        let err = assert_err!(engine.create_reservation(bad, &member).await);
        assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
    }
    assert!(engine.household_reservations(hh.id).await.is_empty());
}

#[tokio::test]
async fn inactive_household_cannot_book() {
    let path = test_path("inactive.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Khama").await;
    assert!(assert_ok!(engine.deactivate_household(hh.id, &board(), "left").await));
    assert!(!assert_ok!(engine.deactivate_household(hh.id, &board(), "left").await));

    let date = wednesday_ahead(&engine);
    let err = assert_err!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn staff_and_outsiders_cannot_book() {
    let path = test_path("staff.journal");
    let engine = open(&path);
    let (hh, _) = register(&engine, "Masire").await;
    let (_, outsider) = register(&engine, "Mogae").await;
    let staff = engine
        .save_member(
            Member {
                id: Ulid::new(),
                household_id: hh.id,
                first_name: "Lesego".into(),
                last_name: "Staff".into(),
                email: Some("lesego@example.org".into()),
                relationship: Relationship::Staff,
                date_of_birth: None,
                active: true,
                last_modified: Utc::now(),
            },
            &board(),
        )
        .await
        .unwrap();
    let date = wednesday_ahead(&engine);

    let staff_actor = Actor::member(staff.email.clone().unwrap(), hh.id);
    let err = assert_err!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &staff_actor).await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = assert_err!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &outsider).await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = assert_err!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &Actor::system()).await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    // The board may book on a household's behalf.
    assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &board()).await);
}

#[tokio::test]
async fn unknown_household_is_not_found() {
    let path = test_path("unknown_household.journal");
    let engine = open(&path);
    let date = wednesday_ahead(&engine);
    let missing = Ulid::new();
    let err = assert_err!(engine.create_reservation(request(missing, Facility::Tennis, date, 9, 10), &board()).await);
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));
}

// ── Transitions ──────────────────────────────────────────────────

#[tokio::test]
async fn invalid_transitions_leave_data_unchanged() {
    let path = test_path("invalid_transitions.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Seretse").await;
    let date = wednesday_ahead(&engine);

    let confirmed = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member).await);
    let id = confirmed.reservation.id;
    let before = engine.get_reservation(&id).await.unwrap();
    let err = assert_err!(engine.approve_reservation(id, &board(), None).await);
    assert!(matches!(
        err,
        EngineError::InvalidTransition { status: ReservationStatus::Confirmed, transition: Transition::Approve, .. }
    ));
    assert_eq!(engine.get_reservation(&id).await.unwrap(), before);

    let pending = assert_ok!(engine.create_reservation(request(hh.id, Facility::Leobo, date, 18, 20), &member).await);
    let pid = pending.reservation.id;
    assert_ok!(engine.deny_reservation(pid, &board(), "Double booked hall").await);
    let cancelled = engine.get_reservation(&pid).await.unwrap();
    let err = assert_err!(engine.deny_reservation(pid, &board(), "again").await);
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert_eq!(engine.get_reservation(&pid).await.unwrap(), cancelled);
    assert_eq!(cancelled.denied.and_then(|d| d.note).as_deref(), Some("Double booked hall"));
}

#[tokio::test]
async fn mgt_approves_any_facility_but_only_board_denies() {
    let path = test_path("approval_rights.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Mpho").await;
    let mgt = Actor::mgt("mgt@example.org");
    let date = wednesday_ahead(&engine);

    assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 8, 10), &member).await);
    assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 11, 12), &member).await);
    let excess = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 13, 14), &member).await);
    let id = excess.reservation.id;

    let err = assert_err!(engine.approve_reservation(id, &member, None).await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    let err = assert_err!(engine.deny_reservation(id, &mgt, "No courts").await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(engine.get_reservation(&id).await.unwrap().status, ReservationStatus::Pending);
    assert_eq!(engine.pending_reservations().await.len(), 1);

    let approved = assert_ok!(engine.approve_reservation(id, &mgt, None).await);
    assert_eq!(approved.status, ReservationStatus::Tentative);
    assert!(engine.pending_reservations().await.is_empty());

    let hall = assert_ok!(engine.create_reservation(request(hh.id, Facility::Leobo, date, 15, 17), &member).await);
    let hall_id = hall.reservation.id;
    let err = assert_err!(engine.deny_reservation(hall_id, &mgt, "Double booked").await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    let denied = assert_ok!(engine.deny_reservation(hall_id, &board(), "Double booked").await);
    assert_eq!(denied.status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn cancel_by_owner_or_committee_only() {
    let path = test_path("cancel_rights.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Lekoko").await;
    let (_, stranger) = register(&engine, "Gaone").await;
    let mut audit = engine.notify.subscribe_audit();
    let mut notes = engine.notify.subscribe_notifications();
    let date = wednesday_ahead(&engine);

    let r = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member).await);
    let id = r.reservation.id;
    let err = assert_err!(engine.cancel_reservation(id, &stranger, None).await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    drain(&mut notes);
    let cancelled = assert_ok!(engine.cancel_reservation(id, &board(), Some("Court resurfacing")).await);
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);
    assert_eq!(cancelled.last_modified_by, "board@example.org");

    let sent = drain(&mut notes);
    assert_eq!(templates(&sent), vec![Template::ReservationCancelled]);
    assert_eq!(sent[0].vars["IF_BOARD_CANCELLED"], "true");
    assert_eq!(sent[0].vars["CANCELLATION_REASON"], "Court resurfacing");

    let actions: Vec<AuditAction> = drain(&mut audit).iter().map(|e: &AuditEntry| e.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::ReservationCreated, AuditAction::ReservationCancelled]
    );

    let err = assert_err!(engine.cancel_reservation(id, &member, None).await);
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    assert!(engine.upcoming_reservations(hh.id, engine.local_today()).await.is_empty());
}

#[tokio::test]
async fn missing_reservation_is_not_found() {
    let path = test_path("missing_reservation.journal");
    let engine = open(&path);
    let id = Ulid::new();
    let err = assert_err!(engine.approve_reservation(id, &board(), None).await);
    assert!(matches!(err, EngineError::NotFound(x) if x == id));
    assert!(engine.get_reservation(&id).await.is_none());
}

// ── Bumping ──────────────────────────────────────────────────────

async fn tentative_tennis(engine: &Engine, hh: &Household, member: &Actor, date: NaiveDate) -> Reservation {
    assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 8, 10), member).await);
    assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 11, 12), member).await);
    let excess = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 13, 14), member).await);
    assert_ok!(engine.approve_reservation(excess.reservation.id, &board(), None).await)
}

#[tokio::test]
async fn bump_inside_window_cancels_tentative() {
    let path = test_path("bump.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Boko").await;
    let (other, _) = register(&engine, "Kitso").await;
    let date = wednesday_ahead(&engine);
    let tentative = tentative_tennis(&engine, &hh, &member, date).await;
    let mut notes = engine.notify.subscribe_notifications();

    let bumped = assert_ok!(engine.bump_reservation(tentative.id, other.id, &board()).await);
    assert_eq!(bumped.status, ReservationStatus::Cancelled);
    assert_eq!(bumped.bumped_by_household, Some(other.id));
    assert_eq!(bumped.bumped_date, Some(engine.local_today()));
    let sent = drain(&mut notes);
    assert_eq!(templates(&sent), vec![Template::ReservationBumped]);
    assert_eq!(sent[0].vars["BUMPED_BY"], "Kitso");

    // Slot is free again.
    assert!(!engine.has_conflict(Facility::Tennis, at(date, 13, 0), at(date, 14, 0)).await.unwrap());
}

#[tokio::test]
async fn bump_rejected_for_confirmed_or_own_household() {
    let path = test_path("bump_rejected.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Ditiro").await;
    let (other, _) = register(&engine, "Onalenna").await;
    let date = wednesday_ahead(&engine);
    let tentative = tentative_tennis(&engine, &hh, &member, date).await;

    let err = assert_err!(engine.bump_reservation(tentative.id, hh.id, &board()).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = assert_err!(engine.bump_reservation(tentative.id, other.id, &member).await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let standard = engine
        .household_reservations(hh.id)
        .await
        .into_iter()
        .find(|r| r.status == ReservationStatus::Confirmed)
        .unwrap();
    let err = assert_err!(engine.bump_reservation(standard.id, other.id, &board()).await);
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);
}

// ── Guest lists ──────────────────────────────────────────────────

#[tokio::test]
async fn guest_list_on_time_and_late() {
    let path = test_path("guest_list.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Pula").await;
    let date = wednesday_ahead(&engine);

    let mut req = request(hh.id, Facility::Leobo, date, 18, 22);
    req.has_guests = true;
    req.guest_count = 12;
    let on_time = assert_ok!(engine.create_reservation(req, &member).await);
    let submitted = assert_ok!(engine.submit_guest_list(on_time.reservation.id, &member).await);
    assert!(submitted.guest_list_submitted);

    let today = engine.local_today();
    let mut late_req = request(hh.id, Facility::WholeFacility, add_days(today, 1), 20, 22);
    late_req.has_guests = true;
    late_req.guest_count = 3;
    let late = assert_ok!(engine.create_reservation(late_req, &member).await);
    let err = assert_err!(engine.submit_guest_list(late.reservation.id, &member).await);
    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert!(err.to_string().contains("at least 3 business days"));
    assert!(!engine.get_reservation(&late.reservation.id).await.unwrap().guest_list_submitted);

    assert!(engine.is_guest_list_deadline_met(date, engine.local_now()).await);
    assert!(!engine.is_guest_list_deadline_met(today, engine.local_now()).await);
}

#[tokio::test]
async fn guest_list_needs_guests() {
    let path = test_path("guest_list_none.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Naledi").await;
    let date = wednesday_ahead(&engine);
    let r = assert_ok!(engine.create_reservation(request(hh.id, Facility::Leobo, date, 18, 22), &member).await);
    let err = assert_err!(engine.submit_guest_list(r.reservation.id, &member).await);
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ── Nightly maintenance ──────────────────────────────────────────

#[tokio::test]
async fn scenario_d_bump_window_promotion_is_idempotent() {
    let path = test_path("scenario_d.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Motsumi").await;
    let date = wednesday_ahead(&engine);
    let tentative = tentative_tennis(&engine, &hh, &member, date).await;
    let deadline = tentative.bump_window_deadline.unwrap();
    let mut audit = engine.notify.subscribe_audit();

    // Window still open on the deadline itself.
    assert_eq!(assert_ok!(engine.promote_expired_bump_windows(deadline).await), 0);

    let day_after = add_days(deadline, 1);
    assert_eq!(engine.collect_bump_candidates(day_after).await, vec![tentative.id]);
    assert_eq!(assert_ok!(engine.promote_expired_bump_windows(day_after).await), 1);
    let promoted = engine.get_reservation(&tentative.id).await.unwrap();
    assert_eq!(promoted.status, ReservationStatus::Confirmed);
    assert_eq!(promoted.last_modified_by, "system");

    let entries = drain(&mut audit);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].actor, "system");
    assert_eq!(entries[0].action, AuditAction::ReservationApproved);
    assert_eq!(entries[0].target_id, tentative.id);

    assert_eq!(assert_ok!(engine.promote_expired_bump_windows(day_after).await), 0);
    assert!(!assert_ok!(engine.promote_reservation(tentative.id, day_after).await));
    assert!(drain(&mut audit).is_empty());
}

#[tokio::test]
async fn past_reservations_complete() {
    let path = test_path("complete.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Kagiso").await;
    let date = wednesday_ahead(&engine);

    let confirmed = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member).await);
    let pending = assert_ok!(engine.create_reservation(request(hh.id, Facility::Leobo, date, 18, 20), &member).await);

    assert_eq!(assert_ok!(engine.complete_past_reservations(date).await), 0);
    assert_eq!(assert_ok!(engine.complete_past_reservations(add_days(date, 1)).await), 1);
    assert_eq!(
        engine.get_reservation(&confirmed.reservation.id).await.unwrap().status,
        ReservationStatus::Completed
    );
    assert_eq!(
        engine.get_reservation(&pending.reservation.id).await.unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(assert_ok!(engine.complete_past_reservations(add_days(date, 1)).await), 0);
}

#[tokio::test]
async fn guest_list_reminder_day_before_deadline() {
    let path = test_path("reminders.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Tumelo").await;
    let date = wednesday_ahead(&engine);
    let mut req = request(hh.id, Facility::Leobo, date, 18, 22);
    req.has_guests = true;
    req.guest_count = 8;
    let r = assert_ok!(engine.create_reservation(req, &member).await).reservation;
    let deadline = r.guest_list_deadline.unwrap();
    let mut notes = engine.notify.subscribe_notifications();

    assert_eq!(engine.guest_list_reminders(add_days(deadline, -2)).await, 0);
    assert_eq!(engine.guest_list_reminders(add_days(deadline, -1)).await, 1);
    let sent = drain(&mut notes);
    assert_eq!(templates(&sent), vec![Template::GuestListReminder]);
    assert_eq!(sent[0].recipients, vec!["tumelo@example.org".to_string()]);

    assert_ok!(engine.submit_guest_list(r.id, &member).await);
    assert_eq!(engine.guest_list_reminders(add_days(deadline, -1)).await, 0);
}

#[tokio::test]
async fn memberships_remind_then_expire() {
    let path = test_path("memberships.journal");
    let engine = open(&path);
    let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
    let (soon, _) = register_with(&engine, "Soon", Relationship::Primary, Some(add_days(today, 30))).await;
    let (week, _) = register_with(&engine, "Week", Relationship::Primary, Some(add_days(today, 7))).await;
    let (expired, _) = register_with(&engine, "Expired", Relationship::Primary, Some(today)).await;
    let (lapsed, _) = register_with(&engine, "Lapsed", Relationship::Primary, Some(add_days(today, -3))).await;
    let mut notes = engine.notify.subscribe_notifications();

    let sweep = assert_ok!(engine.expire_memberships(today).await);
    assert_eq!(sweep, MembershipSweep { reminders_sent: 2, deactivated: 2 });
    let mut sent: Vec<(Template, String)> = drain(&mut notes)
        .into_iter()
        .map(|n| (n.template, n.recipients[0].clone()))
        .collect();
    sent.sort_by(|a, b| (a.0.key(), &a.1).cmp(&(b.0.key(), &b.1)));
    assert_eq!(
        sent,
        vec![
            (Template::RenewalReminder30, "soon@example.org".to_string()),
            (Template::RenewalReminder7, "week@example.org".to_string()),
            (Template::MembershipExpired, "expired@example.org".to_string()),
            (Template::MembershipExpired, "lapsed@example.org".to_string()),
        ]
    );
    assert!(engine.get_household(&soon.id).unwrap().active);
    assert!(engine.get_household(&week.id).unwrap().active);
    assert!(!engine.get_household(&expired.id).unwrap().active);
    assert!(!engine.get_household(&lapsed.id).unwrap().active);

    let again = assert_ok!(engine.expire_memberships(today).await);
    assert_eq!(again.deactivated, 0);
}

#[tokio::test]
async fn daily_summary_lists_day_excluding_staff_and_cancelled() {
    let path = test_path("summary.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Moremi").await;
    engine
        .save_member(
            Member {
                id: Ulid::new(),
                household_id: hh.id,
                first_name: "Thato".into(),
                last_name: "Moremi".into(),
                email: None,
                relationship: Relationship::Child,
                date_of_birth: NaiveDate::from_ymd_opt(2016, 1, 10),
                active: true,
                last_modified: Utc::now(),
            },
            &board(),
        )
        .await
        .unwrap();
    engine
        .save_member(
            Member {
                id: Ulid::new(),
                household_id: hh.id,
                first_name: "Onkemetse".into(),
                last_name: "Staff".into(),
                email: None,
                relationship: Relationship::Staff,
                date_of_birth: None,
                active: true,
                last_modified: Utc::now(),
            },
            &board(),
        )
        .await
        .unwrap();
    let date = wednesday_ahead(&engine);

    let mut party = request(hh.id, Facility::Leobo, date, 18, 22);
    party.has_guests = true;
    party.guest_count = 15;
    assert_ok!(engine.create_reservation(party, &member).await);
    let morning = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 7, 8), &member).await);
    let dropped = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member).await);
    assert_ok!(engine.cancel_reservation(dropped.reservation.id, &member, None).await);
    let mut notes = engine.notify.subscribe_notifications();

    let summary = engine.send_daily_summary(date).await;
    assert_eq!(summary.entries.len(), 2);
    assert_eq!(summary.entries[0].reservation.id, morning.reservation.id);
    assert_eq!(summary.total_guests, 15);
    assert_eq!(summary.total_members, 4);
    assert_eq!(summary.entries[0].attending.len(), 2);
    assert!(summary.entries[0].attending.iter().all(|a| !a.contains("Onkemetse")));
    assert!(summary.entries[0].attending[1].contains("(age "));

    let sent = drain(&mut notes);
    assert_eq!(templates(&sent), vec![Template::DailySummary]);
    assert_eq!(sent[0].recipients, vec![engine.contacts().rso.clone()]);
    assert_eq!(sent[0].vars["TOTAL_RESERVATIONS"], "2");
    assert_eq!(sent[0].vars["IF_NO_RESERVATIONS"], "");
    assert!(sent[0].vars["RESERVATIONS_BLOCK"].contains("--- RESERVATION #2 ---"));

    let empty = engine.daily_summary(add_days(date, 1)).await;
    assert!(empty.entries.is_empty());
    assert_eq!(empty.render_block(), "");
}

// ── Concurrency ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_for_one_slot_admit_one() {
    let path = test_path("concurrent.journal");
    let engine = Arc::new(open(&path));
    let mut households = Vec::new();
    for i in 0..8 {
        households.push(register(&engine, &format!("Racer{i}")).await);
    }
    let date = wednesday_ahead(&engine);

    let mut handles = Vec::new();
    for (hh, member) in households {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(request(hh.id, Facility::Tennis, date, 9, 10), &member)
                .await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::Conflict(Facility::Tennis)), "{e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(engine.reservations_on(date).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_respect_weekly_quota() {
    let path = test_path("concurrent_quota.journal");
    let engine = Arc::new(open(&path));
    let (hh, member) = register(&engine, "Quota").await;
    let date = wednesday_ahead(&engine);

    let mut handles = Vec::new();
    for hour in 6..12 {
        let engine = engine.clone();
        let member = member.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(request(hh.id, Facility::Tennis, date, hour, hour + 1), &member)
                .await
        }));
    }
    for h in handles {
        assert_ok!(h.await.unwrap());
    }
    // Three one-hour bookings fit the quota; the rest are excess.
    let all = engine.household_reservations(hh.id).await;
    assert_eq!(all.iter().filter(|r| r.status == ReservationStatus::Confirmed).count(), 3);
    assert_eq!(all.iter().filter(|r| r.is_excess).count(), 3);
}

// ── Persistence ──────────────────────────────────────────────────

#[tokio::test]
async fn state_survives_replay() {
    let path = test_path("replay.journal");
    let (hh, r_id, date) = {
        let engine = open(&path);
        let (hh, member) = register(&engine, "Replay").await;
        let date = wednesday_ahead(&engine);
        let r = assert_ok!(engine.create_reservation(request(hh.id, Facility::Leobo, date, 18, 20), &member).await);
        assert_ok!(engine.approve_reservation(r.reservation.id, &board(), Some("fine")).await);
        (hh, r.reservation.id, date)
    };
    // Let the writer task observe the closed channel.
    tokio::task::yield_now().await;

    let engine = open(&path);
    assert_eq!(engine.get_household(&hh.id).unwrap().name, "Replay");
    assert_eq!(engine.household_members(&hh.id).len(), 1);
    assert_eq!(engine.primary_email(&hh.id).as_deref(), Some("replay@example.org"));
    let r = engine.get_reservation(&r_id).await.unwrap();
    assert_eq!(r.status, ReservationStatus::Confirmed);
    assert_eq!(r.approved.and_then(|d| d.note).as_deref(), Some("fine"));
    assert!(engine.has_conflict(Facility::Leobo, at(date, 19, 0), at(date, 21, 0)).await.unwrap());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn failed_journal_write_leaves_state_untouched() {
    // Reads back empty, every write fails with ENOSPC.
    let engine = open(&PathBuf::from("/dev/full"));
    let household = Household {
        id: Ulid::new(),
        name: "Tau".into(),
        membership_type: "Full".into(),
        active: true,
        expiration_date: None,
        last_modified: Utc::now(),
    };
    let member = Member {
        id: Ulid::new(),
        household_id: household.id,
        first_name: "Tau".into(),
        last_name: "Family".into(),
        email: Some("tau@example.org".into()),
        relationship: Relationship::Primary,
        date_of_birth: None,
        active: true,
        last_modified: Utc::now(),
    };
    let err = assert_err!(engine.save_household(household.clone(), &board()).await);
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert!(engine.directory.household(&household.id).is_none());

    engine.directory.apply(&Event::HouseholdSaved { household: household.clone() });
    engine.directory.apply(&Event::MemberSaved { member });
    let actor = Actor::member("tau@example.org", household.id);
    let date = wednesday_ahead(&engine);

    for _ in 0..2 {
        let err = assert_err!(
            engine
                .create_reservation(request(household.id, Facility::Tennis, date, 9, 10), &actor)
                .await
        );
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert_eq!(err.public_message(), PERSISTENCE_MESSAGE);
    }
    assert!(engine.reservations_on(date).await.is_empty());
    assert!(engine.household_reservations(household.id).await.is_empty());
    assert!(!assert_ok!(engine.has_conflict(Facility::Tennis, at(date, 9, 0), at(date, 10, 0)).await));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_path("compaction.journal");
    let (hh, ids) = {
        let engine = open(&path);
        let (hh, member) = register(&engine, "Compact").await;
        let date = wednesday_ahead(&engine);
        let mut ids = Vec::new();
        for hour in [7, 9, 11] {
            let r = assert_ok!(engine.create_reservation(request(hh.id, Facility::Tennis, date, hour, hour + 1), &member).await);
            ids.push(r.reservation.id);
        }
        assert_ok!(engine.cancel_reservation(ids[1], &member, None).await);
        assert!(engine.journal_appends_since_compact().await >= 6);

        assert_ok!(engine.compact_journal().await);
        assert_eq!(engine.journal_appends_since_compact().await, 0);
        (hh, ids)
    };
    tokio::task::yield_now().await;

    let engine = open(&path);
    assert_eq!(engine.household_reservations(hh.id).await.len(), 3);
    assert_eq!(
        engine.get_reservation(&ids[1]).await.unwrap().status,
        ReservationStatus::Cancelled
    );
    assert_eq!(engine.get_reservation(&ids[0]).await.unwrap().status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn replacing_holidays_moves_new_deadlines() {
    use crate::calendar::{Holiday, HolidayCalendar, HolidayKind};

    let path = test_path("holidays.journal");
    let engine = open(&path);
    let (hh, member) = register(&engine, "Holiday").await;
    let date = wednesday_ahead(&engine);
    let before = engine.holidays().await.business_day_deadline(date, 3);

    engine
        .replace_holidays(HolidayCalendar::new([Holiday {
            date: before,
            name: "Observed".into(),
            kind: HolidayKind::OneOff,
            active: true,
        }]))
        .await;

    let mut req = request(hh.id, Facility::Leobo, date, 18, 22);
    req.has_guests = true;
    req.guest_count = 2;
    let r = assert_ok!(engine.create_reservation(req, &member).await);
    let after = r.reservation.guest_list_deadline.unwrap();
    assert!(after < before);
    assert!(engine.holidays().await.is_business_day(after));
}
