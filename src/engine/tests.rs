use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::FutureExt;
use tokio_test::assert_ok;
use ulid::Ulid;

use super::*;
use crate::clock::ManualClock;
use crate::membership::{MEMBERSHIP_EXPIRED, MEMBERSHIP_NOT_FOUND};
use crate::model::fixtures;
use crate::model::*;
use crate::notify::BookingEvent;
use crate::store::{BookingRepository, StoreOptions, WalStore};

const T0: Ms = 1_709_251_200_000; // 2024-03-01T00:00:00Z
const ORG: &str = "gym";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("turnstile_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Harness {
    store: Arc<WalStore>,
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn open(name: &str) -> Self {
        Self::open_with(name, StoreOptions::default())
    }

    fn open_with(name: &str, options: StoreOptions) -> Self {
        let store = Arc::new(WalStore::open(ORG, test_wal_path(name), options).unwrap());
        let clock = Arc::new(ManualClock::new(T0));
        let engine = Arc::new(Engine::over_store(store.clone(), clock.clone(), Arc::new(NotifyHub::new())));
        Self { store, engine, clock }
    }

    /// A member with an open-ended active membership.
    async fn member(&self) -> Ulid {
        let id = Ulid::new();
        self.store
            .set_membership(Membership {
                member_id: id,
                status: MembershipStatus::Active,
                valid_from: 0,
                valid_until: None,
            })
            .await
            .unwrap();
        id
    }

    async fn schedule(&self, class: ClassSession) -> ClassSession {
        self.engine.schedule_class(class).await.unwrap()
    }

    /// Class starting a day after T0.
    async fn class(&self, capacity: u32, waitlist_capacity: Option<u32>) -> ClassSession {
        let mut class = fixtures::class(T0 + 24 * HOUR_MS, capacity);
        if let Some(cap) = waitlist_capacity {
            class.waitlist_enabled = true;
            class.waitlist_capacity = cap;
        }
        self.schedule(class).await
    }

    async fn reserve(&self, class_id: Ulid, member_id: Ulid) -> Result<Booking, AdmissionError> {
        self.engine.reserve(ORG, class_id, member_id, Actor::Staff).await
    }

    fn confirmed_count(&self, class_id: Ulid) -> u32 {
        self.engine.get_class(ORG, class_id).unwrap().confirmed_count
    }

    fn booking(&self, class_id: Ulid, booking_id: Ulid) -> Booking {
        self.engine
            .list_bookings(ORG, class_id)
            .unwrap()
            .into_iter()
            .find(|b| b.id == booking_id)
            .unwrap()
    }

    fn positions(&self, class_id: Ulid) -> Vec<(Ulid, u32)> {
        self.engine
            .waitlist(ORG, class_id)
            .unwrap()
            .iter()
            .map(|b| (b.id, b.waitlist_position.unwrap()))
            .collect()
    }
}

fn ms(rfc3339: &str) -> Ms {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .timestamp_millis()
}

// ── Reference scenarios ──────────────────────────────────

#[tokio::test]
async fn cancel_promotes_waitlist_head() {
    let h = Harness::open("scenario_a.wal");
    let class = h.class(1, Some(1)).await;
    let (a, b) = (h.member().await, h.member().await);

    let booking_a = h.reserve(class.id, a).await.unwrap();
    assert_eq!(booking_a.status, BookingStatus::Confirmed);
    assert_eq!(booking_a.waitlist_position, None);

    let booking_b = h.reserve(class.id, b).await.unwrap();
    assert_eq!(booking_b.status, BookingStatus::Waitlist);
    assert_eq!(booking_b.waitlist_position, Some(1));

    let outcome = h.engine.cancel(ORG, booking_a.id, Actor::Member(a), None).await.unwrap();
    assert_eq!(outcome.cancelled.status, BookingStatus::Cancelled);
    let promoted = outcome.promoted.unwrap();
    assert_eq!(promoted.id, booking_b.id);
    assert_eq!(promoted.status, BookingStatus::Confirmed);
    assert_eq!(promoted.waitlist_position, None);

    assert_eq!(h.confirmed_count(class.id), 1);
    assert_eq!(h.booking(class.id, booking_b.id).status, BookingStatus::Confirmed);
    assert!(h.positions(class.id).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_fill_exactly_to_capacity() {
    let h = Harness::open("scenario_b.wal");
    let class = h.class(2, None).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let member = h.member().await;
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.reserve(ORG, class.id, member, Actor::Staff).await
        }));
    }

    let mut confirmed = 0;
    let mut full = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(b) => {
                assert_eq!(b.status, BookingStatus::Confirmed);
                confirmed += 1;
            }
            Err(AdmissionError::ClassFull) => full += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((confirmed, full), (2, 1));
    assert_eq!(h.confirmed_count(class.id), 2);
    assert_eq!(h.engine.list_bookings(ORG, class.id).unwrap().len(), 2);
}

#[tokio::test]
async fn daily_limit_buckets_by_organization_timezone() {
    let h = Harness::open("scenario_c.wal");
    h.store.configure_limits(Some(2), "America/Mexico_City").await.unwrap();
    let member = h.member().await;

    let morning = h.schedule(fixtures::class(ms("2024-03-01T14:00:00Z"), 10)).await;
    // 21:30 local on March 1st, already March 2nd in UTC.
    let late = h.schedule(fixtures::class(ms("2024-03-02T03:30:00Z"), 10)).await;
    // 17:50 local on March 1st.
    let evening = h.schedule(fixtures::class(ms("2024-03-01T23:50:00Z"), 10)).await;
    // 09:00 local on March 2nd.
    let tomorrow = h.schedule(fixtures::class(ms("2024-03-02T15:00:00Z"), 10)).await;

    assert_ok!(h.reserve(morning.id, member).await);
    assert_ok!(h.reserve(late.id, member).await);

    let err = h.reserve(evening.id, member).await.unwrap_err();
    assert_eq!(
        err,
        AdmissionError::DailyLimitReached {
            limit: 2,
            current_count: 2,
            target_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }
    );
    assert!(h.engine.list_bookings(ORG, evening.id).unwrap().is_empty());

    let next_day = assert_ok!(h.reserve(tomorrow.id, member).await);
    assert_eq!(next_day.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn daily_limit_frees_up_after_cancellation() {
    let h = Harness::open("daily_cancel.wal");
    h.store.configure_limits(Some(1), "UTC").await.unwrap();
    let member = h.member().await;
    let first = h.schedule(fixtures::class(T0 + 10 * HOUR_MS, 5)).await;
    let second = h.schedule(fixtures::class(T0 + 12 * HOUR_MS, 5)).await;

    let booking = h.reserve(first.id, member).await.unwrap();
    assert!(matches!(
        h.reserve(second.id, member).await,
        Err(AdmissionError::DailyLimitReached { .. })
    ));

    h.engine.cancel(ORG, booking.id, Actor::Staff, None).await.unwrap();
    assert_ok!(h.reserve(second.id, member).await);
}

#[tokio::test]
async fn closed_window_writes_nothing() {
    let h = Harness::open("scenario_d.wal");
    let mut class = fixtures::class(T0 + 2 * HOUR_MS, 5);
    class.booking_closes_minutes = 30;
    let class = h.schedule(class).await;
    let member = h.member().await;

    h.clock.set(class.start_time - 29 * MINUTE_MS);
    let err = h.reserve(class.id, member).await.unwrap_err();
    assert_eq!(
        err,
        AdmissionError::BookingWindowClosed {
            closes_at: class.start_time - 30 * MINUTE_MS
        }
    );
    assert!(h.engine.list_bookings(ORG, class.id).unwrap().is_empty());
    assert_eq!(h.confirmed_count(class.id), 0);

    h.clock.set(class.start_time);
    assert_eq!(
        h.reserve(class.id, member).await.unwrap_err(),
        AdmissionError::ClassAlreadyStarted
    );
}

// ── Admission order ──────────────────────────────────────

#[tokio::test]
async fn window_not_yet_open_reports_time_remaining() {
    let h = Harness::open("not_open.wal");
    let mut class = fixtures::class(T0 + 72 * HOUR_MS, 5);
    class.booking_opens_hours = Some(48);
    let class = h.schedule(class).await;
    let member = h.member().await;

    let err = h.reserve(class.id, member).await.unwrap_err();
    assert_eq!(
        err,
        AdmissionError::BookingWindowNotYetOpen {
            opens_at: T0 + 24 * HOUR_MS,
            hours_until_open: 24,
            days_until_open: 1,
        }
    );
    assert_eq!(err.localized(Locale::En), "Booking opens in 1 day.");

    h.clock.set(T0 + 23 * HOUR_MS + 30 * MINUTE_MS);
    assert!(matches!(
        h.reserve(class.id, member).await,
        Err(AdmissionError::BookingWindowNotYetOpen { hours_until_open: 1, .. })
    ));

    h.clock.set(T0 + 24 * HOUR_MS);
    assert_ok!(h.reserve(class.id, member).await);
}

#[tokio::test]
async fn membership_gate_rejects_without_writing() {
    let h = Harness::open("membership.wal");
    let class = h.class(5, None).await;

    let stranger = Ulid::new();
    match h.reserve(class.id, stranger).await {
        Err(AdmissionError::MembershipInvalid { code, .. }) => assert_eq!(code, MEMBERSHIP_NOT_FOUND),
        other => panic!("expected membership_invalid, got {other:?}"),
    }

    let lapsed = Ulid::new();
    h.store
        .set_membership(Membership {
            member_id: lapsed,
            status: MembershipStatus::Active,
            valid_from: 0,
            valid_until: Some(class.start_time - HOUR_MS),
        })
        .await
        .unwrap();
    match h.reserve(class.id, lapsed).await {
        Err(AdmissionError::MembershipInvalid { code, .. }) => assert_eq!(code, MEMBERSHIP_EXPIRED),
        other => panic!("expected membership_invalid, got {other:?}"),
    }
    assert!(h.engine.list_bookings(ORG, class.id).unwrap().is_empty());
}

#[tokio::test]
async fn unknown_and_cancelled_classes_are_unavailable() {
    let h = Harness::open("unavailable.wal");
    let member = h.member().await;
    let missing = Ulid::new();
    assert_eq!(
        h.reserve(missing, member).await.unwrap_err(),
        AdmissionError::ClassUnavailable(missing)
    );

    let class = h.class(5, None).await;
    let kept = h.reserve(class.id, member).await.unwrap();
    h.engine.cancel_class(ORG, class.id).await.unwrap();
    let other = h.member().await;
    assert_eq!(
        h.reserve(class.id, other).await.unwrap_err(),
        AdmissionError::ClassUnavailable(class.id)
    );
    // History is kept.
    assert_eq!(h.booking(class.id, kept.id).status, BookingStatus::Confirmed);
    assert!(h.engine.get_class(ORG, class.id).unwrap().is_cancelled);

    assert_eq!(
        h.engine.cancel_class("other_gym", class.id).await.unwrap_err(),
        AdmissionError::ClassUnavailable(class.id)
    );
}

#[tokio::test]
async fn one_active_booking_per_member() {
    let h = Harness::open("double_book.wal");
    let class = h.class(5, Some(5)).await;
    let member = h.member().await;

    let first = h.reserve(class.id, member).await.unwrap();
    assert_eq!(
        h.reserve(class.id, member).await.unwrap_err(),
        AdmissionError::AlreadyBooked {
            status: BookingStatus::Confirmed
        }
    );

    // Cancelled bookings do not block a new one.
    h.engine.cancel(ORG, first.id, Actor::Staff, None).await.unwrap();
    let again = h.reserve(class.id, member).await.unwrap();
    assert_ne!(again.id, first.id);
    assert_eq!(h.confirmed_count(class.id), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_double_booking_admits_once() {
    let h = Harness::open("double_book_race.wal");
    let class = h.class(10, None).await;
    let member = h.member().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.reserve(ORG, class.id, member, Actor::Member(member)).await
        }));
    }
    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(AdmissionError::AlreadyBooked { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(h.confirmed_count(class.id), 1);
}

#[tokio::test]
async fn full_class_versus_full_waitlist() {
    let h = Harness::open("full.wal");
    let no_waitlist = h.class(1, None).await;
    let small_waitlist = h.class(1, Some(1)).await;

    h.reserve(no_waitlist.id, h.member().await).await.unwrap();
    assert_eq!(
        h.reserve(no_waitlist.id, h.member().await).await.unwrap_err(),
        AdmissionError::ClassFull
    );

    h.reserve(small_waitlist.id, h.member().await).await.unwrap();
    h.reserve(small_waitlist.id, h.member().await).await.unwrap();
    assert_eq!(
        h.reserve(small_waitlist.id, h.member().await).await.unwrap_err(),
        AdmissionError::WaitlistFull
    );
}

// ── Concurrency invariants ───────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_and_waitlist_hold_under_load() {
    let h = Harness::open("load.wal");
    let class = h.class(5, Some(3)).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let member = h.member().await;
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.reserve(ORG, class.id, member, Actor::Member(member)).await
        }));
    }

    let (mut confirmed, mut waitlisted, mut rejected) = (0, 0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(b) if b.status == BookingStatus::Confirmed => confirmed += 1,
            Ok(_) => waitlisted += 1,
            Err(AdmissionError::WaitlistFull) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((confirmed, waitlisted, rejected), (5, 3, 12));
    assert_eq!(h.confirmed_count(class.id), 5);
    let positions: Vec<u32> = h.positions(class.id).iter().map(|(_, p)| *p).collect();
    assert_eq!(positions, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancellations_promote_each_head_once() {
    let h = Harness::open("promote_race.wal");
    let class = h.class(3, Some(10)).await;

    let mut seated = Vec::new();
    for _ in 0..3 {
        seated.push(h.reserve(class.id, h.member().await).await.unwrap());
    }
    let mut waiting = Vec::new();
    for _ in 0..5 {
        waiting.push(h.reserve(class.id, h.member().await).await.unwrap());
    }

    let mut handles = Vec::new();
    for booking in &seated {
        let engine = h.engine.clone();
        let id = booking.id;
        handles.push(tokio::spawn(async move { engine.cancel(ORG, id, Actor::Staff, None).await }));
    }
    let mut promoted = Vec::new();
    for handle in handles {
        promoted.push(handle.await.unwrap().unwrap().promoted.unwrap().id);
    }
    promoted.sort();
    let mut expected: Vec<Ulid> = waiting[..3].iter().map(|b| b.id).collect();
    expected.sort();
    assert_eq!(promoted, expected);

    assert_eq!(h.confirmed_count(class.id), 3);
    assert_eq!(h.positions(class.id), vec![(waiting[3].id, 1), (waiting[4].id, 2)]);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn waitlist_stays_contiguous() {
    let h = Harness::open("contiguous.wal");
    let class = h.class(1, Some(5)).await;

    let seated = h.reserve(class.id, h.member().await).await.unwrap();
    let b = h.reserve(class.id, h.member().await).await.unwrap();
    let c = h.reserve(class.id, h.member().await).await.unwrap();
    let d = h.reserve(class.id, h.member().await).await.unwrap();
    assert_eq!(h.positions(class.id), vec![(b.id, 1), (c.id, 2), (d.id, 3)]);

    let outcome = h.engine.cancel(ORG, c.id, Actor::Staff, None).await.unwrap();
    assert!(outcome.promoted.is_none());
    assert_eq!(h.positions(class.id), vec![(b.id, 1), (d.id, 2)]);
    assert_eq!(h.confirmed_count(class.id), 1);

    let outcome = h.engine.cancel(ORG, seated.id, Actor::Staff, None).await.unwrap();
    assert_eq!(outcome.promoted.unwrap().id, b.id);
    assert_eq!(h.positions(class.id), vec![(d.id, 1)]);

    // A newcomer joins at the tail.
    let e = h.reserve(class.id, h.member().await).await.unwrap();
    assert_eq!(e.waitlist_position, Some(2));
}

#[tokio::test]
async fn cancelling_twice_is_already_final() {
    let h = Harness::open("already_final.wal");
    let class = h.class(1, Some(2)).await;
    let member = h.member().await;
    let booking = h.reserve(class.id, member).await.unwrap();
    let waiting = h.reserve(class.id, h.member().await).await.unwrap();

    h.engine
        .cancel(ORG, booking.id, Actor::Member(member), Some("injured"))
        .await
        .unwrap();
    let before = h.engine.list_bookings(ORG, class.id).unwrap();

    assert_eq!(
        h.engine.cancel(ORG, booking.id, Actor::Member(member), None).await.unwrap_err(),
        AdmissionError::AlreadyFinal(BookingStatus::Cancelled)
    );
    assert_eq!(h.engine.list_bookings(ORG, class.id).unwrap(), before);

    let stored = h.booking(class.id, booking.id);
    assert_eq!(stored.cancellation_reason.as_deref(), Some("injured"));
    assert_eq!(stored.cancelled_at, Some(T0));
    assert_eq!(h.booking(class.id, waiting.id).status, BookingStatus::Confirmed);
    assert_eq!(h.confirmed_count(class.id), 1);
}

#[tokio::test]
async fn members_act_only_on_their_own_bookings() {
    let h = Harness::open("forbidden.wal");
    let class = h.class(5, None).await;
    let (owner, intruder) = (h.member().await, h.member().await);

    assert_eq!(
        h.engine
            .reserve(ORG, class.id, owner, Actor::Member(intruder))
            .await
            .unwrap_err(),
        AdmissionError::Forbidden
    );

    let booking = h.engine.reserve(ORG, class.id, owner, Actor::Member(owner)).await.unwrap();
    assert_eq!(
        h.engine
            .cancel(ORG, booking.id, Actor::Member(intruder), None)
            .await
            .unwrap_err(),
        AdmissionError::Forbidden
    );
    assert_eq!(h.booking(class.id, booking.id).status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn cancellation_deadline_binds_members_not_staff() {
    let h = Harness::open("deadline.wal");
    let mut class = fixtures::class(T0 + 3 * HOUR_MS, 5);
    class.cancellation_deadline_hours = 2;
    let class = h.schedule(class).await;
    let (a, b) = (h.member().await, h.member().await);
    let booking_a = h.reserve(class.id, a).await.unwrap();
    let booking_b = h.reserve(class.id, b).await.unwrap();

    // Deadline is T0+1h and is inclusive.
    h.clock.set(T0 + HOUR_MS);
    assert_ok!(h.engine.cancel(ORG, booking_a.id, Actor::Member(a), None).await);

    h.clock.set(T0 + 90 * MINUTE_MS);
    assert_eq!(
        h.engine.cancel(ORG, booking_b.id, Actor::Member(b), None).await.unwrap_err(),
        AdmissionError::CancellationDeadlinePassed {
            deadline: T0 + HOUR_MS
        }
    );
    let outcome = h.engine.cancel(ORG, booking_b.id, Actor::Staff, None).await.unwrap();
    assert_eq!(outcome.cancelled.status, BookingStatus::Cancelled);
    assert_eq!(h.confirmed_count(class.id), 0);
}

#[tokio::test]
async fn cancel_rejects_unknown_and_foreign_bookings() {
    let h = Harness::open("cancel_unknown.wal");
    let missing = Ulid::new();
    assert_eq!(
        h.engine.cancel(ORG, missing, Actor::Staff, None).await.unwrap_err(),
        AdmissionError::BookingNotFound(missing)
    );

    let class = h.class(5, None).await;
    let booking = h.reserve(class.id, h.member().await).await.unwrap();
    assert_eq!(
        h.engine.cancel("other_gym", booking.id, Actor::Staff, None).await.unwrap_err(),
        AdmissionError::BookingNotFound(booking.id)
    );

    let long = "x".repeat(crate::limits::MAX_REASON_LEN + 1);
    assert!(matches!(
        h.engine.cancel(ORG, booking.id, Actor::Staff, Some(&long)).await,
        Err(AdmissionError::LimitExceeded(_))
    ));
}

// ── Attendance ───────────────────────────────────────────

#[tokio::test]
async fn attendance_transitions() {
    let h = Harness::open("attendance.wal");
    let class = h.class(2, Some(2)).await;
    let present = h.reserve(class.id, h.member().await).await.unwrap();
    let absent = h.reserve(class.id, h.member().await).await.unwrap();
    let waiting = h.reserve(class.id, h.member().await).await.unwrap();

    h.clock.set(class.start_time + 5 * MINUTE_MS);
    let checked = h.engine.check_in(ORG, present.id).await.unwrap();
    assert_eq!(checked.status, BookingStatus::Attended);
    assert_eq!(checked.checked_in_at, Some(class.start_time + 5 * MINUTE_MS));

    let missed = h.engine.mark_no_show(ORG, absent.id).await.unwrap();
    assert_eq!(missed.status, BookingStatus::NoShow);

    assert_eq!(
        h.engine.check_in(ORG, present.id).await.unwrap_err(),
        AdmissionError::InvalidTransition {
            from: BookingStatus::Attended,
            to: BookingStatus::Attended
        }
    );
    assert_eq!(
        h.engine.check_in(ORG, waiting.id).await.unwrap_err(),
        AdmissionError::InvalidTransition {
            from: BookingStatus::Waitlist,
            to: BookingStatus::Attended
        }
    );
    assert_eq!(
        h.engine.cancel(ORG, absent.id, Actor::Staff, None).await.unwrap_err(),
        AdmissionError::AlreadyFinal(BookingStatus::NoShow)
    );

    // Attended and no-show bookings keep their seats.
    assert_eq!(h.confirmed_count(class.id), 2);
    assert_eq!(h.positions(class.id), vec![(waiting.id, 1)]);
}

// ── Scheduling ───────────────────────────────────────────

#[tokio::test]
async fn schedule_class_validates_and_resets_counters() {
    let h = Harness::open("schedule.wal");

    let mut zero = fixtures::class(T0 + HOUR_MS, 0);
    assert!(matches!(
        h.engine.schedule_class(zero.clone()).await,
        Err(AdmissionError::InvalidClass(_))
    ));
    zero.capacity = 1;
    zero.end_time = zero.start_time;
    assert!(matches!(
        h.engine.schedule_class(zero).await,
        Err(AdmissionError::InvalidClass(_))
    ));

    let mut ancient = fixtures::class(1_000, 1);
    ancient.end_time = 2_000;
    assert!(matches!(
        h.engine.schedule_class(ancient).await,
        Err(AdmissionError::LimitExceeded(_))
    ));

    let mut inverted = fixtures::class(T0 + 10 * HOUR_MS, 1);
    inverted.booking_opens_hours = Some(1);
    inverted.booking_closes_minutes = 120;
    assert!(matches!(
        h.engine.schedule_class(inverted).await,
        Err(AdmissionError::InvalidClass(_))
    ));

    let mut dirty = fixtures::class(T0 + HOUR_MS, 3);
    dirty.confirmed_count = 7;
    dirty.is_cancelled = true;
    let scheduled = h.engine.schedule_class(dirty.clone()).await.unwrap();
    assert_eq!(scheduled.confirmed_count, 0);
    assert!(!scheduled.is_cancelled);
    assert_eq!(h.engine.get_class(ORG, dirty.id), Some(scheduled));

    assert_eq!(
        h.engine.schedule_class(dirty.clone()).await.unwrap_err(),
        AdmissionError::ClassAlreadyExists(dirty.id)
    );
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn committed_transitions_are_published() {
    let h = Harness::open("notify.wal");
    let class = h.class(1, Some(1)).await;
    let mut rx = h.engine.notify.subscribe(class.id);
    let mut firehose = h.engine.notify.subscribe_all();

    let a = h.reserve(class.id, h.member().await).await.unwrap();
    let b = h.reserve(class.id, h.member().await).await.unwrap();
    // Rejections publish nothing.
    assert!(h.reserve(class.id, h.member().await).await.is_err());
    h.engine.cancel(ORG, a.id, Actor::Staff, None).await.unwrap();
    h.engine.check_in(ORG, b.id).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.booking().class_id, class.id);
        kinds.push(match event {
            BookingEvent::Admitted { .. } => "admitted",
            BookingEvent::Waitlisted { .. } => "waitlisted",
            BookingEvent::Cancelled { .. } => "cancelled",
            BookingEvent::Promoted { .. } => "promoted",
            BookingEvent::CheckedIn { .. } => "checked_in",
            BookingEvent::MarkedNoShow { .. } => "no_show",
        });
    }
    assert_eq!(kinds, vec!["admitted", "waitlisted", "cancelled", "promoted", "checked_in"]);

    match firehose.recv().await.unwrap() {
        BookingEvent::Admitted { booking } => assert_eq!(booking.id, a.id),
        other => panic!("expected admitted, got {other:?}"),
    }
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_is_rebuilt_from_the_wal() {
    let class_id;
    let (seated, waiting, cancelled);
    let before;
    {
        let h = Harness::open("replay.wal");
        let class = h.class(1, Some(3)).await;
        class_id = class.id;
        let first = h.reserve(class.id, h.member().await).await.unwrap();
        seated = h.reserve(class.id, h.member().await).await.unwrap();
        cancelled = h.reserve(class.id, h.member().await).await.unwrap();
        waiting = h.reserve(class.id, h.member().await).await.unwrap();
        h.engine.cancel(ORG, first.id, Actor::Staff, None).await.unwrap();
        h.engine.cancel(ORG, cancelled.id, Actor::Staff, Some("travel")).await.unwrap();
        before = h.engine.list_bookings(ORG, class.id).unwrap();
    }

    let store = Arc::new(WalStore::open(ORG, existing_wal_path("replay.wal"), StoreOptions::default()).unwrap());
    let engine = Engine::with_system_clock(store.clone());
    assert_eq!(engine.list_bookings(ORG, class_id).unwrap(), before);
    assert_eq!(engine.get_class(ORG, class_id).unwrap().confirmed_count, 1);
    let queue: Vec<(Ulid, Option<u32>)> = engine
        .waitlist(ORG, class_id)
        .unwrap()
        .iter()
        .map(|b| (b.id, b.waitlist_position))
        .collect();
    assert_eq!(queue, vec![(waiting.id, Some(1))]);

    assert_eq!(store.class_for_booking(&seated.id), Some(class_id));
    let reason = store
        .class_snapshot(&class_id)
        .and_then(|state| state.booking(&cancelled.id).cloned())
        .and_then(|b| b.cancellation_reason);
    assert_eq!(reason.as_deref(), Some("travel"));

    store.compact().await.unwrap();
    let compacted = WalStore::open(ORG, existing_wal_path("replay.wal"), StoreOptions::default()).unwrap();
    assert_eq!(compacted.class_snapshot(&class_id).unwrap().bookings, before);
}

#[tokio::test]
async fn expired_commit_surfaces_timeout_and_writes_nothing() {
    let path = test_wal_path("expired.wal");
    let class = fixtures::class(T0 + 24 * HOUR_MS, 5);
    let member = Ulid::new();
    {
        let seed = WalStore::open(ORG, path.clone(), StoreOptions::default()).unwrap();
        seed.insert_class(class.clone()).await.unwrap();
        seed.set_membership(Membership {
            member_id: member,
            status: MembershipStatus::Active,
            valid_from: 0,
            valid_until: None,
        })
        .await
        .unwrap();
    }

    let options = StoreOptions {
        commit_timeout: Duration::ZERO,
        ..StoreOptions::default()
    };
    let store = Arc::new(WalStore::open(ORG, path, options).unwrap());
    let engine = Engine::over_store(store, Arc::new(ManualClock::new(T0)), Arc::new(NotifyHub::new()));

    let err = engine.reserve(ORG, class.id, member, Actor::Staff).await.unwrap_err();
    assert_eq!(err, AdmissionError::StorageTimeout);
    assert!(err.is_retryable());
    assert!(engine.list_bookings(ORG, class.id).unwrap().is_empty());
    assert_eq!(engine.get_class(ORG, class.id).unwrap().confirmed_count, 0);
}

#[tokio::test]
async fn abandoned_reserve_still_publishes_its_seat() {
    let class_id;
    {
        let h = Harness::open("abandoned.wal");
        let class = h.class(1, None).await;
        class_id = class.id;
        let (a, b) = (h.member().await, h.member().await);

        // A single poll carries the reservation into its commit, then the caller gives up.
        let abandoned = h.reserve(class.id, a).now_or_never();
        drop(abandoned);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.confirmed_count(class.id), 1);
        assert_eq!(h.reserve(class.id, b).await.unwrap_err(), AdmissionError::ClassFull);
    }

    let store = WalStore::open(ORG, existing_wal_path("abandoned.wal"), StoreOptions::default()).unwrap();
    let state = store.class_snapshot(&class_id).unwrap();
    let seated = state.bookings.iter().filter(|b| b.status == BookingStatus::Confirmed).count();
    assert_eq!(seated, 1);
    assert_eq!(state.class.confirmed_count, 1);
}

/// Path inside the engine test dir, keeping whatever is already there.
fn existing_wal_path(name: &str) -> PathBuf {
    std::env::temp_dir().join("turnstile_test_engine").join(name)
}

// ── Lock contention ──────────────────────────────────────

#[tokio::test]
async fn lock_conflict_is_retried_once() {
    let h = Harness::open_with(
        "retry.wal",
        StoreOptions {
            lock_timeout: Duration::from_millis(200),
            ..StoreOptions::default()
        },
    );
    let class = h.class(5, None).await;
    let member = h.member().await;

    let held = h.store.lock_class(ORG, class.id).await.unwrap().unwrap();
    let engine = h.engine.clone();
    let pending = tokio::spawn(async move { engine.reserve(ORG, class.id, member, Actor::Staff).await });

    // Outlast the first attempt, release well before the retry gives up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(held);

    let booking = pending.await.unwrap().unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(h.confirmed_count(class.id), 1);
}

#[tokio::test]
async fn persistent_conflict_surfaces_as_retryable() {
    let h = Harness::open_with(
        "conflict.wal",
        StoreOptions {
            lock_timeout: Duration::from_millis(50),
            ..StoreOptions::default()
        },
    );
    let class = h.class(5, None).await;
    let member = h.member().await;

    let _held = h.store.lock_class(ORG, class.id).await.unwrap().unwrap();
    let err = h.reserve(class.id, member).await.unwrap_err();
    assert_eq!(err, AdmissionError::StorageConflict(class.id));
    assert!(err.is_retryable());
    assert!(!err.is_business());
}
