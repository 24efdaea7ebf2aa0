use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use super::*;
use crate::store::{LocalStore, SlotSnapshot};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("washslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
}

fn asha() -> Requester {
    Requester::new("u-asha", "Asha")
}

fn ben() -> Requester {
    Requester::new("u-ben", "Ben")
}

fn request(machine: MachineId, who: Requester, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> BookingRequest {
    BookingRequest::new(machine, who, date, start, end)
}

/// Wraps a `LocalStore` to count calls and inject failures.
struct CountingStore {
    inner: LocalStore,
    list_calls: AtomicUsize,
    append_calls: AtomicUsize,
    /// Appended directly to the inner store just before the next append, as
    /// if another resident won the race.
    racer: Mutex<Option<Booking>>,
    always_contended: bool,
    list_delay: Option<Duration>,
}

impl CountingStore {
    fn open(name: &str) -> Self {
        Self {
            inner: LocalStore::open(&test_wal_path(name)).unwrap(),
            list_calls: AtomicUsize::new(0),
            append_calls: AtomicUsize::new(0),
            racer: Mutex::new(None),
            always_contended: false,
            list_delay: None,
        }
    }

    fn appends(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BookingStore for CountingStore {
    async fn find_machine(&self, id: MachineId) -> Result<Option<Machine>, StoreError> {
        self.inner.find_machine(id).await
    }

    async fn list_machines(&self, access_group: Option<&str>) -> Result<Vec<Machine>, StoreError> {
        self.inner.list_machines(access_group).await
    }

    async fn put_machine(&self, machine: Machine) -> Result<(), StoreError> {
        self.inner.put_machine(machine).await
    }

    async fn retire_machine(&self, id: MachineId) -> Result<bool, StoreError> {
        self.inner.retire_machine(id).await
    }

    async fn list_bookings(&self, key: SlotKey) -> Result<SlotSnapshot, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.list_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.list_bookings(key).await
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        self.inner.find_booking(id).await
    }

    async fn append_booking(&self, booking: Booking, expected_version: u64) -> Result<BookingId, StoreError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.always_contended {
            return Err(StoreError::VersionMismatch {
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        let racer = self.racer.lock().unwrap().take();
        if let Some(racer) = racer {
            let snapshot = self.inner.list_bookings(racer.slot()).await?;
            self.inner.append_booking(racer, snapshot.version).await?;
        }
        self.inner.append_booking(booking, expected_version).await
    }

    async fn delete_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        self.inner.delete_booking(id).await
    }

    async fn bookings_for_requester(&self, user_id: &str) -> Result<Vec<Booking>, StoreError> {
        self.inner.bookings_for_requester(user_id).await
    }
}

async fn service_with(store: CountingStore) -> (BookingService<CountingStore>, MachineId) {
    let service = BookingService::new(Arc::new(store), Arc::new(NotifyHub::new()));
    let mid = Ulid::new();
    service
        .save_machine(mid, "Machine-A".into(), "6kg".into(), None)
        .await
        .unwrap();
    (service, mid)
}

async fn service(name: &str) -> (BookingService<CountingStore>, MachineId) {
    service_with(CountingStore::open(name)).await
}

fn racing_booking(machine_id: MachineId, date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Booking {
    Booking {
        id: Ulid::new(),
        machine_id,
        requester: ben(),
        date,
        span: TimeRange::new(start, end),
        created_at: now_ms(),
    }
}

// ── Booking requests ─────────────────────────────────────

#[tokio::test]
async fn empty_slot_accepts_and_persists_once() {
    let (svc, mid) = service("accept.wal").await;
    let id = assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);

    assert_eq!(svc.store().appends(), 1);
    let bookings = svc.bookings_on(mid, day(1)).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].id, id);
    assert_eq!(bookings[0].requester, asha());
    assert_eq!(bookings[0].span, TimeRange::new(t(9, 0), t(10, 0)));
}

#[tokio::test]
async fn book_returns_the_stored_record() {
    let (svc, mid) = service("book_record.wal").await;
    let booking = assert_ok!(svc.book(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert_eq!(svc.bookings_on(mid, day(1)).await.unwrap(), vec![booking]);
}

#[tokio::test]
async fn book_overlap_cancel_and_rebook_sequence() {
    let (svc, mid) = service("sequence.wal").await;

    let first = assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);

    let err = assert_err!(svc.request_booking(request(mid, ben(), day(1), t(9, 30), t(9, 45))).await);
    assert!(matches!(&err, BookingError::Overlap { conflicting, .. } if conflicting.id == first));

    let neighbour = assert_ok!(svc.request_booking(request(mid, ben(), day(1), t(10, 0), t(10, 30))).await);

    assert_eq!(svc.cancel_booking(first, "u-asha", false).await, Ok(true));

    let rebooked = assert_ok!(svc.request_booking(request(mid, ben(), day(1), t(9, 0), t(9, 30))).await);

    let held: Vec<(BookingId, String)> = svc
        .bookings_on(mid, day(1))
        .await
        .unwrap()
        .into_iter()
        .map(|b| (b.id, b.span.to_string()))
        .collect();
    assert_eq!(
        held,
        vec![
            (rebooked, "09:00-09:30".to_string()),
            (neighbour, "10:00-10:30".to_string()),
        ]
    );
    // Three accepted requests, one rejected without a write.
    assert_eq!(svc.store().appends(), 3);
}

#[tokio::test]
async fn back_to_back_bookings_both_accepted() {
    let (svc, mid) = service("back_to_back.wal").await;
    assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert_ok!(svc.request_booking(request(mid, ben(), day(1), t(10, 0), t(11, 0))).await);
    assert_ok!(svc.request_booking(request(mid, ben(), day(1), t(8, 0), t(9, 0))).await);
    assert_eq!(svc.bookings_on(mid, day(1)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn overlap_rejected_without_write() {
    let (svc, mid) = service("overlap.wal").await;
    let first = assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);

    let err = assert_err!(svc.request_booking(request(mid, ben(), day(1), t(9, 30), t(10, 30))).await);
    let BookingError::Overlap { machine_name, conflicting } = &err else {
        panic!("expected overlap, got {err:?}");
    };
    assert_eq!(machine_name, "Machine-A");
    assert_eq!(conflicting.id, first);
    assert_eq!(
        err.to_string(),
        "Machine-A is already booked on 2024-05-01 from 09:00-10:00 by Asha"
    );

    assert_eq!(svc.store().appends(), 1);
    assert_eq!(svc.bookings_on(mid, day(1)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn identical_and_nested_requests_conflict() {
    let (svc, mid) = service("nested.wal").await;
    assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(12, 0))).await);
    for (s, e) in [(t(9, 0), t(12, 0)), (t(10, 0), t(10, 30)), (t(8, 0), t(13, 0)), (t(11, 59), t(12, 30))] {
        let err = assert_err!(svc.request_booking(request(mid, ben(), day(1), s, e)).await);
        assert!(matches!(err, BookingError::Overlap { .. }), "{s}-{e}: {err:?}");
    }
}

#[tokio::test]
async fn invalid_interval_never_reads_slot() {
    let (svc, mid) = service("invalid.wal").await;
    let err = assert_err!(svc.request_booking(request(mid, asha(), day(1), t(10, 0), t(9, 0))).await);
    assert_eq!(err, BookingError::InvalidInterval);
    let err = assert_err!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(9, 0))).await);
    assert_eq!(err, BookingError::InvalidInterval);

    assert_eq!(svc.store().lists(), 0);
    assert_eq!(svc.store().appends(), 0);
}

#[tokio::test]
async fn unknown_machine_rejected() {
    let (svc, _) = service("unknown.wal").await;
    let ghost = Ulid::new();
    let err = assert_err!(svc.request_booking(request(ghost, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert_eq!(err, BookingError::UnknownMachine(ghost));
    assert_eq!(svc.store().appends(), 0);
}

#[tokio::test]
async fn machines_and_dates_are_independent() {
    let (svc, mid) = service("independent.wal").await;
    let other = Ulid::new();
    svc.save_machine(other, "Machine-B".into(), "8kg".into(), None).await.unwrap();

    assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert_ok!(svc.request_booking(request(other, ben(), day(1), t(9, 0), t(10, 0))).await);
    assert_ok!(svc.request_booking(request(mid, ben(), day(2), t(9, 0), t(10, 0))).await);
}

#[tokio::test]
async fn overly_long_booking_rejected() {
    let (svc, mid) = service("too_long.wal").await;
    let err = assert_err!(svc.request_booking(request(mid, asha(), day(1), t(6, 0), t(12, 1))).await);
    assert!(matches!(err, BookingError::LimitExceeded(_)));
    assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(6, 0), t(12, 0))).await);
}

#[tokio::test]
async fn empty_requester_id_rejected() {
    let (svc, mid) = service("empty_requester.wal").await;
    let nobody = Requester::new("", "Nobody");
    let err = assert_err!(svc.request_booking(request(mid, nobody, day(1), t(9, 0), t(10, 0))).await);
    assert!(matches!(err, BookingError::LimitExceeded(_)));
}

// ── Access groups and retirement ─────────────────────────

#[tokio::test]
async fn restricted_machine_requires_matching_group() {
    let (svc, _) = service("groups.wal").await;
    let staff = Ulid::new();
    svc.save_machine(staff, "Staff-1".into(), "10kg".into(), Some("staff".into()))
        .await
        .unwrap();

    let err = assert_err!(svc.request_booking(request(staff, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert_eq!(err, BookingError::NotAuthorized);
    let err = assert_err!(
        svc.request_booking(request(staff, asha(), day(1), t(9, 0), t(10, 0)).in_group("guests"))
            .await
    );
    assert_eq!(err, BookingError::NotAuthorized);

    assert_ok!(
        svc.request_booking(request(staff, asha(), day(1), t(9, 0), t(10, 0)).in_group("staff"))
            .await
    );

    let names = |ms: Vec<Machine>| ms.into_iter().map(|m| m.name).collect::<Vec<_>>();
    assert_eq!(names(svc.list_machines(Some("guests")).await.unwrap()), vec!["Machine-A"]);
    assert_eq!(
        names(svc.list_machines(Some("staff")).await.unwrap()),
        vec!["Machine-A", "Staff-1"]
    );
}

#[tokio::test]
async fn retired_machine_keeps_history_but_takes_no_bookings() {
    let (svc, mid) = service("retired.wal").await;
    let id = assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);

    assert_eq!(svc.retire_machine(mid).await, Ok(true));
    assert_eq!(svc.retire_machine(mid).await, Ok(false));
    assert!(svc.machine(mid).await.unwrap().retired);
    assert!(svc.list_machines(None).await.unwrap().is_empty());

    let err = assert_err!(svc.request_booking(request(mid, ben(), day(1), t(11, 0), t(12, 0))).await);
    assert_eq!(err, BookingError::UnknownMachine(mid));

    assert_eq!(svc.bookings_on(mid, day(1)).await.unwrap().len(), 1);
    assert_ok!(svc.cancel_booking(id, "u-asha", false).await);
    assert!(svc.bookings_on(mid, day(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn retire_unknown_machine() {
    let (svc, _) = service("retire_unknown.wal").await;
    let ghost = Ulid::new();
    assert_eq!(svc.retire_machine(ghost).await, Err(BookingError::UnknownMachine(ghost)));
}

#[tokio::test]
async fn editing_machine_keeps_it_retired() {
    let (svc, mid) = service("edit_retired.wal").await;
    svc.retire_machine(mid).await.unwrap();
    svc.save_machine(mid, "Machine-A2".into(), "7kg".into(), None).await.unwrap();

    let machine = svc.machine(mid).await.unwrap();
    assert_eq!(machine.name, "Machine-A2");
    assert_eq!(machine.capacity, "7kg");
    assert!(machine.retired);
}

#[tokio::test]
async fn machine_field_limits() {
    let (svc, _) = service("machine_limits.wal").await;
    let long = "x".repeat(crate::limits::MAX_NAME_LEN + 1);
    let err = assert_err!(svc.save_machine(Ulid::new(), long, "6kg".into(), None).await);
    assert!(matches!(err, BookingError::LimitExceeded(_)));
    let err = assert_err!(svc.save_machine(Ulid::new(), String::new(), "6kg".into(), None).await);
    assert!(matches!(err, BookingError::LimitExceeded(_)));
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn only_owner_or_admin_cancels() {
    let (svc, mid) = service("cancel_auth.wal").await;
    let id = assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);

    assert_eq!(svc.cancel_booking(id, "u-ben", false).await, Err(BookingError::NotAuthorized));
    assert_eq!(svc.bookings_on(mid, day(1)).await.unwrap().len(), 1);

    assert_ok!(svc.cancel_booking(id, "warden", true).await);
    assert!(svc.bookings_on(mid, day(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancel_frees_the_slot_and_is_idempotent() {
    let (svc, mid) = service("cancel_free.wal").await;
    let id = assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);

    assert_eq!(svc.cancel_booking(id, "u-asha", false).await, Ok(true));
    assert_eq!(svc.cancel_booking(id, "u-asha", false).await, Ok(false));
    assert_eq!(svc.cancel_booking(Ulid::new(), "u-ben", false).await, Ok(false));

    assert_ok!(svc.request_booking(request(mid, ben(), day(1), t(9, 0), t(10, 0))).await);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test]
async fn lost_race_rechecks_and_reports_overlap() {
    let store = CountingStore::open("race_overlap.wal");
    let (svc, mid) = service_with(store).await;
    *svc.store().racer.lock().unwrap() = Some(racing_booking(mid, day(1), t(9, 30), t(10, 30)));

    let err = assert_err!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    let BookingError::Overlap { conflicting, .. } = err else {
        panic!("expected overlap");
    };
    assert_eq!(conflicting.requester, ben());

    assert_eq!(svc.store().lists(), 2);
    assert_eq!(svc.store().appends(), 1);
    assert_eq!(svc.bookings_on(mid, day(1)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn lost_race_to_disjoint_booking_succeeds_on_retry() {
    let store = CountingStore::open("race_disjoint.wal");
    let (svc, mid) = service_with(store).await;
    *svc.store().racer.lock().unwrap() = Some(racing_booking(mid, day(1), t(14, 0), t(15, 0)));

    assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert_eq!(svc.store().appends(), 2);

    let bookings = svc.bookings_on(mid, day(1)).await.unwrap();
    assert_eq!(bookings.len(), 2);
    assert_eq!(bookings[0].requester, asha());
    assert_eq!(bookings[1].requester, ben());
}

#[tokio::test]
async fn persistent_contention_is_unavailable() {
    let mut store = CountingStore::open("contended.wal");
    store.always_contended = true;
    let (svc, mid) = service_with(store).await;

    let err = assert_err!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert_eq!(err, BookingError::StoreUnavailable("booking slot contended".into()));
    assert_eq!(svc.store().appends(), crate::limits::MAX_WRITE_ATTEMPTS as usize);
}

#[tokio::test]
async fn slow_store_times_out_without_write() {
    let mut store = CountingStore::open("slow.wal");
    store.list_delay = Some(Duration::from_secs(5));
    let (svc, mid) = service_with(store).await;
    let svc = svc.with_store_timeout(Duration::from_millis(50));

    let err = assert_err!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert!(matches!(err, BookingError::StoreUnavailable(_)), "{err:?}");
    assert_eq!(svc.store().appends(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_requests_have_one_winner() {
    let store = LocalStore::open(&test_wal_path("one_winner.wal")).unwrap();
    let svc = Arc::new(BookingService::new(Arc::new(store), Arc::new(NotifyHub::new())));
    let mid = Ulid::new();
    svc.save_machine(mid, "Machine-A".into(), "6kg".into(), None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16u32 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            let who = Requester::new(format!("u{i}"), format!("Resident {i}"));
            // Every request covers 10:00-10:30.
            svc.request_booking(request(mid, who, day(1), t(9, 30 + (i % 30)), t(10, 30)))
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(BookingError::Overlap { .. }) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(svc.bookings_on(mid, day(1)).await.unwrap().len(), 1);
}

// ── Queries and notifications ────────────────────────────

#[tokio::test]
async fn free_windows_within_opening_hours() {
    let (svc, mid) = service("free.wal").await;
    let svc = svc.with_opening_hours(TimeRange::new(t(7, 0), t(22, 0)));
    assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    assert_ok!(svc.request_booking(request(mid, ben(), day(1), t(10, 0), t(11, 30))).await);

    assert_eq!(
        svc.free_windows(mid, day(1)).await.unwrap(),
        vec![TimeRange::new(t(7, 0), t(9, 0)), TimeRange::new(t(11, 30), t(22, 0))]
    );
    assert_eq!(svc.free_windows(mid, day(2)).await.unwrap(), vec![svc.opening_hours()]);
}

#[tokio::test]
async fn bookings_for_requester_sorted_by_date_then_time() {
    let (svc, mid) = service("mine.wal").await;
    assert_ok!(svc.request_booking(request(mid, asha(), day(3), t(8, 0), t(9, 0))).await);
    assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(15, 0), t(16, 0))).await);
    assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(7, 0), t(8, 0))).await);
    assert_ok!(svc.request_booking(request(mid, ben(), day(2), t(7, 0), t(8, 0))).await);

    let mine: Vec<(NaiveDate, NaiveTime)> = svc
        .bookings_for("u-asha")
        .await
        .unwrap()
        .into_iter()
        .map(|b| (b.date, b.span.start))
        .collect();
    assert_eq!(mine, vec![(day(1), t(7, 0)), (day(1), t(15, 0)), (day(3), t(8, 0))]);
}

#[tokio::test]
async fn confirmations_and_cancellations_are_broadcast() {
    let (svc, mid) = service("notify.wal").await;
    let mut rx = svc.notify().subscribe(mid);

    let id = assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    let Event::BookingConfirmed { id: got, requester_id, .. } = rx.recv().await.unwrap() else {
        panic!("expected confirmation");
    };
    assert_eq!(got, id);
    assert_eq!(requester_id, "u-asha");

    // Rejections are silent.
    let _ = svc.request_booking(request(mid, ben(), day(1), t(9, 0), t(10, 0))).await;
    assert!(rx.try_recv().is_err());

    svc.cancel_booking(id, "u-asha", false).await.unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        Event::BookingCancelled { id, machine_id: mid, date: day(1) }
    );
}

#[tokio::test]
async fn bookings_survive_restart() {
    let path = test_wal_path("restart.wal");
    let mid = Ulid::new();
    {
        let store = LocalStore::open(&path).unwrap();
        let svc = BookingService::new(Arc::new(store), Arc::new(NotifyHub::new()));
        svc.save_machine(mid, "Machine-A".into(), "6kg".into(), None).await.unwrap();
        assert_ok!(svc.request_booking(request(mid, asha(), day(1), t(9, 0), t(10, 0))).await);
    }

    let store = LocalStore::open(&path).unwrap();
    let svc = BookingService::new(Arc::new(store), Arc::new(NotifyHub::new()));
    assert_eq!(svc.bookings_on(mid, day(1)).await.unwrap().len(), 1);
    let err = assert_err!(svc.request_booking(request(mid, ben(), day(1), t(9, 30), t(10, 30))).await);
    assert!(matches!(err, BookingError::Overlap { .. }));
}
