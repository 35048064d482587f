use std::collections::BTreeSet;
use std::time::Duration;

use chrono::NaiveDate;

use super::*;
use crate::access::Caller;
use crate::patch::{AppointmentField, AppointmentPatch, WorkRangeField, WorkRangePatch};

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// 2024-01-08 (a Monday) 09:00 in America/Sao_Paulo, i.e. 12:00Z.
const MON_9: Ms = 1_704_715_200_000;
const SAO_PAULO: &str = "America/Sao_Paulo";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("agenda_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()
}

fn hm(h: u8, m: u8) -> TimeOfDay {
    TimeOfDay::new(h, m).unwrap()
}

fn set(ids: &[Ulid]) -> BTreeSet<Ulid> {
    ids.iter().copied().collect()
}

/// One company with a branch, a 30-minute service and one employee working
/// Monday 09:00–18:00 inside branch hours 06:00–20:00 (São Paulo).
struct Shop {
    engine: Arc<Engine>,
    company: Ulid,
    branch: Ulid,
    service: Ulid,
    employee: Ulid,
    owner: Ctx,
}

impl Shop {
    async fn open(name: &str) -> Shop {
        Self::open_with(test_wal_path(name), EngineConfig::default()).await
    }

    async fn open_with(path: PathBuf, config: EngineConfig) -> Shop {
        let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new()), config).unwrap());
        let company = Ulid::new();
        let owner = Ctx::of(Caller::owner(Ulid::new(), company));

        engine
            .create(&owner, Company { id: company, name: "Barbearia".into() })
            .await
            .unwrap();
        let service = Ulid::new();
        engine
            .create(
                &owner,
                Service {
                    id: service,
                    company_id: company,
                    name: "Corte".into(),
                    duration: 30 * M,
                },
            )
            .await
            .unwrap();
        let branch = Ulid::new();
        engine
            .create(
                &owner,
                Branch {
                    id: branch,
                    company_id: company,
                    name: "Centro".into(),
                    time_zone: SAO_PAULO.into(),
                    services: set(&[service]),
                },
            )
            .await
            .unwrap();

        let shop = Shop {
            engine,
            company,
            branch,
            service,
            employee: Ulid::new(),
            owner,
        };
        shop.hire(shop.employee).await;
        shop.range(Owner::branch(branch), 1, hm(6, 0), hm(20, 0)).await;
        shop.range(Owner::employee(shop.employee), 1, hm(9, 0), hm(18, 0))
            .await;
        shop
    }

    async fn hire(&self, id: Ulid) {
        self.engine
            .create(
                &self.owner,
                Employee {
                    id,
                    company_id: self.company,
                    name: "Ana".into(),
                    branches: set(&[self.branch]),
                    services: set(&[self.service]),
                    slot_step: None,
                },
            )
            .await
            .unwrap();
    }

    fn new_range(&self, owner: Owner, weekday: u8, start: TimeOfDay, end: TimeOfDay) -> NewWorkRange {
        NewWorkRange {
            owner,
            branch_id: self.branch,
            weekday,
            start_time: start,
            end_time: end,
            time_zone: SAO_PAULO.into(),
            services: set(&[self.service]),
        }
    }

    async fn range(&self, owner: Owner, weekday: u8, start: TimeOfDay, end: TimeOfDay) -> WorkRange {
        self.engine
            .add_work_range(&self.owner, self.new_range(owner, weekday, start, end))
            .await
            .unwrap()
    }

    fn booking(&self, employee: Ulid, client: Ulid, start: Ms) -> NewAppointment {
        NewAppointment {
            employee_id: employee,
            branch_id: self.branch,
            service_id: self.service,
            client_id: client,
            start,
            time_zone: SAO_PAULO.into(),
        }
    }

    async fn book(&self, start: Ms) -> Result<Appointment, EngineError> {
        self.engine
            .book(&self.owner, self.booking(self.employee, Ulid::new(), start))
            .await
    }

    fn monday_query(&self) -> SlotQuery {
        let window = SlotQuery::local_days(monday(), 1, SAO_PAULO).unwrap();
        SlotQuery::new(self.employee, self.branch, self.service, window, SAO_PAULO)
    }

    async fn monday_slots(&self) -> Vec<Slot> {
        self.engine
            .find_slots(&self.owner, &self.monday_query())
            .await
            .unwrap()
            .collect()
    }
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn sao_paulo_monday_slots() {
    let shop = Shop::open("sao_paulo_slots.wal").await;
    let slots = shop.monday_slots().await;

    assert_eq!(slots.len(), 18);
    assert_eq!(slots[0].start, MON_9);
    assert_eq!(slots[17].start, MON_9 + 8 * H + 30 * M);
    assert!(slots.iter().all(|s| s.end - s.start == 30 * M));
    assert!(slots.iter().all(|s| s.employee_id == shop.employee));
    assert!(!slots.iter().any(|s| s.start == MON_9 - 30 * M));
    assert!(!slots.iter().any(|s| s.start == MON_9 + 9 * H));
}

#[tokio::test]
async fn slots_skip_booked_time() {
    let shop = Shop::open("slots_skip_booked.wal").await;
    shop.book(MON_9 + H).await.unwrap();

    let slots = shop.monday_slots().await;
    assert_eq!(slots.len(), 17);
    assert!(!slots.iter().any(|s| s.start == MON_9 + H));
    assert!(slots.iter().any(|s| s.start == MON_9 + H + 30 * M));
}

#[tokio::test]
async fn find_slots_is_idempotent_and_restartable() {
    let shop = Shop::open("slots_idempotent.wal").await;
    let first = shop.monday_slots().await;
    let second = shop.monday_slots().await;
    assert_eq!(first, second);

    let iter = shop
        .engine
        .find_slots(&shop.owner, &shop.monday_query())
        .await
        .unwrap();
    let restarted = iter.clone();
    assert_eq!(iter.count(), restarted.count());
}

#[tokio::test]
async fn employee_step_and_query_step() {
    let shop = Shop::open("slots_step.wal").await;
    let fine = shop
        .engine
        .find_slots(&shop.owner, &shop.monday_query().with_step(15 * M))
        .await
        .unwrap();
    // 09:00 … 17:30 every 15 minutes.
    assert_eq!(fine.count(), 35);

    let err = shop
        .engine
        .find_slots(&shop.owner, &shop.monday_query().with_step(M))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn no_slots_without_branch_hours() {
    let shop = Shop::open("slots_no_branch.wal").await;
    // Tuesday: only the employee works.
    shop.range(Owner::employee(shop.employee), 2, hm(9, 0), hm(12, 0))
        .await;
    let tuesday = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
    let window = SlotQuery::local_days(tuesday, 1, SAO_PAULO).unwrap();
    let query = SlotQuery::new(shop.employee, shop.branch, shop.service, window, SAO_PAULO);
    let slots = shop.engine.find_slots(&shop.owner, &query).await.unwrap();
    assert_eq!(slots.count(), 0);
}

#[tokio::test]
async fn query_window_limits() {
    let shop = Shop::open("slots_window.wal").await;
    let mut query = shop.monday_query();
    query.window = Span::new(MON_9, MON_9 + 40 * 24 * H);
    let err = shop.engine.find_slots(&shop.owner, &query).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let mut query = shop.monday_query();
    query.time_zone = "Mars/Olympus".into();
    let err = shop.engine.find_slots(&shop.owner, &query).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn service_slots_merge_employees() {
    let shop = Shop::open("service_slots.wal").await;
    let second = Ulid::new();
    shop.hire(second).await;
    shop.range(Owner::employee(second), 1, hm(17, 0), hm(19, 0))
        .await;

    let window = SlotQuery::local_days(monday(), 1, SAO_PAULO).unwrap();
    let slots = shop
        .engine
        .find_service_slots(&shop.owner, shop.branch, shop.service, window, SAO_PAULO, None)
        .await
        .unwrap();

    assert_eq!(slots.len(), 18 + 4);
    assert!(slots.windows(2).all(|w| w[0].start <= w[1].start));
    let at_five: Vec<Ulid> = slots
        .iter()
        .filter(|s| s.start == MON_9 + 8 * H)
        .map(|s| s.employee_id)
        .collect();
    assert_eq!(at_five.len(), 2);
    assert!(at_five.contains(&second));
}

#[tokio::test]
async fn slots_realign_after_an_offgrid_booking() {
    let shop = Shop::open("slots_realign.wal").await;
    shop.book(MON_9 + 15 * M).await.unwrap();

    let starts: Vec<Ms> = shop.monday_slots().await.iter().map(|s| s.start).collect();
    // 09:45 is free but off the half-hour grid; the next slot is 10:00.
    assert_eq!(starts[..3], [MON_9 + H, MON_9 + H + 30 * M, MON_9 + 2 * H]);
    assert_eq!(starts.len(), 16);
}

#[tokio::test]
async fn past_slots_are_hidden_under_grace() {
    let config = EngineConfig {
        past_booking_grace: Some(5 * M),
        ..EngineConfig::default()
    };
    let shop = Shop::open_with(test_wal_path("slots_past.wal"), config).await;
    assert!(shop.monday_slots().await.is_empty());

    // The coming week always holds a Monday.
    let today = chrono::Utc::now().date_naive();
    let window = SlotQuery::local_days(today, 8, SAO_PAULO).unwrap();
    let query = SlotQuery::new(shop.employee, shop.branch, shop.service, window, SAO_PAULO);
    let before = conflict::now_ms();
    let slots: Vec<Slot> = shop.engine.find_slots(&shop.owner, &query).await.unwrap().collect();
    assert!(!slots.is_empty());
    assert!(slots.iter().all(|s| s.start >= before - 5 * M));

    let later = slots
        .iter()
        .find(|s| s.start > conflict::now_ms() + H)
        .unwrap();
    shop.book(later.start).await.unwrap();
}

#[tokio::test]
async fn client_filter_hides_their_booked_time() {
    let shop = Shop::open("slots_client_filter.wal").await;
    let other = Ulid::new();
    shop.hire(other).await;
    shop.range(Owner::employee(other), 1, hm(9, 0), hm(18, 0)).await;

    let client = Ulid::new();
    shop.engine
        .book(&shop.owner, shop.booking(other, client, MON_9 + H))
        .await
        .unwrap();

    let all = shop.monday_slots().await;
    assert!(all.iter().any(|s| s.start == MON_9 + H));
    let theirs: Vec<Slot> = shop
        .engine
        .find_slots(&shop.owner, &shop.monday_query().for_client(client))
        .await
        .unwrap()
        .collect();
    assert_eq!(theirs.len(), all.len() - 1);
    assert!(!theirs.iter().any(|s| s.start == MON_9 + H));

    let window = SlotQuery::local_days(monday(), 1, SAO_PAULO).unwrap();
    let merged = shop
        .engine
        .find_service_slots(&shop.owner, shop.branch, shop.service, window, SAO_PAULO, Some(client))
        .await
        .unwrap();
    assert!(!merged.iter().any(|s| s.start == MON_9 + H));
    assert!(merged.iter().any(|s| s.start == MON_9 + H + 30 * M));

    // Clients cannot look into someone else's calendar.
    let as_client = Ctx::of(Caller::client(Ulid::new(), shop.company));
    let err = shop
        .engine
        .find_slots(&as_client, &shop.monday_query().for_client(client))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

// ── Work ranges ──────────────────────────────────────────

#[tokio::test]
async fn overlapping_range_names_sibling() {
    let shop = Shop::open("range_overlap.wal").await;
    let existing = shop.engine.work_schedule(&shop.owner, Owner::employee(shop.employee))
        .await
        .unwrap();
    assert_eq!(existing.len(), 1);

    let err = shop
        .engine
        .add_work_range(
            &shop.owner,
            shop.new_range(Owner::employee(shop.employee), 1, hm(17, 0), hm(19, 0)),
        )
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Overlap(existing[0].id));

    // Touching endpoints are fine.
    shop.range(Owner::employee(shop.employee), 1, hm(18, 0), hm(19, 0))
        .await;
}

#[tokio::test]
async fn range_validation_errors() {
    let shop = Shop::open("range_invalid.wal").await;
    let owner = Owner::employee(shop.employee);

    let backwards = shop.new_range(owner, 3, hm(12, 0), hm(9, 0));
    let err = shop.engine.add_work_range(&shop.owner, backwards).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRange);

    let bad_day = shop.new_range(owner, 7, hm(9, 0), hm(12, 0));
    let err = shop.engine.add_work_range(&shop.owner, bad_day).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRange);

    let mut bad_zone = shop.new_range(owner, 3, hm(9, 0), hm(12, 0));
    bad_zone.time_zone = "Nowhere/Special".into();
    let err = shop.engine.add_work_range(&shop.owner, bad_zone).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRange);

    let mut foreign_service = shop.new_range(owner, 3, hm(9, 0), hm(12, 0));
    foreign_service.services = set(&[Ulid::new()]);
    let err = shop
        .engine
        .add_work_range(&shop.owner, foreign_service)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRange);
}

#[tokio::test]
async fn update_and_remove_range() {
    let shop = Shop::open("range_update.wal").await;
    let range = shop.range(Owner::employee(shop.employee), 2, hm(9, 0), hm(12, 0))
        .await;

    let patch = WorkRangePatch::new().set(WorkRangeField::EndTime(hm(13, 0)));
    let updated = shop
        .engine
        .update_work_range(&shop.owner, range.id, patch)
        .await
        .unwrap();
    assert_eq!(updated.end_time, hm(13, 0));

    // Moving onto Monday collides with the 09:00–18:00 range.
    let patch = WorkRangePatch::new().set(WorkRangeField::Weekday(1));
    let err = shop
        .engine
        .update_work_range(&shop.owner, range.id, patch)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Overlap);

    // An empty service list is accepted; the range just stops producing slots.
    let patch = WorkRangePatch::new().set(WorkRangeField::Services(BTreeSet::new()));
    let emptied = shop
        .engine
        .update_work_range(&shop.owner, range.id, patch)
        .await
        .unwrap();
    assert!(!emptied.is_bookable());

    let removed = shop.engine.remove_work_range(&shop.owner, range.id).await.unwrap();
    assert_eq!(removed.id, range.id);
    let err = shop.engine.remove_work_range(&shop.owner, range.id).await.unwrap_err();
    assert_eq!(err, EngineError::NotFound(range.id));
}

#[tokio::test]
async fn employees_edit_only_their_own_schedule() {
    let shop = Shop::open("range_roles.wal").await;
    let other = Ulid::new();
    shop.hire(other).await;
    let as_employee = Ctx::of(Caller::employee(shop.employee, shop.company));

    shop.engine
        .add_work_range(&as_employee, shop.new_range(Owner::employee(shop.employee), 4, hm(9, 0), hm(12, 0)))
        .await
        .unwrap();
    let err = shop
        .engine
        .add_work_range(&as_employee, shop.new_range(Owner::employee(other), 4, hm(9, 0), hm(12, 0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let as_client = Ctx::of(Caller::client(Ulid::new(), shop.company));
    let err = shop
        .engine
        .add_work_range(&as_client, shop.new_range(Owner::employee(shop.employee), 5, hm(9, 0), hm(12, 0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_ranges_one_wins() {
    let shop = Shop::open("range_concurrent.wal").await;
    for weekday in 2..=6u8 {
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let engine = Arc::clone(&shop.engine);
            let ctx = shop.owner;
            let input = shop.new_range(Owner::employee(shop.employee), weekday, hm(9 + i % 3, 0), hm(14, 0));
            handles.push(tokio::spawn(async move { engine.add_work_range(&ctx, input).await }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::Overlap),
            }
        }
        assert_eq!(ok, 1, "weekday {weekday}");
    }
    let ranges = shop
        .engine
        .work_schedule(&shop.owner, Owner::employee(shop.employee))
        .await
        .unwrap();
    assert_eq!(ranges.len(), 1 + 5);
}

// ── Booking and conflicts ────────────────────────────────

#[tokio::test]
async fn book_conflict_and_adjacent() {
    let shop = Shop::open("book_conflict.wal").await;
    let first = shop.book(MON_9).await.unwrap();
    assert_eq!(first.span, Span::new(MON_9, MON_9 + 30 * M));
    assert_eq!(first.status, AppointmentStatus::Scheduled);

    let err = shop.book(MON_9 + 15 * M).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict(first.id));
    assert!(!err.is_retryable());

    shop.book(MON_9 + 30 * M).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_exactly_one_wins() {
    let shop = Shop::open("book_concurrent.wal").await;
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&shop.engine);
        let ctx = shop.owner;
        let input = shop.booking(shop.employee, Ulid::new(), MON_9 + (i % 3) * 10 * M);
        handles.push(tokio::spawn(async move { engine.book(&ctx, input).await }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }
    assert_eq!(ok, 1);
    let ledger = shop.engine.employee_ledger(shop.employee);
    assert_eq!(ledger.read().await.entries.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aborted_bookings_keep_ledger_and_appointments_in_step() {
    let path = test_wal_path("book_abort.wal");
    let shop = Shop::open_with(path.clone(), EngineConfig::default()).await;
    let other = Ulid::new();
    shop.hire(other).await;
    shop.range(Owner::employee(other), 1, hm(9, 0), hm(18, 0)).await;
    let ctx = shop.owner;

    // Keep the WAL writer busy with another employee's bookings.
    let engine = Arc::clone(&shop.engine);
    let load: Vec<NewAppointment> = (0..18)
        .map(|i| shop.booking(other, Ulid::new(), MON_9 + i * 30 * M))
        .collect();
    let background = tokio::spawn(async move {
        for input in load {
            let _ = engine.book(&ctx, input).await;
        }
    });

    for i in 0..18 {
        let engine = Arc::clone(&shop.engine);
        let input = shop.booking(shop.employee, Ulid::new(), MON_9 + i * 30 * M);
        let task = tokio::spawn(async move { engine.book(&ctx, input).await });
        for _ in 0..i % 6 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
    }
    background.await.unwrap();
    // Commits already past the gate finish before compaction can start.
    shop.engine.compact_wal().await.unwrap();

    let employee = shop.employee;
    let in_ledger = move |engine: &Engine| {
        let ledger = engine.employee_ledger(employee);
        let entries: Vec<(Ulid, Span)> = ledger
            .try_read()
            .unwrap()
            .entries
            .iter()
            .map(|e| (e.appointment_id, e.span))
            .collect();
        entries
    };
    let scheduled = move |engine: &Engine| {
        let mut appts: Vec<(Ulid, Span)> = engine
            .appointments
            .iter()
            .filter(|a| a.employee_id == employee && a.is_scheduled())
            .map(|a| (a.id, a.span))
            .collect();
        appts.sort_by_key(|(_, span)| span.start);
        appts
    };
    let committed = scheduled(&shop.engine);
    assert_eq!(in_ledger(&shop.engine), committed);
    drop(shop);

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
    assert_eq!(scheduled(&engine), committed);
    assert_eq!(in_ledger(&engine), committed);
}

#[tokio::test]
async fn client_cannot_double_book() {
    let shop = Shop::open("book_client.wal").await;
    let other = Ulid::new();
    shop.hire(other).await;
    shop.range(Owner::employee(other), 1, hm(9, 0), hm(18, 0)).await;

    let client = Ulid::new();
    let first = shop
        .engine
        .book(&shop.owner, shop.booking(shop.employee, client, MON_9))
        .await
        .unwrap();
    let err = shop
        .engine
        .book(&shop.owner, shop.booking(other, client, MON_9 + 10 * M))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Conflict(first.id));
}

#[tokio::test]
async fn booking_membership_is_checked() {
    let shop = Shop::open("book_membership.wal").await;
    let mut input = shop.booking(shop.employee, Ulid::new(), MON_9);
    input.time_zone = "Atlantis/Capital".into();
    let err = shop.engine.book(&shop.owner, input).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);

    let err = shop
        .engine
        .book(&shop.owner, shop.booking(Ulid::new(), Ulid::new(), MON_9))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn bookings_must_fit_working_hours() {
    let shop = Shop::open("book_fit.wal").await;

    let err = shop.book(MON_9 - H).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    let err = shop.book(MON_9 + 8 * H + 45 * M).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    // Sunday 03:00, no ranges at all that day.
    let err = shop.book(MON_9 - 30 * H).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    shop.book(MON_9 + 8 * H + 30 * M).await.unwrap();
}

#[tokio::test]
async fn fit_check_can_be_turned_off() {
    let config = EngineConfig {
        require_schedule_fit: false,
        ..EngineConfig::default()
    };
    let shop = Shop::open_with(test_wal_path("book_no_fit.wal"), config).await;
    let appt = shop.book(MON_9 - 30 * H).await.unwrap();
    assert_eq!(appt.span.start, MON_9 - 30 * H);
}

#[tokio::test]
async fn extreme_start_times_are_rejected() {
    let shop = Shop::open("book_extreme.wal").await;
    for start in [i64::MAX, i64::MAX - 1, i64::MIN] {
        let err = shop.book(start).await.unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)), "{start}: {err}");
    }

    let appt = shop.book(MON_9).await.unwrap();
    let patch = AppointmentPatch::from_json(&serde_json::json!({ "start_time": i64::MAX })).unwrap();
    let err = shop
        .engine
        .update_appointment(&shop.owner, appt.id, patch)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
    let err = shop
        .engine
        .reschedule(&shop.owner, appt.id, i64::MAX - 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let unchanged = shop.engine.get_appointment(&shop.owner, appt.id).await.unwrap();
    assert_eq!(unchanged.span, appt.span);
}

#[tokio::test]
async fn past_bookings_rejected_with_grace() {
    let config = EngineConfig {
        past_booking_grace: Some(5 * M),
        ..EngineConfig::default()
    };
    let shop = Shop::open_with(test_wal_path("book_past.wal"), config).await;
    let err = shop.book(MON_9).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn lock_timeout_is_transient() {
    let config = EngineConfig {
        lock_wait: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let shop = Shop::open_with(test_wal_path("book_timeout.wal"), config).await;
    let ledger = shop.engine.employee_ledger(shop.employee);
    let held = ledger.write().await;

    let ctx = shop.owner.with_timeout(Duration::from_millis(60));
    let err = shop
        .engine
        .book(&ctx, shop.booking(shop.employee, Ulid::new(), MON_9))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(err.is_retryable());

    drop(held);
    shop.book(MON_9).await.unwrap();
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn cancel_twice_is_invalid_state() {
    let shop = Shop::open("cancel_twice.wal").await;
    let appt = shop.book(MON_9).await.unwrap();

    let cancelled = shop.engine.cancel(&shop.owner, appt.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(shop.owner.caller.id));
    assert!(cancelled.cancelled_at.is_some());

    let err = shop.engine.cancel(&shop.owner, appt.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = shop
        .engine
        .reschedule(&shop.owner, appt.id, MON_9 + H, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // The slot is free again.
    shop.book(MON_9).await.unwrap();
}

#[tokio::test]
async fn reschedule_records_history() {
    let shop = Shop::open("reschedule_history.wal").await;
    let appt = shop.book(MON_9).await.unwrap();
    let blocker = shop.book(MON_9 + 2 * H).await.unwrap();

    // Shifting within its own interval does not conflict with itself.
    let moved = shop
        .engine
        .reschedule(&shop.owner, appt.id, MON_9 + 15 * M, None)
        .await
        .unwrap();
    assert_eq!(moved.span, Span::new(MON_9 + 15 * M, MON_9 + 45 * M));
    assert_eq!(moved.history.len(), 2);
    assert_eq!(moved.history[0].field, "start_time");
    assert_eq!(moved.history[0].old_value, "2024-01-08T09:00:00-03:00");
    assert_eq!(moved.history[0].new_value, "2024-01-08T09:15:00-03:00");
    assert_eq!(moved.history[1].field, "end_time");

    let err = shop
        .engine
        .reschedule(&shop.owner, appt.id, MON_9 + 2 * H - 10 * M, None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Conflict(blocker.id));

    let patch = AppointmentPatch::new()
        .set(AppointmentField::StartTime(MON_9 + 3 * H))
        .set(AppointmentField::TimeZone("UTC".into()));
    let patched = shop
        .engine
        .update_appointment(&shop.owner, appt.id, patch)
        .await
        .unwrap();
    assert_eq!(patched.span.start, MON_9 + 3 * H);
    assert_eq!(patched.time_zone, "UTC");
    assert_eq!(patched.history.len(), 5);
    assert_eq!(patched.history[4].field, "time_zone");
}

#[tokio::test]
async fn events_reach_company_subscribers() {
    let shop = Shop::open("notify_events.wal").await;
    let mut rx = shop.engine.notify.subscribe(shop.company);
    let appt = shop.book(MON_9).await.unwrap();
    shop.engine.cancel(&shop.owner, appt.id).await.unwrap();

    match rx.recv().await.unwrap() {
        Event::AppointmentBooked(a) => assert_eq!(a.id, appt.id),
        other => panic!("unexpected event {other:?}"),
    }
    match rx.recv().await.unwrap() {
        Event::AppointmentCancelled { id, .. } => assert_eq!(id, appt.id),
        other => panic!("unexpected event {other:?}"),
    }
}

// ── Tenancy and roles ────────────────────────────────────

#[tokio::test]
async fn cross_tenant_access_fails_for_every_role() {
    let shop = Shop::open("tenant_cross.wal").await;
    let appt = shop.book(MON_9).await.unwrap();

    let elsewhere = Ulid::new();
    let strangers = [
        Caller::owner(Ulid::new(), elsewhere),
        // Ids of this shop's own people, claimed under another company.
        Caller::employee(shop.employee, elsewhere),
        Caller::client(appt.client_id, elsewhere),
    ];
    for caller in strangers {
        let stranger = Ctx::of(caller);
        let role = format!("{:?}", caller.role);
        let err = shop.engine.get_appointment(&stranger, appt.id).await.unwrap_err();
        assert_eq!(err, EngineError::CrossTenant(appt.id), "{role}");
        assert_eq!(shop.engine.authorizer.surface(&err), ErrorKind::NotFound);

        let err = shop.engine.cancel(&stranger, appt.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CrossTenant, "{role}");
        let err = shop
            .engine
            .reschedule(&stranger, appt.id, MON_9 + H, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CrossTenant, "{role}");
        let err = shop
            .engine
            .find_slots(&stranger, &shop.monday_query())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CrossTenant, "{role}");
        let err = shop
            .engine
            .book(&stranger, shop.booking(shop.employee, appt.client_id, MON_9 + H))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CrossTenant, "{role}");
    }
    assert!(shop.engine.get_appointment(&shop.owner, appt.id).await.unwrap().is_scheduled());

    // Claiming a company the caller does not belong to.
    let spoofed = Ctx::new(Caller::owner(Ulid::new(), Ulid::new()), shop.company);
    let err = shop.engine.get_appointment(&spoofed, appt.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossTenant);
    let err = shop.engine.list_appointments(&spoofed, &AppointmentFilter::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossTenant);
}

#[tokio::test]
async fn employee_cannot_book_for_colleague() {
    let shop = Shop::open("roles_employee.wal").await;
    let other = Ulid::new();
    shop.hire(other).await;
    shop.range(Owner::employee(other), 1, hm(9, 0), hm(18, 0)).await;

    let as_employee = Ctx::of(Caller::employee(shop.employee, shop.company));
    let err = shop
        .engine
        .book(&as_employee, shop.booking(other, Ulid::new(), MON_9))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let own = shop
        .engine
        .book(&as_employee, shop.booking(shop.employee, Ulid::new(), MON_9))
        .await
        .unwrap();
    let as_other = Ctx::of(Caller::employee(other, shop.company));
    let err = shop.engine.cancel(&as_other, own.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn clients_see_and_cancel_only_their_own() {
    let shop = Shop::open("roles_client.wal").await;
    let client = Ulid::new();
    let as_client = Ctx::of(Caller::client(client, shop.company));

    let mine = shop
        .engine
        .book(&as_client, shop.booking(shop.employee, client, MON_9))
        .await
        .unwrap();
    let err = shop
        .engine
        .book(&as_client, shop.booking(shop.employee, Ulid::new(), MON_9 + H))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let theirs = shop.book(MON_9 + 2 * H).await.unwrap();

    let visible = shop
        .engine
        .list_appointments(&as_client, &AppointmentFilter::default())
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, mine.id);
    let all = shop
        .engine
        .list_appointments(&shop.owner, &AppointmentFilter::default())
        .unwrap();
    assert_eq!(all.len(), 2);

    let err = shop.engine.get_appointment(&as_client, theirs.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    shop.engine.cancel(&as_client, mine.id).await.unwrap();
}

#[tokio::test]
async fn client_self_booking_can_be_disabled() {
    let mut config = EngineConfig::default();
    config.access.client_self_booking = false;
    let shop = Shop::open_with(test_wal_path("roles_no_client.wal"), config).await;
    let client = Ulid::new();
    let as_client = Ctx::of(Caller::client(client, shop.company));
    let err = shop
        .engine
        .book(&as_client, shop.booking(shop.employee, client, MON_9))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

// ── Directory ────────────────────────────────────────────

#[tokio::test]
async fn directory_guards() {
    let shop = Shop::open("directory_guards.wal").await;

    let err = Repository::<Service>::delete(&*shop.engine, &shop.owner, shop.service)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::InUse(shop.service));

    let as_employee = Ctx::of(Caller::employee(shop.employee, shop.company));
    let err = Repository::<Branch>::delete(&*shop.engine, &as_employee, shop.branch)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = shop
        .engine
        .create(&shop.owner, Company { id: shop.company, name: "Again".into() })
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyExists(shop.company));

    let short = Service {
        id: Ulid::new(),
        company_id: shop.company,
        name: "Blink".into(),
        duration: M,
    };
    let err = shop.engine.create(&shop.owner, short).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);

    let unused = Service {
        id: Ulid::new(),
        company_id: shop.company,
        name: "Barba".into(),
        duration: 20 * M,
    };
    shop.engine.create(&shop.owner, unused.clone()).await.unwrap();
    let fetched = Repository::<Service>::get(&*shop.engine, &shop.owner, unused.id)
        .await
        .unwrap();
    assert_eq!(fetched, unused);
    Repository::<Service>::delete(&*shop.engine, &shop.owner, unused.id)
        .await
        .unwrap();
    let err = Repository::<Service>::get(&*shop.engine, &shop.owner, unused.id)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotFound(unused.id));
}

#[tokio::test]
async fn employee_branch_must_share_company() {
    let shop = Shop::open("directory_cross.wal").await;
    let other_company = Ulid::new();
    let other_owner = Ctx::of(Caller::owner(Ulid::new(), other_company));
    shop.engine
        .create(&other_owner, Company { id: other_company, name: "Rival".into() })
        .await
        .unwrap();

    let err = shop
        .engine
        .create(
            &other_owner,
            Employee {
                id: Ulid::new(),
                company_id: other_company,
                name: "Spy".into(),
                branches: set(&[shop.branch]),
                services: BTreeSet::new(),
                slot_step: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::CrossTenant(shop.branch));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let shop = Shop::open_with(path.clone(), EngineConfig::default()).await;
    let kept = shop.book(MON_9).await.unwrap();
    let dropped = shop.book(MON_9 + H).await.unwrap();
    shop.engine.cancel(&shop.owner, dropped.id).await.unwrap();
    let moved = shop
        .engine
        .reschedule(&shop.owner, kept.id, MON_9 + 2 * H, None)
        .await
        .unwrap();
    let before = shop.monday_slots().await;
    let owner = shop.owner;
    drop(shop);

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
    let replayed = engine.get_appointment(&owner, kept.id).await.unwrap();
    assert_eq!(replayed, moved);
    let cancelled = engine.get_appointment(&owner, dropped.id).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);

    let query = SlotQuery::new(
        replayed.employee_id,
        replayed.branch_id,
        replayed.service_id,
        SlotQuery::local_days(monday(), 1, SAO_PAULO).unwrap(),
        SAO_PAULO,
    );
    let after: Vec<Slot> = engine.find_slots(&owner, &query).await.unwrap().collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let shop = Shop::open_with(path.clone(), EngineConfig::default()).await;
    let appt = shop.book(MON_9).await.unwrap();
    for _ in 0..3 {
        let other = shop.book(MON_9 + 4 * H).await.unwrap();
        shop.engine.cancel(&shop.owner, other.id).await.unwrap();
    }
    assert!(shop.engine.wal_appends_since_compact().await > 0);

    shop.engine.compact_wal().await.unwrap();
    assert_eq!(shop.engine.wal_appends_since_compact().await, 0);
    let before = shop
        .engine
        .list_appointments(&shop.owner, &AppointmentFilter { include_cancelled: true, ..Default::default() })
        .unwrap();
    let owner = shop.owner;
    drop(shop);

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap();
    let after = engine
        .list_appointments(&owner, &AppointmentFilter { include_cancelled: true, ..Default::default() })
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(after.len(), 4);
    assert!(engine.get_appointment(&owner, appt.id).await.unwrap().is_scheduled());
}
