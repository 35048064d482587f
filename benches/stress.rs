use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ulid::Ulid;

use agenda::access::{Caller, Ctx};
use agenda::config::EngineConfig;
use agenda::engine::{Engine, ErrorKind, Repository, SlotQuery};
use agenda::model::*;
use agenda::notify::NotifyHub;

const MINUTE: Ms = MINUTE_MS;
const DAY: Ms = 24 * 60 * MINUTE;
/// 2024-01-07T00:00:00Z, a Sunday.
const BASE: Ms = 1_704_585_600_000;
const ZONE: &str = "UTC";

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// A company with one branch open around the clock, a 30 minute service and
/// `n_employees` employees working the same hours.
struct Shop {
    engine: Arc<Engine>,
    owner: Ctx,
    branch: Ulid,
    service: Ulid,
    employees: Vec<Ulid>,
}

impl Shop {
    fn booking(&self, employee: Ulid, start: Ms) -> NewAppointment {
        NewAppointment {
            employee_id: employee,
            branch_id: self.branch,
            service_id: self.service,
            client_id: Ulid::new(),
            start,
            time_zone: ZONE.into(),
        }
    }
}

async fn setup(name: &str, n_employees: usize) -> Shop {
    let dir = std::env::temp_dir().join("agenda_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}.wal"));
    let _ = std::fs::remove_file(&path);
    let engine = Arc::new(Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap());

    let company = Ulid::new();
    let owner = Ctx::of(Caller::owner(Ulid::new(), company));
    let service = Ulid::new();
    let branch = Ulid::new();
    engine
        .create(&owner, Company { id: company, name: name.into() })
        .await
        .unwrap();
    engine
        .create(
            &owner,
            Service {
                id: service,
                company_id: company,
                name: "service".into(),
                duration: 30 * MINUTE,
            },
        )
        .await
        .unwrap();
    engine
        .create(
            &owner,
            Branch {
                id: branch,
                company_id: company,
                name: "branch".into(),
                time_zone: ZONE.into(),
                services: [service].into_iter().collect(),
            },
        )
        .await
        .unwrap();

    let mut owners = vec![Owner::branch(branch)];
    let mut employees = Vec::with_capacity(n_employees);
    for i in 0..n_employees {
        let id = Ulid::new();
        engine
            .create(
                &owner,
                Employee {
                    id,
                    company_id: company,
                    name: format!("employee {i}"),
                    branches: [branch].into_iter().collect(),
                    services: [service].into_iter().collect(),
                    slot_step: None,
                },
            )
            .await
            .unwrap();
        employees.push(id);
        owners.push(Owner::employee(id));
    }
    for range_owner in owners {
        for weekday in 0..7 {
            engine
                .add_work_range(
                    &owner,
                    NewWorkRange {
                        owner: range_owner,
                        branch_id: branch,
                        weekday,
                        start_time: TimeOfDay::new(0, 0).unwrap(),
                        end_time: TimeOfDay::END_OF_DAY,
                        time_zone: ZONE.into(),
                        services: [service].into_iter().collect(),
                    },
                )
                .await
                .unwrap();
        }
    }

    Shop {
        engine,
        owner,
        branch,
        service,
        employees,
    }
}

async fn phase1_sequential() {
    let shop = setup("sequential", 1).await;
    let employee = shop.employees[0];

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        shop.engine
            .book(&shop.owner, shop.booking(employee, BASE + i as Ms * 30 * MINUTE))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("book latency", &mut latencies);
}

async fn phase2_concurrent() {
    let n_tasks = 10;
    let n_per_task = 200;
    let shop = Arc::new(setup("concurrent", n_tasks).await);

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let shop = Arc::clone(&shop);
        handles.push(tokio::spawn(async move {
            let employee = shop.employees[task];
            for j in 0..n_per_task {
                shop.engine
                    .book(&shop.owner, shop.booking(employee, BASE + j as Ms * 30 * MINUTE))
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contention() {
    let shop = Arc::new(setup("contention", 1).await);
    let employee = shop.employees[0];
    let rounds = 100;
    let n_tasks = 16;
    let won = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    for round in 0..rounds {
        let slot = BASE + round as Ms * 30 * MINUTE;
        let mut handles = Vec::new();
        for _ in 0..n_tasks {
            let shop = Arc::clone(&shop);
            let won = Arc::clone(&won);
            let conflicts = Arc::clone(&conflicts);
            handles.push(tokio::spawn(async move {
                match shop.engine.book(&shop.owner, shop.booking(employee, slot)).await {
                    Ok(_) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.kind() == ErrorKind::Conflict => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    println!(
        "  {rounds} rounds x {n_tasks} racers: {} won, {} conflicts in {:.2}s",
        won.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    assert_eq!(won.load(Ordering::Relaxed), rounds);
}

async fn phase4_slots_under_load() {
    let shop = Arc::new(setup("slots_under_load", 6).await);

    // Pre-fill a busy week for the readers' employee.
    let reader_employee = shop.employees[0];
    for i in 0..100 {
        shop.engine
            .book(&shop.owner, shop.booking(reader_employee, BASE + i as Ms * 90 * MINUTE))
            .await
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 1..shop.employees.len() {
        let shop = Arc::clone(&shop);
        let stop = Arc::clone(&stop);
        writer_handles.push(tokio::spawn(async move {
            let employee = shop.employees[w];
            let mut i: Ms = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = shop
                    .engine
                    .book(&shop.owner, shop.booking(employee, BASE + i * 30 * MINUTE))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 200;
    let window = Span::new(BASE, BASE + 7 * DAY);
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let shop = Arc::clone(&shop);
        reader_handles.push(tokio::spawn(async move {
            let query = SlotQuery::new(reader_employee, shop.branch, shop.service, window, ZONE);
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let slots = shop.engine.find_slots(&shop.owner, &query).await.unwrap();
                let n = slots.count();
                latencies.push(t.elapsed());
                assert!(n > 0);
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("find_slots (7 days)", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    println!("=== agenda stress benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent().await;

    println!("\n[phase 3] racing for one slot");
    phase3_contention().await;

    println!("\n[phase 4] slot lookup latency under booking load");
    phase4_slots_under_load().await;

    println!("\n=== benchmark complete ===");
}
