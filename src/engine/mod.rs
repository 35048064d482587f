mod availability;
mod conflict;
mod directory;
mod error;
mod mutations;
mod queries;
mod schedule;
#[cfg(test)]
mod tests;

pub use availability::{
    SlotIter, SlotSource, free_time, intersect_intervals, merge_overlapping, open_time, subtract_intervals,
};
pub use directory::{DirectoryEntity, Repository};
pub use error::{EngineError, ErrorKind};
pub use queries::SlotQuery;
pub use schedule::WorkSchedule;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::access::{Authorizer, Ctx};
use crate::config::EngineConfig;
use crate::limits::{COMMIT_BACKOFF_BASE_MS, COMMIT_BACKOFF_MAX_MS, MAX_HISTORY_ENTRIES};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{
    APPOINTMENTS_SCHEDULED, LOCK_RETRIES_TOTAL, WAL_COMPACTIONS_TOTAL, WAL_FLUSH_BATCH_SIZE,
    WAL_FLUSH_DURATION_SECONDS,
};
use crate::wal::Wal;
use crate::zone;

pub type SharedLedger = Arc<RwLock<Ledger>>;
pub type SharedSchedule = Arc<RwLock<WorkSchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append that is already queued when the first one
/// arrives joins its batch and shares one fsync. A non-append command ends
/// the batch and runs right after it, so ordering is preserved.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut deferred: Option<WalCommand> = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch: Vec<PendingAppend> = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
            }
            WalCommand::Compact { events, response } => {
                let result = Wal::write_compact_file(wal.path(), &events)
                    .and_then(|()| wal.swap_compact_file());
                if result.is_ok() {
                    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
                }
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch lingers in
    // the buffer; every caller of this batch is told it failed.
    let flushed = wal.flush_sync();
    let result = appended.and(flushed);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL batch of {} failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

/// In-memory scheduling state rebuilt from the WAL.
///
/// Write serialization: a work-range edit holds its owner's schedule write
/// lock; an appointment write holds the employee ledger lock, then the client
/// ledger lock. Every writer also holds the compaction gate for reading, so a
/// compaction (gate write) sees no half-applied state.
pub struct Engine {
    pub(super) companies: DashMap<Ulid, Company>,
    pub(super) branches: DashMap<Ulid, Branch>,
    pub(super) employees: DashMap<Ulid, Employee>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) schedules: DashMap<Owner, SharedSchedule>,
    /// Reverse lookup: work range id → owner.
    pub(super) range_owner: DashMap<Ulid, Owner>,
    pub(super) appointments: DashMap<Ulid, Appointment>,
    pub(super) employee_ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) client_ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub authorizer: Authorizer,
    pub config: EngineConfig,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must run
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            companies: DashMap::new(),
            branches: DashMap::new(),
            employees: DashMap::new(),
            services: DashMap::new(),
            schedules: DashMap::new(),
            range_owner: DashMap::new(),
            appointments: DashMap::new(),
            employee_ledgers: DashMap::new(),
            client_ledgers: DashMap::new(),
            gate: Arc::new(RwLock::new(())),
            wal_tx,
            notify,
            authorizer: Authorizer::new(config.access),
            config,
        };

        // Nothing else can see these locks yet, so try_write always succeeds.
        for event in &events {
            engine.replay_one(event);
        }
        info!(
            "replayed {} events: {} companies, {} appointments",
            events.len(),
            engine.companies.len(),
            engine.appointments.len()
        );
        Ok(engine)
    }

    fn replay_one(&self, event: &Event) {
        match event {
            Event::WorkRangeSaved(WorkRange { owner, company_id, .. })
            | Event::WorkRangeRemoved { owner, company_id, .. } => {
                let schedule = self.schedule(*owner, *company_id);
                if let Ok(mut guard) = schedule.try_write() {
                    self.apply_schedule(&mut guard, event);
                }
            }
            Event::AppointmentBooked(_)
            | Event::AppointmentRescheduled { .. }
            | Event::AppointmentCancelled { .. } => {
                let Some((employee, client)) = self.ledgers_for(event) else {
                    warn!("replay: appointment event for unknown appointment skipped");
                    return;
                };
                if let (Ok(mut e), Ok(mut c)) = (employee.try_write(), client.try_write()) {
                    self.apply_appointment(&mut e, &mut c, event);
                }
            }
            _ => self.apply_directory(event),
        }
    }

    fn ledgers_for(&self, event: &Event) -> Option<(SharedLedger, SharedLedger)> {
        let (employee_id, client_id) = match event {
            Event::AppointmentBooked(a) => (a.employee_id, a.client_id),
            Event::AppointmentRescheduled { id, .. } | Event::AppointmentCancelled { id, .. } => {
                let a = self.appointments.get(id)?;
                (a.employee_id, a.client_id)
            }
            _ => return None,
        };
        Some((self.employee_ledger(employee_id), self.client_ledger(client_id)))
    }

    // ── State lookups ────────────────────────────────────────

    pub(super) fn schedule(&self, owner: Owner, company_id: Ulid) -> SharedSchedule {
        self.schedules
            .entry(owner)
            .or_insert_with(|| Arc::new(RwLock::new(WorkSchedule::new(owner, company_id))))
            .clone()
    }

    pub(super) fn existing_schedule(&self, owner: &Owner) -> Option<SharedSchedule> {
        self.schedules.get(owner).map(|e| e.value().clone())
    }

    pub(super) fn employee_ledger(&self, employee_id: Ulid) -> SharedLedger {
        self.employee_ledgers
            .entry(employee_id)
            .or_insert_with(|| Arc::new(RwLock::new(Ledger::new(employee_id))))
            .clone()
    }

    pub(super) fn client_ledger(&self, client_id: Ulid) -> SharedLedger {
        self.client_ledgers
            .entry(client_id)
            .or_insert_with(|| Arc::new(RwLock::new(Ledger::new(client_id))))
            .clone()
    }

    pub(super) fn company_of_owner(&self, owner: &Owner) -> Result<Ulid, EngineError> {
        let company = match owner.kind {
            OwnerKind::Employee => self.employees.get(&owner.id).map(|e| e.company_id),
            OwnerKind::Branch => self.branches.get(&owner.id).map(|b| b.company_id),
        };
        company.ok_or(EngineError::NotFound(owner.id))
    }

    pub(super) fn deadline(&self, ctx: &Ctx) -> Instant {
        Instant::now() + ctx.timeout.unwrap_or(self.config.request_timeout)
    }

    // ── Bounded lock acquisition ─────────────────────────────

    /// Wait for a lock in slices of `lock_wait`, backing off exponentially
    /// between slices, until `deadline` or `max_commit_attempts`. Exhaustion
    /// is a retryable timeout, never a conflict.
    pub(super) async fn acquire<G, F, Fut>(&self, what: &'static str, deadline: Instant, mut attempt_lock: F) -> Result<G, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = G>,
    {
        let mut attempt = 0u32;
        loop {
            let wait = self.config.lock_wait.min(deadline.saturating_duration_since(Instant::now()));
            if let Ok(guard) = tokio::time::timeout(wait, attempt_lock()).await {
                return Ok(guard);
            }
            attempt += 1;
            metrics::counter!(LOCK_RETRIES_TOTAL, "lock" => what).increment(1);
            if attempt >= self.config.max_commit_attempts || Instant::now() >= deadline {
                warn!("gave up waiting for {what} after {attempt} attempts");
                return Err(EngineError::Timeout(what));
            }
            let pause = backoff(attempt).min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
        }
    }

    pub(super) async fn enter_gate(&self, deadline: Instant) -> Result<OwnedRwLockReadGuard<()>, EngineError> {
        self.acquire("commit gate", deadline, || Arc::clone(&self.gate).read_owned())
            .await
    }

    pub(super) async fn write_ledger(
        &self,
        ledger: &SharedLedger,
        what: &'static str,
        deadline: Instant,
    ) -> Result<OwnedRwLockWriteGuard<Ledger>, EngineError> {
        self.acquire(what, deadline, || Arc::clone(ledger).write_owned()).await
    }

    pub(super) async fn write_schedule(
        &self,
        schedule: &SharedSchedule,
        deadline: Instant,
    ) -> Result<OwnedRwLockWriteGuard<WorkSchedule>, EngineError> {
        self.acquire("schedule lock", deadline, || Arc::clone(schedule).write_owned())
            .await
    }

    pub(super) async fn read_schedule(
        &self,
        schedule: &SharedSchedule,
        deadline: Instant,
    ) -> Result<OwnedRwLockReadGuard<WorkSchedule>, EngineError> {
        self.acquire("schedule lock", deadline, || Arc::clone(schedule).read_owned())
            .await
    }

    pub(super) async fn read_ledger(
        &self,
        ledger: &SharedLedger,
        deadline: Instant,
    ) -> Result<OwnedRwLockReadGuard<Ledger>, EngineError> {
        self.acquire("ledger lock", deadline, || Arc::clone(ledger).read_owned())
            .await
    }

    // ── Persistence ──────────────────────────────────────────

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply + publish for directory records. Caller holds the gate.
    pub(super) async fn persist_directory(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_directory(&event);
        self.notify.publish(&event);
        Ok(())
    }

    /// WAL-append + apply + publish for a work range. Caller holds the gate
    /// and the owner's schedule write lock.
    pub(super) async fn persist_schedule(&self, schedule: &mut WorkSchedule, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_schedule(schedule, &event);
        self.notify.publish(&event);
        Ok(())
    }

    /// Commit an appointment event. Runs to completion in its own task so a
    /// caller that gives up mid-way cannot leave the log and memory apart;
    /// the task owns every guard until the apply is done.
    pub(super) async fn commit_appointment(
        self: &Arc<Self>,
        gate: OwnedRwLockReadGuard<()>,
        mut employee: OwnedRwLockWriteGuard<Ledger>,
        mut client: OwnedRwLockWriteGuard<Ledger>,
        event: Event,
    ) -> Result<(), EngineError> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _gate = gate;
            engine.wal_append(&event).await?;
            engine.apply_appointment(&mut employee, &mut client, &event);
            engine.notify.publish(&event);
            Ok::<(), EngineError>(())
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    // ── Apply ────────────────────────────────────────────────

    fn apply_directory(&self, event: &Event) {
        match event {
            Event::CompanySaved(c) => {
                self.companies.insert(c.id, c.clone());
            }
            Event::CompanyRemoved { id } => {
                self.companies.remove(id);
            }
            Event::BranchSaved(b) => {
                self.branches.insert(b.id, b.clone());
            }
            Event::BranchRemoved { id, .. } => {
                self.branches.remove(id);
                self.schedules.remove(&Owner::branch(*id));
            }
            Event::EmployeeSaved(e) => {
                self.employees.insert(e.id, e.clone());
            }
            Event::EmployeeRemoved { id, .. } => {
                self.employees.remove(id);
                self.schedules.remove(&Owner::employee(*id));
                self.employee_ledgers.remove(id);
            }
            Event::ServiceSaved(s) => {
                self.services.insert(s.id, s.clone());
            }
            Event::ServiceRemoved { id, .. } => {
                self.services.remove(id);
            }
            _ => {}
        }
    }

    fn apply_schedule(&self, schedule: &mut WorkSchedule, event: &Event) {
        match event {
            Event::WorkRangeSaved(range) => {
                self.range_owner.insert(range.id, range.owner);
                schedule.upsert(range.clone());
            }
            Event::WorkRangeRemoved { id, .. } => {
                self.range_owner.remove(id);
                schedule.remove(id);
            }
            _ => {}
        }
    }

    fn apply_appointment(&self, employee: &mut Ledger, client: &mut Ledger, event: &Event) {
        match event {
            Event::AppointmentBooked(a) => {
                if a.is_scheduled() {
                    employee.insert(a.id, a.span);
                    client.insert(a.id, a.span);
                    metrics::gauge!(APPOINTMENTS_SCHEDULED).increment(1.0);
                }
                self.appointments.insert(a.id, a.clone());
            }
            Event::AppointmentRescheduled {
                id,
                span,
                time_zone,
                at,
                ..
            } => {
                if let Some(mut a) = self.appointments.get_mut(id) {
                    record_reschedule(&mut a, *span, time_zone, *at);
                }
                employee.remove(*id);
                employee.insert(*id, *span);
                client.remove(*id);
                client.insert(*id, *span);
            }
            Event::AppointmentCancelled { id, by, at, .. } => {
                if let Some(mut a) = self.appointments.get_mut(id) {
                    a.status = AppointmentStatus::Cancelled;
                    a.cancelled_at = Some(*at);
                    a.cancelled_by = Some(*by);
                }
                if employee.remove(*id).is_some() {
                    metrics::gauge!(APPOINTMENTS_SCHEDULED).decrement(1.0);
                }
                client.remove(*id);
            }
            _ => {}
        }
    }

    /// Events that recreate the current state. Caller holds the gate for
    /// writing, so no writer holds a schedule lock and `try_read` succeeds.
    pub(super) fn snapshot(&self) -> Result<Vec<Event>, EngineError> {
        let mut events: Vec<Event> = Vec::new();
        events.extend(self.companies.iter().map(|c| Event::CompanySaved(c.value().clone())));
        events.extend(self.services.iter().map(|s| Event::ServiceSaved(s.value().clone())));
        events.extend(self.branches.iter().map(|b| Event::BranchSaved(b.value().clone())));
        events.extend(self.employees.iter().map(|e| Event::EmployeeSaved(e.value().clone())));
        for entry in self.schedules.iter() {
            let schedule = entry
                .value()
                .try_read()
                .map_err(|_| EngineError::Timeout("schedule snapshot"))?;
            events.extend(schedule.ranges.iter().cloned().map(Event::WorkRangeSaved));
        }
        events.extend(
            self.appointments
                .iter()
                .map(|a| Event::AppointmentBooked(a.value().clone())),
        );
        Ok(events)
    }
}

/// Append audit entries for every field a reschedule changes, then move it.
fn record_reschedule(a: &mut Appointment, span: Span, time_zone: &str, at: Ms) {
    let old_tz = zone::parse_zone(&a.time_zone);
    let new_tz = zone::parse_zone(time_zone);
    let show = |ms: Ms, tz: Option<chrono_tz::Tz>| match tz {
        Some(tz) => zone::to_rfc3339(ms, tz),
        None => ms.to_string(),
    };

    let mut changes = Vec::new();
    if a.span.start != span.start {
        changes.push(("start_time", show(a.span.start, old_tz), show(span.start, new_tz)));
    }
    if a.span.end != span.end {
        changes.push(("end_time", show(a.span.end, old_tz), show(span.end, new_tz)));
    }
    if a.time_zone != time_zone {
        changes.push(("time_zone", a.time_zone.clone(), time_zone.to_string()));
    }
    for (field, old_value, new_value) in changes {
        a.history.push(FieldChange {
            at,
            field: field.to_string(),
            old_value,
            new_value,
        });
    }
    if a.history.len() > MAX_HISTORY_ENTRIES {
        let excess = a.history.len() - MAX_HISTORY_ENTRIES;
        a.history.drain(..excess);
    }

    a.span = span;
    a.time_zone = time_zone.to_string();
}

fn backoff(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    Duration::from_millis((COMMIT_BACKOFF_BASE_MS * factor).min(COMMIT_BACKOFF_MAX_MS))
}
