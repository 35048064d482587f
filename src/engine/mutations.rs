use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::access::{Action, Ctx};
use crate::limits::MAX_SERVICES_PER_RANGE;
use crate::model::*;
use crate::observability;
use crate::patch::{AppointmentPatch, WorkRangePatch};
use crate::zone;

use super::conflict::{check_no_conflict, now_ms, span_from};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Work ranges ──────────────────────────────────────────

    pub async fn add_work_range(&self, ctx: &Ctx, input: NewWorkRange) -> Result<WorkRange, EngineError> {
        let started = Instant::now();
        let result = self.add_work_range_inner(ctx, input).await;
        observability::record("add_work_range", started, &result);
        result
    }

    async fn add_work_range_inner(&self, ctx: &Ctx, input: NewWorkRange) -> Result<WorkRange, EngineError> {
        let weekday = Weekday::new(input.weekday)
            .ok_or_else(|| EngineError::InvalidRange(format!("weekday {} outside 0..=6", input.weekday)))?;
        let owner_company = self.company_of_owner(&input.owner)?;
        let branch_company = self
            .branches
            .get(&input.branch_id)
            .map(|b| b.company_id)
            .ok_or(EngineError::NotFound(input.branch_id))?;
        self.authorizer.guard(
            ctx,
            &[(input.owner.id, owner_company), (input.branch_id, branch_company)],
        )?;
        self.authorizer.authorize_schedule_edit(&ctx.caller, &input.owner)?;
        if input.owner.kind == OwnerKind::Branch && input.owner.id != input.branch_id {
            return Err(EngineError::InvalidInput("a branch range must sit at its own branch".into()));
        }

        let range = WorkRange {
            id: Ulid::new(),
            owner: input.owner,
            company_id: owner_company,
            branch_id: input.branch_id,
            weekday,
            start_time: input.start_time,
            end_time: input.end_time,
            time_zone: input.time_zone,
            services: input.services,
        };
        self.check_range_services(ctx, &range)?;

        let deadline = self.deadline(ctx);
        let _gate = self.enter_gate(deadline).await?;
        let schedule = self.schedule(range.owner, range.company_id);
        let mut guard = self.write_schedule(&schedule, deadline).await?;
        guard.validate(&range)?;
        if !range.is_bookable() {
            warn!("work range {} lists no services and cannot be booked", range.id);
        }
        self.persist_schedule(&mut guard, Event::WorkRangeSaved(range.clone()))
            .await?;
        debug!("work range {} added for {:?} {}", range.id, range.owner.kind, range.owner.id);
        Ok(range)
    }

    pub async fn update_work_range(&self, ctx: &Ctx, id: Ulid, patch: WorkRangePatch) -> Result<WorkRange, EngineError> {
        let started = Instant::now();
        let result = self.update_work_range_inner(ctx, id, patch).await;
        observability::record("update_work_range", started, &result);
        result
    }

    async fn update_work_range_inner(&self, ctx: &Ctx, id: Ulid, patch: WorkRangePatch) -> Result<WorkRange, EngineError> {
        let owner = self
            .range_owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let schedule = self.existing_schedule(&owner).ok_or(EngineError::NotFound(id))?;

        let deadline = self.deadline(ctx);
        let _gate = self.enter_gate(deadline).await?;
        let mut guard = self.write_schedule(&schedule, deadline).await?;
        let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        self.authorizer.guard(ctx, &[(id, current.company_id)])?;
        self.authorizer.authorize_schedule_edit(&ctx.caller, &current.owner)?;

        let next = patch.apply(&current)?;
        self.check_range_services(ctx, &next)?;
        if patch.touches_timing() {
            guard.validate(&next)?;
        }
        if !next.is_bookable() {
            warn!("work range {id} lists no services and cannot be booked");
        }
        self.persist_schedule(&mut guard, Event::WorkRangeSaved(next.clone()))
            .await?;
        Ok(next)
    }

    pub async fn remove_work_range(&self, ctx: &Ctx, id: Ulid) -> Result<WorkRange, EngineError> {
        let started = Instant::now();
        let result = self.remove_work_range_inner(ctx, id).await;
        observability::record("remove_work_range", started, &result);
        result
    }

    async fn remove_work_range_inner(&self, ctx: &Ctx, id: Ulid) -> Result<WorkRange, EngineError> {
        let owner = self
            .range_owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let schedule = self.existing_schedule(&owner).ok_or(EngineError::NotFound(id))?;

        let deadline = self.deadline(ctx);
        let _gate = self.enter_gate(deadline).await?;
        let mut guard = self.write_schedule(&schedule, deadline).await?;
        let current = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        self.authorizer.guard(ctx, &[(id, current.company_id)])?;
        self.authorizer.authorize_schedule_edit(&ctx.caller, &current.owner)?;

        let event = Event::WorkRangeRemoved {
            id,
            owner: current.owner,
            company_id: current.company_id,
        };
        self.persist_schedule(&mut guard, event).await?;
        Ok(current)
    }

    /// Services listed on a range must belong to the company and be offered
    /// by the branch, and for employee ranges by an employee working there.
    fn check_range_services(&self, ctx: &Ctx, range: &WorkRange) -> Result<(), EngineError> {
        if range.services.len() > MAX_SERVICES_PER_RANGE {
            return Err(EngineError::LimitExceeded("too many services on work range"));
        }
        let mut targets = Vec::with_capacity(range.services.len());
        for service_id in &range.services {
            let company = self
                .services
                .get(service_id)
                .map(|s| s.company_id)
                .ok_or_else(|| EngineError::InvalidRange(format!("unknown service {service_id}")))?;
            targets.push((*service_id, company));
        }
        self.authorizer.guard(ctx, &targets)?;

        let branch = self
            .branches
            .get(&range.branch_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(range.branch_id))?;
        if let Some(missing) = range.services.iter().find(|s| !branch.services.contains(s)) {
            return Err(EngineError::InvalidRange(format!(
                "service {missing} is not offered by branch {}",
                branch.id
            )));
        }

        if range.owner.kind == OwnerKind::Employee {
            let employee = self
                .employees
                .get(&range.owner.id)
                .map(|e| e.value().clone())
                .ok_or(EngineError::NotFound(range.owner.id))?;
            if !employee.branches.contains(&range.branch_id) {
                return Err(EngineError::InvalidRange(format!(
                    "employee {} does not work at branch {}",
                    employee.id, range.branch_id
                )));
            }
            if let Some(missing) = range.services.iter().find(|s| !employee.services.contains(s)) {
                return Err(EngineError::InvalidRange(format!(
                    "service {missing} is not offered by employee {}",
                    employee.id
                )));
            }
        }
        Ok(())
    }

    // ── Appointments ─────────────────────────────────────────

    pub async fn book(self: &Arc<Self>, ctx: &Ctx, input: NewAppointment) -> Result<Appointment, EngineError> {
        let started = Instant::now();
        let result = self.book_inner(ctx, input).await;
        observability::record("book", started, &result);
        result
    }

    async fn book_inner(self: &Arc<Self>, ctx: &Ctx, input: NewAppointment) -> Result<Appointment, EngineError> {
        let employee = self
            .employees
            .get(&input.employee_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(input.employee_id))?;
        let branch = self
            .branches
            .get(&input.branch_id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(input.branch_id))?;
        let service = self
            .services
            .get(&input.service_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(input.service_id))?;
        self.authorizer.guard(
            ctx,
            &[
                (employee.id, employee.company_id),
                (branch.id, branch.company_id),
                (service.id, service.company_id),
            ],
        )?;
        self.authorizer
            .authorize(&ctx.caller, Action::Create, employee.id, input.client_id)?;

        if !employee.branches.contains(&branch.id) {
            return Err(EngineError::InvalidInput(format!(
                "employee {} does not work at branch {}",
                employee.id, branch.id
            )));
        }
        if !employee.services.contains(&service.id) || !branch.services.contains(&service.id) {
            return Err(EngineError::InvalidInput(format!(
                "service {} is not offered by this employee at this branch",
                service.id
            )));
        }
        check_zone(&input.time_zone)?;
        if service.duration <= 0 {
            return Err(EngineError::InvalidInput("service has no duration".into()));
        }
        let span = span_from(input.start, service.duration)?;
        let now = now_ms();
        self.check_not_past(span.start, now)?;

        let deadline = self.deadline(ctx);
        if self.config.require_schedule_fit {
            self.check_schedule_fit(employee.id, branch.id, service.id, &span, deadline)
                .await?;
        }

        let gate = self.enter_gate(deadline).await?;
        let employee_guard = self
            .write_ledger(&self.employee_ledger(employee.id), "employee ledger", deadline)
            .await?;
        let client_guard = self
            .write_ledger(&self.client_ledger(input.client_id), "client ledger", deadline)
            .await?;
        check_no_conflict(&employee_guard, &span, None)
            .and_then(|()| check_no_conflict(&client_guard, &span, None))
            .inspect_err(|e| debug!("booking for employee {} rejected: {e}", employee.id))?;

        let appointment = Appointment {
            id: Ulid::new(),
            company_id: ctx.company_id,
            branch_id: branch.id,
            employee_id: employee.id,
            service_id: service.id,
            client_id: input.client_id,
            span,
            time_zone: input.time_zone,
            status: AppointmentStatus::Scheduled,
            created_at: now,
            cancelled_at: None,
            cancelled_by: None,
            history: Vec::new(),
        };
        self.commit_appointment(
            gate,
            employee_guard,
            client_guard,
            Event::AppointmentBooked(appointment.clone()),
        )
        .await?;
        info!("appointment {} booked with employee {}", appointment.id, employee.id);
        Ok(appointment)
    }

    /// Move a scheduled appointment to `new_start`, keeping its duration.
    /// `time_zone` replaces the display zone when given.
    pub async fn reschedule(
        self: &Arc<Self>,
        ctx: &Ctx,
        id: Ulid,
        new_start: Ms,
        time_zone: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let started = Instant::now();
        let result = self.reschedule_inner(ctx, id, new_start, time_zone).await;
        observability::record("reschedule", started, &result);
        result
    }

    /// Apply a whitelisted patch; only the start time and zone can change.
    pub async fn update_appointment(
        self: &Arc<Self>,
        ctx: &Ctx,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        let current_start = self
            .appointments
            .get(&id)
            .map(|a| a.span.start)
            .ok_or(EngineError::NotFound(id))?;
        let start = patch.start_time().unwrap_or(current_start);
        self.reschedule(ctx, id, start, patch.time_zone().map(str::to_string))
            .await
    }

    async fn reschedule_inner(
        self: &Arc<Self>,
        ctx: &Ctx,
        id: Ulid,
        new_start: Ms,
        time_zone: Option<String>,
    ) -> Result<Appointment, EngineError> {
        let current = self
            .appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        self.authorizer.guard(ctx, &[(id, current.company_id)])?;
        self.authorizer
            .authorize(&ctx.caller, Action::Reschedule, current.employee_id, current.client_id)?;
        if !current.is_scheduled() {
            return Err(EngineError::InvalidState("cancelled appointments cannot be rescheduled"));
        }
        let time_zone = match time_zone {
            Some(tz) => {
                check_zone(&tz)?;
                tz
            }
            None => current.time_zone.clone(),
        };
        let span = span_from(new_start, current.span.duration_ms())?;
        let now = now_ms();
        self.check_not_past(span.start, now)?;

        let deadline = self.deadline(ctx);
        if self.config.require_schedule_fit {
            self.check_schedule_fit(current.employee_id, current.branch_id, current.service_id, &span, deadline)
                .await?;
        }

        let gate = self.enter_gate(deadline).await?;
        let employee_guard = self
            .write_ledger(&self.employee_ledger(current.employee_id), "employee ledger", deadline)
            .await?;
        let client_guard = self
            .write_ledger(&self.client_ledger(current.client_id), "client ledger", deadline)
            .await?;
        // A concurrent cancel may have won the lock first.
        let still_scheduled = self
            .appointments
            .get(&id)
            .is_some_and(|a| a.is_scheduled());
        if !still_scheduled {
            return Err(EngineError::InvalidState("cancelled appointments cannot be rescheduled"));
        }
        check_no_conflict(&employee_guard, &span, Some(id))
            .and_then(|()| check_no_conflict(&client_guard, &span, Some(id)))
            .inspect_err(|e| debug!("reschedule of {id} rejected: {e}"))?;

        let event = Event::AppointmentRescheduled {
            id,
            company_id: current.company_id,
            employee_id: current.employee_id,
            span,
            time_zone,
            at: now,
        };
        self.commit_appointment(gate, employee_guard, client_guard, event)
            .await?;
        info!("appointment {id} moved to {}", span.start);
        self.appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel(self: &Arc<Self>, ctx: &Ctx, id: Ulid) -> Result<Appointment, EngineError> {
        let started = Instant::now();
        let result = self.cancel_inner(ctx, id).await;
        observability::record("cancel", started, &result);
        result
    }

    async fn cancel_inner(self: &Arc<Self>, ctx: &Ctx, id: Ulid) -> Result<Appointment, EngineError> {
        let current = self
            .appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        self.authorizer.guard(ctx, &[(id, current.company_id)])?;
        self.authorizer
            .authorize(&ctx.caller, Action::Cancel, current.employee_id, current.client_id)?;
        if !current.is_scheduled() {
            return Err(EngineError::InvalidState("appointment already cancelled"));
        }
        let now = now_ms();
        if self.config.past_booking_grace.is_some() && now >= current.span.start {
            return Err(EngineError::InvalidState("appointment already started"));
        }

        let deadline = self.deadline(ctx);
        let gate = self.enter_gate(deadline).await?;
        let employee_guard = self
            .write_ledger(&self.employee_ledger(current.employee_id), "employee ledger", deadline)
            .await?;
        let client_guard = self
            .write_ledger(&self.client_ledger(current.client_id), "client ledger", deadline)
            .await?;
        let still_scheduled = self
            .appointments
            .get(&id)
            .is_some_and(|a| a.is_scheduled());
        if !still_scheduled {
            return Err(EngineError::InvalidState("appointment already cancelled"));
        }

        let event = Event::AppointmentCancelled {
            id,
            company_id: current.company_id,
            employee_id: current.employee_id,
            by: ctx.caller.id,
            at: now,
        };
        self.commit_appointment(gate, employee_guard, client_guard, event)
            .await?;
        info!("appointment {id} cancelled by {}", ctx.caller.id);
        self.appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    fn check_not_past(&self, start: Ms, now: Ms) -> Result<(), EngineError> {
        match self.config.past_booking_grace {
            Some(grace) if start < now.saturating_sub(grace) => Err(EngineError::InvalidState("appointment starts in the past")),
            _ => Ok(()),
        }
    }

    async fn check_schedule_fit(
        &self,
        employee_id: Ulid,
        branch_id: Ulid,
        service_id: Ulid,
        span: &Span,
        deadline: tokio::time::Instant,
    ) -> Result<(), EngineError> {
        let open = self
            .open_time_for(employee_id, branch_id, service_id, span, deadline)
            .await?;
        if open.iter().any(|s| s.contains_span(span)) {
            Ok(())
        } else {
            Err(EngineError::InvalidInput("appointment is outside working hours".into()))
        }
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list for the current state.
    /// Writers are held off at the gate for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let events = self.snapshot()?;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn check_zone(time_zone: &str) -> Result<(), EngineError> {
    zone::parse_zone(time_zone)
        .map(|_| ())
        .ok_or_else(|| EngineError::InvalidInput(format!("unknown time zone {time_zone:?}")))
}
