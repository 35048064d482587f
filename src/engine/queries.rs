use std::time::Instant;

use chrono::{Days, NaiveDate};
use dashmap::DashMap;
use futures::future::try_join_all;
use ulid::Ulid;

use crate::access::{Action, Ctx};
use crate::limits::{MAX_SERVICE_DURATION_MS, MIN_SLOT_STEP_MS};
use crate::model::*;
use crate::observability::{self, SLOTS_EMITTED};
use crate::zone;

use super::availability::{SlotIter, SlotSource, free_time, merge_overlapping, open_time};
use super::conflict::{now_ms, validate_window};
use super::{Engine, EngineError, SharedLedger};

/// Arguments of one availability lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotQuery {
    pub employee_id: Ulid,
    pub branch_id: Ulid,
    pub service_id: Ulid,
    pub window: Span,
    /// Zone the caller browses in.
    pub time_zone: String,
    /// Overrides the employee's slot step.
    pub step: Option<Ms>,
    /// Hide slots overlapping this client's own appointments.
    pub client_id: Option<Ulid>,
}

impl SlotQuery {
    pub fn new(employee_id: Ulid, branch_id: Ulid, service_id: Ulid, window: Span, time_zone: impl Into<String>) -> Self {
        Self {
            employee_id,
            branch_id,
            service_id,
            window,
            time_zone: time_zone.into(),
            step: None,
            client_id: None,
        }
    }

    pub fn with_step(mut self, step: Ms) -> Self {
        self.step = Some(step);
        self
    }

    pub fn for_client(mut self, client_id: Ulid) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Window from local midnight of `date` to local midnight `days` later,
    /// both in `time_zone`.
    pub fn local_days(date: NaiveDate, days: u32, time_zone: &str) -> Result<Span, EngineError> {
        let tz = zone::parse_zone(time_zone)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown time zone {time_zone:?}")))?;
        if days == 0 {
            return Err(EngineError::InvalidInput("window must cover at least one day".into()));
        }
        let last = date
            .checked_add_days(Days::new(days as u64))
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        Ok(Span::new(zone::local_midnight(tz, date), zone::local_midnight(tz, last)))
    }
}

impl Engine {
    /// Bookable slots for one employee, branch and service inside the
    /// query window. Only short read guards are taken, to snapshot the
    /// schedules and the ledgers; the iterator itself is detached.
    pub async fn find_slots(&self, ctx: &Ctx, query: &SlotQuery) -> Result<SlotIter, EngineError> {
        let started = Instant::now();
        let result = self.find_slots_inner(ctx, query).await;
        observability::record("find_slots", started, &result);
        result
    }

    async fn find_slots_inner(&self, ctx: &Ctx, query: &SlotQuery) -> Result<SlotIter, EngineError> {
        let employee = self
            .employees
            .get(&query.employee_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(query.employee_id))?;
        let branch_company = self
            .branches
            .get(&query.branch_id)
            .map(|b| b.company_id)
            .ok_or(EngineError::NotFound(query.branch_id))?;
        let service = self
            .services
            .get(&query.service_id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(query.service_id))?;
        self.authorizer.guard(
            ctx,
            &[
                (employee.id, employee.company_id),
                (query.branch_id, branch_company),
                (service.id, service.company_id),
            ],
        )?;
        validate_window(&query.window)?;
        if zone::parse_zone(&query.time_zone).is_none() {
            return Err(EngineError::InvalidInput(format!("unknown time zone {:?}", query.time_zone)));
        }
        if let Some(step) = query.step
            && !(MIN_SLOT_STEP_MS..=MAX_SERVICE_DURATION_MS).contains(&step)
        {
            return Err(EngineError::LimitExceeded("slot step out of range"));
        }
        if let Some(client_id) = query.client_id {
            self.authorizer.authorize_client_filter(&ctx.caller, client_id)?;
        }

        let step = query
            .step
            .or(employee.slot_step)
            .or(self.config.default_slot_step)
            .unwrap_or(service.duration);
        let source = SlotSource {
            employee_id: employee.id,
            branch_id: query.branch_id,
            service_id: service.id,
            time_zone: query.time_zone.clone(),
            duration: service.duration,
            step,
        };
        if !employee.branches.contains(&query.branch_id) || !employee.services.contains(&service.id) {
            return Ok(SlotIter::empty(source));
        }

        let deadline = self.deadline(ctx);
        let (employee_ranges, branch_ranges) = self
            .offerings(employee.id, query.branch_id, service.id, deadline)
            .await?;
        if employee_ranges.is_empty() || branch_ranges.is_empty() {
            return Ok(SlotIter::empty(source));
        }

        let Some(window) = self.bookable_window(&query.window) else {
            return Ok(SlotIter::empty(source));
        };
        let mut busy = self.busy_in(&self.employee_ledgers, employee.id, &window, deadline).await?;
        if let Some(client_id) = query.client_id {
            busy.extend(self.busy_in(&self.client_ledgers, client_id, &window, deadline).await?);
            busy.sort_by_key(|s| s.start);
            busy = merge_overlapping(&busy);
        }

        let free = free_time(&employee_ranges, &branch_ranges, &busy, &window);
        Ok(SlotIter::new(free, source))
    }

    /// `window` without the part that can no longer be booked; `None` once
    /// all of it is past.
    fn bookable_window(&self, window: &Span) -> Option<Span> {
        let Some(grace) = self.config.past_booking_grace else {
            return Some(*window);
        };
        let earliest = now_ms().saturating_sub(grace);
        (window.end > earliest).then(|| Span::new(window.start.max(earliest), window.end))
    }

    /// Scheduled spans of one ledger inside `window`, sorted by start.
    async fn busy_in(
        &self,
        ledgers: &DashMap<Ulid, SharedLedger>,
        owner_id: Ulid,
        window: &Span,
        deadline: tokio::time::Instant,
    ) -> Result<Vec<Span>, EngineError> {
        let ledger = ledgers.get(&owner_id).map(|l| l.value().clone());
        match ledger {
            Some(ledger) => {
                let guard = self.read_ledger(&ledger, deadline).await?;
                Ok(guard.overlapping(window).map(|e| e.span).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    /// Slots of every employee offering `service_id` at `branch_id`, in start
    /// order; ties break on employee id. With `client_id`, times that client
    /// already has booked are left out.
    pub async fn find_service_slots(
        &self,
        ctx: &Ctx,
        branch_id: Ulid,
        service_id: Ulid,
        window: Span,
        time_zone: &str,
        client_id: Option<Ulid>,
    ) -> Result<Vec<Slot>, EngineError> {
        let started = Instant::now();
        let result = self
            .find_service_slots_inner(ctx, branch_id, service_id, window, time_zone, client_id)
            .await;
        observability::record("find_service_slots", started, &result);
        if let Ok(slots) = &result {
            metrics::histogram!(SLOTS_EMITTED).record(slots.len() as f64);
        }
        result
    }

    async fn find_service_slots_inner(
        &self,
        ctx: &Ctx,
        branch_id: Ulid,
        service_id: Ulid,
        window: Span,
        time_zone: &str,
        client_id: Option<Ulid>,
    ) -> Result<Vec<Slot>, EngineError> {
        let branch_company = self
            .branches
            .get(&branch_id)
            .map(|b| b.company_id)
            .ok_or(EngineError::NotFound(branch_id))?;
        let service_company = self
            .services
            .get(&service_id)
            .map(|s| s.company_id)
            .ok_or(EngineError::NotFound(service_id))?;
        self.authorizer
            .guard(ctx, &[(branch_id, branch_company), (service_id, service_company)])?;

        let mut employees: Vec<Ulid> = self
            .employees
            .iter()
            .filter(|e| {
                e.company_id == ctx.company_id && e.branches.contains(&branch_id) && e.services.contains(&service_id)
            })
            .map(|e| e.id)
            .collect();
        employees.sort();

        let queries: Vec<SlotQuery> = employees
            .into_iter()
            .map(|employee_id| SlotQuery {
                client_id,
                ..SlotQuery::new(employee_id, branch_id, service_id, window, time_zone)
            })
            .collect();
        let per_employee = try_join_all(queries.iter().map(|q| self.find_slots_inner(ctx, q))).await?;

        let mut slots: Vec<Slot> = per_employee.into_iter().flatten().collect();
        slots.sort_by(|a, b| a.start.cmp(&b.start).then(a.employee_id.cmp(&b.employee_id)));
        Ok(slots)
    }

    /// Work ranges of the employee and of the branch that offer the service
    /// at the branch.
    async fn offerings(
        &self,
        employee_id: Ulid,
        branch_id: Ulid,
        service_id: Ulid,
        deadline: tokio::time::Instant,
    ) -> Result<(Vec<WorkRange>, Vec<WorkRange>), EngineError> {
        let mut sides = [Vec::new(), Vec::new()];
        for (side, owner) in sides
            .iter_mut()
            .zip([Owner::employee(employee_id), Owner::branch(branch_id)])
        {
            if let Some(schedule) = self.existing_schedule(&owner) {
                let guard = self.read_schedule(&schedule, deadline).await?;
                *side = guard.offering(branch_id, service_id);
            }
        }
        let [employee, branch] = sides;
        Ok((employee, branch))
    }

    /// Employee ∩ branch working time for a service around `span`.
    pub(super) async fn open_time_for(
        &self,
        employee_id: Ulid,
        branch_id: Ulid,
        service_id: Ulid,
        span: &Span,
        deadline: tokio::time::Instant,
    ) -> Result<Vec<Span>, EngineError> {
        let (employee_ranges, branch_ranges) = self
            .offerings(employee_id, branch_id, service_id, deadline)
            .await?;
        Ok(open_time(&employee_ranges, &branch_ranges, span))
    }

    pub async fn get_appointment(&self, ctx: &Ctx, id: Ulid) -> Result<Appointment, EngineError> {
        let appointment = self
            .appointments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        self.authorizer.guard(ctx, &[(id, appointment.company_id)])?;
        self.authorizer.authorize(
            &ctx.caller,
            Action::Read,
            appointment.employee_id,
            appointment.client_id,
        )?;
        Ok(appointment)
    }

    /// Appointments of the claimed company the caller may see, by start time.
    pub fn list_appointments(&self, ctx: &Ctx, filter: &AppointmentFilter) -> Result<Vec<AppointmentInfo>, EngineError> {
        self.authorizer.guard(ctx, &[])?;
        let visibility = self.authorizer.visibility(&ctx.caller);
        let mut result: Vec<AppointmentInfo> = self
            .appointments
            .iter()
            .filter(|a| a.company_id == ctx.company_id && visibility.admits(a) && filter.matches(a))
            .map(|a| AppointmentInfo::from(a.value()))
            .collect();
        result.sort_by_key(|a| (a.start_time, a.id));
        Ok(result)
    }

    /// Every work range of `owner`, by weekday then start time.
    pub async fn work_schedule(&self, ctx: &Ctx, owner: Owner) -> Result<Vec<WorkRangeInfo>, EngineError> {
        let company_id = self.company_of_owner(&owner)?;
        self.authorizer.guard(ctx, &[(owner.id, company_id)])?;
        let Some(schedule) = self.existing_schedule(&owner) else {
            return Ok(Vec::new());
        };
        let guard = self.read_schedule(&schedule, self.deadline(ctx)).await?;
        Ok(guard.ranges.iter().map(WorkRangeInfo::from).collect())
    }
}
