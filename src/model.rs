use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only absolute time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Weekly wall-clock types ──────────────────────────────────────

/// Day of week, 0 = Sunday … 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Weekday(u8);

impl Weekday {
    pub fn new(day: u8) -> Option<Self> {
        (day <= 6).then_some(Self(day))
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn from_chrono(day: chrono::Weekday) -> Self {
        Self(day.num_days_from_sunday() as u8)
    }
}

/// Wall-clock time of day in whole minutes since midnight. `24:00` is accepted
/// as an end-of-day marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(24 * 60);

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
            return None;
        }
        Some(Self(hour as u16 * 60 + minute as u16))
    }

    /// Parse `HH:MM`.
    pub fn parse(s: &str) -> Option<Self> {
        let (h, m) = s.split_once(':')?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return None;
        }
        Self::new(h.parse().ok()?, m.parse().ok()?)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

// ── Work schedules ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerKind {
    Employee,
    Branch,
}

/// The employee or branch a work range belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub kind: OwnerKind,
    pub id: Ulid,
}

impl Owner {
    pub fn employee(id: Ulid) -> Self {
        Self { kind: OwnerKind::Employee, id }
    }

    pub fn branch(id: Ulid) -> Self {
        Self { kind: OwnerKind::Branch, id }
    }
}

/// One weekly-recurring availability window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRange {
    pub id: Ulid,
    pub owner: Owner,
    pub company_id: Ulid,
    /// For branch ranges this is the owner itself.
    pub branch_id: Ulid,
    pub weekday: Weekday,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub time_zone: String,
    pub services: BTreeSet<Ulid>,
}

impl WorkRange {
    /// A range listing no services can never produce a slot.
    pub fn is_bookable(&self) -> bool {
        !self.services.is_empty()
    }

    pub fn offers(&self, service_id: &Ulid) -> bool {
        self.services.contains(service_id)
    }
}

/// Input for creating a work range. Times and weekday are validated by the engine.
#[derive(Debug, Clone)]
pub struct NewWorkRange {
    pub owner: Owner,
    pub branch_id: Ulid,
    pub weekday: u8,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub time_zone: String,
    pub services: BTreeSet<Ulid>,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Cancelled,
}

/// One audited change made to an appointment after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub at: Ms,
    pub field: String,
    pub old_value: String,
    pub new_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub company_id: Ulid,
    pub branch_id: Ulid,
    pub employee_id: Ulid,
    pub service_id: Ulid,
    pub client_id: Ulid,
    /// Absolute UTC interval.
    pub span: Span,
    /// Zone the booking was made in; display only.
    pub time_zone: String,
    pub status: AppointmentStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub cancelled_by: Option<Ulid>,
    pub history: Vec<FieldChange>,
}

impl Appointment {
    pub fn is_scheduled(&self) -> bool {
        self.status == AppointmentStatus::Scheduled
    }
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub employee_id: Ulid,
    pub branch_id: Ulid,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub start: Ms,
    pub time_zone: String,
}

/// A candidate bookable start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub employee_id: Ulid,
    pub branch_id: Ulid,
    pub service_id: Ulid,
    pub time_zone: String,
}

/// Sorted index of scheduled spans for one employee or one client. The write
/// half of its lock is the commit lock for that owner.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub owner_id: Ulid,
    /// Scheduled appointments, sorted by `span.start`.
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub appointment_id: Ulid,
    pub span: Span,
}

impl Ledger {
    pub fn new(owner_id: Ulid) -> Self {
        Self {
            owner_id,
            entries: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appointment_id: Ulid, span: Span) {
        let pos = self
            .entries
            .binary_search_by_key(&span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, LedgerEntry { appointment_id, span });
    }

    pub fn remove(&mut self, appointment_id: Ulid) -> Option<LedgerEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.appointment_id == appointment_id)?;
        Some(self.entries.remove(pos))
    }

    /// Entries whose span overlaps the query window.
    /// Binary search skips entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &LedgerEntry> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

// ── Tenancy context ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Ulid,
    pub company_id: Ulid,
    pub name: String,
    pub time_zone: String,
    pub services: BTreeSet<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: Ulid,
    pub company_id: Ulid,
    pub name: String,
    pub branches: BTreeSet<Ulid>,
    pub services: BTreeSet<Ulid>,
    /// Slot granularity for this employee; falls back to the service duration.
    pub slot_step: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub company_id: Ulid,
    pub name: String,
    pub duration: Ms,
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CompanySaved(Company),
    CompanyRemoved {
        id: Ulid,
    },
    BranchSaved(Branch),
    BranchRemoved {
        id: Ulid,
        company_id: Ulid,
    },
    EmployeeSaved(Employee),
    EmployeeRemoved {
        id: Ulid,
        company_id: Ulid,
    },
    ServiceSaved(Service),
    ServiceRemoved {
        id: Ulid,
        company_id: Ulid,
    },
    WorkRangeSaved(WorkRange),
    WorkRangeRemoved {
        id: Ulid,
        owner: Owner,
        company_id: Ulid,
    },
    AppointmentBooked(Appointment),
    AppointmentRescheduled {
        id: Ulid,
        company_id: Ulid,
        employee_id: Ulid,
        span: Span,
        time_zone: String,
        at: Ms,
    },
    AppointmentCancelled {
        id: Ulid,
        company_id: Ulid,
        employee_id: Ulid,
        by: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn company_id(&self) -> Ulid {
        match self {
            Event::CompanySaved(c) => c.id,
            Event::CompanyRemoved { id } => *id,
            Event::BranchSaved(b) => b.company_id,
            Event::EmployeeSaved(e) => e.company_id,
            Event::ServiceSaved(s) => s.company_id,
            Event::WorkRangeSaved(r) => r.company_id,
            Event::AppointmentBooked(a) => a.company_id,
            Event::BranchRemoved { company_id, .. }
            | Event::EmployeeRemoved { company_id, .. }
            | Event::ServiceRemoved { company_id, .. }
            | Event::WorkRangeRemoved { company_id, .. }
            | Event::AppointmentRescheduled { company_id, .. }
            | Event::AppointmentCancelled { company_id, .. } => *company_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub company_id: Ulid,
    pub branch_id: Ulid,
    pub employee_id: Ulid,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub start_time: Ms,
    pub end_time: Ms,
    pub time_zone: String,
    pub status: AppointmentStatus,
    pub cancelled_at: Option<Ms>,
    pub changes: usize,
}

impl From<&Appointment> for AppointmentInfo {
    fn from(a: &Appointment) -> Self {
        Self {
            id: a.id,
            company_id: a.company_id,
            branch_id: a.branch_id,
            employee_id: a.employee_id,
            service_id: a.service_id,
            client_id: a.client_id,
            start_time: a.span.start,
            end_time: a.span.end,
            time_zone: a.time_zone.clone(),
            status: a.status,
            cancelled_at: a.cancelled_at,
            changes: a.history.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRangeInfo {
    pub id: Ulid,
    pub owner: Owner,
    pub branch_id: Ulid,
    pub weekday: u8,
    pub start_time: String,
    pub end_time: String,
    pub time_zone: String,
    pub services: Vec<Ulid>,
    pub bookable: bool,
}

impl From<&WorkRange> for WorkRangeInfo {
    fn from(r: &WorkRange) -> Self {
        Self {
            id: r.id,
            owner: r.owner,
            branch_id: r.branch_id,
            weekday: r.weekday.number(),
            start_time: r.start_time.to_string(),
            end_time: r.end_time.to_string(),
            time_zone: r.time_zone.clone(),
            services: r.services.iter().copied().collect(),
            bookable: r.is_bookable(),
        }
    }
}

/// Listing filter; visibility rules are applied on top of it.
#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter {
    pub employee_id: Option<Ulid>,
    pub branch_id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub window: Option<Span>,
    pub include_cancelled: bool,
}

impl AppointmentFilter {
    pub fn matches(&self, a: &Appointment) -> bool {
        self.employee_id.is_none_or(|id| id == a.employee_id)
            && self.branch_id.is_none_or(|id| id == a.branch_id)
            && self.client_id.is_none_or(|id| id == a.client_id)
            && self.window.is_none_or(|w| w.overlaps(&a.span))
            && (self.include_cancelled || a.is_scheduled())
    }
}
