use std::collections::BTreeSet;

use serde_json::Value;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Ms, TimeOfDay, Weekday, WorkRange};
use crate::zone;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkRangeField {
    Weekday(u8),
    StartTime(TimeOfDay),
    EndTime(TimeOfDay),
    TimeZone(String),
    Services(BTreeSet<Ulid>),
}

const WORK_RANGE_IMMUTABLE: &[&str] = &["id", "owner", "owner_kind", "owner_id", "employee_id", "branch_id", "company_id"];

/// Partial update of a work range over a closed set of fields. Identity and
/// tenancy fields are rejected by name, unknown ones too.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkRangePatch {
    pub fields: Vec<WorkRangeField>,
}

impl WorkRangePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: WorkRangeField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::InvalidInput("patch must be a JSON object".into()))?;
        let mut patch = Self::new();
        for (key, v) in obj {
            let field = match key.as_str() {
                "weekday" => {
                    let day = v
                        .as_u64()
                        .filter(|d| *d <= u8::MAX as u64)
                        .ok_or_else(|| bad_value(key))?;
                    WorkRangeField::Weekday(day as u8)
                }
                "start_time" => WorkRangeField::StartTime(time_of_day(key, v)?),
                "end_time" => WorkRangeField::EndTime(time_of_day(key, v)?),
                "time_zone" => WorkRangeField::TimeZone(v.as_str().ok_or_else(|| bad_value(key))?.to_string()),
                "services" => {
                    let items = v.as_array().ok_or_else(|| bad_value(key))?;
                    let mut services = BTreeSet::new();
                    for item in items {
                        let id = item
                            .as_str()
                            .and_then(|s| Ulid::from_string(s).ok())
                            .ok_or_else(|| bad_value(key))?;
                        services.insert(id);
                    }
                    WorkRangeField::Services(services)
                }
                other if WORK_RANGE_IMMUTABLE.contains(&other) => return Err(immutable(other)),
                other => return Err(unknown(other)),
            };
            patch.fields.push(field);
        }
        if patch.fields.is_empty() {
            return Err(EngineError::InvalidInput("empty patch".into()));
        }
        Ok(patch)
    }

    /// True when the patch changes when the range happens (needs re-validation
    /// against siblings).
    pub fn touches_timing(&self) -> bool {
        self.fields
            .iter()
            .any(|f| !matches!(f, WorkRangeField::Services(_)))
    }

    /// Candidate range with the patch applied. Only the weekday is checked
    /// here; the schedule validates the rest.
    pub fn apply(&self, range: &WorkRange) -> Result<WorkRange, EngineError> {
        let mut next = range.clone();
        for field in &self.fields {
            match field {
                WorkRangeField::Weekday(day) => {
                    next.weekday = Weekday::new(*day)
                        .ok_or_else(|| EngineError::InvalidRange(format!("weekday {day} outside 0..=6")))?;
                }
                WorkRangeField::StartTime(t) => next.start_time = *t,
                WorkRangeField::EndTime(t) => next.end_time = *t,
                WorkRangeField::TimeZone(tz) => next.time_zone = tz.clone(),
                WorkRangeField::Services(s) => next.services = s.clone(),
            }
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppointmentField {
    StartTime(Ms),
    TimeZone(String),
}

const APPOINTMENT_IMMUTABLE: &[&str] = &[
    "id",
    "company_id",
    "branch_id",
    "employee_id",
    "service_id",
    "client_id",
    "status",
    "end_time",
    "history",
    "created_at",
    "cancelled_at",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub fields: Vec<AppointmentField>,
}

impl AppointmentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: AppointmentField) -> Self {
        self.fields.push(field);
        self
    }

    /// `start_time` accepts RFC 3339 strings or Unix milliseconds.
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        let obj = value
            .as_object()
            .ok_or_else(|| EngineError::InvalidInput("patch must be a JSON object".into()))?;
        let mut patch = Self::new();
        for (key, v) in obj {
            let field = match key.as_str() {
                "start_time" => {
                    let ms = match v {
                        Value::String(s) => zone::parse_rfc3339(s),
                        Value::Number(n) => n.as_i64(),
                        _ => None,
                    }
                    .ok_or_else(|| bad_value(key))?;
                    AppointmentField::StartTime(ms)
                }
                "time_zone" => AppointmentField::TimeZone(v.as_str().ok_or_else(|| bad_value(key))?.to_string()),
                other if APPOINTMENT_IMMUTABLE.contains(&other) => return Err(immutable(other)),
                other => return Err(unknown(other)),
            };
            patch.fields.push(field);
        }
        if patch.fields.is_empty() {
            return Err(EngineError::InvalidInput("empty patch".into()));
        }
        Ok(patch)
    }

    pub fn start_time(&self) -> Option<Ms> {
        self.fields.iter().rev().find_map(|f| match f {
            AppointmentField::StartTime(ms) => Some(*ms),
            _ => None,
        })
    }

    pub fn time_zone(&self) -> Option<&str> {
        self.fields.iter().rev().find_map(|f| match f {
            AppointmentField::TimeZone(tz) => Some(tz.as_str()),
            _ => None,
        })
    }
}

fn time_of_day(key: &str, v: &Value) -> Result<TimeOfDay, EngineError> {
    v.as_str()
        .and_then(TimeOfDay::parse)
        .ok_or_else(|| bad_value(key))
}

fn bad_value(key: &str) -> EngineError {
    EngineError::InvalidInput(format!("bad value for `{key}`"))
}

fn immutable(key: &str) -> EngineError {
    EngineError::InvalidInput(format!("field `{key}` cannot be changed"))
}

fn unknown(key: &str) -> EngineError {
    EngineError::InvalidInput(format!("unknown field `{key}`"))
}
