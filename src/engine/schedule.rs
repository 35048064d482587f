use chrono::{Days, NaiveDate};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::limits::MAX_RANGES_PER_OWNER;
use crate::model::*;
use crate::zone;

use super::EngineError;

/// Sundays of the weeks used to compare ranges declared in different zones,
/// one in each half of the year so both DST regimes are covered.
const REFERENCE_SUNDAYS: [(i32, u32, u32); 2] = [(2024, 1, 7), (2024, 7, 7)];

/// All work ranges of one employee or branch, kept sorted by weekday then
/// start time. The write half of its lock serializes edits for the owner.
#[derive(Debug, Clone)]
pub struct WorkSchedule {
    pub owner: Owner,
    pub company_id: Ulid,
    pub ranges: Vec<WorkRange>,
}

impl WorkSchedule {
    pub fn new(owner: Owner, company_id: Ulid) -> Self {
        Self {
            owner,
            company_id,
            ranges: Vec::new(),
        }
    }

    pub fn get(&self, id: &Ulid) -> Option<&WorkRange> {
        self.ranges.iter().find(|r| r.id == *id)
    }

    pub fn on_weekday(&self, day: Weekday) -> impl Iterator<Item = &WorkRange> {
        self.ranges.iter().filter(move |r| r.weekday == day)
    }

    /// Ranges of this schedule that sit at `branch_id` and list `service_id`.
    pub fn offering(&self, branch_id: Ulid, service_id: Ulid) -> Vec<WorkRange> {
        self.ranges
            .iter()
            .filter(|r| r.branch_id == branch_id && r.offers(&service_id))
            .cloned()
            .collect()
    }

    /// Check `candidate` on its own and against every sibling on the same
    /// weekday. A candidate with an existing id is treated as its replacement.
    pub fn validate(&self, candidate: &WorkRange) -> Result<(), EngineError> {
        validate_range(candidate)?;
        let replacing = self.get(&candidate.id).is_some();
        if !replacing && self.ranges.len() >= MAX_RANGES_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many work ranges for owner"));
        }
        for sibling in self.on_weekday(candidate.weekday) {
            if sibling.id != candidate.id && ranges_collide(candidate, sibling) {
                return Err(EngineError::Overlap(sibling.id));
            }
        }
        Ok(())
    }

    /// Insert or replace. Callers validate first.
    pub fn upsert(&mut self, range: WorkRange) {
        self.ranges.retain(|r| r.id != range.id);
        let key = (range.weekday, range.start_time);
        let pos = self
            .ranges
            .partition_point(|r| (r.weekday, r.start_time) <= key);
        self.ranges.insert(pos, range);
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<WorkRange> {
        let pos = self.ranges.iter().position(|r| r.id == *id)?;
        Some(self.ranges.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Shape checks that need no siblings. Returns the resolved zone.
pub fn validate_range(range: &WorkRange) -> Result<Tz, EngineError> {
    if range.end_time <= range.start_time {
        return Err(EngineError::InvalidRange(format!(
            "end {} is not after start {}",
            range.end_time, range.start_time
        )));
    }
    zone::parse_zone(&range.time_zone)
        .ok_or_else(|| EngineError::InvalidRange(format!("unknown time zone {:?}", range.time_zone)))
}

fn ranges_collide(a: &WorkRange, b: &WorkRange) -> bool {
    if a.time_zone == b.time_zone {
        return a.start_time < b.end_time && b.start_time < a.end_time;
    }
    REFERENCE_SUNDAYS
        .iter()
        .any(|&sunday| match (reference_span(a, sunday), reference_span(b, sunday)) {
            (Some(x), Some(y)) => x.overlaps(&y),
            _ => false,
        })
}

/// Absolute span of the range's occurrence in the week starting `sunday`.
fn reference_span(range: &WorkRange, sunday: (i32, u32, u32)) -> Option<Span> {
    let tz = zone::parse_zone(&range.time_zone)?;
    let (y, m, d) = sunday;
    let date = NaiveDate::from_ymd_opt(y, m, d)?.checked_add_days(Days::new(range.weekday.number() as u64))?;
    let start = zone::local_to_ms(tz, date, range.start_time.minutes());
    let end = zone::local_to_ms(tz, date, range.end_time.minutes());
    (start < end).then(|| Span::new(start, end))
}
