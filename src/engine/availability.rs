use chrono::Datelike;
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;
use crate::zone;

// ── Slot resolution ───────────────────────────────────────────────

/// Identity and granularity of the slots produced for one
/// (employee, branch, service) combination.
#[derive(Debug, Clone)]
pub struct SlotSource {
    pub employee_id: Ulid,
    pub branch_id: Ulid,
    pub service_id: Ulid,
    /// Zone the caller browses in; carried on every slot for display.
    pub time_zone: String,
    pub duration: Ms,
    pub step: Ms,
}

/// Lazy, restartable sequence of bookable slots. Cloning yields an
/// independent iterator from the same position.
///
/// Starts sit on multiples of the step counted from local midnight in the
/// caller's zone.
#[derive(Debug, Clone)]
pub struct SlotIter {
    free: Vec<Span>,
    idx: usize,
    cursor: Ms,
    tz: Option<Tz>,
    source: SlotSource,
}

impl SlotIter {
    pub fn new(free: Vec<Span>, source: SlotSource) -> Self {
        let mut iter = Self {
            free,
            idx: 0,
            cursor: 0,
            tz: zone::parse_zone(&source.time_zone),
            source,
        };
        if let Some(first) = iter.free.first() {
            iter.cursor = iter.align(first.start);
        }
        iter
    }

    pub fn empty(source: SlotSource) -> Self {
        Self::new(Vec::new(), source)
    }

    /// First grid point at or after `t`.
    fn align(&self, t: Ms) -> Ms {
        let step = self.source.step.max(1);
        match self.tz.and_then(|tz| zone::ms_of_day(tz, t)) {
            Some(of_day) if of_day % step != 0 => t + (step - of_day % step),
            _ => t,
        }
    }
}

impl Iterator for SlotIter {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        loop {
            let free = *self.free.get(self.idx)?;
            if self.cursor + self.source.duration <= free.end {
                let start = self.cursor;
                self.cursor = self.align(start + self.source.step.max(1));
                return Some(Slot {
                    start,
                    end: start + self.source.duration,
                    employee_id: self.source.employee_id,
                    branch_id: self.source.branch_id,
                    service_id: self.source.service_id,
                    time_zone: self.source.time_zone.clone(),
                });
            }
            self.idx += 1;
            if let Some(next) = self.free.get(self.idx) {
                self.cursor = self.align(next.start);
            }
        }
    }
}

/// Free time for a service: employee ranges ∩ branch ranges (both already
/// filtered to the branch and service), minus `busy`, clipped to `window`.
/// `busy` must be sorted by start and disjoint.
pub fn free_time(
    employee_ranges: &[WorkRange],
    branch_ranges: &[WorkRange],
    busy: &[Span],
    window: &Span,
) -> Vec<Span> {
    let open = open_time(employee_ranges, branch_ranges, window);
    if busy.is_empty() {
        open
    } else {
        subtract_intervals(&open, busy)
    }
}

/// Employee ∩ branch availability in absolute time. A side with no ranges
/// yields nothing.
pub fn open_time(employee_ranges: &[WorkRange], branch_ranges: &[WorkRange], window: &Span) -> Vec<Span> {
    let employee = weekly_spans(employee_ranges, window);
    if employee.is_empty() {
        return Vec::new();
    }
    let branch = weekly_spans(branch_ranges, window);
    intersect_intervals(&employee, &branch)
}

/// Merged absolute spans of every occurrence of `ranges` inside `window`.
pub fn weekly_spans(ranges: &[WorkRange], window: &Span) -> Vec<Span> {
    let mut spans: Vec<Span> = ranges
        .iter()
        .filter(|r| r.is_bookable())
        .flat_map(|r| occurrences(r, window))
        .collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Occurrences of one weekly range inside `window`, converted per calendar
/// date in the range's own zone.
pub fn occurrences(range: &WorkRange, window: &Span) -> Vec<Span> {
    let Some(tz) = zone::parse_zone(&range.time_zone) else {
        return Vec::new();
    };
    let (Some(first), Some(last)) = (
        zone::local_date(tz, window.start),
        zone::local_date(tz, window.end - 1),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for date in first.iter_days().take_while(|d| *d <= last) {
        if Weekday::from_chrono(date.weekday()) != range.weekday {
            continue;
        }
        let start = zone::local_to_ms(tz, date, range.start_time.minutes()).max(window.start);
        let end = zone::local_to_ms(tz, date, range.end_time.minutes()).min(window.end);
        if start < end {
            out.push(Span::new(start, end));
        }
    }
    out
}

// ── Interval algebra ──────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Intersection of two sorted, disjoint interval lists.
pub fn intersect_intervals(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let start = a[i].start.max(b[j].start);
        let end = a[i].end.min(b[j].end);
        if start < end {
            result.push(Span::new(start, end));
        }
        if a[i].end <= b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    result
}
