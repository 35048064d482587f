use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;

use crate::limits::MAX_TIME_ZONE_LEN;
use crate::model::Ms;

/// Resolve an IANA zone name. Offsets are never cached; every conversion
/// below works per calendar date.
pub fn parse_zone(name: &str) -> Option<Tz> {
    if name.is_empty() || name.len() > MAX_TIME_ZONE_LEN {
        return None;
    }
    name.parse::<Tz>().ok()
}

/// Absolute instant of `minutes` past local midnight of `date` in `tz`.
///
/// Times inside a DST gap resolve to the first wall-clock minute after the
/// gap; ambiguous times (fall back) resolve to the earlier instant.
/// `minutes == 1440` lands on the following midnight.
pub fn local_to_ms(tz: Tz, date: NaiveDate, minutes: u16) -> Ms {
    let naive = date.and_time(NaiveTime::default()) + Duration::minutes(minutes as i64);
    resolve_local(tz, naive)
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Ms {
    let mut candidate = naive;
    // Gaps are at most a few hours in the tz database.
    for _ in 0..=240 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return dt.timestamp_millis(),
            LocalResult::Ambiguous(earliest, _) => return earliest.timestamp_millis(),
            LocalResult::None => candidate += Duration::minutes(1),
        }
    }
    naive.and_utc().timestamp_millis()
}

/// Calendar date of an absolute instant as seen in `tz`.
pub fn local_date(tz: Tz, ms: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.with_timezone(&tz).date_naive())
}

/// Wall-clock milliseconds since local midnight of an absolute instant.
pub fn ms_of_day(tz: Tz, ms: Ms) -> Option<Ms> {
    let local = DateTime::from_timestamp_millis(ms)?.with_timezone(&tz);
    Some(local.time().num_seconds_from_midnight() as Ms * 1000 + local.timestamp_subsec_millis() as Ms)
}

/// Local midnight of `date` in `tz`.
pub fn local_midnight(tz: Tz, date: NaiveDate) -> Ms {
    local_to_ms(tz, date, 0)
}

pub fn to_rfc3339(ms: Ms, tz: Tz) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.with_timezone(&tz).to_rfc3339(),
        None => ms.to_string(),
    }
}

pub fn parse_rfc3339(s: &str) -> Option<Ms> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
