use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Span of `duration` starting at `start`, bounds-checked before the end is
/// computed.
pub(crate) fn span_from(start: Ms, duration: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let end = start
        .checked_add(duration)
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    let span = Span::new(start, end);
    validate_span(&span)?;
    Ok(span)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SERVICE_DURATION_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

/// Query windows: non-empty, in range, and at most `MAX_QUERY_WINDOW_MS` wide.
pub(crate) fn validate_window(window: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if window.end <= window.start {
        return Err(EngineError::InvalidInput("window end must be after start".into()));
    }
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// First scheduled entry in `ledger` overlapping `span`, ignoring `exclude`
/// (the appointment being moved).
pub(crate) fn check_no_conflict(ledger: &Ledger, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    match ledger
        .overlapping(span)
        .find(|e| Some(e.appointment_id) != exclude)
    {
        Some(entry) => Err(EngineError::Conflict(entry.appointment_id)),
        None => Ok(()),
    }
}
