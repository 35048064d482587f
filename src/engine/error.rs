use ulid::Ulid;

/// Stable failure taxonomy. The transport collaborator maps each kind to a
/// fixed status code; nothing inside the engine knows about status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRange,
    Overlap,
    Conflict,
    CrossTenant,
    Forbidden,
    InvalidState,
    Transient,
    NotFound,
    Invalid,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRange => "invalid_range",
            ErrorKind::Overlap => "overlap",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CrossTenant => "cross_tenant",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Transient => "transient",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed work range: bad times, zone, weekday or service set.
    InvalidRange(String),
    /// Work range collides with a sibling of the same owner and weekday.
    Overlap(Ulid),
    /// Appointment collides with a scheduled appointment.
    Conflict(Ulid),
    /// Entity belongs to a different company than the one claimed.
    CrossTenant(Ulid),
    Forbidden(&'static str),
    InvalidState(&'static str),
    Timeout(&'static str),
    WalError(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InUse(Ulid),
    InvalidInput(String),
    LimitExceeded(&'static str),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRange(_) => ErrorKind::InvalidRange,
            EngineError::Overlap(_) => ErrorKind::Overlap,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::CrossTenant(_) => ErrorKind::CrossTenant,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::InvalidState(_) | EngineError::InUse(_) => ErrorKind::InvalidState,
            EngineError::Timeout(_) | EngineError::WalError(_) => ErrorKind::Transient,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::InvalidInput(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Invalid,
        }
    }

    /// Safe to retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(msg) => write!(f, "invalid work range: {msg}"),
            EngineError::Overlap(id) => write!(f, "overlaps work range: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with appointment: {id}"),
            EngineError::CrossTenant(id) => write!(f, "entity {id} belongs to another company"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::Timeout(msg) => write!(f, "timed out: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InUse(id) => write!(f, "still referenced: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(EngineError::Timeout("lock").is_retryable());
        assert!(EngineError::WalError("disk".into()).is_retryable());
        assert!(!EngineError::Conflict(Ulid::new()).is_retryable());
        assert!(!EngineError::NotFound(Ulid::new()).is_retryable());
    }

    #[test]
    fn tenancy_and_role_denials_are_distinct() {
        let cross = EngineError::CrossTenant(Ulid::new());
        let denied = EngineError::Forbidden("not your appointment");
        assert_eq!(cross.kind(), ErrorKind::CrossTenant);
        assert_eq!(denied.kind(), ErrorKind::Forbidden);
        assert_ne!(cross.kind(), denied.kind());
    }

    #[test]
    fn display_names_the_conflicting_id() {
        let id = Ulid::new();
        assert!(EngineError::Conflict(id).to_string().contains(&id.to_string()));
        assert_eq!(ErrorKind::Conflict.as_str(), "conflict");
    }
}
