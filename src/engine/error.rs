use ulid::Ulid;

/// Coarse outcome class the wire layer maps onto distinct SQLSTATEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Bad input shape or a booking policy violation; one entry per failed check.
    Validation(Vec<String>),
    /// The car already has a booking overlapping the requested dates.
    Conflict {
        car_id: Ulid,
        booking_id: Ulid,
    },
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        EngineError::Validation(vec![reason.into()])
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::WalError(_) => ErrorKind::Internal,
            EngineError::AlreadyExists(_)
            | EngineError::Validation(_)
            | EngineError::HasBookings(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(reasons) => {
                write!(f, "invalid request: {}", reasons.join("; "))
            }
            EngineError::Conflict { car_id, booking_id } => write!(
                f,
                "car {car_id} is not available for the requested dates (booking {booking_id})"
            ),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete car {id}: has bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
