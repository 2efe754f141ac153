use std::time::Duration;
use uuid::Uuid;

/// Failures reported by a storage adapter.
///
/// Adapters translate their backend's error codes into these variants; nothing
/// above the adapter boundary inspects backend-specific codes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("lock wait exceeded {0:?}")]
    LockTimeout(Duration),

    #[error("no session available within {0:?}")]
    PoolExhausted(Duration),

    #[error("session pool is closed")]
    PoolClosed,

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Business-rule rejections. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("booking must contain at least one passenger")]
    EmptyBooking,

    #[error("passenger {index} is missing a name or identity number")]
    InvalidPassenger { index: usize },

    #[error("duplicate identity in request")]
    DuplicateIdentity,

    #[error("seat {0} requested more than once")]
    DuplicateSeat(Uuid),

    #[error("identity already ticketed on this trip ({count} passenger(s))")]
    IdentityAlreadyTicketed { count: usize },

    #[error("seat unavailable: {}", format_ids(.0))]
    SeatUnavailable(Vec<Uuid>),

    #[error("trip {0} not found")]
    TripNotFound(Uuid),

    #[error("seat {0} is not part of this trip's vehicle")]
    SeatNotOnTrip(Uuid),

    #[error("total price overflows")]
    PriceOverflow,

    #[error("refund must name at least one ticket")]
    EmptyRefund,

    #[error("ticket {0} listed more than once")]
    DuplicateTicket(Uuid),

    #[error("ticket not found or not owned by requester")]
    TicketsNotFound,

    #[error("ticket {0} already refunded or invalid")]
    TicketNotRefundable(Uuid),
}

/// Coarse class of a rejection, used to pick a transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Invalid,
    NotFound,
    Conflict,
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Rejection::TripNotFound(_) | Rejection::TicketsNotFound => RejectionKind::NotFound,
            Rejection::IdentityAlreadyTicketed { .. }
            | Rejection::SeatUnavailable(_)
            | Rejection::TicketNotRefundable(_) => RejectionKind::Conflict,
            _ => RejectionKind::Invalid,
        }
    }
}

fn format_ids(ids: &[Uuid]) -> String {
    ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(", ")
}

/// Error surface of the booking engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Permanent failure: bad input, not-found, business rule, ownership.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// Storage-engine write conflict. Safe to re-run the whole transaction.
    #[error("transient conflict: {0}")]
    Conflict(String),

    /// Retries exhausted, or a bounded wait (session, lock) ran out.
    #[error("service busy, retry later: {0}")]
    Busy(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            EngineError::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => EngineError::Conflict(msg),
            e @ (StoreError::LockTimeout(_) | StoreError::PoolExhausted(_)) => {
                EngineError::Busy(e.to_string())
            }
            e @ (StoreError::PoolClosed | StoreError::Backend(_) | StoreError::Corrupt(_)) => {
                EngineError::Infrastructure(e.to_string())
            }
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
