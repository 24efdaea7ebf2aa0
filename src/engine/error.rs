use ulid::Ulid;

use crate::model::Booking;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// `start >= end`. Never persisted, never retried.
    InvalidInterval,
    UnknownMachine(Ulid),
    /// The slot is taken. Carries enough to let a person pick another time.
    Overlap {
        machine_name: String,
        conflicting: Booking,
    },
    NotAuthorized,
    LimitExceeded(&'static str),
    /// Transient store fault or timeout. The whole call is safe to retry.
    StoreUnavailable(String),
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidInterval => write!(f, "invalid interval: end must be after start"),
            BookingError::UnknownMachine(id) => write!(f, "unknown machine: {id}"),
            BookingError::Overlap {
                machine_name,
                conflicting,
            } => write!(
                f,
                "{machine_name} is already booked on {} from {} by {}",
                conflicting.date, conflicting.span, conflicting.requester.display_name
            ),
            BookingError::NotAuthorized => write!(f, "not authorized"),
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            BookingError::StoreUnavailable(e) => write!(f, "booking store unavailable: {e}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionMismatch { .. } => {
                BookingError::StoreUnavailable("booking slot contended".into())
            }
            StoreError::UnknownMachine(id) => BookingError::UnknownMachine(id),
            StoreError::Unavailable(reason) => BookingError::StoreUnavailable(reason),
        }
    }
}
