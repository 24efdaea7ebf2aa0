mod local;

pub use local::LocalStore;

use async_trait::async_trait;

use crate::model::*;

/// Every booking on one machine/date plus the optimistic-concurrency token
/// observed when it was read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub bookings: Vec<Booking>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The slot took an append after the caller's snapshot was read.
    VersionMismatch { expected: u64, actual: u64 },
    /// The machine is missing or was retired before the append could land.
    UnknownMachine(MachineId),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::VersionMismatch { expected, actual } => {
                write!(f, "slot version mismatch: expected {expected}, found {actual}")
            }
            StoreError::UnknownMachine(id) => write!(f, "no active machine {id}"),
            StoreError::Unavailable(reason) => write!(f, "store unavailable: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence seam for machines and bookings.
///
/// Implementations own all persisted state. Reads return owned snapshots; the
/// booking service never holds a lock across calls.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_machine(&self, id: MachineId) -> Result<Option<Machine>, StoreError>;

    /// Non-retired machines. `None` lists every machine; `Some(group)` lists the
    /// unrestricted machines plus those tagged with `group`.
    async fn list_machines(&self, access_group: Option<&str>) -> Result<Vec<Machine>, StoreError>;

    /// Insert a machine, or edit the one with the same id. Never un-retires.
    async fn put_machine(&self, machine: Machine) -> Result<(), StoreError>;

    /// Mark a machine retired. `false` if no such machine exists.
    async fn retire_machine(&self, id: MachineId) -> Result<bool, StoreError>;

    /// Equality filter on machine and date. No ordering guarantee.
    async fn list_bookings(&self, key: SlotKey) -> Result<SlotSnapshot, StoreError>;

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Append only if the slot's version still equals `expected_version` and the
    /// machine is still active.
    async fn append_booking(
        &self,
        booking: Booking,
        expected_version: u64,
    ) -> Result<BookingId, StoreError>;

    /// Idempotent. Returns the removed booking, or `None` if it was already gone.
    async fn delete_booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    async fn bookings_for_requester(&self, user_id: &str) -> Result<Vec<Booking>, StoreError>;
}
