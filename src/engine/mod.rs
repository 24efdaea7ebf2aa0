mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{free_windows, merge_overlapping, subtract_ranges};
pub use conflict::{Decision, evaluate};
pub use error::BookingError;
pub use mutations::BookingRequest;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::{BookingStore, StoreError};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Laundry room opening hours used when none are configured.
pub fn default_opening_hours() -> TimeRange {
    TimeRange::new(
        NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
        NaiveTime::from_hms_opt(23, 0, 0).unwrap_or_default(),
    )
}

/// Orchestrates bookings against an injected store: load the slot, run the
/// conflict check, write on acceptance.
///
/// Holds no booking state of its own. Each call works on a fresh snapshot
/// from the store and relies on the store's per-slot version to detect a
/// concurrent writer.
pub struct BookingService<S> {
    store: Arc<S>,
    notify: Arc<NotifyHub>,
    store_timeout: Duration,
    opening_hours: TimeRange,
}

impl<S: BookingStore> BookingService<S> {
    pub fn new(store: Arc<S>, notify: Arc<NotifyHub>) -> Self {
        Self {
            store,
            notify,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            opening_hours: default_opening_hours(),
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_opening_hours(mut self, opening_hours: TimeRange) -> Self {
        self.opening_hours = opening_hours;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    pub fn opening_hours(&self) -> TimeRange {
        self.opening_hours
    }

    /// Run one store call under the configured timeout. A timeout becomes
    /// `StoreError::Unavailable`. Only the wait is abandoned: a mutation the
    /// store already started runs to completion, journal and memory alike.
    pub(super) async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("store call {op} timed out after {:?}", self.store_timeout);
                Err(StoreError::Unavailable(format!("{op} timed out")))
            }
        }
    }

    /// Look up a machine that must exist.
    pub(super) async fn require_machine(&self, id: MachineId) -> Result<Machine, BookingError> {
        self.call("find_machine", self.store.find_machine(id))
            .await?
            .ok_or(BookingError::UnknownMachine(id))
    }
}
