use chrono::NaiveDate;

use crate::model::*;
use crate::store::BookingStore;

use super::availability;
use super::{BookingError, BookingService};

impl<S: BookingStore> BookingService<S> {
    pub async fn machine(&self, id: MachineId) -> Result<Machine, BookingError> {
        self.require_machine(id).await
    }

    /// Active machines visible to `group`, ordered by name. `None` lists
    /// every active machine.
    pub async fn list_machines(&self, group: Option<&str>) -> Result<Vec<Machine>, BookingError> {
        Ok(self.call("list_machines", self.store.list_machines(group)).await?)
    }

    /// Bookings for one machine on one date, ordered by start time.
    pub async fn bookings_on(
        &self,
        machine_id: MachineId,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, BookingError> {
        self.require_machine(machine_id).await?;
        let snapshot = self
            .call("list_bookings", self.store.list_bookings(SlotKey::new(machine_id, date)))
            .await?;
        let mut bookings = snapshot.bookings;
        bookings.sort_by_key(|b| (b.span.start, b.created_at));
        Ok(bookings)
    }

    /// Every booking held by one resident, ordered by date then start.
    pub async fn bookings_for(&self, user_id: &str) -> Result<Vec<Booking>, BookingError> {
        let mut bookings = self
            .call("bookings_for_requester", self.store.bookings_for_requester(user_id))
            .await?;
        bookings.sort_by_key(|b| (b.date, b.span.start));
        Ok(bookings)
    }

    /// Unbooked ranges within opening hours for a machine and date.
    pub async fn free_windows(
        &self,
        machine_id: MachineId,
        date: NaiveDate,
    ) -> Result<Vec<TimeRange>, BookingError> {
        let bookings = self.bookings_on(machine_id, date).await?;
        Ok(availability::free_windows(&self.opening_hours, &bookings))
    }
}
