use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::{BookingStore, StoreError};

use super::conflict::{Decision, evaluate};
use super::{BookingError, BookingService};

/// A proposed booking as submitted by a resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub machine_id: MachineId,
    pub requester: Requester,
    /// The requester's access group; restricted machines require a match.
    pub access_group: Option<String>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl BookingRequest {
    pub fn new(
        machine_id: MachineId,
        requester: Requester,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Self {
        Self {
            machine_id,
            requester,
            access_group: None,
            date,
            start,
            end,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.access_group = Some(group.into());
        self
    }
}

fn validate_requester(requester: &Requester) -> Result<(), BookingError> {
    if requester.user_id.is_empty() || requester.user_id.len() > MAX_USER_ID_LEN {
        return Err(BookingError::LimitExceeded("requester id empty or too long"));
    }
    if requester.display_name.len() > MAX_DISPLAY_NAME_LEN {
        return Err(BookingError::LimitExceeded("requester name too long"));
    }
    Ok(())
}

fn validate_machine_fields(
    name: &str,
    capacity: &str,
    access_group: Option<&str>,
) -> Result<(), BookingError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(BookingError::LimitExceeded("machine name empty or too long"));
    }
    if capacity.len() > MAX_CAPACITY_LEN {
        return Err(BookingError::LimitExceeded("capacity descriptor too long"));
    }
    if access_group.is_some_and(|g| g.is_empty() || g.len() > MAX_ACCESS_GROUP_LEN) {
        return Err(BookingError::LimitExceeded("access group empty or too long"));
    }
    Ok(())
}

impl<S: BookingStore> BookingService<S> {
    /// Book a machine for `[start, end)` on a date.
    ///
    /// Exactly one store append on success, none on rejection. If another
    /// writer changes the slot between our read and our write, the whole
    /// read-decide-write sequence runs once more against a fresh snapshot.
    pub async fn request_booking(&self, request: BookingRequest) -> Result<BookingId, BookingError> {
        self.book(request).await.map(|booking| booking.id)
    }

    /// Same as `request_booking`, returning the booking as stored.
    pub async fn book(&self, request: BookingRequest) -> Result<Booking, BookingError> {
        let result = self.try_request_booking(request).await;
        metrics::counter!(
            observability::BOOKING_REQUESTS_TOTAL,
            "outcome" => observability::outcome_label(&result)
        )
        .increment(1);
        result
    }

    async fn try_request_booking(&self, request: BookingRequest) -> Result<Booking, BookingError> {
        let machine = self.require_machine(request.machine_id).await?;
        if machine.retired {
            return Err(BookingError::UnknownMachine(machine.id));
        }
        // Checked before any slot read.
        let Some(span) = TimeRange::checked(request.start, request.end) else {
            return Err(BookingError::InvalidInterval);
        };
        if span.duration().num_minutes() > MAX_BOOKING_MINUTES {
            return Err(BookingError::LimitExceeded("booking too long"));
        }
        validate_requester(&request.requester)?;
        if !machine.visible_to(request.access_group.as_deref()) {
            debug!(
                "{} may not book {} (group {:?})",
                request.requester.user_id, machine.name, machine.access_group
            );
            return Err(BookingError::NotAuthorized);
        }

        let key = SlotKey::new(machine.id, request.date);
        let mut attempt = 1;
        loop {
            let snapshot = self.call("list_bookings", self.store.list_bookings(key)).await?;
            match evaluate(&snapshot.bookings, span.start, span.end) {
                Decision::Accepted => {}
                Decision::Conflict(existing) => {
                    debug!(
                        "rejecting {} on {} {}: overlaps booking {} ({})",
                        span, machine.name, request.date, existing.id, existing.span
                    );
                    return Err(BookingError::Overlap {
                        machine_name: machine.name.clone(),
                        conflicting: existing.clone(),
                    });
                }
                Decision::Invalid(_) => return Err(BookingError::InvalidInterval),
            }
            if snapshot.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
                return Err(BookingError::LimitExceeded("too many bookings on this machine and date"));
            }

            let booking = Booking {
                id: Ulid::new(),
                machine_id: machine.id,
                requester: request.requester.clone(),
                date: request.date,
                span,
                created_at: now_ms(),
            };
            let append = self.store.append_booking(booking.clone(), snapshot.version);
            match self.call("append_booking", append).await {
                Ok(id) => {
                    info!(
                        "booked {} {} {} for {} ({id})",
                        machine.name, booking.date, booking.span, booking.requester.user_id
                    );
                    self.notify.send(machine.id, &Event::confirmed(&booking));
                    return Ok(booking);
                }
                Err(StoreError::VersionMismatch { expected, actual }) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(
                        "slot {} {} moved from version {expected} to {actual}, re-checking",
                        machine.name, request.date
                    );
                    metrics::counter!(observability::BOOKING_WRITE_RETRIES_TOTAL).increment(1);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Cancel a booking. Only its requester or an administrator may do so.
    /// Cancelling a booking that no longer exists succeeds; the flag says
    /// whether this call removed anything.
    pub async fn cancel_booking(
        &self,
        id: BookingId,
        actor_id: &str,
        is_admin: bool,
    ) -> Result<bool, BookingError> {
        let result = self.try_cancel_booking(id, actor_id, is_admin).await;
        metrics::counter!(
            observability::CANCELLATIONS_TOTAL,
            "outcome" => observability::outcome_label(&result)
        )
        .increment(1);
        result
    }

    async fn try_cancel_booking(
        &self,
        id: BookingId,
        actor_id: &str,
        is_admin: bool,
    ) -> Result<bool, BookingError> {
        let Some(booking) = self.call("find_booking", self.store.find_booking(id)).await? else {
            debug!("cancel {id}: already gone");
            return Ok(false);
        };
        if booking.requester.user_id != actor_id && !is_admin {
            return Err(BookingError::NotAuthorized);
        }

        let Some(removed) = self.call("delete_booking", self.store.delete_booking(id)).await? else {
            return Ok(false);
        };
        info!(
            "cancelled {id} ({} {}) by {actor_id}",
            removed.date, removed.span
        );
        self.notify.send(removed.machine_id, &Event::cancelled(&removed));
        Ok(true)
    }

    /// Add a machine, or edit the one with the same id.
    pub async fn save_machine(
        &self,
        id: MachineId,
        name: String,
        capacity: String,
        access_group: Option<String>,
    ) -> Result<(), BookingError> {
        validate_machine_fields(&name, &capacity, access_group.as_deref())?;

        let existing = self.call("find_machine", self.store.find_machine(id)).await?;
        if existing.is_none() {
            let count = self.call("list_machines", self.store.list_machines(None)).await?.len();
            if count >= MAX_MACHINES {
                return Err(BookingError::LimitExceeded("too many machines"));
            }
        }

        let machine = Machine::new(id, name, capacity, access_group);
        let event = if existing.is_some() {
            Event::MachineUpdated {
                id,
                name: machine.name.clone(),
                capacity: machine.capacity.clone(),
                access_group: machine.access_group.clone(),
            }
        } else {
            Event::MachineAdded {
                id,
                name: machine.name.clone(),
                capacity: machine.capacity.clone(),
                access_group: machine.access_group.clone(),
            }
        };
        self.call("put_machine", self.store.put_machine(machine)).await?;
        info!("saved machine {id}");
        self.notify.send(id, &event);
        Ok(())
    }

    /// Retire a machine. Its bookings stay as history and can still be cancelled.
    /// `false` if it was already retired.
    pub async fn retire_machine(&self, id: MachineId) -> Result<bool, BookingError> {
        if self.require_machine(id).await?.retired {
            return Ok(false);
        }
        if !self.call("retire_machine", self.store.retire_machine(id)).await? {
            return Err(BookingError::UnknownMachine(id));
        }
        info!("retired machine {id}");
        self.notify.send(id, &Event::MachineRetired { id });
        Ok(true)
    }
}
