use chrono::{NaiveDate, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for audit timestamps only; booking times are wall-clock.
pub type Ms = i64;

pub type MachineId = Ulid;
pub type BookingId = Ulid;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Half-open wall-clock range `[start, end)` on a single calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn checked(start: NaiveTime, end: NaiveTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// A bookable washing machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    /// Free-text load descriptor, e.g. "6kg".
    pub capacity: String,
    /// `None` means any resident may see and book the machine.
    pub access_group: Option<String>,
    /// Retired machines keep their bookings as history but accept no new ones.
    pub retired: bool,
}

impl Machine {
    pub fn new(id: MachineId, name: String, capacity: String, access_group: Option<String>) -> Self {
        Self {
            id,
            name,
            capacity,
            access_group,
            retired: false,
        }
    }

    pub fn visible_to(&self, group: Option<&str>) -> bool {
        match self.access_group.as_deref() {
            None => true,
            Some(own) => group == Some(own),
        }
    }
}

/// Who made a booking, captured at booking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: String,
    pub display_name: String,
}

impl Requester {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub machine_id: MachineId,
    pub requester: Requester,
    pub date: NaiveDate,
    pub span: TimeRange,
    pub created_at: Ms,
}

impl Booking {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.machine_id, self.date)
    }
}

/// The per-machine-per-date booking set. All overlap checks happen inside one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub machine_id: MachineId,
    pub date: NaiveDate,
}

impl SlotKey {
    pub fn new(machine_id: MachineId, date: NaiveDate) -> Self {
        Self { machine_id, date }
    }
}

/// The event types, flat with no nesting. This is the WAL record format and the
/// notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MachineAdded {
        id: MachineId,
        name: String,
        capacity: String,
        access_group: Option<String>,
    },
    MachineUpdated {
        id: MachineId,
        name: String,
        capacity: String,
        access_group: Option<String>,
    },
    MachineRetired {
        id: MachineId,
    },
    BookingConfirmed {
        id: BookingId,
        machine_id: MachineId,
        requester_id: String,
        requester_name: String,
        date: NaiveDate,
        span: TimeRange,
        created_at: Ms,
    },
    BookingCancelled {
        id: BookingId,
        machine_id: MachineId,
        date: NaiveDate,
    },
}

impl Event {
    pub fn confirmed(booking: &Booking) -> Self {
        Event::BookingConfirmed {
            id: booking.id,
            machine_id: booking.machine_id,
            requester_id: booking.requester.user_id.clone(),
            requester_name: booking.requester.display_name.clone(),
            date: booking.date,
            span: booking.span,
            created_at: booking.created_at,
        }
    }

    pub fn cancelled(booking: &Booking) -> Self {
        Event::BookingCancelled {
            id: booking.id,
            machine_id: booking.machine_id,
            date: booking.date,
        }
    }

    /// The machine an event concerns; used to route notifications.
    pub fn machine_id(&self) -> MachineId {
        match self {
            Event::MachineAdded { id, .. }
            | Event::MachineUpdated { id, .. }
            | Event::MachineRetired { id } => *id,
            Event::BookingConfirmed { machine_id, .. }
            | Event::BookingCancelled { machine_id, .. } => *machine_id,
        }
    }

    /// Rebuild the booking carried by a `BookingConfirmed` event.
    pub fn into_booking(self) -> Option<Booking> {
        match self {
            Event::BookingConfirmed {
                id,
                machine_id,
                requester_id,
                requester_name,
                date,
                span,
                created_at,
            } => Some(Booking {
                id,
                machine_id,
                requester: Requester::new(requester_id, requester_name),
                date,
                span,
                created_at,
            }),
            _ => None,
        }
    }
}
