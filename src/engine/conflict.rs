use chrono::NaiveTime;

use crate::model::*;

/// Outcome of checking a proposed range against one machine/date.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision<'a> {
    Accepted,
    /// The first existing booking (in the order supplied) that overlaps.
    Conflict(&'a Booking),
    Invalid(&'static str),
}

/// Decide whether `[start, end)` fits among `existing`.
///
/// `existing` must already be narrowed to the same machine and date. Half-open
/// ranges: a booking ending exactly at `start` does not conflict. Which
/// conflicting booking is returned is advisory; any overlap rejects.
pub fn evaluate(existing: &[Booking], start: NaiveTime, end: NaiveTime) -> Decision<'_> {
    let Some(proposed) = TimeRange::checked(start, end) else {
        return Decision::Invalid("end must be after start");
    };
    existing
        .iter()
        .find(|b| b.span.overlaps(&proposed))
        .map_or(Decision::Accepted, Decision::Conflict)
}
