use crate::model::*;

/// Free ranges inside `opening` once every booking has been taken out.
///
/// Bookings may arrive in any order and may extend past the opening hours;
/// the result is sorted and disjoint.
pub fn free_windows(opening: &TimeRange, bookings: &[Booking]) -> Vec<TimeRange> {
    let mut taken: Vec<TimeRange> = bookings
        .iter()
        .map(|b| b.span)
        .filter(|span| span.overlaps(opening))
        .collect();
    taken.sort_by_key(|s| s.start);
    let taken = merge_overlapping(&taken);
    subtract_ranges(std::slice::from_ref(opening), &taken)
}

/// Merge sorted overlapping/adjacent ranges into disjoint ranges.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` disjoint.
pub fn subtract_ranges(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(TimeRange::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(TimeRange::new(current_start, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn r(s: (u32, u32), e: (u32, u32)) -> TimeRange {
        TimeRange::new(t(s.0, s.1), t(e.0, e.1))
    }

    fn booking(span: TimeRange) -> Booking {
        Booking {
            id: Ulid::new(),
            machine_id: Ulid::nil(),
            requester: Requester::new("u1", "Asha"),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            span,
            created_at: 0,
        }
    }

    #[test]
    fn no_bookings_whole_day_free() {
        let opening = r((6, 0), (23, 0));
        assert_eq!(free_windows(&opening, &[]), vec![opening]);
    }

    #[test]
    fn bookings_punch_holes() {
        let opening = r((6, 0), (23, 0));
        let bookings = [booking(r((10, 0), (11, 0))), booking(r((7, 0), (8, 30)))];
        assert_eq!(
            free_windows(&opening, &bookings),
            vec![r((6, 0), (7, 0)), r((8, 30), (10, 0)), r((11, 0), (23, 0))]
        );
    }

    #[test]
    fn back_to_back_bookings_leave_no_sliver() {
        let opening = r((6, 0), (23, 0));
        let bookings = [booking(r((9, 0), (10, 0))), booking(r((10, 0), (11, 0)))];
        assert_eq!(
            free_windows(&opening, &bookings),
            vec![r((6, 0), (9, 0)), r((11, 0), (23, 0))]
        );
    }

    #[test]
    fn bookings_outside_opening_hours_are_clipped() {
        let opening = r((6, 0), (23, 0));
        let bookings = [booking(r((5, 0), (6, 30))), booking(r((22, 0), (23, 30))), booking(r((1, 0), (2, 0)))];
        assert_eq!(free_windows(&opening, &bookings), vec![r((6, 30), (22, 0))]);
    }

    #[test]
    fn fully_booked_day() {
        let opening = r((6, 0), (8, 0));
        let bookings = [booking(r((6, 0), (7, 0))), booking(r((6, 30), (8, 0)))];
        assert!(free_windows(&opening, &bookings).is_empty());
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let merged = merge_overlapping(&[r((9, 0), (10, 0)), r((9, 30), (10, 30)), r((10, 30), (11, 0)), r((12, 0), (13, 0))]);
        assert_eq!(merged, vec![r((9, 0), (11, 0)), r((12, 0), (13, 0))]);
        assert!(merge_overlapping(&[]).is_empty());
    }

    #[test]
    fn subtract_middle_and_edges() {
        let base = [r((8, 0), (12, 0))];
        assert_eq!(subtract_ranges(&base, &[]), base.to_vec());
        assert_eq!(
            subtract_ranges(&base, &[r((7, 0), (8, 30)), r((9, 0), (9, 30)), r((11, 0), (13, 0))]),
            vec![r((8, 30), (9, 0)), r((9, 30), (11, 0))]
        );
        assert!(subtract_ranges(&[], &[r((9, 0), (10, 0))]).is_empty());
    }
}
