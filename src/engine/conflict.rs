use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// How far each existing booking is padded before the overlap test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffer {
    /// Each booking's own stored `buffer_minutes`.
    Stored,
    Minutes(u32),
}

impl Buffer {
    fn ms_for(&self, booking: &Booking) -> Ms {
        match self {
            Buffer::Stored => booking.buffer_ms(),
            Buffer::Minutes(m) => *m as Ms * MINUTE_MS,
        }
    }
}

/// The existing booking that blocks a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub booking_id: Ulid,
    pub span: Span,
    pub buffered: Span,
}

/// Test `candidate` against every confirmed booking in `existing`, each padded
/// on both ends by `buffer`. Among several hits the smallest booking id is reported.
pub fn has_conflict<'a>(
    existing: impl IntoIterator<Item = &'a Booking>,
    candidate: &Span,
    buffer: Buffer,
    exclude: Option<Ulid>,
) -> Option<Conflict> {
    existing
        .into_iter()
        .filter(|b| b.is_confirmed() && Some(b.id) != exclude)
        .filter_map(|b| {
            let buffered = b.span.expand(buffer.ms_for(b));
            // not (candidate.end <= start || candidate.start >= end)
            buffered.overlaps(candidate).then_some(Conflict {
                booking_id: b.id,
                span: b.span,
                buffered,
            })
        })
        .min_by_key(|c| c.booking_id)
}

/// Trainer-side check: stored buffers, narrowed with the sorted index first.
pub fn trainer_conflict(ts: &TrainerState, candidate: &Span, exclude: Option<Ulid>) -> Option<Conflict> {
    let reach = MAX_BUFFER_MINUTES as Ms * MINUTE_MS;
    let search = candidate.expand(reach);
    has_conflict(ts.overlapping(&search), candidate, Buffer::Stored, exclude)
}

/// User-side check: raw intervals, no buffer.
pub fn user_conflict(bookings: &[Booking], candidate: &Span, exclude: Option<Ulid>) -> Option<Conflict> {
    has_conflict(bookings, candidate, Buffer::Minutes(0), exclude)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SESSION_DURATION_MS {
        return Err(EngineError::LimitExceeded("session too long"));
    }
    Ok(())
}

pub(crate) fn validate_reason(reason: Option<&str>) -> Result<(), EngineError> {
    if let Some(r) = reason
        && r.len() > MAX_REASON_LEN
    {
        return Err(EngineError::LimitExceeded("reason too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;
    const H: Ms = HOUR_MS;

    fn booking(start: Ms, end: Ms, buffer_minutes: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            trainer_id: Ulid::new(),
            class_type: ClassType::Boxing,
            span: Span::new(start, end),
            status: BookingStatus::Confirmed,
            buffer_minutes,
            session: None,
            booked_at: 0,
            unavailable_marked_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn buffer_extends_both_sides() {
        let existing = vec![booking(8 * H, 9 * H, 10)];
        // 09:05 starts inside 09:00 + 10m
        let hit = has_conflict(&existing, &Span::new(9 * H + 5 * M, 10 * H), Buffer::Stored, None);
        assert_eq!(hit.map(|c| c.booking_id), Some(existing[0].id));
        assert_eq!(hit.unwrap().buffered, Span::new(8 * H - 10 * M, 9 * H + 10 * M));
        // 07:00-07:55 ends inside 07:50 lead-in
        assert!(has_conflict(&existing, &Span::new(7 * H, 7 * H + 55 * M), Buffer::Stored, None).is_some());
        // 09:10 exactly clears it
        assert!(has_conflict(&existing, &Span::new(9 * H + 10 * M, 10 * H), Buffer::Stored, None).is_none());
    }

    #[test]
    fn zero_buffer_is_plain_half_open_overlap() {
        let existing = vec![booking(8 * H, 9 * H, 10)];
        assert!(user_conflict(&existing, &Span::new(9 * H, 10 * H), None).is_none());
        assert!(user_conflict(&existing, &Span::new(8 * H + 30 * M, 9 * H + 30 * M), None).is_some());
    }

    #[test]
    fn ignores_non_confirmed_and_excluded() {
        let mut blocked = booking(8 * H, 9 * H, 10);
        blocked.status = BookingStatus::Blocked;
        let mine = booking(10 * H, 11 * H, 10);
        let existing = vec![blocked, mine.clone()];
        assert!(has_conflict(&existing, &Span::new(8 * H, 9 * H), Buffer::Stored, None).is_none());
        assert!(has_conflict(&existing, &Span::new(10 * H, 11 * H), Buffer::Stored, Some(mine.id)).is_none());
    }

    #[test]
    fn reports_smallest_id_among_hits() {
        let a = booking(8 * H, 9 * H, 0);
        let b = booking(9 * H, 10 * H, 0);
        let expected = a.id.min(b.id);
        let existing = vec![b, a];
        let hit = has_conflict(&existing, &Span::new(8 * H, 10 * H), Buffer::Minutes(0), None);
        assert_eq!(hit.map(|c| c.booking_id), Some(expected));
    }

    #[test]
    fn trainer_conflict_uses_sorted_index() {
        let mut ts = TrainerState::new(Ulid::new());
        ts.insert_booking(booking(8 * H, 9 * H, 10));
        ts.insert_booking(booking(14 * H, 15 * H, 10));
        assert!(trainer_conflict(&ts, &Span::new(9 * H + 5 * M, 10 * H), None).is_some());
        assert!(trainer_conflict(&ts, &Span::new(11 * H, 12 * H), None).is_none());
        assert!(trainer_conflict(&ts, &Span::new(13 * H, 13 * H + 55 * M), None).is_some());
    }

    #[test]
    fn span_limits() {
        assert!(validate_span(&Span::new(MIN_VALID_TIMESTAMP_MS - 1, MIN_VALID_TIMESTAMP_MS + H)).is_err());
        assert!(validate_span(&Span::new(MIN_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS + 16 * H)).is_err());
        assert!(validate_span(&Span::new(MIN_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS + H)).is_ok());
    }
}
