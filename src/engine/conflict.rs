use chrono::{DateTime, Duration, Utc};
use ulid::Ulid;

use crate::limits::{MAX_BOOKING_DURATION_HOURS, MAX_VALID_UNIX, MIN_VALID_UNIX};
use crate::model::{RoomState, Span};

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidTimeRange("end must be after start"));
    }
    if span.start.timestamp() < MIN_VALID_UNIX || span.end.timestamp() > MAX_VALID_UNIX {
        return Err(EngineError::InvalidTimeRange("timestamp out of range"));
    }
    if span.duration() > Duration::hours(MAX_BOOKING_DURATION_HOURS) {
        return Err(EngineError::InvalidTimeRange("booking too long"));
    }
    Ok(())
}

/// Collect the start of every occurrence in `occurrences` that overlaps an
/// active booking in `room` (excluding `exclude`, for edit-in-place), or an
/// earlier occurrence in the same batch.
///
/// Overlap is the strict half-open test: touching endpoints do not conflict.
/// Rejected and cancelled bookings are freed slots and never conflict.
/// An empty result means the whole batch is admissible; a non-empty result
/// means the whole batch is rejected (all-or-nothing).
pub(crate) fn conflicting_starts(
    room: &RoomState,
    occurrences: &[Span],
    exclude: Option<Ulid>,
) -> Vec<DateTime<Utc>> {
    let mut conflicts = Vec::new();
    for (i, occ) in occurrences.iter().enumerate() {
        let against_existing = room
            .overlapping(occ)
            .any(|b| b.status.is_active() && Some(b.id) != exclude);
        let against_batch = occurrences[..i].iter().any(|prev| prev.overlaps(occ));
        if against_existing || against_batch {
            conflicts.push(occ.start);
        }
    }
    conflicts
}
