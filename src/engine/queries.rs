use chrono::{DateTime, Duration, Utc};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

fn info(b: &BookingState, room_id: Ulid) -> BookingInfo {
    BookingInfo {
        id: b.id,
        series_id: b.series_id,
        room_id,
        owner: b.owner.clone(),
        start: b.span.start,
        end: b.span.end,
        title: b.title.clone(),
        participants: b.participants,
        status: b.status,
        notified: b.notified,
    }
}

impl Engine {
    pub fn list_rooms(&self) -> Vec<RoomInfo> {
        self.rooms
            .iter()
            .map(|entry| {
                let rs = entry.value().clone();
                let guard = rs.try_read().expect("list_rooms: uncontended read");
                RoomInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                    capacity: guard.capacity,
                    location: guard.location.clone(),
                    approver: guard.approver.clone(),
                    maintenance: guard.maintenance,
                }
            })
            .collect()
    }

    pub fn list_equipment(&self) -> Vec<Equipment> {
        self.equipment.iter().map(|e| e.value().clone()).collect()
    }

    /// The calendar feed: active bookings overlapping the window. Reads are
    /// not serialized against in-flight writes — eventually consistent by
    /// contract.
    pub async fn bookings_in_window(
        &self,
        room_id: Ulid,
        window: Span,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let rs = match self.get_room(&room_id) {
            Some(rs) => rs,
            None => return Ok(vec![]),
        };
        let guard = rs.read().await;
        Ok(guard
            .overlapping(&window)
            .filter(|b| b.status.is_active())
            .map(|b| info(b, room_id))
            .collect())
    }

    /// Full booking history for a room, optionally filtered by status.
    /// `status = Some(Pending)` is the approver work queue.
    pub async fn list_bookings(
        &self,
        room_id: Ulid,
        status: Option<BookingStatus>,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let rs = match self.get_room(&room_id) {
            Some(rs) => rs,
            None => return Ok(vec![]),
        };
        let guard = rs.read().await;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| status.is_none_or(|s| b.status == s))
            .map(|b| info(b, room_id))
            .collect())
    }

    /// Approved, un-notified bookings starting within `lead` of `now` — the
    /// reminder sweep's work list.
    pub fn collect_due_reminders(&self, now: DateTime<Utc>, lead: Duration) -> Vec<Ulid> {
        let horizon = now + lead;
        let mut due = Vec::new();
        for entry in self.rooms.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for b in &guard.bookings {
                    if b.status == BookingStatus::Approved
                        && !b.notified
                        && b.span.start >= now
                        && b.span.start <= horizon
                    {
                        due.push(b.id);
                    }
                }
            }
        }
        due
    }
}
