use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingState, BookingStatus};

const CHANNEL_CAPACITY: usize = 256;

/// What happened to the booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationKind {
    Created,
    StatusChanged { old: String, new: String },
    Reminder,
}

/// The dispatcher payload, display-ready: downstream sinks (mail, chat,
/// calendar sync) consume it as-is from the NOTIFY channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    #[serde(flatten)]
    pub kind: NotificationKind,
    pub booking_id: Ulid,
    pub room_id: Ulid,
    pub room: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Requester display name, or `"unknown"` when the owner is null.
    pub requester: String,
    /// Comma-joined equipment names, or `"none"`.
    pub equipment: String,
    /// Free-text notes, or `"none"` when blank.
    pub notes: String,
    /// Resulting status label.
    pub status: String,
}

impl Notification {
    fn build(
        kind: NotificationKind,
        booking: &BookingState,
        room_id: Ulid,
        room_name: &str,
        equipment_names: &[String],
    ) -> Self {
        Self {
            kind,
            booking_id: booking.id,
            room_id,
            room: room_name.to_string(),
            title: booking.title.clone(),
            start: booking.span.start,
            end: booking.span.end,
            requester: booking
                .owner
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            equipment: if equipment_names.is_empty() {
                "none".to_string()
            } else {
                equipment_names.join(", ")
            },
            notes: if booking.notes.trim().is_empty() {
                "none".to_string()
            } else {
                booking.notes.clone()
            },
            status: booking.status.as_str().to_string(),
        }
    }

    pub fn created(
        booking: &BookingState,
        room_id: Ulid,
        room_name: &str,
        equipment_names: &[String],
    ) -> Self {
        Self::build(NotificationKind::Created, booking, room_id, room_name, equipment_names)
    }

    pub fn status_changed(
        booking: &BookingState,
        old: BookingStatus,
        room_id: Ulid,
        room_name: &str,
        equipment_names: &[String],
    ) -> Self {
        let kind = NotificationKind::StatusChanged {
            old: old.as_str().to_string(),
            new: booking.status.as_str().to_string(),
        };
        Self::build(kind, booking, room_id, room_name, equipment_names)
    }

    pub fn reminder(
        booking: &BookingState,
        room_id: Ulid,
        room_name: &str,
        equipment_names: &[String],
    ) -> Self {
        Self::build(NotificationKind::Reminder, booking, room_id, room_name, equipment_names)
    }
}

/// Broadcast hub for LISTEN/NOTIFY per room. Delivery is best-effort:
/// publishing to a room nobody listens on is a no-op, and a lagging or
/// dropped receiver never affects the mutation that produced the event.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a room. Creates the channel if needed.
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a notification. No-op if nobody is listening.
    pub fn publish(&self, room_id: Ulid, notification: Notification) {
        if let Some(sender) = self.channels.get(&room_id) {
            let _ = sender.send(notification);
        }
    }

    /// Remove a channel (e.g. when the room is deleted).
    pub fn remove(&self, room_id: &Ulid) {
        self.channels.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use chrono::TimeZone;

    fn booking(notes: &str, owner: Option<&str>, status: BookingStatus) -> BookingState {
        let start = Utc.with_ymd_and_hms(2030, 6, 2, 9, 0, 0).unwrap();
        BookingState {
            id: Ulid::new(),
            series_id: None,
            owner: owner.map(String::from),
            span: Span::new(start, start + chrono::Duration::hours(1)),
            title: "sync".into(),
            participants: 4,
            chairman: String::new(),
            department: String::new(),
            description: String::new(),
            extra_requests: String::new(),
            notes: notes.into(),
            equipment: Vec::new(),
            status,
            notified: false,
            created_at: start,
            updated_at: start,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let room_id = Ulid::new();
        let mut rx = hub.subscribe(room_id);

        let n = Notification::created(
            &booking("", Some("ann"), BookingStatus::Approved),
            room_id,
            "Room A",
            &[],
        );
        hub.publish(room_id, n.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received, n);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let room_id = Ulid::new();
        // No subscriber — should not panic
        hub.publish(
            room_id,
            Notification::reminder(
                &booking("", Some("ann"), BookingStatus::Approved),
                room_id,
                "Room A",
                &[],
            ),
        );
    }

    #[test]
    fn display_defaults() {
        let room_id = Ulid::new();
        let n = Notification::created(&booking("  ", None, BookingStatus::Pending), room_id, "A", &[]);
        assert_eq!(n.requester, "unknown");
        assert_eq!(n.equipment, "none");
        assert_eq!(n.notes, "none");
        assert_eq!(n.status, "pending");

        let with_gear = Notification::created(
            &booking("bring cables", Some("bob"), BookingStatus::Pending),
            room_id,
            "A",
            &["projector".to_string(), "whiteboard".to_string()],
        );
        assert_eq!(with_gear.equipment, "projector, whiteboard");
        assert_eq!(with_gear.notes, "bring cables");
    }

    #[test]
    fn payload_is_json_object_with_kind() {
        let room_id = Ulid::new();
        let old = BookingStatus::Pending;
        let n = Notification::status_changed(
            &booking("", Some("ann"), BookingStatus::Approved),
            old,
            room_id,
            "Room A",
            &[],
        );
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], "status_changed");
        assert_eq!(json["old"], "pending");
        assert_eq!(json["new"], "approved");
        assert_eq!(json["room"], "Room A");
    }
}
