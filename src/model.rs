use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Half-open interval `[start, end)` over UTC instants.
///
/// Validity (`start < end`, bounded timestamps) is checked at the mutation
/// boundary by `engine::conflict::validate_span`, not at construction, so
/// user-supplied garbage surfaces as `InvalidTimeRange` instead of a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Where a booking sits in the approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    /// Active bookings participate in the no-overlap invariant.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    /// Terminal bookings accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Rejected | BookingStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "approved" => Some(BookingStatus::Approved),
            "rejected" => Some(BookingStatus::Rejected),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repetition rule for a booking request. Consumed entirely at creation time
/// when the request is expanded into occurrences; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Once,
    Weekly { until: NaiveDate },
    Monthly { until: NaiveDate },
}

/// One persisted booking occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingState {
    pub id: Ulid,
    /// Correlation id shared by all occurrences of one recurring request.
    pub series_id: Option<Ulid>,
    /// Requester display name. `None` when the user was deleted upstream;
    /// the booking survives.
    pub owner: Option<String>,
    pub span: Span,
    pub title: String,
    pub participants: u32,
    pub chairman: String,
    pub department: String,
    pub description: String,
    pub extra_requests: String,
    pub notes: String,
    pub equipment: Vec<Ulid>,
    pub status: BookingStatus,
    /// Reminder de-duplication flag.
    pub notified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: String,
    /// Seats. At least 1, enforced at create/update.
    pub capacity: u32,
    pub location: Option<String>,
    /// Designated approver for this room's pending bookings.
    /// `None` routes approvals to any global admin.
    pub approver: Option<String>,
    pub maintenance: Option<Span>,
    /// All bookings, active and terminal, sorted by `span.start`.
    pub bookings: Vec<BookingState>,
}

impl RoomState {
    pub fn new(
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        approver: Option<String>,
        maintenance: Option<Span>,
    ) -> Self {
        Self {
            id,
            name,
            capacity,
            location,
            approver,
            maintenance,
            bookings: Vec::new(),
        }
    }

    pub fn under_maintenance(&self, now: DateTime<Utc>) -> bool {
        self.maintenance.is_some_and(|w| w.contains_instant(now))
    }

    /// Insert a booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: BookingState) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove a booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<BookingState> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&BookingState> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut BookingState> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingState> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

/// A bookable accessory (projector, conference phone, …).
/// Registry-only lifecycle; bookings reference equipment by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: Ulid,
    pub name: String,
    pub description: String,
}

/// A new booking request, pre-expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub room_id: Ulid,
    pub span: Span,
    pub title: String,
    pub participants: u32,
    pub chairman: String,
    pub department: String,
    pub description: String,
    pub extra_requests: String,
    pub notes: String,
    pub equipment: Vec<Ulid>,
    pub recurrence: Recurrence,
}

/// Field-wise edit of an existing booking. `None` keeps the current value;
/// `span` replaces start and end together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub span: Option<Span>,
    pub title: Option<String>,
    pub participants: Option<u32>,
    pub chairman: Option<String>,
    pub department: Option<String>,
    pub description: Option<String>,
    pub extra_requests: Option<String>,
    pub notes: Option<String>,
    pub equipment: Option<Vec<Ulid>>,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        approver: Option<String>,
        maintenance: Option<Span>,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
        capacity: u32,
        location: Option<String>,
        approver: Option<String>,
        maintenance: Option<Span>,
    },
    RoomDeleted {
        id: Ulid,
    },
    EquipmentAdded {
        id: Ulid,
        name: String,
        description: String,
    },
    EquipmentRemoved {
        id: Ulid,
    },
    /// Creation of one occurrence. Carries the full booking row so WAL
    /// compaction can emit a single event per live booking.
    BookingRequested {
        id: Ulid,
        room_id: Ulid,
        series_id: Option<Ulid>,
        owner: Option<String>,
        span: Span,
        title: String,
        participants: u32,
        chairman: String,
        department: String,
        description: String,
        extra_requests: String,
        notes: String,
        equipment: Vec<Ulid>,
        status: BookingStatus,
        notified: bool,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
    BookingApproved {
        id: Ulid,
        room_id: Ulid,
        actor: String,
        at: DateTime<Utc>,
    },
    BookingRejected {
        id: Ulid,
        room_id: Ulid,
        actor: String,
        at: DateTime<Utc>,
    },
    BookingCancelled {
        id: Ulid,
        room_id: Ulid,
        actor: String,
        at: DateTime<Utc>,
    },
    BookingEdited {
        id: Ulid,
        room_id: Ulid,
        span: Span,
        title: String,
        participants: u32,
        chairman: String,
        department: String,
        description: String,
        extra_requests: String,
        notes: String,
        equipment: Vec<Ulid>,
        status: BookingStatus,
        at: DateTime<Utc>,
    },
    ReminderSent {
        id: Ulid,
        room_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
    pub location: Option<String>,
    pub approver: Option<String>,
    pub maintenance: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub series_id: Option<Ulid>,
    pub room_id: Ulid,
    pub owner: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub title: String,
    pub participants: u32,
    pub status: BookingStatus,
    pub notified: bool,
}
