use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidTimeRange(&'static str),
    CapacityExceeded { requested: u32, capacity: u32 },
    /// One or more occurrences overlap an active booking; carries the start
    /// of every conflicting occurrence so the caller can show the full list.
    Conflict(Vec<DateTime<Utc>>),
    PermissionDenied(&'static str),
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    UnderMaintenance(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTimeRange(msg) => write!(f, "invalid time range: {msg}"),
            EngineError::CapacityExceeded { requested, capacity } => {
                write!(f, "capacity exceeded: {requested} participants in a {capacity}-seat room")
            }
            EngineError::Conflict(starts) => {
                let list: Vec<String> = starts.iter().map(|t| t.to_rfc3339()).collect();
                write!(f, "conflicts with existing bookings at: {}", list.join(", "))
            }
            EngineError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            EngineError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a {from} booking")
            }
            EngineError::UnderMaintenance(id) => {
                write!(f, "room {id} is under maintenance")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
