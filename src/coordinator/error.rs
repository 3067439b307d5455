use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{BookingStatus, Gender, GenderRestriction};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),
    #[error("student not found: {0}")]
    StudentNotFound(String),
    #[error("room already exists: {0}")]
    RoomExists(String),
    #[error("room {0} is retired and accepts no new bookings")]
    RoomRetired(String),
    #[error("room {0} still has confirmed bookings")]
    RoomInUse(String),
    #[error("room {room} is restricted to {restriction}; student is {gender:?}")]
    GenderMismatch {
        room: String,
        restriction: GenderRestriction,
        gender: Gender,
    },
    #[error("student already holds confirmed booking {0} for this room")]
    DuplicateBooking(Ulid),
    #[error("room {room} is full (booking {booking_id} rejected)")]
    NoCapacity { room: String, booking_id: Ulid },
    #[error("booking {booking} is {status}; cannot {action}")]
    InvalidState {
        booking: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    #[error("capacity {capacity} is below current occupancy {occupied}")]
    CapacityBelowOccupancy { capacity: u32, occupied: u32 },
    #[error("invalid capacity {0}")]
    InvalidCapacity(u32),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("temporarily unavailable, please try again: {0}")]
    Transient(String),
}

/// The user-visible outcome categories every failure collapses to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    NotFound,
    NoCapacity,
    GenderMismatch,
    DuplicateBooking,
    InvalidState,
    TransientError,
    InvalidRequest,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::NotFound => "not_found",
            Rejection::NoCapacity => "no_capacity",
            Rejection::GenderMismatch => "gender_mismatch",
            Rejection::DuplicateBooking => "duplicate_booking",
            Rejection::InvalidState => "invalid_state",
            Rejection::TransientError => "transient_error",
            Rejection::InvalidRequest => "invalid_request",
        }
    }
}

impl EngineError {
    pub fn rejection(&self) -> Rejection {
        match self {
            EngineError::RoomNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::StudentNotFound(_) => Rejection::NotFound,
            EngineError::NoCapacity { .. } => Rejection::NoCapacity,
            EngineError::GenderMismatch { .. } => Rejection::GenderMismatch,
            EngineError::DuplicateBooking(_) => Rejection::DuplicateBooking,
            EngineError::InvalidState { .. }
            | EngineError::RoomRetired(_)
            | EngineError::RoomInUse(_) => Rejection::InvalidState,
            EngineError::Transient(_) => Rejection::TransientError,
            EngineError::RoomExists(_)
            | EngineError::CapacityBelowOccupancy { .. }
            | EngineError::InvalidCapacity(_)
            | EngineError::LimitExceeded(_) => Rejection::InvalidRequest,
        }
    }
}

/// Fallback mapping for store errors the caller did not handle itself.
/// `NotFound` is read as a room, which is what every inventory call means by it.
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(number) => EngineError::RoomNotFound(number),
            StoreError::AlreadyExists(number) => EngineError::RoomExists(number),
            StoreError::Full(room) => EngineError::Transient(format!("room {room} became full")),
            StoreError::Retired(number) => EngineError::RoomRetired(number),
            StoreError::InUse(number) => EngineError::RoomInUse(number),
            StoreError::Duplicate(existing) => EngineError::DuplicateBooking(existing),
            StoreError::InvalidTransition { booking, from, change } => EngineError::InvalidState {
                booking,
                status: from,
                action: change,
            },
            StoreError::CapacityBelowOccupancy { capacity, occupied } => {
                EngineError::CapacityBelowOccupancy { capacity, occupied }
            }
            StoreError::LimitExceeded(what) => EngineError::LimitExceeded(what),
            e @ (StoreError::AlreadyAtZero(_)
            | StoreError::NotHeld { .. }
            | StoreError::Unavailable(_)) => EngineError::Transient(e.to_string()),
        }
    }
}
