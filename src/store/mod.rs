mod durable;
mod ledger;
mod rooms;
#[cfg(test)]
mod tests;

pub use durable::Store;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("room {0} is full")]
    Full(String),
    #[error("room {0} is retired")]
    Retired(String),
    #[error("room {0} still holds capacity")]
    InUse(String),
    #[error("room {0} has nothing to release")]
    AlreadyAtZero(String),
    #[error("claim {claim} is not held on room {room}")]
    NotHeld { room: String, claim: Ulid },
    #[error("student already holds confirmed booking {0} for this room")]
    Duplicate(Ulid),
    #[error("booking {booking} is {from}; cannot record {change}")]
    InvalidTransition {
        booking: Ulid,
        from: BookingStatus,
        change: &'static str,
    },
    #[error("capacity {capacity} is below current occupancy {occupied}")]
    CapacityBelowOccupancy { capacity: u32, occupied: u32 },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Only unavailability is worth retrying; everything else is a definite answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Durable record of rooms with atomic, per-room capacity mutation.
///
/// `try_reserve` and `release` are conditional updates keyed by a claim token
/// (the booking id): reserving a held claim is a no-op success and releasing
/// an unheld claim mutates nothing, so a retried or compensating call can
/// never move somebody else's unit.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn get_room(&self, number: &str) -> Result<Room, StoreError>;

    async fn list_rooms(&self, room_type: Option<&str>) -> Result<Vec<Room>, StoreError>;

    async fn insert_room(&self, room: Room) -> Result<(), StoreError>;

    async fn update_room(&self, number: &str, patch: RoomPatch) -> Result<Room, StoreError>;

    async fn retire_room(&self, number: &str) -> Result<Room, StoreError>;

    /// Fails with `InUse` while any capacity is held.
    async fn remove_room(&self, number: &str) -> Result<Room, StoreError>;

    /// Atomically take one unit if `occupied < capacity`, else `Full`.
    async fn try_reserve(&self, number: &str, claim: Ulid) -> Result<Room, StoreError>;

    /// `try_reserve` that also admits retired rooms. Only for putting back
    /// the unit of a booking that is still `Confirmed`; capacity still binds.
    async fn restore(&self, number: &str, claim: Ulid) -> Result<Room, StoreError>;

    /// Give back the unit held by `claim`.
    async fn release(&self, number: &str, claim: Ulid) -> Result<Room, StoreError>;

    async fn claims(&self, number: &str) -> Result<Vec<Ulid>, StoreError>;
}

/// Append-only booking ledger with a denormalized current-status view.
#[async_trait]
pub trait BookingLedger: Send + Sync {
    /// Record a lifecycle event. Illegal transitions are refused with
    /// `InvalidTransition`; a second active confirmation for the same
    /// (room, student) pair is refused with `Duplicate`.
    async fn append(&self, event: LedgerEvent) -> Result<EventId, StoreError>;

    async fn get_booking(&self, id: Ulid) -> Result<Booking, StoreError>;

    /// Bookings for a room, oldest first.
    async fn list_by_room(&self, room: &str) -> Result<Vec<Booking>, StoreError>;

    /// Bookings for a student, oldest first.
    async fn list_by_student(&self, student: &str) -> Result<Vec<Booking>, StoreError>;

    async fn list_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, StoreError>;

    /// Every recorded entry for a booking, in append order.
    async fn history(&self, id: Ulid) -> Result<Vec<LedgerEntry>, StoreError>;
}
