use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;
use crate::store::StoreError;

use super::{Coordinator, EngineError};

impl Coordinator {
    pub(super) async fn load_room(&self, number: &str) -> Result<Room, EngineError> {
        let inventory = &self.inventory;
        self.retry
            .run("get_room", || inventory.get_room(number))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => EngineError::RoomNotFound(number.to_string()),
                other => other.into(),
            })
    }

    pub(super) async fn load_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let ledger = &self.ledger;
        self.retry
            .run("get_booking", || ledger.get_booking(id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => EngineError::BookingNotFound(id),
                other => other.into(),
            })
    }

    pub async fn get_room(&self, number: &str) -> Result<Room, EngineError> {
        self.load_room(number).await
    }

    pub async fn get_room_status(&self, number: &str) -> Result<RoomStatus, EngineError> {
        Ok(self.load_room(number).await?.status())
    }

    /// Rooms ordered by number, optionally of one type.
    pub async fn list_rooms(&self, room_type: Option<&str>) -> Result<Vec<Room>, EngineError> {
        let inventory = &self.inventory;
        Ok(self
            .retry
            .run("list_rooms", || inventory.list_rooms(room_type))
            .await?)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.load_booking(id).await
    }

    pub async fn bookings_by_room(&self, room: &str) -> Result<Vec<Booking>, EngineError> {
        let ledger = &self.ledger;
        Ok(self
            .retry
            .run("list_by_room", || ledger.list_by_room(room))
            .await?)
    }

    pub async fn bookings_by_student(&self, student: &str) -> Result<Vec<Booking>, EngineError> {
        let ledger = &self.ledger;
        Ok(self
            .retry
            .run("list_by_student", || ledger.list_by_student(student))
            .await?)
    }

    pub async fn bookings_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, EngineError> {
        let ledger = &self.ledger;
        Ok(self
            .retry
            .run("list_by_status", || ledger.list_by_status(status))
            .await?)
    }

    /// The booking's ledger entries, oldest first.
    pub async fn booking_history(&self, id: Ulid) -> Result<Vec<LedgerEntry>, EngineError> {
        let ledger = &self.ledger;
        self.retry
            .run("history", || ledger.history(id))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => EngineError::BookingNotFound(id),
                other => other.into(),
            })
    }

    /// Per-type occupancy from the projector cache, rebuilt first if stale.
    pub async fn get_occupancy(&self, room_type: Option<&str>) -> Result<OccupancyView, EngineError> {
        Ok(self.projector.view(room_type).await?)
    }

    /// Rebuild the occupancy cache from the inventory.
    pub async fn recompute_occupancy(&self, room_type: Option<&str>) -> Result<OccupancyView, EngineError> {
        Ok(self.projector.recompute(room_type).await?)
    }

    /// Ledger entries for one room, as they are appended.
    pub fn subscribe(&self, room: &str) -> broadcast::Receiver<LedgerEntry> {
        self.notify.subscribe(room)
    }
}
