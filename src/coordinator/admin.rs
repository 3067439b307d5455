use tracing::{info, warn};

use crate::limits::MAX_ROOM_CAPACITY;
use crate::model::*;
use crate::store::StoreError;

use super::{Coordinator, EngineError, check_id};

fn check_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 || capacity > MAX_ROOM_CAPACITY {
        return Err(EngineError::InvalidCapacity(capacity));
    }
    Ok(())
}

impl Coordinator {
    /// Register a new room. Occupancy always starts at zero.
    pub async fn create_room(&self, mut room: Room) -> Result<Room, EngineError> {
        check_id(&room.number, "room number length")?;
        check_id(&room.room_type, "room type length")?;
        check_capacity(room.capacity)?;
        room.occupied = 0;
        room.retired = false;

        // Single attempt: a retried insert whose first attempt landed would
        // report AlreadyExists for our own room.
        self.inventory.insert_room(room.clone()).await?;
        self.refresh_types(&[room.room_type.as_str()]).await;
        info!(room = %room.number, room_type = %room.room_type, capacity = room.capacity, "room created");
        Ok(room)
    }

    /// Management edit. Capacity may not drop below what is currently held.
    pub async fn update_room(&self, number: &str, patch: RoomPatch) -> Result<Room, EngineError> {
        if let Some(capacity) = patch.capacity {
            check_capacity(capacity)?;
        }
        if let Some(room_type) = &patch.room_type {
            check_id(room_type, "room type length")?;
        }
        let before = self.load_room(number).await?;
        let inventory = &self.inventory;
        let after = self
            .retry
            .run("update_room", || inventory.update_room(number, patch.clone()))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => EngineError::RoomNotFound(number.to_string()),
                other => other.into(),
            })?;
        self.refresh_types(&[before.room_type.as_str(), after.room_type.as_str()])
            .await;
        info!(room = number, "room updated");
        Ok(after)
    }

    /// Soft-retire: no new bookings, existing ones stand.
    pub async fn retire_room(&self, number: &str) -> Result<Room, EngineError> {
        let inventory = &self.inventory;
        let room = self
            .retry
            .run("retire_room", || inventory.retire_room(number))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => EngineError::RoomNotFound(number.to_string()),
                other => other.into(),
            })?;
        info!(room = number, "room retired");
        Ok(room)
    }

    /// Delete a room that no confirmed booking references.
    pub async fn remove_room(&self, number: &str) -> Result<Room, EngineError> {
        self.load_room(number).await?;
        let active = self
            .bookings_by_room(number)
            .await?
            .iter()
            .any(|b| b.status == BookingStatus::Confirmed);
        if active {
            return Err(EngineError::RoomInUse(number.to_string()));
        }

        let room = self.inventory.remove_room(number).await.map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::RoomNotFound(number.to_string()),
            other => other.into(),
        })?;
        self.notify.remove(number);
        self.refresh_types(&[room.room_type.as_str()]).await;
        info!(room = number, "room removed");
        Ok(room)
    }

    async fn refresh_types(&self, types: &[&str]) {
        for (i, &room_type) in types.iter().enumerate() {
            if types[..i].contains(&room_type) {
                continue;
            }
            if let Err(e) = self.projector.recompute(Some(room_type)).await {
                warn!(room_type, error = %e, "occupancy refresh failed");
                self.projector.invalidate();
            }
        }
    }
}
