use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::MAX_ROOMS_PER_HOSTEL;
use crate::model::*;

use super::durable::{Placeholder, RoomState};
use super::{InventoryStore, Store, StoreError};

#[async_trait]
impl InventoryStore for Store {
    async fn get_room(&self, number: &str) -> Result<Room, StoreError> {
        let shared = self.room_handle(number)?;
        let guard = shared.read().await;
        if !guard.committed {
            return Err(StoreError::NotFound(number.to_string()));
        }
        Ok(guard.room.clone())
    }

    async fn list_rooms(&self, room_type: Option<&str>) -> Result<Vec<Room>, StoreError> {
        let handles: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(handles.len());
        for shared in handles {
            let guard = shared.read().await;
            if guard.committed && room_type.is_none_or(|t| guard.room.room_type == t) {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.number.cmp(&b.number));
        Ok(rooms)
    }

    async fn insert_room(&self, mut room: Room) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        if self.rooms.len() >= MAX_ROOMS_PER_HOSTEL {
            return Err(StoreError::LimitExceeded("too many rooms"));
        }

        let number = room.number.clone();
        room.revision = self.next_revision();
        let state = Arc::new(RwLock::new(RoomState::new(room, [], false)));
        let mut guard = state.clone().write_owned().await;
        let placeholder = Placeholder::insert(&self.rooms, number.clone(), state)
            .map_err(|_| StoreError::AlreadyExists(number))?;

        let record = Record::RoomCreated {
            room: guard.room.clone(),
            claims: Vec::new(),
        };
        self.wal_append(record).await?;
        guard.committed = true;
        placeholder.commit();
        Ok(())
    }

    async fn update_room(&self, number: &str, patch: RoomPatch) -> Result<Room, StoreError> {
        let _gate = self.gate.read().await;
        let shared = self.room_handle(number)?;
        let mut guard = shared.write().await;
        if !guard.committed {
            return Err(StoreError::NotFound(number.to_string()));
        }

        let capacity = patch.capacity.unwrap_or(guard.room.capacity);
        if capacity < guard.room.occupied {
            return Err(StoreError::CapacityBelowOccupancy {
                capacity,
                occupied: guard.room.occupied,
            });
        }
        let record = Record::RoomUpdated {
            number: number.to_string(),
            room_type: patch.room_type.unwrap_or_else(|| guard.room.room_type.clone()),
            capacity,
            price: patch.price.unwrap_or(guard.room.price),
            gender: patch.gender.unwrap_or(guard.room.gender),
        };
        self.wal_append(record.clone()).await?;
        guard.apply(&record);
        guard.room.revision = self.next_revision();
        Ok(guard.room.clone())
    }

    async fn retire_room(&self, number: &str) -> Result<Room, StoreError> {
        let _gate = self.gate.read().await;
        let shared = self.room_handle(number)?;
        let mut guard = shared.write().await;
        if !guard.committed {
            return Err(StoreError::NotFound(number.to_string()));
        }
        if guard.room.retired {
            return Ok(guard.room.clone());
        }
        let record = Record::RoomRetired {
            number: number.to_string(),
        };
        self.wal_append(record.clone()).await?;
        guard.apply(&record);
        guard.room.revision = self.next_revision();
        Ok(guard.room.clone())
    }

    async fn remove_room(&self, number: &str) -> Result<Room, StoreError> {
        let _gate = self.gate.read().await;
        let shared = self.room_handle(number)?;
        let mut guard = shared.write().await;
        if !guard.committed {
            return Err(StoreError::NotFound(number.to_string()));
        }
        if !guard.claims.is_empty() {
            return Err(StoreError::InUse(number.to_string()));
        }
        self.wal_append(Record::RoomRemoved {
            number: number.to_string(),
        })
        .await?;
        guard.committed = false;
        guard.room.revision = self.next_revision();
        self.rooms.remove_if(number, |_, v| Arc::ptr_eq(v, &shared));
        Ok(guard.room.clone())
    }

    async fn try_reserve(&self, number: &str, claim: Ulid) -> Result<Room, StoreError> {
        self.reserve_claim(number, claim, false).await
    }

    async fn restore(&self, number: &str, claim: Ulid) -> Result<Room, StoreError> {
        self.reserve_claim(number, claim, true).await
    }

    async fn release(&self, number: &str, claim: Ulid) -> Result<Room, StoreError> {
        let _gate = self.gate.read().await;
        let shared = self.room_handle(number)?;
        let mut guard = shared.write().await;
        if !guard.committed {
            return Err(StoreError::NotFound(number.to_string()));
        }
        if !guard.claims.contains(&claim) {
            return Err(if guard.room.occupied == 0 {
                StoreError::AlreadyAtZero(number.to_string())
            } else {
                StoreError::NotHeld {
                    room: number.to_string(),
                    claim,
                }
            });
        }

        let record = Record::CapacityReleased {
            number: number.to_string(),
            claim,
        };
        self.wal_append(record.clone()).await?;
        guard.apply(&record);
        guard.room.revision = self.next_revision();
        Ok(guard.room.clone())
    }

    async fn claims(&self, number: &str) -> Result<Vec<Ulid>, StoreError> {
        let shared = self.room_handle(number)?;
        let guard = shared.read().await;
        if !guard.committed {
            return Err(StoreError::NotFound(number.to_string()));
        }
        Ok(guard.claims.iter().copied().collect())
    }
}

impl Store {
    async fn reserve_claim(
        &self,
        number: &str,
        claim: Ulid,
        admit_retired: bool,
    ) -> Result<Room, StoreError> {
        let _gate = self.gate.read().await;
        let shared = self.room_handle(number)?;
        let mut guard = shared.write().await;
        if !guard.committed {
            return Err(StoreError::NotFound(number.to_string()));
        }
        if guard.claims.contains(&claim) {
            return Ok(guard.room.clone());
        }
        if guard.room.retired && !admit_retired {
            return Err(StoreError::Retired(number.to_string()));
        }
        if guard.room.occupied >= guard.room.capacity {
            return Err(StoreError::Full(number.to_string()));
        }

        let record = Record::CapacityReserved {
            number: number.to_string(),
            claim,
        };
        self.wal_append(record.clone()).await?;
        guard.apply(&record);
        guard.room.revision = self.next_revision();
        Ok(guard.room.clone())
    }
}
