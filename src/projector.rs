use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::model::*;
use crate::store::{InventoryStore, StoreError};

/// What the cache last saw of one room.
#[derive(Debug, Clone)]
struct Tracked {
    room_type: String,
    capacity: u32,
    occupied: u32,
    revision: u64,
}

impl From<&Room> for Tracked {
    fn from(room: &Room) -> Self {
        Self {
            room_type: room.room_type.clone(),
            capacity: room.capacity,
            occupied: room.occupied,
            revision: room.revision,
        }
    }
}

#[derive(Default)]
struct Cache {
    rooms: HashMap<String, Tracked>,
    by_type: BTreeMap<String, TypeOccupancy>,
}

impl Cache {
    fn add(&mut self, t: &Tracked) {
        let agg = self.by_type.entry(t.room_type.clone()).or_default();
        agg.rooms += 1;
        agg.capacity += u64::from(t.capacity);
        agg.occupied += u64::from(t.occupied);
    }

    fn subtract(&mut self, t: &Tracked) {
        let Some(agg) = self.by_type.get_mut(&t.room_type) else {
            return;
        };
        agg.rooms = agg.rooms.saturating_sub(1);
        agg.capacity = agg.capacity.saturating_sub(u64::from(t.capacity));
        agg.occupied = agg.occupied.saturating_sub(u64::from(t.occupied));
        if agg.rooms == 0 {
            self.by_type.remove(&t.room_type);
        }
    }

    /// Take `room` if it is newer than what is tracked. Returns whether it was.
    fn observe(&mut self, room: &Room) -> bool {
        if self
            .rooms
            .get(&room.number)
            .is_some_and(|old| old.revision >= room.revision)
        {
            return false;
        }
        let new = Tracked::from(room);
        if let Some(old) = self.rooms.insert(room.number.clone(), new.clone()) {
            self.subtract(&old);
        }
        self.add(&new);
        true
    }

    fn forget(&mut self, number: &str) {
        if let Some(old) = self.rooms.remove(number) {
            self.subtract(&old);
        }
    }
}

/// Read-optimized occupancy aggregates per room type.
///
/// The cache is derived and disposable. It is fed the post-change room after
/// every reserve/release and rebuilt from the inventory on demand or by the
/// periodic reconciler. Every room snapshot carries the store's revision, so
/// a change that a recompute has already counted is ignored when its hook
/// arrives late, and an old snapshot never overwrites a newer one.
pub struct OccupancyProjector {
    inventory: Arc<dyn InventoryStore>,
    cache: Mutex<Cache>,
    stale: AtomicBool,
}

impl OccupancyProjector {
    pub fn new(inventory: Arc<dyn InventoryStore>) -> Self {
        Self {
            inventory,
            cache: Mutex::new(Cache::default()),
            stale: AtomicBool::new(true),
        }
    }

    /// Full rebuild from the inventory, optionally scoped to one room type.
    ///
    /// Returns the rebuilt view. Rooms of the scope missing from the listing
    /// leave the cache; listed rooms replace older tracked snapshots.
    pub async fn recompute(&self, room_type: Option<&str>) -> Result<OccupancyView, StoreError> {
        let rooms = self.inventory.list_rooms(room_type).await?;
        let view = OccupancyView::from_rooms(&rooms);

        let mut cache = self.cache.lock().await;
        let listed: HashSet<&str> = rooms.iter().map(|r| r.number.as_str()).collect();
        let gone: Vec<String> = cache
            .rooms
            .iter()
            .filter(|(number, t)| {
                room_type.is_none_or(|ty| t.room_type == ty) && !listed.contains(number.as_str())
            })
            .map(|(number, _)| number.clone())
            .collect();
        for number in &gone {
            cache.forget(number);
        }
        for room in &rooms {
            cache.observe(room);
        }
        drop(cache);

        if room_type.is_none() {
            self.stale.store(false, Ordering::Release);
        }
        debug!(scope = room_type.unwrap_or("*"), types = view.by_type.len(), "occupancy recomputed");
        Ok(view)
    }

    /// Incremental hook, fed the room as a reserve or release left it.
    /// Snapshots no newer than the tracked one are no-ops.
    pub async fn on_room_changed(&self, room: &Room) {
        if !self.cache.lock().await.observe(room) {
            debug!(room = %room.number, revision = room.revision, "occupancy change already counted");
        }
    }

    /// Force the next read to rebuild.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Current view, rebuilding first if the cache is stale.
    pub async fn view(&self, room_type: Option<&str>) -> Result<OccupancyView, StoreError> {
        if self.is_stale() {
            self.recompute(None).await?;
        }
        Ok(self.snapshot(room_type).await)
    }

    /// The cached aggregates as they are, without touching the inventory.
    pub async fn snapshot(&self, room_type: Option<&str>) -> OccupancyView {
        let cache = self.cache.lock().await;
        let by_type = cache
            .by_type
            .iter()
            .filter(|(t, _)| room_type.is_none_or(|ty| t.as_str() == ty))
            .map(|(t, agg)| (t.clone(), *agg))
            .collect();
        OccupancyView { by_type }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("bunkd_test_projector");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn seeded(name: &str) -> (Arc<Store>, OccupancyProjector) {
        let store = Arc::new(Store::open(&test_wal_path(name)).unwrap());
        store.insert_room(Room::new("A101", "single", 1)).await.unwrap();
        store.insert_room(Room::new("A102", "single", 1)).await.unwrap();
        store.insert_room(Room::new("B201", "double", 2)).await.unwrap();
        let projector = OccupancyProjector::new(store.clone());
        (store, projector)
    }

    #[tokio::test]
    async fn first_read_rebuilds() {
        let (store, projector) = seeded("first_read.wal").await;
        store.try_reserve("B201", Ulid::new()).await.unwrap();
        assert!(projector.is_stale());

        let view = projector.view(None).await.unwrap();
        assert!(!projector.is_stale());
        assert_eq!(view.by_type["single"], TypeOccupancy { rooms: 2, capacity: 2, occupied: 0 });
        assert_eq!(view.by_type["double"], TypeOccupancy { rooms: 1, capacity: 2, occupied: 1 });
    }

    #[tokio::test]
    async fn incremental_matches_recompute() {
        let (store, projector) = seeded("incremental.wal").await;
        projector.recompute(None).await.unwrap();

        let a = Ulid::new();
        let b = Ulid::new();
        let room = store.try_reserve("A101", a).await.unwrap();
        projector.on_room_changed(&room).await;
        let room = store.try_reserve("B201", b).await.unwrap();
        projector.on_room_changed(&room).await;
        let room = store.release("A101", a).await.unwrap();
        projector.on_room_changed(&room).await;

        let incremental = projector.snapshot(None).await;
        let rebuilt = projector.recompute(None).await.unwrap();
        assert_eq!(incremental, rebuilt);
        assert_eq!(rebuilt.total().occupied, 1);
    }

    #[tokio::test]
    async fn late_change_after_recompute_is_not_counted_twice() {
        let store = Arc::new(Store::open(&test_wal_path("late_change.wal")).unwrap());
        store.insert_room(Room::new("PP1", "double", 2)).await.unwrap();
        let projector = OccupancyProjector::new(store.clone());
        projector.recompute(None).await.unwrap();

        // The reserve lands, a recompute sees it, then the hook arrives.
        let room = store.try_reserve("PP1", Ulid::new()).await.unwrap();
        projector.recompute(None).await.unwrap();
        projector.on_room_changed(&room).await;

        let cached = projector.snapshot(None).await;
        let truth = OccupancyView::from_rooms(&store.list_rooms(None).await.unwrap());
        assert_eq!(cached, truth);
        assert_eq!(cached.by_type["double"].occupied, 1);
    }

    #[tokio::test]
    async fn older_snapshot_never_overwrites_newer() {
        let (store, projector) = seeded("older_snapshot.wal").await;
        projector.recompute(None).await.unwrap();

        let first = store.try_reserve("B201", Ulid::new()).await.unwrap();
        let second = store.try_reserve("B201", Ulid::new()).await.unwrap();
        projector.on_room_changed(&second).await;
        projector.on_room_changed(&first).await;

        assert_eq!(projector.snapshot(Some("double")).await.by_type["double"].occupied, 2);
    }

    #[tokio::test]
    async fn unknown_room_is_picked_up_from_its_change() {
        let (store, projector) = seeded("unknown_room.wal").await;
        projector.recompute(None).await.unwrap();

        store.insert_room(Room::new("C301", "dorm", 4)).await.unwrap();
        let room = store.try_reserve("C301", Ulid::new()).await.unwrap();
        projector.on_room_changed(&room).await;

        let view = projector.view(Some("dorm")).await.unwrap();
        assert_eq!(view.by_type["dorm"], TypeOccupancy { rooms: 1, capacity: 4, occupied: 1 });
        assert_eq!(view, projector.recompute(Some("dorm")).await.unwrap());
    }

    #[tokio::test]
    async fn scoped_recompute_only_touches_one_type() {
        let (store, projector) = seeded("scoped.wal").await;
        projector.recompute(None).await.unwrap();

        store.try_reserve("A101", Ulid::new()).await.unwrap();
        store.try_reserve("B201", Ulid::new()).await.unwrap();
        let view = projector.recompute(Some("single")).await.unwrap();
        assert_eq!(view.by_type.len(), 1);

        let cached = projector.snapshot(None).await;
        assert_eq!(cached.by_type["single"].occupied, 1);
        // The double rooms were not rebuilt and no change was fed.
        assert_eq!(cached.by_type["double"].occupied, 0);
    }

    #[tokio::test]
    async fn removed_rooms_leave_the_cache() {
        let (store, projector) = seeded("removed.wal").await;
        projector.recompute(None).await.unwrap();

        store.remove_room("B201").await.unwrap();
        projector.recompute(Some("double")).await.unwrap();
        let cached = projector.snapshot(None).await;
        assert!(!cached.by_type.contains_key("double"));
        assert_eq!(cached.by_type["single"].rooms, 2);
    }
}
