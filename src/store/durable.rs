use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::StoreError;

pub(super) struct RoomState {
    pub room: Room,
    pub claims: BTreeSet<Ulid>,
    /// False while the creating record is still in flight; readers treat
    /// uncommitted rooms as absent.
    pub committed: bool,
}

impl RoomState {
    pub fn new(mut room: Room, claims: impl IntoIterator<Item = Ulid>, committed: bool) -> Self {
        let claims: BTreeSet<Ulid> = claims.into_iter().collect();
        room.occupied = claims.len() as u32;
        Self {
            room,
            claims,
            committed,
        }
    }

    /// Apply a room-scoped record (caller holds the lock).
    pub fn apply(&mut self, record: &Record) {
        match record {
            Record::RoomUpdated {
                room_type,
                capacity,
                price,
                gender,
                ..
            } => {
                self.room.room_type = room_type.clone();
                self.room.capacity = *capacity;
                self.room.price = *price;
                self.room.gender = *gender;
            }
            Record::RoomRetired { .. } => self.room.retired = true,
            Record::CapacityReserved { claim, .. } => {
                self.claims.insert(*claim);
                self.room.occupied = self.claims.len() as u32;
            }
            Record::CapacityReleased { claim, .. } => {
                self.claims.remove(claim);
                self.room.occupied = self.claims.len() as u32;
            }
            // Creation/removal happen at the map level; ledger records are booking-scoped.
            Record::RoomCreated { .. } | Record::RoomRemoved { .. } | Record::LedgerAppended { .. } => {}
        }
    }
}

pub(super) struct BookingState {
    pub booking: Booking,
    pub history: Vec<LedgerEntry>,
    pub committed: bool,
}

impl BookingState {
    pub fn opened(booking: Booking, entry: LedgerEntry, committed: bool) -> Self {
        Self {
            booking,
            history: vec![entry],
            committed,
        }
    }

    pub fn apply(&mut self, entry: LedgerEntry) {
        self.booking.apply(&entry.event);
        self.history.push(entry);
    }
}

pub(super) type SharedRoom = Arc<RwLock<RoomState>>;
pub(super) type SharedBooking = Arc<RwLock<BookingState>>;

/// An uncommitted entry inserted ahead of its WAL record. Unless `commit()`
/// is reached, dropping it takes the entry back out of the map, including
/// when the inserting future is dropped mid-append.
pub(super) struct Placeholder<'a, K: Eq + Hash + Clone, V> {
    map: &'a DashMap<K, Arc<V>>,
    key: Option<K>,
    value: Arc<V>,
}

impl<'a, K: Eq + Hash + Clone, V> Placeholder<'a, K, V> {
    /// Insert `value` under `key`, or hand it back if the key is taken.
    pub fn insert(map: &'a DashMap<K, Arc<V>>, key: K, value: Arc<V>) -> Result<Self, Arc<V>> {
        match map.entry(key.clone()) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(v) => {
                v.insert(value.clone());
                Ok(Self {
                    map,
                    key: Some(key),
                    value,
                })
            }
        }
    }

    pub fn commit(mut self) {
        self.key = None;
    }
}

impl<K: Eq + Hash + Clone, V> Drop for Placeholder<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.map.remove_if(&key, |_, v| Arc::ptr_eq(v, &self.value));
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped: {}", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Record, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Record, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let mut batch = vec![(record, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Replay ───────────────────────────────────────────────

#[derive(Default)]
struct Replay {
    rooms: HashMap<String, RoomState>,
    bookings: HashMap<Ulid, BookingState>,
    /// Booking ids in the order they were opened.
    opened: Vec<Ulid>,
    max_seq: Option<EventId>,
    /// Room revisions are reassigned in replay order.
    revision: u64,
}

impl Replay {
    fn apply(&mut self, record: Record) {
        match record {
            Record::RoomCreated { mut room, claims } => {
                self.revision += 1;
                room.revision = self.revision;
                self.rooms
                    .insert(room.number.clone(), RoomState::new(room, claims, true));
            }
            Record::RoomRemoved { number } => {
                self.rooms.remove(&number);
            }
            Record::LedgerAppended { entry } => {
                self.max_seq = Some(self.max_seq.map_or(entry.seq, |m| m.max(entry.seq)));
                let id = entry.event.booking_id;
                if let Some(state) = self.bookings.get_mut(&id) {
                    state.apply(entry);
                } else if let Some(booking) = Booking::open(&entry.event) {
                    self.bookings
                        .insert(id, BookingState::opened(booking, entry, true));
                    self.opened.push(id);
                }
            }
            other => {
                if let Some(number) = room_of(&other)
                    && let Some(state) = self.rooms.get_mut(number)
                {
                    self.revision += 1;
                    state.apply(&other);
                    state.room.revision = self.revision;
                }
            }
        }
    }
}

fn room_of(record: &Record) -> Option<&str> {
    match record {
        Record::RoomUpdated { number, .. }
        | Record::RoomRetired { number }
        | Record::RoomRemoved { number }
        | Record::CapacityReserved { number, .. }
        | Record::CapacityReleased { number, .. } => Some(number),
        Record::RoomCreated { room, .. } => Some(&room.number),
        Record::LedgerAppended { .. } => None,
    }
}

/// The durable document store: rooms and bookings held in memory behind
/// per-entry locks, every mutation made durable through the WAL before it
/// becomes visible.
pub struct Store {
    pub(super) rooms: DashMap<String, SharedRoom>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    pub(super) by_room: DashMap<String, Vec<Ulid>>,
    pub(super) by_student: DashMap<String, Vec<Ulid>>,
    /// (room, student) → the pair's confirmed booking.
    pub(super) active: DashMap<(String, String), Ulid>,
    next_seq: AtomicU64,
    next_revision: AtomicU64,
    /// Mutations hold it shared; compaction holds it exclusively.
    pub(super) gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Store {
    /// Replay the WAL at `path` and start its writer task. Must run inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, records) = Wal::recover(path)?;
        let replayed = records.len();
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replay = Replay::default();
        for record in records {
            replay.apply(record);
        }

        let store = Self {
            rooms: DashMap::new(),
            bookings: DashMap::new(),
            by_room: DashMap::new(),
            by_student: DashMap::new(),
            active: DashMap::new(),
            next_seq: AtomicU64::new(replay.max_seq.map_or(0, |m| m + 1)),
            next_revision: AtomicU64::new(replay.revision + 1),
            gate: RwLock::new(()),
            wal_tx,
        };

        for (number, state) in replay.rooms {
            store.rooms.insert(number, Arc::new(RwLock::new(state)));
        }
        for id in replay.opened {
            let Some(state) = replay.bookings.remove(&id) else {
                continue;
            };
            let b = &state.booking;
            store.by_room.entry(b.room.clone()).or_default().push(id);
            store.by_student.entry(b.student.clone()).or_default().push(id);
            if b.status == BookingStatus::Confirmed {
                store.active.insert((b.room.clone(), b.student.clone()), id);
            }
            store.bookings.insert(id, Arc::new(RwLock::new(state)));
        }

        if replayed > 0 {
            info!(
                "replayed {replayed} records from {}: {} rooms, {} bookings",
                path.display(),
                store.rooms.len(),
                store.bookings.len()
            );
        }
        Ok(store)
    }

    pub(super) fn next_seq(&self) -> EventId {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn next_revision(&self) -> u64 {
        self.next_revision.fetch_add(1, Ordering::Relaxed)
    }

    /// Write a record through the group-commit writer and wait for fsync.
    pub(super) async fn wal_append(&self, record: Record) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL write failed: {e}")))
    }

    pub(super) fn room_handle(&self, number: &str) -> Result<SharedRoom, StoreError> {
        self.rooms
            .get(number)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(number.to_string()))
    }

    pub(super) fn booking_handle(&self, id: &Ulid) -> Result<SharedBooking, StoreError> {
        self.bookings
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Rewrite the WAL as a snapshot: every room with its held claims, then every
    /// ledger entry in sequence order. History is never dropped.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;

        let rooms: Vec<(String, SharedRoom)> = self
            .rooms
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let bookings: Vec<(Ulid, SharedBooking)> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut records = Vec::with_capacity(rooms.len());
        for (number, shared) in rooms {
            let guard = shared.read().await;
            if guard.committed {
                records.push(Record::RoomCreated {
                    room: guard.room.clone(),
                    claims: guard.claims.iter().copied().collect(),
                });
            } else {
                drop(guard);
                self.rooms.remove(&number);
            }
        }

        let mut entries = Vec::new();
        for (id, shared) in bookings {
            let guard = shared.read().await;
            if guard.committed {
                entries.extend(guard.history.iter().cloned());
            } else {
                drop(guard);
                self.bookings.remove(&id);
            }
        }
        entries.sort_by_key(|e| e.seq);
        records.extend(entries.into_iter().map(|entry| Record::LedgerAppended { entry }));

        let count = records.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                records,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction failed: {e}")))?;
        debug!("compacted WAL to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
