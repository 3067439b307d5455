use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::LedgerEntry;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of ledger entries, one channel per room.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<LedgerEntry>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a room's ledger entries. Creates the channel if needed.
    pub fn subscribe(&self, room: &str) -> broadcast::Receiver<LedgerEntry> {
        self.channels
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, entry: &LedgerEntry) {
        if let Some(sender) = self.channels.get(&entry.event.room) {
            let _ = sender.send(entry.clone());
        }
    }

    /// Drop a room's channel (e.g. when the room is removed).
    pub fn remove(&self, room: &str) {
        self.channels.remove(room);
    }
}
