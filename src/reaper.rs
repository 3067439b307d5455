use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::model::{Ms, now_ms};
use crate::store::Store;

/// Background task that cancels confirmed bookings left unpaid past `ttl`.
pub async fn run_payment_reaper(coordinator: Arc<Coordinator>, ttl: Duration) {
    let ttl_ms = ttl.as_millis() as Ms;
    let mut interval = tokio::time::interval(reaper_period(ttl));
    loop {
        interval.tick().await;
        match coordinator.expire_unpaid(now_ms(), ttl_ms).await {
            Ok(expired) if !expired.is_empty() => {
                info!(count = expired.len(), "expired unpaid bookings");
            }
            Ok(_) => {}
            Err(e) => warn!("unpaid expiry pass failed: {e}"),
        }
    }
}

/// Check often enough that a booking outlives its window by at most a tenth of it.
fn reaper_period(ttl: Duration) -> Duration {
    (ttl / 10).clamp(Duration::from_secs(1), Duration::from_secs(60))
}

/// Background task that periodically re-aligns claims with the ledger.
pub async fn run_reconciler(coordinator: Arc<Coordinator>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match coordinator.reconcile(now_ms()).await {
            Ok(report) if !report.is_clean() => {
                warn!(
                    released = report.orphans_released.len(),
                    restored = report.claims_restored.len(),
                    unrestorable = report.unrestorable.len(),
                    "reconciler corrected drift"
                );
            }
            Ok(_) => {}
            Err(e) => warn!("reconciliation pass failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(store: Arc<Store>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
        debug!(rooms = store.room_count(), "compaction pass done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StudentDirectory;
    use crate::model::*;
    use crate::store::{BookingLedger, InventoryStore};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bunkd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn period_is_bounded() {
        assert_eq!(reaper_period(Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(reaper_period(Duration::from_secs(300)), Duration::from_secs(30));
        assert_eq!(reaper_period(Duration::from_secs(86_400)), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn payment_reaper_cancels_stale_unpaid() {
        let store = Arc::new(Store::open(&test_wal_path("payment_reaper.wal")).unwrap());
        let coord = Arc::new(Coordinator::for_store(
            store.clone(),
            Arc::new(StudentDirectory::new()),
        ));
        coord.create_room(Room::new("A1", "single", 1)).await.unwrap();
        let booking = coord.book_as("A1", "s", Gender::Male).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let task = tokio::spawn(run_payment_reaper(coord.clone(), Duration::from_millis(1)));
        let mut status = BookingStatus::Confirmed;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = store.get_booking(booking.id).await.unwrap().status;
            if status != BookingStatus::Confirmed {
                break;
            }
        }
        task.abort();
        assert_eq!(status, BookingStatus::Cancelled);
        assert_eq!(store.get_room("A1").await.unwrap().occupied, 0);
    }

    #[tokio::test]
    async fn reconciler_releases_orphans() {
        let store = Arc::new(Store::open(&test_wal_path("reconciler.wal")).unwrap());
        let coord = Arc::new(
            Coordinator::for_store(store.clone(), Arc::new(StudentDirectory::new()))
                .with_orphan_grace(0),
        );
        coord.create_room(Room::new("B1", "single", 2)).await.unwrap();
        store.try_reserve("B1", ulid::Ulid::new()).await.unwrap();

        let task = tokio::spawn(run_reconciler(coord.clone(), Duration::from_millis(10)));
        let mut occupied = 1;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            occupied = store.get_room("B1").await.unwrap().occupied;
            if occupied == 0 {
                break;
            }
        }
        task.abort();
        assert_eq!(occupied, 0);
    }
}
