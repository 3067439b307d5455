use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::coordinator::{Coordinator, DEFAULT_ORPHAN_GRACE_MS};
use crate::directory::StudentDirectory;
use crate::limits::*;
use crate::model::Ms;
use crate::reaper;
use crate::retry::RetryPolicy;
use crate::store::Store;

/// Per-hostel engine tuning, shared by every hostel the manager loads.
#[derive(Debug, Clone)]
pub struct HostelSettings {
    pub compact_threshold: u64,
    /// `None` keeps unpaid bookings indefinitely.
    pub unpaid_ttl: Option<Duration>,
    pub reconcile_interval: Duration,
    pub orphan_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for HostelSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            unpaid_ttl: None,
            reconcile_interval: Duration::from_secs(60),
            orphan_grace: Duration::from_millis(DEFAULT_ORPHAN_GRACE_MS as u64),
            retry: RetryPolicy::default(),
        }
    }
}

/// One loaded hostel: its durable store and the coordinator over it.
pub struct Hostel {
    /// Canonical name: the requested one with unsafe characters dropped.
    pub name: String,
    pub store: Arc<Store>,
    pub coordinator: Arc<Coordinator>,
}

/// Manages per-hostel engines. Each hostel gets its own Store + WAL + background tasks.
/// The student directory is shared: a student is the same person in every hostel.
///
/// Hostels are keyed by canonical name, so two requested names that map to
/// the same WAL file always share one engine.
pub struct HostelManager {
    hostels: DashMap<String, Arc<Hostel>>,
    students: Arc<StudentDirectory>,
    data_dir: PathBuf,
    settings: HostelSettings,
}

impl HostelManager {
    pub fn new(data_dir: PathBuf, settings: HostelSettings) -> Self {
        Self {
            hostels: DashMap::new(),
            students: Arc::new(StudentDirectory::new()),
            data_dir,
            settings,
        }
    }

    pub fn students(&self) -> &Arc<StudentDirectory> {
        &self.students
    }

    /// Get or lazily load a hostel.
    pub fn get_or_create(&self, name: &str) -> io::Result<Arc<Hostel>> {
        if name.len() > MAX_HOSTEL_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "hostel name too long",
            ));
        }

        // Only the name's safe characters reach the filesystem.
        let safe_name: String = name
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty hostel name",
            ));
        }
        if let Some(hostel) = self.hostels.get(&safe_name) {
            return Ok(hostel.value().clone());
        }
        if self.hostels.len() >= MAX_HOSTELS {
            return Err(io::Error::other("too many hostels"));
        }

        let hostel = match self.hostels.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let hostel = Arc::new(self.load(&safe_name)?);
                v.insert(hostel.clone());
                hostel
            }
        };
        metrics::gauge!(crate::observability::HOSTELS_ACTIVE).set(self.hostels.len() as f64);
        Ok(hostel)
    }

    fn load(&self, name: &str) -> io::Result<Hostel> {
        let wal_path = self.data_dir.join(format!("{name}.wal"));
        let store = Arc::new(Store::open(&wal_path)?);
        let coordinator = Arc::new(
            Coordinator::for_store(store.clone(), self.students.clone())
                .with_retry(self.settings.retry.clone())
                .with_orphan_grace(self.settings.orphan_grace.as_millis() as Ms),
        );

        // The reconciler's first tick is immediate, so claims orphaned by a
        // crash are cleaned up on load.
        tokio::spawn(reaper::run_reconciler(
            coordinator.clone(),
            self.settings.reconcile_interval,
        ));
        tokio::spawn(reaper::run_compactor(
            store.clone(),
            self.settings.compact_threshold,
        ));
        if let Some(ttl) = self.settings.unpaid_ttl {
            tokio::spawn(reaper::run_payment_reaper(coordinator.clone(), ttl));
        }

        info!(hostel = name, wal = %wal_path.display(), rooms = store.room_count(), "hostel loaded");
        Ok(Hostel {
            name: name.to_string(),
            store,
            coordinator,
        })
    }
}
