mod admin;
mod booking;
mod error;
mod queries;
mod reconcile;

pub use error::{EngineError, Rejection};
pub use reconcile::{ClaimFix, ReconcileReport};

use std::sync::Arc;

use crate::directory::ProfileDirectory;
use crate::limits::MAX_ID_LEN;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::projector::OccupancyProjector;
use crate::retry::RetryPolicy;
use crate::store::{BookingLedger, InventoryStore, Store};

/// Claims younger than this are assumed to belong to an in-flight `book()`.
pub const DEFAULT_ORPHAN_GRACE_MS: Ms = 30_000;

/// Reason recorded when the unpaid-expiry reaper cancels a booking.
pub const UNPAID_EXPIRY_REASON: &str = "payment window expired";

/// The reservation coordinator.
///
/// Turns a booking request into a reserve + ledger append pair and keeps the
/// two in step: every unit of capacity it takes is either backed by a
/// `Confirmed` ledger entry or given back before the call returns. It holds
/// no locks of its own across store calls; all atomicity comes from the
/// store's conditional operations.
pub struct Coordinator {
    inventory: Arc<dyn InventoryStore>,
    ledger: Arc<dyn BookingLedger>,
    directory: Arc<dyn ProfileDirectory>,
    projector: Arc<OccupancyProjector>,
    notify: Arc<NotifyHub>,
    retry: RetryPolicy,
    orphan_grace: Ms,
}

impl Coordinator {
    pub fn new(
        inventory: Arc<dyn InventoryStore>,
        ledger: Arc<dyn BookingLedger>,
        directory: Arc<dyn ProfileDirectory>,
    ) -> Self {
        Self {
            projector: Arc::new(OccupancyProjector::new(inventory.clone())),
            inventory,
            ledger,
            directory,
            notify: Arc::new(NotifyHub::new()),
            retry: RetryPolicy::default(),
            orphan_grace: DEFAULT_ORPHAN_GRACE_MS,
        }
    }

    /// Coordinator over a single durable store serving as both inventory and ledger.
    pub fn for_store(store: Arc<Store>, directory: Arc<dyn ProfileDirectory>) -> Self {
        Self::new(store.clone(), store, directory)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_orphan_grace(mut self, grace: Ms) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub fn projector(&self) -> &Arc<OccupancyProjector> {
        &self.projector
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }
}

fn check_id(id: &str, what: &'static str) -> Result<(), EngineError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}
