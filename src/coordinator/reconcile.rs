use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{RECONCILE_FIXES_TOTAL, UNPAID_EXPIRED_TOTAL};
use crate::store::StoreError;

use super::{Coordinator, EngineError, UNPAID_EXPIRY_REASON};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFix {
    pub room: String,
    pub booking_id: Ulid,
}

/// What one reconciliation pass found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub rooms_checked: usize,
    /// Held capacity with no confirmed booking behind it, now released.
    pub orphans_released: Vec<ClaimFix>,
    /// Confirmed bookings that had lost their unit, now re-reserved.
    pub claims_restored: Vec<ClaimFix>,
    /// Confirmed bookings whose unit could not be taken back.
    pub unrestorable: Vec<ClaimFix>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphans_released.is_empty()
            && self.claims_restored.is_empty()
            && self.unrestorable.is_empty()
    }
}

impl Coordinator {
    /// Bring every room's held claims back in line with its confirmed
    /// bookings, then rebuild the occupancy cache.
    ///
    /// Unrecorded claims younger than the orphan grace period are left alone:
    /// they belong to `book()` calls whose ledger append has not landed yet.
    pub async fn reconcile(&self, now: Ms) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();
        let rooms = self.list_rooms(None).await?;

        for room in &rooms {
            let number = room.number.as_str();
            let inventory = &self.inventory;
            let claims = match self.retry.run("claims", || inventory.claims(number)).await {
                Ok(claims) => claims,
                // Removed since the listing.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            let bookings = self.bookings_by_room(number).await?;
            let recorded: HashSet<Ulid> = bookings.iter().map(|b| b.id).collect();
            let confirmed: HashSet<Ulid> = bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Confirmed)
                .map(|b| b.id)
                .collect();
            report.rooms_checked += 1;

            for claim in claims.iter().filter(|c| !confirmed.contains(c)) {
                let age = now - claim.timestamp_ms() as Ms;
                // Only a claim the ledger has never heard of can be a booking in flight.
                if !recorded.contains(claim) && age < self.orphan_grace {
                    debug!(room = number, claim = %claim, age, "young unbacked claim left alone");
                    continue;
                }
                match self.retry.run("release", || inventory.release(number, *claim)).await {
                    Ok(_) => {
                        warn!(room = number, claim = %claim, "released orphan claim");
                        metrics::counter!(RECONCILE_FIXES_TOTAL, "kind" => "orphan_released")
                            .increment(1);
                        report.orphans_released.push(ClaimFix {
                            room: number.to_string(),
                            booking_id: *claim,
                        });
                    }
                    Err(e) => debug!(room = number, claim = %claim, error = %e, "orphan release skipped"),
                }
            }

            let held: HashSet<Ulid> = claims.iter().copied().collect();
            for id in confirmed.iter().filter(|id| !held.contains(id)) {
                let fix = ClaimFix {
                    room: number.to_string(),
                    booking_id: *id,
                };
                match self.retry.run("restore", || inventory.restore(number, *id)).await {
                    Ok(_) => {
                        // A close may have released this unit and not yet
                        // appended its transition when the bookings were read.
                        if !self.still_confirmed(*id).await? {
                            if let Err(e) = self
                                .retry
                                .run("release", || inventory.release(number, *id))
                                .await
                            {
                                debug!(room = number, booking = %id, error = %e, "undo of restore skipped");
                            }
                            debug!(room = number, booking = %id, "booking closed while restoring, claim dropped");
                            continue;
                        }
                        warn!(room = number, booking = %id, "restored missing claim");
                        metrics::counter!(RECONCILE_FIXES_TOTAL, "kind" => "claim_restored")
                            .increment(1);
                        report.claims_restored.push(fix);
                    }
                    Err(e) => {
                        error!(room = number, booking = %id, error = %e, "confirmed booking holds no capacity and none can be taken");
                        metrics::counter!(RECONCILE_FIXES_TOTAL, "kind" => "unrestorable")
                            .increment(1);
                        report.unrestorable.push(fix);
                    }
                }
            }
        }

        self.projector.recompute(None).await?;
        if report.is_clean() {
            debug!(rooms = report.rooms_checked, "reconciliation clean");
        } else {
            info!(
                rooms = report.rooms_checked,
                released = report.orphans_released.len(),
                restored = report.claims_restored.len(),
                unrestorable = report.unrestorable.len(),
                "reconciliation applied fixes"
            );
        }
        Ok(report)
    }

    async fn still_confirmed(&self, id: Ulid) -> Result<bool, EngineError> {
        match self.load_booking(id).await {
            Ok(booking) => Ok(booking.status == BookingStatus::Confirmed),
            Err(EngineError::BookingNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Cancel confirmed bookings left unpaid for longer than `ttl`.
    /// Returns the ids that were cancelled.
    pub async fn expire_unpaid(&self, now: Ms, ttl: Ms) -> Result<Vec<Ulid>, EngineError> {
        let mut expired = Vec::new();
        for booking in self.bookings_by_status(BookingStatus::Confirmed).await? {
            if booking.paid_at.is_some() || booking.requested_at.saturating_add(ttl) > now {
                continue;
            }
            match self.cancel(booking.id, UNPAID_EXPIRY_REASON).await {
                Ok(_) => {
                    info!(booking = %booking.id, room = %booking.room, "unpaid booking expired");
                    metrics::counter!(UNPAID_EXPIRED_TOTAL).increment(1);
                    expired.push(booking.id);
                }
                // Paid, cancelled or completed since the listing.
                Err(e) => debug!(booking = %booking.id, error = %e, "expiry skipped"),
            }
        }
        Ok(expired)
    }
}
