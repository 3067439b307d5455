use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::durable::{BookingState, Placeholder};
use super::{BookingLedger, Store, StoreError};

type PairKey = (String, String);

/// Reservation of the unique (room, student) confirmed slot for an in-flight
/// append. Dropping it without `keep()` gives the slot back.
struct ActiveSlot<'a> {
    active: &'a DashMap<PairKey, Ulid>,
    key: Option<PairKey>,
}

impl<'a> ActiveSlot<'a> {
    fn claim(active: &'a DashMap<PairKey, Ulid>, key: PairKey, id: Ulid) -> Result<Self, StoreError> {
        match active.entry(key.clone()) {
            Entry::Occupied(e) => Err(StoreError::Duplicate(*e.get())),
            Entry::Vacant(v) => {
                v.insert(id);
                Ok(Self {
                    active,
                    key: Some(key),
                })
            }
        }
    }

    fn keep(mut self) {
        self.key = None;
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.active.remove(&key);
        }
    }
}

/// Legal moves of the booking state machine. Opening events are handled separately.
fn check_transition(booking: &Booking, change: &Transition) -> Result<(), StoreError> {
    let ok = match change {
        Transition::Cancelled { .. } | Transition::Completed => {
            booking.status == BookingStatus::Confirmed
        }
        Transition::PaymentSettled => {
            booking.status == BookingStatus::Confirmed && booking.paid_at.is_none()
        }
        Transition::Confirmed { .. } | Transition::Rejected { .. } => false,
    };
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            booking: booking.id,
            from: booking.status,
            change: change.label(),
        })
    }
}

impl Store {
    async fn append_opening(&self, event: LedgerEvent) -> Result<EventId, StoreError> {
        let id = event.booking_id;
        let Some(booking) = Booking::open(&event) else {
            return Err(StoreError::InvalidTransition {
                booking: id,
                from: BookingStatus::Pending,
                change: event.change.label(),
            });
        };

        let slot = if booking.status == BookingStatus::Confirmed {
            let key = (booking.room.clone(), booking.student.clone());
            Some(ActiveSlot::claim(&self.active, key, id)?)
        } else {
            None
        };

        let entry = LedgerEntry {
            seq: self.next_seq(),
            event,
        };
        let state = Arc::new(RwLock::new(BookingState::opened(
            booking.clone(),
            entry.clone(),
            false,
        )));
        let mut guard = state.clone().write_owned().await;
        let placeholder = Placeholder::insert(&self.bookings, id, state)
            .map_err(|_| StoreError::AlreadyExists(id.to_string()))?;

        let seq = entry.seq;
        self.wal_append(Record::LedgerAppended { entry }).await?;

        self.by_room.entry(booking.room.clone()).or_default().push(id);
        self.by_student.entry(booking.student.clone()).or_default().push(id);
        guard.committed = true;
        placeholder.commit();
        if let Some(slot) = slot {
            slot.keep();
        }
        Ok(seq)
    }

    async fn append_transition(&self, event: LedgerEvent) -> Result<EventId, StoreError> {
        let shared = self.booking_handle(&event.booking_id)?;
        let mut guard = shared.write().await;
        if !guard.committed {
            return Err(StoreError::NotFound(event.booking_id.to_string()));
        }
        if guard.booking.room != event.room || guard.booking.student != event.student {
            return Err(StoreError::InvalidTransition {
                booking: event.booking_id,
                from: guard.booking.status,
                change: "mismatched room or student",
            });
        }
        check_transition(&guard.booking, &event.change)?;

        let entry = LedgerEntry {
            seq: self.next_seq(),
            event,
        };
        let seq = entry.seq;
        self.wal_append(Record::LedgerAppended {
            entry: entry.clone(),
        })
        .await?;
        guard.apply(entry);

        let b = &guard.booking;
        if b.status.is_terminal() {
            self.active
                .remove_if(&(b.room.clone(), b.student.clone()), |_, v| *v == b.id);
        }
        Ok(seq)
    }

    /// Resolve ids from a secondary index to committed bookings, oldest first.
    async fn collect_bookings(&self, ids: Vec<Ulid>) -> Vec<Booking> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(shared) = self.booking_handle(&id) else {
                continue;
            };
            let guard = shared.read().await;
            if guard.committed {
                out.push(guard.booking.clone());
            }
        }
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        out
    }
}

#[async_trait]
impl BookingLedger for Store {
    async fn append(&self, event: LedgerEvent) -> Result<EventId, StoreError> {
        let _gate = self.gate.read().await;
        if event.change.opens_booking() {
            self.append_opening(event).await
        } else {
            self.append_transition(event).await
        }
    }

    async fn get_booking(&self, id: Ulid) -> Result<Booking, StoreError> {
        let shared = self.booking_handle(&id)?;
        let guard = shared.read().await;
        if !guard.committed {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(guard.booking.clone())
    }

    async fn list_by_room(&self, room: &str) -> Result<Vec<Booking>, StoreError> {
        let ids = self
            .by_room
            .get(room)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(self.collect_bookings(ids).await)
    }

    async fn list_by_student(&self, student: &str) -> Result<Vec<Booking>, StoreError> {
        let ids = self
            .by_student
            .get(student)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(self.collect_bookings(ids).await)
    }

    async fn list_by_status(&self, status: BookingStatus) -> Result<Vec<Booking>, StoreError> {
        let ids: Vec<Ulid> = self.bookings.iter().map(|e| *e.key()).collect();
        let mut bookings = self.collect_bookings(ids).await;
        bookings.retain(|b| b.status == status);
        Ok(bookings)
    }

    async fn history(&self, id: Ulid) -> Result<Vec<LedgerEntry>, StoreError> {
        let shared = self.booking_handle(&id)?;
        let guard = shared.read().await;
        if !guard.committed {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(guard.history.clone())
    }
}
