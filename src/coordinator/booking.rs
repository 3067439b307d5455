use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, COMPENSATION_FAILURES_TOTAL, COMPENSATIONS_TOTAL, RELEASES_TOTAL};
use crate::store::StoreError;

use super::{Coordinator, EngineError, check_id};

fn outcome(label: &'static str) {
    metrics::counter!(BOOKINGS_TOTAL, "outcome" => label).increment(1);
}

impl Coordinator {
    /// Book a room for a student, looking the student's gender up in the directory.
    pub async fn book(&self, room: &str, student: &str) -> Result<Booking, EngineError> {
        check_id(student, "student id length")?;
        let directory = &self.directory;
        let profile = self
            .retry
            .run("get_student_profile", || directory.get_student_profile(student))
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => EngineError::StudentNotFound(student.to_string()),
                other => other.into(),
            })?;
        self.book_as(room, student, profile.gender).await
    }

    /// Book a room for a student whose gender the caller already knows.
    ///
    /// Resolves synchronously to a `Confirmed` booking or an error; nothing
    /// in between is ever visible. `NoCapacity` and exhausted transient
    /// failures leave a `Rejected` booking in the ledger; validation failures
    /// leave nothing.
    pub async fn book_as(
        &self,
        room_number: &str,
        student: &str,
        gender: Gender,
    ) -> Result<Booking, EngineError> {
        check_id(room_number, "room number length")?;
        check_id(student, "student id length")?;

        let room = self.load_room(room_number).await?;
        if room.retired {
            outcome("retired");
            return Err(EngineError::RoomRetired(room.number));
        }
        if !room.gender.admits(gender) {
            outcome("gender_mismatch");
            return Err(EngineError::GenderMismatch {
                room: room.number,
                restriction: room.gender,
                gender,
            });
        }

        let ledger = &self.ledger;
        let held = self
            .retry
            .run("list_by_student", || ledger.list_by_student(student))
            .await?;
        if let Some(existing) = held
            .iter()
            .find(|b| b.room == room_number && b.status == BookingStatus::Confirmed)
        {
            outcome("duplicate");
            return Err(EngineError::DuplicateBooking(existing.id));
        }

        let id = Ulid::new();
        let requested_at = now_ms();

        let inventory = &self.inventory;
        match self
            .retry
            .run("try_reserve", || inventory.try_reserve(room_number, id))
            .await
        {
            Ok(room) => self.projector.on_room_changed(&room).await,
            Err(StoreError::Full(_)) => {
                self.record_rejection(id, room_number, student, requested_at, RejectReason::NoCapacity)
                    .await;
                outcome("no_capacity");
                info!(room = room_number, student, booking = %id, "booking rejected: no capacity");
                return Err(EngineError::NoCapacity {
                    room: room_number.to_string(),
                    booking_id: id,
                });
            }
            Err(e) if e.is_transient() => {
                // The last attempt may still have landed. Releasing our own
                // claim is exact either way.
                self.compensate_release(room_number, id).await;
                self.record_rejection(id, room_number, student, requested_at, RejectReason::TransientError)
                    .await;
                outcome("transient_error");
                warn!(room = room_number, booking = %id, error = %e, "reserve failed after retries");
                return Err(EngineError::Transient(e.to_string()));
            }
            Err(e) => {
                outcome("invalid");
                return Err(e.into());
            }
        }

        let event = LedgerEvent {
            booking_id: id,
            room: room_number.to_string(),
            student: student.to_string(),
            at: now_ms(),
            change: Transition::Confirmed { requested_at },
        };
        match self
            .retry
            .run("append", || ledger.append(event.clone()))
            .await
        {
            Ok(seq) => {
                self.notify.send(&LedgerEntry { seq, event: event.clone() });
                outcome("confirmed");
                info!(room = room_number, student, booking = %id, "booking confirmed");
                Booking::open(&event).ok_or_else(|| EngineError::Transient("unreadable booking".into()))
            }
            Err(StoreError::Duplicate(existing)) => {
                // Lost the race against the same student's concurrent request.
                self.compensate_release(room_number, id).await;
                outcome("duplicate");
                Err(EngineError::DuplicateBooking(existing))
            }
            Err(e) => {
                self.compensate_release(room_number, id).await;
                self.record_rejection(id, room_number, student, requested_at, RejectReason::TransientError)
                    .await;
                outcome("transient_error");
                warn!(room = room_number, booking = %id, error = %e, "ledger append failed after retries");
                Err(EngineError::Transient(e.to_string()))
            }
        }
    }

    /// `Confirmed → Cancelled`, giving the room's unit back.
    pub async fn cancel(&self, id: Ulid, reason: &str) -> Result<Booking, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        self.close(
            id,
            Transition::Cancelled {
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// `Confirmed → Completed` at the end of a stay.
    pub async fn complete(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.close(id, Transition::Completed).await
    }

    /// Payment hook: settle a confirmed booking. Repeated calls are no-ops.
    pub async fn on_payment_confirmed(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.load_booking(id).await?;
        if booking.paid_at.is_some() {
            return Ok(booking);
        }
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidState {
                booking: id,
                status: booking.status,
                action: "settle payment",
            });
        }

        let event = LedgerEvent {
            booking_id: id,
            room: booking.room.clone(),
            student: booking.student.clone(),
            at: now_ms(),
            change: Transition::PaymentSettled,
        };
        let ledger = &self.ledger;
        match self
            .retry
            .run("append", || ledger.append(event.clone()))
            .await
        {
            Ok(seq) => {
                self.notify.send(&LedgerEntry { seq, event: event.clone() });
                info!(booking = %id, "payment settled");
                let mut booking = booking;
                booking.apply(&event);
                Ok(booking)
            }
            Err(StoreError::InvalidTransition { .. }) => {
                // Either a concurrent settlement won or the booking closed meanwhile.
                let current = self.load_booking(id).await?;
                if current.paid_at.is_some() {
                    Ok(current)
                } else {
                    Err(EngineError::InvalidState {
                        booking: id,
                        status: current.status,
                        action: "settle payment",
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shared release → append → compensate protocol for leaving `Confirmed`.
    async fn close(&self, id: Ulid, change: Transition) -> Result<Booking, EngineError> {
        let action = change.label();
        let booking = self.load_booking(id).await?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::InvalidState {
                booking: id,
                status: booking.status,
                action,
            });
        }
        let room = booking.room.as_str();

        let inventory = &self.inventory;
        let released = match self
            .retry
            .run("release", || inventory.release(room, id))
            .await
        {
            Ok(after) => {
                self.projector.on_room_changed(&after).await;
                true
            }
            Err(StoreError::AlreadyAtZero(_) | StoreError::NotHeld { .. } | StoreError::NotFound(_)) => {
                warn!(room, booking = %id, "confirmed booking held no capacity; closing anyway");
                false
            }
            Err(e) => {
                // A timed-out release may have landed; put the claim back.
                self.compensate_reserve(room, id).await;
                return Err(e.into());
            }
        };

        let event = LedgerEvent {
            booking_id: id,
            room: booking.room.clone(),
            student: booking.student.clone(),
            at: now_ms(),
            change,
        };
        let ledger = &self.ledger;
        let appended = self
            .retry
            .run("append", || ledger.append(event.clone()))
            .await;

        match appended {
            Ok(seq) => {
                // A reconcile pass that ran between the release and the append
                // saw a confirmed booking without its unit and put it back.
                self.release_stray_claim(room, id).await;
                self.notify.send(&LedgerEntry { seq, event: event.clone() });
                metrics::counter!(RELEASES_TOTAL, "kind" => action).increment(1);
                info!(room, booking = %id, action, "booking closed");
                let mut booking = booking;
                booking.apply(&event);
                Ok(booking)
            }
            Err(StoreError::InvalidTransition { .. }) => {
                // Someone else closed it first, or an earlier attempt of ours
                // landed without an acknowledgement. Either way the booking no
                // longer needs the unit.
                self.release_stray_claim(room, id).await;
                let history = self.booking_history(id).await?;
                let current = self.load_booking(id).await?;
                if history.last().is_some_and(|entry| entry.event == event) {
                    return Ok(current);
                }
                debug!(booking = %id, status = %current.status, "lost close race");
                Err(EngineError::InvalidState {
                    booking: id,
                    status: current.status,
                    action,
                })
            }
            Err(e) => {
                if released {
                    self.compensate_reserve(room, id).await;
                }
                warn!(room, booking = %id, action, error = %e, "close failed after retries");
                Err(e.into())
            }
        }
    }

    /// Best-effort ledger record of a turned-down booking.
    async fn record_rejection(
        &self,
        id: Ulid,
        room: &str,
        student: &str,
        requested_at: Ms,
        reason: RejectReason,
    ) {
        let event = LedgerEvent {
            booking_id: id,
            room: room.to_string(),
            student: student.to_string(),
            at: now_ms(),
            change: Transition::Rejected {
                requested_at,
                reason,
            },
        };
        let ledger = &self.ledger;
        match self
            .retry
            .run("append", || ledger.append(event.clone()))
            .await
        {
            Ok(seq) => self.notify.send(&LedgerEntry { seq, event }),
            Err(e) => warn!(room, booking = %id, error = %e, "could not record rejection"),
        }
    }

    /// Give back the unit held under `claim`, if it is still held.
    pub(super) async fn compensate_release(&self, room: &str, claim: Ulid) {
        metrics::counter!(COMPENSATIONS_TOTAL, "action" => "release").increment(1);
        let inventory = &self.inventory;
        match self
            .retry
            .run("release", || inventory.release(room, claim))
            .await
        {
            Ok(after) => {
                info!(room, claim = %claim, "compensating release");
                self.projector.on_room_changed(&after).await;
            }
            Err(StoreError::AlreadyAtZero(_) | StoreError::NotHeld { .. }) => {}
            Err(e) => {
                metrics::counter!(COMPENSATION_FAILURES_TOTAL).increment(1);
                error!(room, claim = %claim, error = %e, "compensating release failed; manual reconciliation required");
            }
        }
    }

    /// Drop `claim` if something re-took it after the booking closed.
    async fn release_stray_claim(&self, room: &str, claim: Ulid) {
        match self.inventory.release(room, claim).await {
            Ok(after) => {
                warn!(room, claim = %claim, "released unit re-taken for a closed booking");
                self.projector.on_room_changed(&after).await;
            }
            Err(StoreError::AlreadyAtZero(_) | StoreError::NotHeld { .. } | StoreError::NotFound(_)) => {}
            Err(e) => {
                // The reconciler finds and frees it on its next pass.
                warn!(room, claim = %claim, error = %e, "could not check for a stray claim");
            }
        }
    }

    /// Re-take the unit for a booking that is still `Confirmed` after a failed close.
    /// Retirement does not block this; the booking already owns the unit.
    async fn compensate_reserve(&self, room: &str, claim: Ulid) {
        metrics::counter!(COMPENSATIONS_TOTAL, "action" => "reserve").increment(1);
        let inventory = &self.inventory;
        match self
            .retry
            .run("restore", || inventory.restore(room, claim))
            .await
        {
            Ok(after) => self.projector.on_room_changed(&after).await,
            Err(e) => {
                metrics::counter!(COMPENSATION_FAILURES_TOTAL).increment(1);
                error!(room, claim = %claim, error = %e, "compensating reserve failed; manual reconciliation required");
                self.projector.invalidate();
            }
        }
    }
}
