use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Monotonic ledger sequence number assigned on append.
pub type EventId = u64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Rooms ────────────────────────────────────────────────────────

/// Who may book a room. `none` on the wire means the same as `unisex`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenderRestriction {
    Male,
    Female,
    #[default]
    #[serde(alias = "none")]
    Unisex,
}

impl GenderRestriction {
    pub fn admits(self, gender: Gender) -> bool {
        match self {
            GenderRestriction::Unisex => true,
            GenderRestriction::Male => gender == Gender::Male,
            GenderRestriction::Female => gender == Gender::Female,
        }
    }
}

impl fmt::Display for GenderRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GenderRestriction::Male => "male",
            GenderRestriction::Female => "female",
            GenderRestriction::Unisex => "unisex",
        };
        f.write_str(s)
    }
}

/// Declared gender from the student's identity profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Available,
    Occupied,
}

/// A bookable room. `occupied` is owned by the inventory store and only
/// changes through its reserve/release operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub number: String,
    pub room_type: String,
    pub capacity: u32,
    pub occupied: u32,
    /// Price per term in minor currency units.
    pub price: u64,
    pub gender: GenderRestriction,
    /// Retired rooms keep their bookings but accept no new ones.
    pub retired: bool,
    /// Stamped by the store on every applied change. Higher means newer,
    /// across all rooms of one store.
    #[serde(default)]
    pub revision: u64,
}

impl Room {
    pub fn new(number: impl Into<String>, room_type: impl Into<String>, capacity: u32) -> Self {
        Self {
            number: number.into(),
            room_type: room_type.into(),
            capacity,
            occupied: 0,
            price: 0,
            gender: GenderRestriction::Unisex,
            retired: false,
            revision: 0,
        }
    }

    pub fn with_price(mut self, price: u64) -> Self {
        self.price = price;
        self
    }

    pub fn with_gender(mut self, gender: GenderRestriction) -> Self {
        self.gender = gender;
        self
    }

    pub fn status(&self) -> RoomStatus {
        if self.occupied < self.capacity {
            RoomStatus::Available
        } else {
            RoomStatus::Occupied
        }
    }

    pub fn vacancies(&self) -> u32 {
        self.capacity.saturating_sub(self.occupied)
    }
}

/// Management edit of a room. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(default)]
    pub room_type: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub price: Option<u64>,
    #[serde(default)]
    pub gender: Option<GenderRestriction>,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Rejected | BookingStatus::Cancelled | BookingStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a booking attempt that reached the ledger was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoCapacity,
    TransientError,
}

/// A state change recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    Confirmed { requested_at: Ms },
    Rejected { requested_at: Ms, reason: RejectReason },
    Cancelled { reason: String },
    Completed,
    PaymentSettled,
}

impl Transition {
    /// Transitions that create a booking rather than advance one.
    pub fn opens_booking(&self) -> bool {
        matches!(self, Transition::Confirmed { .. } | Transition::Rejected { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Transition::Confirmed { .. } => "confirmed",
            Transition::Rejected { .. } => "rejected",
            Transition::Cancelled { .. } => "cancelled",
            Transition::Completed => "completed",
            Transition::PaymentSettled => "payment_settled",
        }
    }
}

/// What a caller asks the ledger to record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub booking_id: Ulid,
    pub room: String,
    pub student: String,
    pub at: Ms,
    pub change: Transition,
}

/// A recorded ledger event with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: EventId,
    pub event: LedgerEvent,
}

/// Current state of a booking, folded from its ledger entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room: String,
    pub student: String,
    pub requested_at: Ms,
    pub status: BookingStatus,
    pub reject_reason: Option<RejectReason>,
    /// Present only when `status == Cancelled`.
    pub cancel_reason: Option<String>,
    pub paid_at: Option<Ms>,
    pub updated_at: Ms,
}

impl Booking {
    /// Build a booking from its opening ledger event.
    /// Returns `None` for events that advance an existing booking.
    pub fn open(event: &LedgerEvent) -> Option<Self> {
        let (requested_at, status, reject_reason) = match &event.change {
            Transition::Confirmed { requested_at } => {
                (*requested_at, BookingStatus::Confirmed, None)
            }
            Transition::Rejected {
                requested_at,
                reason,
            } => (*requested_at, BookingStatus::Rejected, Some(*reason)),
            _ => return None,
        };
        Some(Self {
            id: event.booking_id,
            room: event.room.clone(),
            student: event.student.clone(),
            requested_at,
            status,
            reject_reason,
            cancel_reason: None,
            paid_at: None,
            updated_at: event.at,
        })
    }

    /// Fold a follow-up event into the booking. Legality is checked by the ledger.
    pub fn apply(&mut self, event: &LedgerEvent) {
        match &event.change {
            Transition::Cancelled { reason } => {
                self.status = BookingStatus::Cancelled;
                self.cancel_reason = Some(reason.clone());
            }
            Transition::Completed => self.status = BookingStatus::Completed,
            Transition::PaymentSettled => self.paid_at = Some(event.at),
            Transition::Confirmed { .. } | Transition::Rejected { .. } => {}
        }
        self.updated_at = event.at;
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub id: String,
    pub gender: Gender,
    #[serde(default)]
    pub name: Option<String>,
}

// ── Occupancy ────────────────────────────────────────────────────

/// Aggregate for one room type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeOccupancy {
    pub rooms: u32,
    pub capacity: u64,
    pub occupied: u64,
}

impl TypeOccupancy {
    pub fn vacancies(&self) -> u64 {
        self.capacity.saturating_sub(self.occupied)
    }
}

/// Derived, rebuildable occupancy view keyed by room type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyView {
    pub by_type: BTreeMap<String, TypeOccupancy>,
}

impl OccupancyView {
    pub fn from_rooms<'a>(rooms: impl IntoIterator<Item = &'a Room>) -> Self {
        let mut by_type: BTreeMap<String, TypeOccupancy> = BTreeMap::new();
        for room in rooms {
            let agg = by_type.entry(room.room_type.clone()).or_default();
            agg.rooms += 1;
            agg.capacity += u64::from(room.capacity);
            agg.occupied += u64::from(room.occupied);
        }
        Self { by_type }
    }

    pub fn total(&self) -> TypeOccupancy {
        self.by_type
            .values()
            .fold(TypeOccupancy::default(), |mut acc, t| {
                acc.rooms += t.rooms;
                acc.capacity += t.capacity;
                acc.occupied += t.occupied;
                acc
            })
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// Durable record types. Flat, no nesting beyond the ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// `claims` is empty for new rooms and carries held claims in compaction snapshots.
    RoomCreated { room: Room, claims: Vec<Ulid> },
    RoomUpdated {
        number: String,
        room_type: String,
        capacity: u32,
        price: u64,
        gender: GenderRestriction,
    },
    RoomRetired { number: String },
    RoomRemoved { number: String },
    CapacityReserved { number: String, claim: Ulid },
    CapacityReleased { number: String, claim: Ulid },
    LedgerAppended { entry: LedgerEntry },
}
