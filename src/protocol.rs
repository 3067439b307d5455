//! Newline-delimited JSON protocol.
//!
//! Every line a client sends is one `Request`, tagged by `op`; every line the
//! server sends is one `Response`, tagged by `type`. Watch notifications are
//! pushed as `Event` responses between replies.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::coordinator::{EngineError, ReconcileReport, Rejection};
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Must be the first request on a connection.
    Hello { hostel: String, password: String },
    CreateRoom {
        number: String,
        room_type: String,
        capacity: u32,
        #[serde(default)]
        price: u64,
        #[serde(default)]
        gender: GenderRestriction,
    },
    UpdateRoom {
        number: String,
        #[serde(flatten)]
        patch: RoomPatch,
    },
    RetireRoom { number: String },
    RemoveRoom { number: String },
    RegisterStudent {
        student: String,
        gender: Gender,
        #[serde(default)]
        name: Option<String>,
    },
    Book { room: String, student: String },
    Cancel {
        booking_id: Ulid,
        #[serde(default)]
        reason: String,
    },
    Complete { booking_id: Ulid },
    PaymentConfirmed { booking_id: Ulid },
    GetRoom { number: String },
    RoomStatus { number: String },
    ListRooms {
        #[serde(default)]
        room_type: Option<String>,
    },
    Occupancy {
        #[serde(default)]
        room_type: Option<String>,
    },
    GetBooking { booking_id: Ulid },
    BookingsByRoom { room: String },
    BookingsByStudent { student: String },
    BookingsByStatus { status: BookingStatus },
    BookingHistory { booking_id: Ulid },
    Reconcile,
    Watch { room: String },
    Unwatch { room: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready { hostel: String },
    Room { room: Room },
    Rooms { rooms: Vec<Room> },
    RoomStatus { number: String, status: RoomStatus },
    Student { profile: StudentProfile },
    Booking { booking: Booking },
    Bookings { bookings: Vec<Booking> },
    History { entries: Vec<LedgerEntry> },
    Occupancy { view: OccupancyView, total: TypeOccupancy },
    Reconciled { report: ReconcileReport },
    Watching { room: String },
    Unwatched { room: String },
    Event { entry: LedgerEntry },
    Error { reason: Rejection, message: String },
}

impl Response {
    pub fn invalid(message: impl Into<String>) -> Self {
        Response::Error {
            reason: Rejection::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

impl From<EngineError> for Response {
    fn from(e: EngineError) -> Self {
        Response::Error {
            reason: e.rejection(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_requests() {
        let req: Request = serde_json::from_str(r#"{"op":"book","room":"A101","student":"s1"}"#).unwrap();
        assert_eq!(
            req,
            Request::Book {
                room: "A101".into(),
                student: "s1".into()
            }
        );

        let req: Request = serde_json::from_str(r#"{"op":"reconcile"}"#).unwrap();
        assert_eq!(req, Request::Reconcile);

        let req: Request = serde_json::from_str(
            r#"{"op":"create_room","number":"B2","room_type":"double","capacity":2,"gender":"none"}"#,
        )
        .unwrap();
        match req {
            Request::CreateRoom { gender, price, .. } => {
                assert_eq!(gender, GenderRestriction::Unisex);
                assert_eq!(price, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn update_room_patch_is_flattened() {
        let req: Request =
            serde_json::from_str(r#"{"op":"update_room","number":"A1","capacity":3}"#).unwrap();
        assert_eq!(
            req,
            Request::UpdateRoom {
                number: "A1".into(),
                patch: RoomPatch {
                    capacity: Some(3),
                    ..RoomPatch::default()
                }
            }
        );
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"drop_tables"}"#).is_err());
    }

    #[test]
    fn errors_carry_rejection_category() {
        let resp: Response = EngineError::RoomNotFound("Z9".into()).into();
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["reason"], "not_found");
        assert!(json["message"].as_str().unwrap().contains("Z9"));
    }
}
