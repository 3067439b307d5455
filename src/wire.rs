use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::coordinator::EngineError;
use crate::hostel::{Hostel, HostelManager};
use crate::limits::*;
use crate::model::*;
use crate::observability::{self, AUTH_FAILURES_TOTAL, REQUEST_DURATION_SECONDS, REQUESTS_TOTAL};
use crate::protocol::{Request, Response};

type Lines<S> = Framed<S, LinesCodec>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Forwarding tasks for the rooms this connection watches. Aborted on drop.
#[derive(Default)]
struct Watches(HashMap<String, JoinHandle<()>>);

impl Drop for Watches {
    fn drop(&mut self) {
        for (_, task) in self.0.drain() {
            task.abort();
        }
    }
}

/// Serve one client: handshake, then requests and pushed watch events until EOF.
pub async fn process_connection<S>(
    socket: S,
    manager: Arc<HostelManager>,
    password: String,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let Some(hostel) = handshake(&mut lines, &manager, &password).await? else {
        return Ok(());
    };

    let (event_tx, mut event_rx) = mpsc::channel::<LedgerEntry>(256);
    let mut watches = Watches::default();

    loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        send(&mut lines, &Response::invalid("request line too long")).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Request>(&line) {
                    Ok(req) => {
                        let label = observability::request_label(&req);
                        let start = Instant::now();
                        let response = dispatch(req, &hostel, &manager, &mut watches, &event_tx).await;
                        let status = if response.is_error() { "error" } else { "ok" };
                        metrics::counter!(REQUESTS_TOTAL, "op" => label, "status" => status).increment(1);
                        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => label)
                            .record(start.elapsed().as_secs_f64());
                        response
                    }
                    Err(e) => Response::invalid(format!("bad request: {e}")),
                };
                send(&mut lines, &response).await?;
            }
            Some(entry) = event_rx.recv() => {
                send(&mut lines, &Response::Event { entry }).await?;
            }
        }
    }
    debug!(hostel = %hostel.name, "client disconnected");
    Ok(())
}

async fn send<S>(lines: &mut Lines<S>, response: &Response) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    lines.send(serde_json::to_string(response)?).await?;
    Ok(())
}

/// First line must be `hello`. Returns `None` if the client left before sending it.
async fn handshake<S>(
    lines: &mut Lines<S>,
    manager: &HostelManager,
    password: &str,
) -> Result<Option<Arc<Hostel>>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(line) = lines.next().await else {
        return Ok(None);
    };
    let line = line?;
    let (hostel, given) = match serde_json::from_str::<Request>(&line) {
        Ok(Request::Hello { hostel, password }) => (hostel, password),
        _ => {
            send(lines, &Response::invalid("expected hello")).await?;
            return Err(ConnectionError::Handshake("first request was not hello".into()));
        }
    };
    if given != password {
        metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
        send(lines, &Response::invalid("authentication failed")).await?;
        return Err(ConnectionError::Handshake("bad password".into()));
    }
    match manager.get_or_create(&hostel) {
        Ok(loaded) => {
            send(lines, &Response::Ready { hostel: loaded.name.clone() }).await?;
            Ok(Some(loaded))
        }
        Err(e) => {
            send(lines, &Response::invalid(format!("hostel error: {e}"))).await?;
            Err(ConnectionError::Handshake(e.to_string()))
        }
    }
}

async fn dispatch(
    req: Request,
    hostel: &Hostel,
    manager: &HostelManager,
    watches: &mut Watches,
    events: &mpsc::Sender<LedgerEntry>,
) -> Response {
    match execute(req, hostel, manager, watches, events).await {
        Ok(response) => response,
        Err(e) => e.into(),
    }
}

async fn execute(
    req: Request,
    hostel: &Hostel,
    manager: &HostelManager,
    watches: &mut Watches,
    events: &mpsc::Sender<LedgerEntry>,
) -> Result<Response, EngineError> {
    let coord = &hostel.coordinator;
    let response = match req {
        Request::Hello { .. } => Response::invalid("already connected"),
        Request::CreateRoom {
            number,
            room_type,
            capacity,
            price,
            gender,
        } => {
            let room = Room::new(number, room_type, capacity)
                .with_price(price)
                .with_gender(gender);
            Response::Room {
                room: coord.create_room(room).await?,
            }
        }
        Request::UpdateRoom { number, patch } => Response::Room {
            room: coord.update_room(&number, patch).await?,
        },
        Request::RetireRoom { number } => Response::Room {
            room: coord.retire_room(&number).await?,
        },
        Request::RemoveRoom { number } => Response::Room {
            room: coord.remove_room(&number).await?,
        },
        Request::RegisterStudent {
            student,
            gender,
            name,
        } => {
            if student.is_empty() || student.len() > MAX_ID_LEN {
                return Err(EngineError::LimitExceeded("student id length"));
            }
            if name.as_ref().is_some_and(|n| n.len() > MAX_STUDENT_NAME_LEN) {
                return Err(EngineError::LimitExceeded("student name too long"));
            }
            let profile = StudentProfile {
                id: student,
                gender,
                name,
            };
            manager.students().upsert(profile.clone());
            Response::Student { profile }
        }
        Request::Book { room, student } => Response::Booking {
            booking: coord.book(&room, &student).await?,
        },
        Request::Cancel { booking_id, reason } => Response::Booking {
            booking: coord.cancel(booking_id, &reason).await?,
        },
        Request::Complete { booking_id } => Response::Booking {
            booking: coord.complete(booking_id).await?,
        },
        Request::PaymentConfirmed { booking_id } => Response::Booking {
            booking: coord.on_payment_confirmed(booking_id).await?,
        },
        Request::GetRoom { number } => Response::Room {
            room: coord.get_room(&number).await?,
        },
        Request::RoomStatus { number } => {
            let status = coord.get_room_status(&number).await?;
            Response::RoomStatus { number, status }
        }
        Request::ListRooms { room_type } => Response::Rooms {
            rooms: coord.list_rooms(room_type.as_deref()).await?,
        },
        Request::Occupancy { room_type } => {
            let view = coord.get_occupancy(room_type.as_deref()).await?;
            let total = view.total();
            Response::Occupancy { view, total }
        }
        Request::GetBooking { booking_id } => Response::Booking {
            booking: coord.get_booking(booking_id).await?,
        },
        Request::BookingsByRoom { room } => Response::Bookings {
            bookings: coord.bookings_by_room(&room).await?,
        },
        Request::BookingsByStudent { student } => Response::Bookings {
            bookings: coord.bookings_by_student(&student).await?,
        },
        Request::BookingsByStatus { status } => Response::Bookings {
            bookings: coord.bookings_by_status(status).await?,
        },
        Request::BookingHistory { booking_id } => Response::History {
            entries: coord.booking_history(booking_id).await?,
        },
        Request::Reconcile => Response::Reconciled {
            report: coord.reconcile(now_ms()).await?,
        },
        Request::Watch { room } => {
            if watches.0.contains_key(&room) {
                return Ok(Response::Watching { room });
            }
            if watches.0.len() >= MAX_WATCHES_PER_CONNECTION {
                return Err(EngineError::LimitExceeded("too many watches on connection"));
            }
            coord.get_room(&room).await?;
            let rx = coord.subscribe(&room);
            let task = tokio::spawn(forward(room.clone(), rx, events.clone()));
            watches.0.insert(room.clone(), task);
            Response::Watching { room }
        }
        Request::Unwatch { room } => {
            if let Some(task) = watches.0.remove(&room) {
                task.abort();
            }
            Response::Unwatched { room }
        }
    };
    Ok(response)
}

/// Pump one room's broadcast into the connection's event queue.
async fn forward(
    room: String,
    mut rx: broadcast::Receiver<LedgerEntry>,
    events: mpsc::Sender<LedgerEntry>,
) {
    loop {
        match rx.recv().await {
            Ok(entry) => {
                if events.send(entry).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(room, skipped, "watcher lagged; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
