use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use super::*;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("bunkd_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn confirmed(id: Ulid, room: &str, student: &str) -> LedgerEvent {
    LedgerEvent {
        booking_id: id,
        room: room.into(),
        student: student.into(),
        at: 1_000,
        change: Transition::Confirmed { requested_at: 1_000 },
    }
}

fn follow_up(b: &LedgerEvent, change: Transition) -> LedgerEvent {
    LedgerEvent {
        at: b.at + 1,
        change,
        ..b.clone()
    }
}

// ── Inventory ────────────────────────────────────────────

#[tokio::test]
async fn insert_and_get_room() {
    let store = Store::open(&test_wal_path("insert_get.wal")).unwrap();
    store
        .insert_room(Room::new("A101", "single", 1).with_price(45_000))
        .await
        .unwrap();

    let room = store.get_room("A101").await.unwrap();
    assert_eq!(room.capacity, 1);
    assert_eq!(room.occupied, 0);
    assert_eq!(room.price, 45_000);
    assert!(matches!(store.get_room("Z999").await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn duplicate_room_rejected() {
    let store = Store::open(&test_wal_path("dup_room.wal")).unwrap();
    store.insert_room(Room::new("A101", "single", 1)).await.unwrap();
    let result = store.insert_room(Room::new("A101", "double", 2)).await;
    assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    assert_eq!(store.get_room("A101").await.unwrap().room_type, "single");
}

#[tokio::test]
async fn inserted_room_starts_empty() {
    let store = Store::open(&test_wal_path("starts_empty.wal")).unwrap();
    let mut room = Room::new("A101", "single", 2);
    room.occupied = 2;
    store.insert_room(room).await.unwrap();
    assert_eq!(store.get_room("A101").await.unwrap().occupied, 0);
}

#[tokio::test]
async fn reserve_until_full() {
    let store = Store::open(&test_wal_path("until_full.wal")).unwrap();
    store.insert_room(Room::new("B201", "double", 2)).await.unwrap();

    store.try_reserve("B201", Ulid::new()).await.unwrap();
    let room = store.try_reserve("B201", Ulid::new()).await.unwrap();
    assert_eq!(room.occupied, 2);
    assert_eq!(room.status(), RoomStatus::Occupied);

    let third = store.try_reserve("B201", Ulid::new()).await;
    assert!(matches!(third, Err(StoreError::Full(_))));
    assert_eq!(store.get_room("B201").await.unwrap().occupied, 2);
}

#[tokio::test]
async fn reserve_same_claim_is_idempotent() {
    let store = Store::open(&test_wal_path("idempotent_claim.wal")).unwrap();
    store.insert_room(Room::new("B201", "double", 2)).await.unwrap();

    let claim = Ulid::new();
    store.try_reserve("B201", claim).await.unwrap();
    let room = store.try_reserve("B201", claim).await.unwrap();
    assert_eq!(room.occupied, 1);
}

#[tokio::test]
async fn release_only_frees_held_claims() {
    let store = Store::open(&test_wal_path("release_claims.wal")).unwrap();
    store.insert_room(Room::new("B201", "double", 2)).await.unwrap();

    let empty = store.release("B201", Ulid::new()).await;
    assert!(matches!(empty, Err(StoreError::AlreadyAtZero(_))));

    let held = Ulid::new();
    store.try_reserve("B201", held).await.unwrap();
    let stranger = store.release("B201", Ulid::new()).await;
    assert!(matches!(stranger, Err(StoreError::NotHeld { .. })));
    assert_eq!(store.get_room("B201").await.unwrap().occupied, 1);

    let room = store.release("B201", held).await.unwrap();
    assert_eq!(room.occupied, 0);
    assert!(store.claims("B201").await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_reserves_never_oversell() {
    let store = Arc::new(Store::open(&test_wal_path("concurrent_reserve.wal")).unwrap());
    store.insert_room(Room::new("C301", "dorm", 5)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..40 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.try_reserve("C301", Ulid::new()).await
        }));
    }

    let mut ok = 0;
    let mut full = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(StoreError::Full(_)) => full += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(full, 35);
    assert_eq!(store.get_room("C301").await.unwrap().occupied, 5);
}

#[tokio::test]
async fn retired_room_refuses_new_claims() {
    let store = Store::open(&test_wal_path("retired.wal")).unwrap();
    store.insert_room(Room::new("D401", "single", 2)).await.unwrap();
    let held = Ulid::new();
    store.try_reserve("D401", held).await.unwrap();

    let room = store.retire_room("D401").await.unwrap();
    assert!(room.retired);
    assert_eq!(room.occupied, 1);

    let result = store.try_reserve("D401", Ulid::new()).await;
    assert!(matches!(result, Err(StoreError::Retired(_))));
    // Existing holders can still leave.
    store.release("D401", held).await.unwrap();
}

#[tokio::test]
async fn restore_admits_retired_rooms_within_capacity() {
    let store = Store::open(&test_wal_path("restore_retired.wal")).unwrap();
    store.insert_room(Room::new("D402", "single", 1)).await.unwrap();
    let held = Ulid::new();
    store.try_reserve("D402", held).await.unwrap();
    store.retire_room("D402").await.unwrap();
    store.release("D402", held).await.unwrap();

    assert!(matches!(
        store.try_reserve("D402", held).await,
        Err(StoreError::Retired(_))
    ));
    let room = store.restore("D402", held).await.unwrap();
    assert!(room.retired);
    assert_eq!(room.occupied, 1);
    // Idempotent for the same claim, capacity still binds for others.
    assert_eq!(store.restore("D402", held).await.unwrap().occupied, 1);
    assert!(matches!(
        store.restore("D402", Ulid::new()).await,
        Err(StoreError::Full(_))
    ));
}

#[tokio::test]
async fn every_room_change_gets_a_newer_revision() {
    let store = Store::open(&test_wal_path("revisions.wal")).unwrap();
    store.insert_room(Room::new("E1", "single", 2)).await.unwrap();
    store.insert_room(Room::new("E2", "single", 2)).await.unwrap();
    let created = store.get_room("E1").await.unwrap().revision;
    let claim = Ulid::new();
    let reserved = store.try_reserve("E1", claim).await.unwrap().revision;
    let other = store.try_reserve("E2", Ulid::new()).await.unwrap().revision;
    let released = store.release("E1", claim).await.unwrap().revision;
    assert!(created < reserved && reserved < other && other < released);

    // A refused change leaves the revision alone.
    store.retire_room("E1").await.unwrap();
    let retired = store.get_room("E1").await.unwrap().revision;
    assert!(store.try_reserve("E1", Ulid::new()).await.is_err());
    assert_eq!(store.get_room("E1").await.unwrap().revision, retired);
}

#[tokio::test]
async fn remove_room_requires_no_claims() {
    let store = Store::open(&test_wal_path("remove_room.wal")).unwrap();
    store.insert_room(Room::new("D402", "single", 1)).await.unwrap();
    let claim = Ulid::new();
    store.try_reserve("D402", claim).await.unwrap();

    let busy = store.remove_room("D402").await;
    assert!(matches!(busy, Err(StoreError::InUse(_))));

    store.release("D402", claim).await.unwrap();
    store.remove_room("D402").await.unwrap();
    assert!(matches!(store.get_room("D402").await, Err(StoreError::NotFound(_))));
    assert_eq!(store.room_count(), 0);
}

#[tokio::test]
async fn capacity_cannot_drop_below_occupancy() {
    let store = Store::open(&test_wal_path("capacity_edit.wal")).unwrap();
    store.insert_room(Room::new("E501", "triple", 3)).await.unwrap();
    store.try_reserve("E501", Ulid::new()).await.unwrap();
    store.try_reserve("E501", Ulid::new()).await.unwrap();

    let shrink = store
        .update_room(
            "E501",
            RoomPatch {
                capacity: Some(1),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(
        shrink,
        Err(StoreError::CapacityBelowOccupancy { capacity: 1, occupied: 2 })
    ));

    let room = store
        .update_room(
            "E501",
            RoomPatch {
                capacity: Some(2),
                price: Some(30_000),
                gender: Some(GenderRestriction::Female),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(room.capacity, 2);
    assert_eq!(room.price, 30_000);
    assert_eq!(room.gender, GenderRestriction::Female);
    assert_eq!(room.room_type, "triple");
    assert_eq!(room.status(), RoomStatus::Occupied);
}

#[tokio::test]
async fn list_rooms_by_type() {
    let store = Store::open(&test_wal_path("list_rooms.wal")).unwrap();
    store.insert_room(Room::new("A102", "single", 1)).await.unwrap();
    store.insert_room(Room::new("A101", "single", 1)).await.unwrap();
    store.insert_room(Room::new("B201", "double", 2)).await.unwrap();

    let all = store.list_rooms(None).await.unwrap();
    let numbers: Vec<_> = all.iter().map(|r| r.number.as_str()).collect();
    assert_eq!(numbers, vec!["A101", "A102", "B201"]);

    let singles = store.list_rooms(Some("single")).await.unwrap();
    assert_eq!(singles.len(), 2);
    assert!(store.list_rooms(Some("suite")).await.unwrap().is_empty());
}

// ── Ledger ───────────────────────────────────────────────

#[tokio::test]
async fn append_confirmed_and_read_back() {
    let store = Store::open(&test_wal_path("ledger_confirm.wal")).unwrap();
    let id = Ulid::new();
    let seq = store.append(confirmed(id, "A101", "s1")).await.unwrap();

    let booking = store.get_booking(id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(booking.room, "A101");
    let history = store.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].seq, seq);
}

#[tokio::test]
async fn second_active_confirmation_for_pair_is_duplicate() {
    let store = Store::open(&test_wal_path("ledger_dup.wal")).unwrap();
    let first = Ulid::new();
    store.append(confirmed(first, "A101", "s1")).await.unwrap();

    let result = store.append(confirmed(Ulid::new(), "A101", "s1")).await;
    assert_eq!(result, Err(StoreError::Duplicate(first)));

    // Other students and other rooms are unaffected.
    store.append(confirmed(Ulid::new(), "A101", "s2")).await.unwrap();
    store.append(confirmed(Ulid::new(), "A102", "s1")).await.unwrap();
}

#[tokio::test]
async fn cancellation_frees_the_pair() {
    let store = Store::open(&test_wal_path("ledger_cancel_pair.wal")).unwrap();
    let first = confirmed(Ulid::new(), "A101", "s1");
    store.append(first.clone()).await.unwrap();
    store
        .append(follow_up(
            &first,
            Transition::Cancelled {
                reason: "moving out".into(),
            },
        ))
        .await
        .unwrap();

    store.append(confirmed(Ulid::new(), "A101", "s1")).await.unwrap();
}

#[tokio::test]
async fn illegal_transitions_refused() {
    let store = Store::open(&test_wal_path("ledger_transitions.wal")).unwrap();
    let opening = confirmed(Ulid::new(), "A101", "s1");
    store.append(opening.clone()).await.unwrap();
    store
        .append(follow_up(&opening, Transition::Completed))
        .await
        .unwrap();

    let cancel_after_complete = store
        .append(follow_up(
            &opening,
            Transition::Cancelled {
                reason: "late".into(),
            },
        ))
        .await;
    assert!(matches!(
        cancel_after_complete,
        Err(StoreError::InvalidTransition {
            from: BookingStatus::Completed,
            ..
        })
    ));

    let reopen = store.append(opening.clone()).await;
    assert!(matches!(reopen, Err(StoreError::AlreadyExists(_)) | Err(StoreError::Duplicate(_))));

    let unknown = store
        .append(follow_up(
            &confirmed(Ulid::new(), "A101", "s1"),
            Transition::Completed,
        ))
        .await;
    assert!(matches!(unknown, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn payment_settles_once() {
    let store = Store::open(&test_wal_path("ledger_payment.wal")).unwrap();
    let opening = confirmed(Ulid::new(), "A101", "s1");
    store.append(opening.clone()).await.unwrap();
    store
        .append(follow_up(&opening, Transition::PaymentSettled))
        .await
        .unwrap();
    assert!(store.get_booking(opening.booking_id).await.unwrap().paid_at.is_some());

    let again = store
        .append(follow_up(&opening, Transition::PaymentSettled))
        .await;
    assert!(matches!(again, Err(StoreError::InvalidTransition { .. })));
}

#[tokio::test]
async fn abandoned_opening_append_frees_its_slot() {
    let store = Store::open(&test_wal_path("abandoned_append.wal")).unwrap();
    let event = confirmed(Ulid::new(), "A101", "s1");

    // Parked on the WAL writer's acknowledgement, then dropped.
    let mut pending = Box::pin(store.append(event.clone()));
    assert!(futures::poll!(pending.as_mut()).is_pending());
    drop(pending);

    assert!(matches!(
        store.get_booking(event.booking_id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(store.list_by_student("s1").await.unwrap().is_empty());
    store.append(event.clone()).await.unwrap();
    assert_eq!(
        store.get_booking(event.booking_id).await.unwrap().status,
        BookingStatus::Confirmed
    );
}

#[tokio::test]
async fn mismatched_follow_up_refused() {
    let store = Store::open(&test_wal_path("ledger_mismatch.wal")).unwrap();
    let opening = confirmed(Ulid::new(), "A101", "s1");
    store.append(opening.clone()).await.unwrap();

    let mut wrong = follow_up(&opening, Transition::Completed);
    wrong.room = "B201".into();
    assert!(matches!(
        store.append(wrong).await,
        Err(StoreError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn listings_are_oldest_first() {
    let store = Store::open(&test_wal_path("ledger_listing.wal")).unwrap();
    let mut ids = Vec::new();
    for (i, student) in ["s1", "s2", "s3"].iter().enumerate() {
        let id = Ulid::new();
        let mut ev = confirmed(id, "A101", student);
        ev.change = Transition::Confirmed {
            requested_at: 1_000 + i as Ms,
        };
        store.append(ev).await.unwrap();
        ids.push(id);
    }
    let rejected = Ulid::new();
    store
        .append(LedgerEvent {
            booking_id: rejected,
            room: "A101".into(),
            student: "s1".into(),
            at: 2_000,
            change: Transition::Rejected {
                requested_at: 2_000,
                reason: RejectReason::NoCapacity,
            },
        })
        .await
        .unwrap();

    let by_room: Vec<_> = store
        .list_by_room("A101")
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(by_room, vec![ids[0], ids[1], ids[2], rejected]);

    let by_student = store.list_by_student("s1").await.unwrap();
    assert_eq!(by_student.len(), 2);
    assert_eq!(by_student[1].status, BookingStatus::Rejected);

    let confirmed_only = store.list_by_status(BookingStatus::Confirmed).await.unwrap();
    assert_eq!(confirmed_only.len(), 3);
    assert!(store.list_by_room("Z999").await.unwrap().is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_rooms_claims_and_ledger() {
    let path = test_wal_path("replay_all.wal");
    let opening = confirmed(Ulid::new(), "A101", "s1");
    let last_seq;
    {
        let store = Store::open(&path).unwrap();
        store.insert_room(Room::new("A101", "single", 1)).await.unwrap();
        store.insert_room(Room::new("A102", "single", 1)).await.unwrap();
        store.try_reserve("A101", opening.booking_id).await.unwrap();
        store.append(opening.clone()).await.unwrap();
        last_seq = store
            .append(follow_up(&opening, Transition::PaymentSettled))
            .await
            .unwrap();
        store.retire_room("A102").await.unwrap();
    }

    let store = Store::open(&path).unwrap();
    let room = store.get_room("A101").await.unwrap();
    assert_eq!(room.occupied, 1);
    assert_eq!(store.claims("A101").await.unwrap(), vec![opening.booking_id]);
    assert!(store.get_room("A102").await.unwrap().retired);

    let booking = store.get_booking(opening.booking_id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert!(booking.paid_at.is_some());
    assert_eq!(store.history(opening.booking_id).await.unwrap().len(), 2);

    // Uniqueness index and sequence counter survive the restart.
    let dup = store.append(confirmed(Ulid::new(), "A101", "s1")).await;
    assert_eq!(dup, Err(StoreError::Duplicate(opening.booking_id)));
    let next = store
        .append(follow_up(&opening, Transition::Completed))
        .await
        .unwrap();
    assert!(next > last_seq);
}

#[tokio::test]
async fn compaction_preserves_state_and_history() {
    let path = test_wal_path("compact_state.wal");
    let opening = confirmed(Ulid::new(), "B201", "s1");
    {
        let store = Store::open(&path).unwrap();
        store.insert_room(Room::new("B201", "double", 2)).await.unwrap();
        for _ in 0..10 {
            let churn = Ulid::new();
            store.try_reserve("B201", churn).await.unwrap();
            store.release("B201", churn).await.unwrap();
        }
        store.try_reserve("B201", opening.booking_id).await.unwrap();
        store.append(opening.clone()).await.unwrap();
        store
            .append(follow_up(&opening, Transition::PaymentSettled))
            .await
            .unwrap();

        assert!(store.wal_appends_since_compact().await > 20);
        let before = std::fs::metadata(&path).unwrap().len();
        store.compact().await.unwrap();
        assert_eq!(store.wal_appends_since_compact().await, 0);
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        // Appends after compaction land in the new file.
        store.insert_room(Room::new("B202", "double", 2)).await.unwrap();
    }

    let store = Store::open(&path).unwrap();
    assert_eq!(store.get_room("B201").await.unwrap().occupied, 1);
    assert_eq!(store.claims("B201").await.unwrap(), vec![opening.booking_id]);
    assert!(store.get_room("B202").await.is_ok());
    let history = store.history(opening.booking_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].seq < history[1].seq);
}

#[tokio::test]
async fn group_commit_under_concurrency() {
    let path = test_wal_path("group_commit.wal");
    let store = Arc::new(Store::open(&path).unwrap());

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.insert_room(Room::new(format!("R{i:02}"), "single", 1)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(store.list_rooms(None).await.unwrap().len(), 20);

    let reopened = Store::open(&path).unwrap();
    assert_eq!(reopened.list_rooms(None).await.unwrap().len(), 20);
}
