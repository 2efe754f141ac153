use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use transit_booking::{BookingEngine, RetryPolicy};
use transit_core::{
    BookingRequest, EngineError, InventoryStore, LockSet, OrderStatus, PassengerRequest,
    RefundRequest, Rejection, Seat, TicketStatus, Trip,
};
use transit_store::{MemoryStore, PoolSettings};
use uuid::Uuid;

async fn store_with(settings: PoolSettings) -> MemoryStore {
    MemoryStore::open(settings).await.unwrap()
}

async fn store() -> MemoryStore {
    store_with(PoolSettings { lock_timeout_ms: 2_000, ..PoolSettings::default() }).await
}

fn engine(store: &MemoryStore) -> BookingEngine {
    BookingEngine::new(Arc::new(store.clone()), RetryPolicy::new(3, Duration::from_millis(1)))
}

fn passenger(name: &str, identity: &str, seat: &Seat) -> PassengerRequest {
    PassengerRequest {
        name: name.to_string(),
        identity_number: identity.into(),
        seat_id: seat.id,
    }
}

fn booking(trip: &Trip, passengers: Vec<PassengerRequest>) -> BookingRequest {
    BookingRequest { trip_id: trip.id, passengers }
}

fn refund(ticket_ids: Vec<Uuid>) -> RefundRequest {
    RefundRequest { ticket_ids, reason: "change of plans".to_string() }
}

fn rejection(result: Result<impl std::fmt::Debug, EngineError>) -> Rejection {
    match result {
        Err(EngineError::Rejected(r)) => r,
        other => panic!("expected rejection, got {:?}", other),
    }
}

// ============================================================================
// Booking
// ============================================================================

#[tokio::test]
async fn test_total_is_base_price_times_passengers() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(12_345, 4);

    let receipt = engine
        .book(
            "alice",
            &booking(
                &trip,
                vec![
                    passenger("Ada", "ID-1", &seats[0]),
                    passenger("Bob", "ID-2", &seats[1]),
                    passenger("Cy", "ID-3", &seats[2]),
                ],
            ),
        )
        .await
        .unwrap();

    assert_eq!(receipt.total_cents, 37_035);
    assert_eq!(receipt.ticket_ids.len(), 3);

    let order = store.order(receipt.order_id).unwrap();
    assert_eq!(order.total_cents, 37_035);
    assert_eq!(order.ticket_count, 3);
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(store.tickets().len(), 3);
    assert!(store.tickets().iter().all(|t| t.price_cents == 12_345));
}

#[tokio::test]
async fn test_duplicate_identity_writes_nothing() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 2);

    let result = engine
        .book(
            "alice",
            &booking(&trip, vec![passenger("Ada", "A", &seats[0]), passenger("Ada", "A", &seats[1])]),
        )
        .await;

    assert_eq!(rejection(result), Rejection::DuplicateIdentity);
    assert!(store.orders().is_empty());
    assert!(store.tickets().is_empty());
}

#[tokio::test]
async fn test_identity_already_ticketed_on_trip() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 2);

    engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();

    let result = engine
        .book("bob", &booking(&trip, vec![passenger("Ada", "A", &seats[1])]))
        .await;
    assert_eq!(rejection(result), Rejection::IdentityAlreadyTicketed { count: 1 });
    assert_eq!(store.tickets().len(), 1);
}

#[tokio::test]
async fn test_same_identity_may_ride_other_trips() {
    let store = store().await;
    let engine = engine(&store);
    let (first, first_seats) = store.seed_trip(100, 1);
    let (second, second_seats) = store.seed_trip(100, 1);

    engine
        .book("alice", &booking(&first, vec![passenger("Ada", "A", &first_seats[0])]))
        .await
        .unwrap();
    engine
        .book("alice", &booking(&second, vec![passenger("Ada", "A", &second_seats[0])]))
        .await
        .unwrap();

    assert_eq!(store.tickets().len(), 2);
}

#[tokio::test]
async fn test_taken_seat_is_unavailable() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 2);

    engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();

    let result = engine
        .book(
            "bob",
            &booking(&trip, vec![passenger("Bob", "B", &seats[1]), passenger("Cy", "C", &seats[0])]),
        )
        .await;

    assert_eq!(rejection(result), Rejection::SeatUnavailable(vec![seats[0].id]));
    assert_eq!(store.orders().len(), 1);
}

#[tokio::test]
async fn test_unknown_trip_and_foreign_seat() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, _) = store.seed_trip(100, 1);
    let (_, other_seats) = store.seed_trip(100, 1);

    let ghost = Trip { id: Uuid::new_v4(), ..trip.clone() };
    let result = engine
        .book("alice", &booking(&ghost, vec![passenger("Ada", "A", &other_seats[0])]))
        .await;
    assert_eq!(rejection(result), Rejection::TripNotFound(ghost.id));

    let result = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &other_seats[0])]))
        .await;
    assert_eq!(rejection(result), Rejection::SeatNotOnTrip(other_seats[0].id));
    assert!(store.tickets().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bookings_for_one_seat_have_one_winner() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    let attempts = (0..8).map(|i| {
        let engine = engine.clone();
        let request = booking(&trip, vec![passenger("Rider", &format!("ID-{}", i), &seats[0])]);
        tokio::spawn(async move { engine.book(&format!("user-{}", i), &request).await })
    });

    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].total_cents, 100);

    for result in results.iter().filter(|r| r.is_err()) {
        match result {
            Err(EngineError::Rejected(Rejection::SeatUnavailable(ids))) => assert_eq!(ids, &vec![seats[0].id]),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    let valid: Vec<_> = store.tickets().into_iter().filter(|t| t.is_valid()).collect();
    assert_eq!(valid.len(), 1);
    assert_eq!(store.orders().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bookings_for_one_identity_have_one_winner() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 6);

    let attempts = seats.iter().map(|seat| {
        let engine = engine.clone();
        let request = booking(&trip, vec![passenger("Ada", "SAME-ID", seat)]);
        tokio::spawn(async move { engine.book("alice", &request).await })
    });

    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e.rejection(), Some(Rejection::IdentityAlreadyTicketed { .. }))));
    assert_eq!(store.tickets().len(), 1);
}

// ============================================================================
// Retry and bounded waits
// ============================================================================

#[tokio::test]
async fn test_transient_conflict_is_retried() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    store.fail_next_commits(2);
    let receipt = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();

    assert_eq!(store.orders().len(), 1);
    assert_eq!(store.orders()[0].id, receipt.order_id);
}

#[tokio::test]
async fn test_exhausted_retries_report_busy() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    store.fail_next_commits(3);
    let result = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await;

    assert!(matches!(result, Err(EngineError::Busy(_))));
    assert!(store.orders().is_empty());

    // The failure budget is spent; the next call goes through.
    engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rejections_are_not_retried() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();

    // A retry would consume the injected failure.
    store.fail_next_commits(1);
    let result = engine
        .book("bob", &booking(&trip, vec![passenger("Bob", "B", &seats[0])]))
        .await;
    assert!(matches!(rejection(result), Rejection::SeatUnavailable(_)));

    let mut tx = store.begin().await.unwrap();
    assert!(tx.commit().await.is_err());
}

#[tokio::test]
async fn test_lock_wait_is_bounded() {
    let store = store_with(PoolSettings { lock_timeout_ms: 30, ..PoolSettings::default() }).await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    let mut holder = store.begin().await.unwrap();
    holder
        .acquire_locks(&LockSet::for_booking(trip.id, std::iter::empty(), [seats[0].id]))
        .await
        .unwrap();

    let result = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await;
    assert!(matches!(result, Err(EngineError::Busy(_))));

    holder.rollback().await.unwrap();
    engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_session_wait_is_bounded() {
    let store = store_with(PoolSettings {
        min_idle: 1,
        max_size: 1,
        acquire_timeout_ms: 30,
        ..PoolSettings::default()
    })
    .await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    let holder = store.begin().await.unwrap();
    let result = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await;
    assert!(matches!(result, Err(EngineError::Busy(_))));

    drop(holder);
    assert_eq!(engine.pool_status().in_use, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refunds_of_one_order_close_it() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 2);

    let receipt = engine
        .book(
            "alice",
            &booking(&trip, vec![passenger("Ada", "A", &seats[0]), passenger("Bob", "B", &seats[1])]),
        )
        .await
        .unwrap();

    let attempts = receipt.ticket_ids.iter().map(|id| {
        let engine = engine.clone();
        let request = refund(vec![*id]);
        tokio::spawn(async move { engine.refund("alice", &request).await })
    });

    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap().unwrap()).collect();

    // Whichever refund commits second sees no valid ticket left.
    let closing: Vec<_> = results.iter().filter(|r| !r.refunded_orders.is_empty()).collect();
    assert_eq!(closing.len(), 1);
    assert_eq!(closing[0].refunded_orders, vec![receipt.order_id]);

    assert_eq!(store.order(receipt.order_id).unwrap().status, OrderStatus::Refunded);
    assert!(store.tickets().iter().all(|t| t.status == TicketStatus::Refunded));
    assert_eq!(store.refunds().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refunds_of_one_ticket_have_one_winner() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    let receipt = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();
    let ticket_id = receipt.ticket_ids[0];

    let attempts = (0..6).map(|_| {
        let engine = engine.clone();
        let request = refund(vec![ticket_id]);
        tokio::spawn(async move { engine.refund("alice", &request).await })
    });

    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e.rejection(), Some(Rejection::TicketNotRefundable(id)) if *id == ticket_id)));

    assert_eq!(store.refunds().len(), 1);
    assert_eq!(store.order(receipt.order_id).unwrap().status, OrderStatus::Refunded);
}

// ============================================================================
// Refund
// ============================================================================

#[tokio::test]
async fn test_partial_then_full_refund() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 2);

    let receipt = engine
        .book(
            "alice",
            &booking(&trip, vec![passenger("Ada", "A", &seats[0]), passenger("Bob", "B", &seats[1])]),
        )
        .await
        .unwrap();
    let (t1, t2) = (receipt.ticket_ids[0], receipt.ticket_ids[1]);

    let first = engine.refund("alice", &refund(vec![t1])).await.unwrap();
    assert_eq!(first.refund_cents, 100);
    assert!(first.refunded_orders.is_empty());
    assert_eq!(store.order(receipt.order_id).unwrap().status, OrderStatus::Confirmed);

    let second = engine.refund("alice", &refund(vec![t2])).await.unwrap();
    assert_eq!(second.refund_cents, 100);
    assert_eq!(second.refunded_orders, vec![receipt.order_id]);
    assert_eq!(store.order(receipt.order_id).unwrap().status, OrderStatus::Refunded);

    let refunds = store.refunds();
    assert_eq!(refunds.len(), 2);
    assert!(refunds.iter().all(|r| r.amount_cents == 100 && r.handled_by == "alice"));
}

#[tokio::test]
async fn test_refund_is_idempotent_per_ticket() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 2);

    let receipt = engine
        .book(
            "alice",
            &booking(&trip, vec![passenger("Ada", "A", &seats[0]), passenger("Bob", "B", &seats[1])]),
        )
        .await
        .unwrap();
    let (t1, t2) = (receipt.ticket_ids[0], receipt.ticket_ids[1]);

    engine.refund("alice", &refund(vec![t1])).await.unwrap();

    let result = engine.refund("alice", &refund(vec![t2, t1])).await;
    assert_eq!(rejection(result), Rejection::TicketNotRefundable(t1));

    // All-or-nothing: t2 is untouched by the failed batch.
    let t2_now = store.tickets().into_iter().find(|t| t.id == t2).unwrap();
    assert_eq!(t2_now.status, TicketStatus::Valid);
    assert_eq!(store.refunds().len(), 1);
}

#[tokio::test]
async fn test_refund_requires_ownership() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    let receipt = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();

    let result = engine.refund("mallory", &refund(receipt.ticket_ids.clone())).await;
    assert_eq!(rejection(result), Rejection::TicketsNotFound);

    let result = engine
        .refund("alice", &refund(vec![receipt.ticket_ids[0], Uuid::new_v4()]))
        .await;
    assert_eq!(rejection(result), Rejection::TicketsNotFound);

    assert!(store.tickets()[0].is_valid());
    assert!(store.refunds().is_empty());
}

#[tokio::test]
async fn test_refund_spanning_orders_recomputes_each() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 3);

    let solo = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();
    let group = engine
        .book(
            "alice",
            &booking(&trip, vec![passenger("Bob", "B", &seats[1]), passenger("Cy", "C", &seats[2])]),
        )
        .await
        .unwrap();

    let receipt = engine
        .refund("alice", &refund(vec![solo.ticket_ids[0], group.ticket_ids[0]]))
        .await
        .unwrap();

    assert_eq!(receipt.refund_cents, 200);
    assert_eq!(receipt.refunded_orders, vec![solo.order_id]);
    assert_eq!(store.order(solo.order_id).unwrap().status, OrderStatus::Refunded);
    assert_eq!(store.order(group.order_id).unwrap().status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn test_refunded_seat_can_be_booked_again() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 1);

    let receipt = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();
    engine.refund("alice", &refund(receipt.ticket_ids)).await.unwrap();

    engine
        .book("bob", &booking(&trip, vec![passenger("Bob", "B", &seats[0])]))
        .await
        .unwrap();

    assert_eq!(store.tickets().iter().filter(|t| t.is_valid()).count(), 1);
}

#[tokio::test]
async fn test_refund_retries_injected_conflict() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(250, 1);

    let receipt = engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();

    store.fail_next_commits(1);
    let refunded = engine.refund("alice", &refund(receipt.ticket_ids)).await.unwrap();
    assert_eq!(refunded.refund_cents, 250);
    assert_eq!(store.refunds().len(), 1);
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn test_seat_map_reflects_bookings() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 3);

    engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[1])]))
        .await
        .unwrap();

    let map = engine.seat_map(trip.id).await.unwrap();
    assert_eq!(map.capacity, 3);
    assert_eq!(map.available, 2);
    let occupied: Vec<Uuid> = map.seats.iter().filter(|s| s.occupied).map(|s| s.seat.id).collect();
    assert_eq!(occupied, vec![seats[1].id]);

    let missing = engine.seat_map(Uuid::new_v4()).await;
    assert!(matches!(rejection(missing), Rejection::TripNotFound(_)));
}

#[tokio::test]
async fn test_orders_for_owner_include_tickets() {
    let store = store().await;
    let engine = engine(&store);
    let (trip, seats) = store.seed_trip(100, 3);

    engine
        .book("alice", &booking(&trip, vec![passenger("Ada", "A", &seats[0])]))
        .await
        .unwrap();
    engine
        .book(
            "alice",
            &booking(&trip, vec![passenger("Bob", "B", &seats[1]), passenger("Cy", "C", &seats[2])]),
        )
        .await
        .unwrap();

    let orders = engine.orders_for_owner("alice").await.unwrap();
    assert_eq!(orders.len(), 2);
    assert_eq!(orders.iter().map(|o| o.tickets.len()).sum::<usize>(), 3);
    assert!(orders[0].order.created_at >= orders[1].order.created_at);

    assert!(engine.orders_for_owner("bob").await.unwrap().is_empty());
}
