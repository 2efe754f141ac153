use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use transit_core::{
    BookingReceipt, BookingRequest, EngineError, EngineResult, InventoryStore, InventoryTx,
    OrderDetails, PoolStatus, RefundReceipt, RefundRequest, Rejection, SeatMap,
};

use crate::booking::{book_in_tx, validate_booking};
use crate::refund::{refund_in_tx, validate_refund};
use crate::retry::{retry_with_predicate, RetryError, RetryPolicy};

/// Transactional booking and refund over an [`InventoryStore`].
#[derive(Clone)]
pub struct BookingEngine {
    store: Arc<dyn InventoryStore>,
    retry: RetryPolicy,
}

impl BookingEngine {
    pub fn new(store: Arc<dyn InventoryStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Book every passenger of the request under one new order, or nothing.
    #[instrument(skip(self, request), fields(trip_id = %request.trip_id, passengers = request.passengers.len()))]
    pub async fn book(&self, owner_id: &str, request: &BookingRequest) -> EngineResult<BookingReceipt> {
        validate_booking(request)?;

        let receipt = self
            .with_retry(move || async move {
                let mut tx = self.store.begin().await?;
                let outcome = book_in_tx(tx.as_mut(), owner_id, request).await;
                finish(tx, outcome).await
            })
            .await?;

        info!(order_id = %receipt.order_id, total_cents = receipt.total_cents, "Booking confirmed");
        Ok(receipt)
    }

    /// Refund the listed tickets of `requester_id`, all or nothing.
    #[instrument(skip(self, request), fields(tickets = request.ticket_ids.len()))]
    pub async fn refund(&self, requester_id: &str, request: &RefundRequest) -> EngineResult<RefundReceipt> {
        validate_refund(request)?;

        let receipt = self
            .with_retry(move || async move {
                let mut tx = self.store.begin().await?;
                let outcome = refund_in_tx(tx.as_mut(), requester_id, request).await;
                finish(tx, outcome).await
            })
            .await?;

        info!(
            refund_cents = receipt.refund_cents,
            orders_refunded = receipt.refunded_orders.len(),
            "Refund completed"
        );
        Ok(receipt)
    }

    /// Seats of the trip's vehicle with their occupancy.
    pub async fn seat_map(&self, trip_id: Uuid) -> EngineResult<SeatMap> {
        let mut tx = self.store.begin().await?;
        let outcome = async {
            let trip = tx
                .trip(trip_id)
                .await?
                .ok_or(Rejection::TripNotFound(trip_id))?;
            let seats = tx.vehicle_seats(trip.vehicle_id).await?;
            let tickets = tx.valid_tickets_for_trip(trip_id).await?;
            Ok::<_, EngineError>(SeatMap::build(&trip, seats, &tickets))
        }
        .await;
        finish(tx, outcome).await
    }

    /// The owner's orders, newest first, each with its tickets.
    pub async fn orders_for_owner(&self, owner_id: &str) -> EngineResult<Vec<OrderDetails>> {
        let mut tx = self.store.begin().await?;
        let outcome = async {
            let orders = tx.orders_for_owner(owner_id).await?;
            let mut details = Vec::with_capacity(orders.len());
            for order in orders {
                let tickets = tx.order_tickets(order.id).await?;
                details.push(OrderDetails { order, tickets });
            }
            Ok::<_, EngineError>(details)
        }
        .await;
        finish(tx, outcome).await
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.store.pool_status()
    }

    pub async fn shutdown(&self) {
        info!("Closing inventory store");
        self.store.close().await;
    }

    async fn with_retry<F, Fut, T>(&self, operation: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        retry_with_predicate(&self.retry, operation, EngineError::is_transient)
            .await
            .map_err(|err| match err {
                RetryError::Permanent(e) => e,
                RetryError::Exhausted { attempts, last } => {
                    warn!(attempts, error = %last, "Giving up on contended transaction");
                    EngineError::Busy(format!("too much contention after {} attempts", attempts))
                }
            })
    }
}

/// Commit on success, roll back on failure. A failed rollback is logged; the
/// original error still wins.
async fn finish<T>(mut tx: Box<dyn InventoryTx>, outcome: EngineResult<T>) -> EngineResult<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
