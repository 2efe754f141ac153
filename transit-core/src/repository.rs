use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::lock::LockSet;
use crate::models::{Order, OrderStatus, RefundRecord, Seat, Ticket, TicketStatus, TicketTally, Trip};
use transit_shared::IdentityNumber;

/// Read-only snapshot of the session pool for operational monitoring.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub min_idle: usize,
    pub max_size: usize,
    #[serde(with = "millis")]
    pub acquire_timeout: Duration,
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
    pub idle: usize,
    pub in_use: usize,
    pub closed: bool,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Entry point of a storage adapter: hands out transactions on pooled sessions.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Borrow a session and open a transaction on it.
    async fn begin(&self) -> Result<Box<dyn InventoryTx>, StoreError>;

    fn pool_status(&self) -> PoolStatus;

    /// Stop handing out sessions and release idle ones.
    async fn close(&self);
}

/// One open transaction.
///
/// Every mutation of tickets, orders and refunds goes through a transaction
/// that first takes the relevant keys with [`InventoryTx::acquire_locks`].
/// Dropping a transaction without `commit` rolls it back and discards its
/// session.
#[async_trait]
pub trait InventoryTx: Send {
    /// Take exclusive storage-level holds on every key, in set order. Blocks
    /// behind concurrent holders for at most the configured lock timeout.
    async fn acquire_locks(&mut self, keys: &LockSet) -> Result<(), StoreError>;

    async fn trip(&mut self, trip_id: Uuid) -> Result<Option<Trip>, StoreError>;

    async fn seats(&mut self, seat_ids: &[Uuid]) -> Result<Vec<Seat>, StoreError>;

    async fn vehicle_seats(&mut self, vehicle_id: Uuid) -> Result<Vec<Seat>, StoreError>;

    async fn valid_tickets_for_identities(
        &mut self,
        trip_id: Uuid,
        identities: &[IdentityNumber],
    ) -> Result<Vec<Ticket>, StoreError>;

    async fn valid_tickets_for_seats(
        &mut self,
        trip_id: Uuid,
        seat_ids: &[Uuid],
    ) -> Result<Vec<Ticket>, StoreError>;

    async fn valid_tickets_for_trip(&mut self, trip_id: Uuid) -> Result<Vec<Ticket>, StoreError>;

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn insert_ticket(&mut self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Tickets among `ticket_ids` whose order belongs to `owner_id`.
    async fn owned_tickets(
        &mut self,
        owner_id: &str,
        ticket_ids: &[Uuid],
    ) -> Result<Vec<Ticket>, StoreError>;

    async fn set_ticket_status(&mut self, ticket_id: Uuid, status: TicketStatus) -> Result<(), StoreError>;

    async fn insert_refund(&mut self, refund: &RefundRecord) -> Result<(), StoreError>;

    async fn ticket_tally(&mut self, order_id: Uuid) -> Result<TicketTally, StoreError>;

    async fn set_order_status(&mut self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError>;

    /// Orders of `owner_id`, newest first.
    async fn orders_for_owner(&mut self, owner_id: &str) -> Result<Vec<Order>, StoreError>;

    async fn order_tickets(&mut self, order_id: Uuid) -> Result<Vec<Ticket>, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
