//! In-process inventory store.
//!
//! Serves the API when no database is configured and backs the engine's
//! concurrency tests. Each transaction buffers its writes and applies them
//! atomically on commit; exclusive holds come from a keyed table of async
//! mutexes that stay locked until the transaction ends.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit};
use tracing::{debug, warn};
use uuid::Uuid;
use transit_core::{
    InventoryStore, InventoryTx, LockKey, LockSet, Order, OrderStatus, PoolStatus, RefundRecord,
    Seat, StoreError, Ticket, TicketStatus, TicketTally, Trip,
};
use transit_shared::IdentityNumber;

use crate::pool::{PoolSettings, SessionLimiter};

#[derive(Default)]
struct Tables {
    trips: HashMap<Uuid, Trip>,
    seats: HashMap<Uuid, Seat>,
    orders: HashMap<Uuid, Order>,
    tickets: HashMap<Uuid, Ticket>,
    refunds: Vec<RefundRecord>,
}

struct Shared {
    tables: Mutex<Tables>,
    locks: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    failing_commits: AtomicUsize,
    lock_timeout: Duration,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_slot(&self, key: &LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop table entries nobody holds or waits on.
    fn prune_locks(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    sessions: SessionLimiter,
}

impl MemoryStore {
    pub async fn open(settings: PoolSettings) -> Result<Self, StoreError> {
        let shared = Arc::new(Shared {
            tables: Mutex::new(Tables::default()),
            locks: Mutex::new(HashMap::new()),
            failing_commits: AtomicUsize::new(0),
            lock_timeout: settings.lock_timeout(),
        });
        let sessions = SessionLimiter::new(settings)?;
        Ok(Self { shared, sessions })
    }

    pub fn register_trip(&self, trip: Trip, seats: Vec<Seat>) {
        let mut tables = self.shared.tables();
        for seat in seats {
            tables.seats.insert(seat.id, seat);
        }
        tables.trips.insert(trip.id, trip);
    }

    /// Creates a vehicle with `seat_count` seats in carriage "1" and a trip on it.
    pub fn seed_trip(&self, base_price_cents: i64, seat_count: usize) -> (Trip, Vec<Seat>) {
        let vehicle_id = Uuid::new_v4();
        let seats: Vec<Seat> = (1..=seat_count)
            .map(|n| Seat {
                id: Uuid::new_v4(),
                vehicle_id,
                seat_number: format!("{:02}", n),
                seat_type: "standard".to_string(),
                carriage: "1".to_string(),
            })
            .collect();
        let trip = Trip {
            id: Uuid::new_v4(),
            vehicle_id,
            base_price_cents,
            seat_capacity: seat_count as i32,
        };
        self.register_trip(trip.clone(), seats.clone());
        (trip, seats)
    }

    /// Make the next `count` commits fail with a write conflict.
    pub fn fail_next_commits(&self, count: usize) {
        self.shared.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.shared.tables().tickets.values().cloned().collect()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.shared.tables().orders.values().cloned().collect()
    }

    pub fn order(&self, order_id: Uuid) -> Option<Order> {
        self.shared.tables().orders.get(&order_id).cloned()
    }

    pub fn refunds(&self) -> Vec<RefundRecord> {
        self.shared.tables().refunds.clone()
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn InventoryTx>, StoreError> {
        let slot = self.sessions.acquire().await?;
        Ok(Box::new(MemoryTx {
            shared: self.shared.clone(),
            _slot: slot,
            held: HashSet::new(),
            guards: Vec::new(),
            delta: Delta::default(),
        }))
    }

    fn pool_status(&self) -> PoolStatus {
        self.sessions.status()
    }

    async fn close(&self) {
        self.sessions.close();
    }
}

/// Writes made by one transaction, invisible to others until commit.
#[derive(Default)]
struct Delta {
    orders: Vec<Order>,
    tickets: Vec<Ticket>,
    ticket_status: HashMap<Uuid, TicketStatus>,
    order_status: HashMap<Uuid, OrderStatus>,
    refunds: Vec<RefundRecord>,
}

impl Delta {
    fn overlay_ticket(&self, ticket: &Ticket) -> Ticket {
        let mut ticket = ticket.clone();
        if let Some(status) = self.ticket_status.get(&ticket.id) {
            ticket.status = *status;
        }
        ticket
    }

    fn overlay_order(&self, order: &Order) -> Order {
        let mut order = order.clone();
        if let Some(status) = self.order_status.get(&order.id) {
            order.status = *status;
        }
        order
    }
}

pub struct MemoryTx {
    shared: Arc<Shared>,
    _slot: OwnedSemaphorePermit,
    held: HashSet<LockKey>,
    guards: Vec<OwnedMutexGuard<()>>,
    delta: Delta,
}

impl MemoryTx {
    /// Tickets visible to this transaction that satisfy `keep`.
    fn visible_tickets<F>(&self, keep: F) -> Vec<Ticket>
    where
        F: Fn(&Ticket) -> bool,
    {
        let tables = self.shared.tables();
        tables
            .tickets
            .values()
            .map(|t| self.delta.overlay_ticket(t))
            .chain(self.delta.tickets.iter().map(|t| self.delta.overlay_ticket(t)))
            .filter(|t| keep(t))
            .collect()
    }

    fn visible_order(&self, order_id: Uuid) -> Option<Order> {
        let tables = self.shared.tables();
        tables
            .orders
            .get(&order_id)
            .or_else(|| self.delta.orders.iter().find(|o| o.id == order_id))
            .map(|o| self.delta.overlay_order(o))
    }

    fn release(&mut self) {
        self.delta = Delta::default();
        self.held.clear();
        self.guards.clear();
        self.shared.prune_locks();
    }

    /// Apply the delta, refusing anything that would break the one-valid-ticket
    /// rules or double-refund a ticket.
    fn apply(&mut self) -> Result<(), StoreError> {
        let delta = std::mem::take(&mut self.delta);
        let mut tables = self.shared.tables();

        for (ticket_id, status) in &delta.ticket_status {
            match tables.tickets.get(ticket_id).map(|t| t.status) {
                Some(TicketStatus::Refunded) if *status == TicketStatus::Refunded => {
                    return Err(StoreError::Conflict(format!("ticket {} refunded concurrently", ticket_id)));
                }
                Some(_) => {}
                None if delta.tickets.iter().any(|t| t.id == *ticket_id) => {}
                None => return Err(StoreError::Conflict(format!("ticket {} vanished", ticket_id))),
            }
        }

        for ticket in &delta.tickets {
            let clash = tables.tickets.values().any(|t| {
                t.is_valid()
                    && delta.ticket_status.get(&t.id) != Some(&TicketStatus::Refunded)
                    && t.trip_id == ticket.trip_id
                    && (t.seat_id == ticket.seat_id || t.identity_number == ticket.identity_number)
            });
            if clash {
                return Err(StoreError::Conflict(format!(
                    "seat or identity already ticketed on trip {}",
                    ticket.trip_id
                )));
            }
        }

        for order in delta.orders {
            tables.orders.insert(order.id, order);
        }
        for ticket in delta.tickets {
            tables.tickets.insert(ticket.id, ticket);
        }
        for (ticket_id, status) in delta.ticket_status {
            if let Some(ticket) = tables.tickets.get_mut(&ticket_id) {
                ticket.status = status;
            }
        }
        for (order_id, status) in delta.order_status {
            if let Some(order) = tables.orders.get_mut(&order_id) {
                order.status = status;
            }
        }
        tables.refunds.extend(delta.refunds);
        Ok(())
    }
}

#[async_trait]
impl InventoryTx for MemoryTx {
    async fn acquire_locks(&mut self, keys: &LockSet) -> Result<(), StoreError> {
        for key in keys.iter() {
            if self.held.contains(key) {
                continue;
            }
            let slot = self.shared.lock_slot(key);
            let guard = tokio::time::timeout(self.shared.lock_timeout, slot.lock_owned())
                .await
                .map_err(|_| {
                    warn!(key = %key, "Lock wait timed out");
                    StoreError::LockTimeout(self.shared.lock_timeout)
                })?;
            self.guards.push(guard);
            self.held.insert(key.clone());
        }
        debug!(keys = keys.len(), "Inventory locks acquired");
        Ok(())
    }

    async fn trip(&mut self, trip_id: Uuid) -> Result<Option<Trip>, StoreError> {
        Ok(self.shared.tables().trips.get(&trip_id).cloned())
    }

    async fn seats(&mut self, seat_ids: &[Uuid]) -> Result<Vec<Seat>, StoreError> {
        let tables = self.shared.tables();
        Ok(seat_ids.iter().filter_map(|id| tables.seats.get(id).cloned()).collect())
    }

    async fn vehicle_seats(&mut self, vehicle_id: Uuid) -> Result<Vec<Seat>, StoreError> {
        let tables = self.shared.tables();
        Ok(tables
            .seats
            .values()
            .filter(|s| s.vehicle_id == vehicle_id)
            .cloned()
            .collect())
    }

    async fn valid_tickets_for_identities(
        &mut self,
        trip_id: Uuid,
        identities: &[IdentityNumber],
    ) -> Result<Vec<Ticket>, StoreError> {
        Ok(self.visible_tickets(|t| {
            t.trip_id == trip_id && t.is_valid() && identities.contains(&t.identity_number)
        }))
    }

    async fn valid_tickets_for_seats(
        &mut self,
        trip_id: Uuid,
        seat_ids: &[Uuid],
    ) -> Result<Vec<Ticket>, StoreError> {
        Ok(self.visible_tickets(|t| t.trip_id == trip_id && t.is_valid() && seat_ids.contains(&t.seat_id)))
    }

    async fn valid_tickets_for_trip(&mut self, trip_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        Ok(self.visible_tickets(|t| t.trip_id == trip_id && t.is_valid()))
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        self.delta.orders.push(order.clone());
        Ok(())
    }

    async fn insert_ticket(&mut self, ticket: &Ticket) -> Result<(), StoreError> {
        self.delta.tickets.push(ticket.clone());
        Ok(())
    }

    async fn owned_tickets(
        &mut self,
        owner_id: &str,
        ticket_ids: &[Uuid],
    ) -> Result<Vec<Ticket>, StoreError> {
        let candidates = self.visible_tickets(|t| ticket_ids.contains(&t.id));
        let mut owned: Vec<Ticket> = candidates
            .into_iter()
            .filter(|t| {
                self.visible_order(t.order_id)
                    .map(|o| o.owner_id == owner_id)
                    .unwrap_or(false)
            })
            .collect();
        owned.sort_by_key(|t| t.id);
        Ok(owned)
    }

    async fn set_ticket_status(&mut self, ticket_id: Uuid, status: TicketStatus) -> Result<(), StoreError> {
        self.delta.ticket_status.insert(ticket_id, status);
        Ok(())
    }

    async fn insert_refund(&mut self, refund: &RefundRecord) -> Result<(), StoreError> {
        self.delta.refunds.push(refund.clone());
        Ok(())
    }

    async fn ticket_tally(&mut self, order_id: Uuid) -> Result<TicketTally, StoreError> {
        let tickets = self.visible_tickets(|t| t.order_id == order_id);
        Ok(TicketTally {
            total: tickets.len() as i64,
            valid: tickets.iter().filter(|t| t.is_valid()).count() as i64,
        })
    }

    async fn set_order_status(&mut self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError> {
        self.delta.order_status.insert(order_id, status);
        Ok(())
    }

    async fn orders_for_owner(&mut self, owner_id: &str) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = {
            let tables = self.shared.tables();
            tables
                .orders
                .values()
                .chain(self.delta.orders.iter())
                .filter(|o| o.owner_id == owner_id)
                .map(|o| self.delta.overlay_order(o))
                .collect()
        };
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn order_tickets(&mut self, order_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let mut tickets = self.visible_tickets(|t| t.order_id == order_id);
        tickets.sort_by_key(|t| t.id);
        Ok(tickets)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let injected = self
            .shared
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if injected {
            Err(StoreError::Conflict("injected commit failure".to_string()))
        } else {
            self.apply()
        };
        self.release();
        result
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.guards.clear();
        self.shared.prune_locks();
    }
}
