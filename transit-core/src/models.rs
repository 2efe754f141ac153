use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use transit_shared::IdentityNumber;

use crate::error::StoreError;

/// A scheduled departure. Read-only to the booking engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trip {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub base_price_cents: i64,
    pub seat_capacity: i32,
}

/// A physical seat slot on a vehicle, reused by every trip of that vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Seat {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub seat_number: String,
    pub seat_type: String,
    pub carriage: String,
}

/// Ticket lifecycle. `Refunded` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Valid,
    Refunded,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Valid => "valid",
            TicketStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "valid" => Ok(TicketStatus::Valid),
            "refunded" => Ok(TicketStatus::Refunded),
            other => Err(StoreError::Corrupt(format!("unknown ticket status '{}'", other))),
        }
    }
}

/// Order lifecycle. `Refunded` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Confirmed,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "confirmed" => Ok(OrderStatus::Confirmed),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(StoreError::Corrupt(format!("unknown order status '{}'", other))),
        }
    }

    /// Status an order must carry given the current states of its tickets.
    pub fn from_tally(tally: &TicketTally) -> Self {
        if tally.total > 0 && tally.valid == 0 {
            OrderStatus::Refunded
        } else {
            OrderStatus::Confirmed
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Individual,
    Group,
}

impl OrderKind {
    pub fn for_ticket_count(count: usize) -> Self {
        if count > 1 {
            OrderKind::Group
        } else {
            OrderKind::Individual
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Individual => "individual",
            OrderKind::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "individual" => Ok(OrderKind::Individual),
            "group" => Ok(OrderKind::Group),
            other => Err(StoreError::Corrupt(format!("unknown order kind '{}'", other))),
        }
    }
}

/// One passenger's claim on one seat for one trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub order_id: Uuid,
    pub trip_id: Uuid,
    pub seat_id: Uuid,
    pub passenger_name: String,
    pub identity_number: IdentityNumber,
    pub price_cents: i64,
    pub status: TicketStatus,
}

impl Ticket {
    pub fn issue(order: &Order, passenger: &PassengerRequest, price_cents: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order.id,
            trip_id: order.trip_id,
            seat_id: passenger.seat_id,
            passenger_name: passenger.name.trim().to_string(),
            identity_number: passenger.identity_number.clone(),
            price_cents,
            status: TicketStatus::Valid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == TicketStatus::Valid
    }

    /// Mark as refunded (never delete). Fails if already refunded.
    pub fn refund(&mut self) -> Result<(), TicketStatus> {
        match self.status {
            TicketStatus::Valid => {
                self.status = TicketStatus::Refunded;
                Ok(())
            }
            current => Err(current),
        }
    }
}

/// A purchase grouping the tickets bought in one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub owner_id: String,
    pub trip_id: Uuid,
    pub total_cents: i64,
    pub ticket_count: i32,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn confirmed(owner_id: &str, trip_id: Uuid, ticket_count: usize, total_cents: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            trip_id,
            total_cents,
            ticket_count: ticket_count as i32,
            kind: OrderKind::for_ticket_count(ticket_count),
            status: OrderStatus::Confirmed,
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit entry, one per refunded ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRecord {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub amount_cents: i64,
    pub reason: String,
    pub refunded_at: DateTime<Utc>,
    pub handled_by: String,
}

impl RefundRecord {
    pub fn for_ticket(ticket: &Ticket, reason: &str, handled_by: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id: ticket.id,
            amount_cents: ticket.price_cents,
            reason: reason.to_string(),
            refunded_at: Utc::now(),
            handled_by: handled_by.to_string(),
        }
    }
}

/// Ticket counts under one order, as seen inside the current transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TicketTally {
    pub total: i64,
    pub valid: i64,
}

// ============================================================================
// Requests and receipts
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassengerRequest {
    pub name: String,
    pub identity_number: IdentityNumber,
    pub seat_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRequest {
    pub trip_id: Uuid,
    pub passengers: Vec<PassengerRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BookingReceipt {
    pub order_id: Uuid,
    pub total_cents: i64,
    pub ticket_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub ticket_ids: Vec<Uuid>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_cents: i64,
    pub refunded_ticket_ids: Vec<Uuid>,
    /// Orders that reached `refunded` as a result of this request.
    pub refunded_orders: Vec<Uuid>,
}

// ============================================================================
// Read models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatAvailability {
    #[serde(flatten)]
    pub seat: Seat,
    pub occupied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatMap {
    pub trip_id: Uuid,
    pub capacity: i32,
    pub available: i32,
    pub seats: Vec<SeatAvailability>,
}

impl SeatMap {
    /// Builds the map from the vehicle's seats and the trip's valid tickets.
    pub fn build(trip: &Trip, mut seats: Vec<Seat>, valid_tickets: &[Ticket]) -> Self {
        seats.sort_by(|a, b| {
            a.carriage
                .cmp(&b.carriage)
                .then_with(|| a.seat_number.cmp(&b.seat_number))
        });

        let seats: Vec<SeatAvailability> = seats
            .into_iter()
            .map(|seat| {
                let occupied = valid_tickets
                    .iter()
                    .any(|t| t.seat_id == seat.id && t.is_valid());
                SeatAvailability { seat, occupied }
            })
            .collect();

        let occupied = seats.iter().filter(|s| s.occupied).count() as i32;

        Self {
            trip_id: trip.id,
            capacity: trip.seat_capacity,
            available: (trip.seat_capacity - occupied).max(0),
            seats,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub tickets: Vec<Ticket>,
}
