use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;
use transit_core::{
    BookingReceipt, BookingRequest, EngineResult, InventoryTx, LockSet, Order, Rejection, Ticket,
};
use transit_shared::IdentityNumber;

/// Checks that need no storage access. Runs once, before any attempt.
pub fn validate_booking(request: &BookingRequest) -> Result<(), Rejection> {
    if request.passengers.is_empty() {
        return Err(Rejection::EmptyBooking);
    }

    for (index, passenger) in request.passengers.iter().enumerate() {
        if passenger.name.trim().is_empty() || passenger.identity_number.expose().trim().is_empty() {
            return Err(Rejection::InvalidPassenger { index });
        }
    }

    let mut identities = HashSet::new();
    if !request.passengers.iter().all(|p| identities.insert(p.identity_number.expose())) {
        return Err(Rejection::DuplicateIdentity);
    }

    let mut seats = HashSet::new();
    for passenger in &request.passengers {
        if !seats.insert(passenger.seat_id) {
            return Err(Rejection::DuplicateSeat(passenger.seat_id));
        }
    }

    Ok(())
}

/// One booking attempt inside an open transaction. Re-reads everything it
/// decides on; the caller commits or rolls back.
pub async fn book_in_tx(
    tx: &mut dyn InventoryTx,
    owner_id: &str,
    request: &BookingRequest,
) -> EngineResult<BookingReceipt> {
    let trip_id = request.trip_id;
    let identities: Vec<IdentityNumber> = request
        .passengers
        .iter()
        .map(|p| p.identity_number.clone())
        .collect();
    let seat_ids: Vec<Uuid> = request.passengers.iter().map(|p| p.seat_id).collect();

    // Hold every identity and seat before looking at availability.
    let keys = LockSet::for_booking(trip_id, identities.iter(), seat_ids.iter().copied());
    tx.acquire_locks(&keys).await?;

    let ticketed = tx.valid_tickets_for_identities(trip_id, &identities).await?;
    if !ticketed.is_empty() {
        for ticket in &ticketed {
            debug!(identity = %ticket.identity_number.tail(), trip_id = %trip_id, "Identity already holds a valid ticket");
        }
        return Err(Rejection::IdentityAlreadyTicketed { count: ticketed.len() }.into());
    }

    let taken = tx.valid_tickets_for_seats(trip_id, &seat_ids).await?;
    if !taken.is_empty() {
        let mut occupied: Vec<Uuid> = taken.iter().map(|t| t.seat_id).collect();
        occupied.sort();
        occupied.dedup();
        return Err(Rejection::SeatUnavailable(occupied).into());
    }

    let trip = tx
        .trip(trip_id)
        .await?
        .ok_or(Rejection::TripNotFound(trip_id))?;

    let seats = tx.seats(&seat_ids).await?;
    for seat_id in &seat_ids {
        let on_vehicle = seats
            .iter()
            .any(|s| s.id == *seat_id && s.vehicle_id == trip.vehicle_id);
        if !on_vehicle {
            return Err(Rejection::SeatNotOnTrip(*seat_id).into());
        }
    }

    let count = request.passengers.len();
    let total_cents = i64::try_from(count)
        .ok()
        .and_then(|n| trip.base_price_cents.checked_mul(n))
        .ok_or(Rejection::PriceOverflow)?;

    let order = Order::confirmed(owner_id, trip_id, count, total_cents);
    tx.insert_order(&order).await?;

    let mut ticket_ids = Vec::with_capacity(count);
    for passenger in &request.passengers {
        let ticket = Ticket::issue(&order, passenger, trip.base_price_cents);
        tx.insert_ticket(&ticket).await?;
        ticket_ids.push(ticket.id);
    }

    debug!(order_id = %order.id, trip_id = %trip_id, tickets = count, "Booking staged");

    Ok(BookingReceipt {
        order_id: order.id,
        total_cents,
        ticket_ids,
    })
}
