use std::collections::{BTreeSet, HashSet};
use tracing::debug;
use uuid::Uuid;
use transit_core::{
    EngineResult, InventoryTx, LockSet, OrderStatus, RefundReceipt, RefundRecord, RefundRequest,
    Rejection, TicketStatus,
};

pub fn validate_refund(request: &RefundRequest) -> Result<(), Rejection> {
    if request.ticket_ids.is_empty() {
        return Err(Rejection::EmptyRefund);
    }
    let mut seen = HashSet::new();
    for id in &request.ticket_ids {
        if !seen.insert(*id) {
            return Err(Rejection::DuplicateTicket(*id));
        }
    }
    Ok(())
}

/// One refund attempt inside an open transaction.
///
/// A batch may span several orders. Every touched order is locked after the
/// tickets and its status recomputed from the tickets it holds at this point
/// in the transaction.
pub async fn refund_in_tx(
    tx: &mut dyn InventoryTx,
    requester_id: &str,
    request: &RefundRequest,
) -> EngineResult<RefundReceipt> {
    tx.acquire_locks(&LockSet::for_tickets(request.ticket_ids.iter().copied()))
        .await?;

    let mut tickets = tx.owned_tickets(requester_id, &request.ticket_ids).await?;
    if tickets.len() != request.ticket_ids.len() {
        return Err(Rejection::TicketsNotFound.into());
    }

    if let Some(spent) = tickets.iter().find(|t| !t.is_valid()) {
        return Err(Rejection::TicketNotRefundable(spent.id).into());
    }

    let mut refund_cents: i64 = 0;
    let mut refunded_ticket_ids = Vec::with_capacity(tickets.len());
    for ticket in tickets.iter_mut() {
        ticket
            .refund()
            .map_err(|_| Rejection::TicketNotRefundable(ticket.id))?;
        tx.set_ticket_status(ticket.id, TicketStatus::Refunded).await?;
        tx.insert_refund(&RefundRecord::for_ticket(ticket, &request.reason, requester_id))
            .await?;
        refund_cents = refund_cents.saturating_add(ticket.price_cents);
        refunded_ticket_ids.push(ticket.id);
    }

    let order_ids: BTreeSet<Uuid> = tickets.iter().map(|t| t.order_id).collect();
    tx.acquire_locks(&LockSet::for_orders(order_ids.iter().copied()))
        .await?;

    let mut refunded_orders = Vec::new();
    for order_id in order_ids {
        let tally = tx.ticket_tally(order_id).await?;
        let status = OrderStatus::from_tally(&tally);
        tx.set_order_status(order_id, status).await?;
        if status == OrderStatus::Refunded {
            refunded_orders.push(order_id);
        }
    }

    debug!(
        tickets = refunded_ticket_ids.len(),
        orders_closed = refunded_orders.len(),
        "Refund staged"
    );

    Ok(RefundReceipt {
        refund_cents,
        refunded_ticket_ids,
        refunded_orders,
    })
}
