use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;
use transit_core::{
    InventoryStore, InventoryTx, LockKey, LockSet, Order, OrderKind, OrderStatus, PoolStatus,
    RefundRecord, Seat, StoreError, Ticket, TicketStatus, TicketTally, Trip,
};
use transit_shared::{IdentityNumber, Masked};

use crate::pool::PoolSettings;

// ============================================================================
// Error classification
// ============================================================================

/// Map a sqlx error onto the adapter-neutral taxonomy.
///
/// 40P01 deadlock_detected and 40001 serialization_failure are the classic
/// write-conflict signals. 23505 can only come from the one-valid-ticket
/// indexes racing, which a fresh attempt resolves into a proper rejection.
pub(crate) fn classify(err: sqlx::Error, settings: &PoolSettings) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40P01") | Some("40001") | Some("23505") => {
                StoreError::Conflict(db.message().to_string())
            }
            Some("55P03") => StoreError::LockTimeout(settings.lock_timeout()),
            _ => StoreError::Backend(err.to_string()),
        },
        sqlx::Error::PoolTimedOut => StoreError::PoolExhausted(settings.acquire_timeout()),
        sqlx::Error::PoolClosed => StoreError::PoolClosed,
        _ => StoreError::Backend(err.to_string()),
    }
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed inventory store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    settings: PoolSettings,
}

impl PgStore {
    pub async fn connect(connection_string: &str, settings: PoolSettings) -> Result<Self, StoreError> {
        settings.validate()?;

        let pool = PgPoolOptions::new()
            .min_connections(settings.min_idle)
            .max_connections(settings.max_size)
            .acquire_timeout(settings.acquire_timeout())
            .idle_timeout(settings.idle_timeout())
            .test_before_acquire(settings.test_before_acquire)
            .connect(connection_string)
            .await
            .map_err(|e| classify(e, &settings))?;

        info!(
            min_connections = settings.min_idle,
            max_connections = settings.max_size,
            "Database pool ready"
        );
        Ok(Self::from_pool(pool, settings))
    }

    /// Wrap an existing pool. Only the lock timeout and error classification
    /// are taken from `settings`; limits come from the pool itself.
    pub fn from_pool(pool: PgPool, settings: PoolSettings) -> Self {
        Self { pool, settings }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {}", e)))?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn InventoryTx>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| classify(e, &self.settings))?;

        // SET LOCAL does not accept bind parameters.
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.settings.lock_timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, &self.settings))?;

        Ok(Box::new(PgInventoryTx { tx: Some(tx), settings: self.settings.clone() }))
    }

    fn pool_status(&self) -> PoolStatus {
        let options = self.pool.options();
        let size = self.pool.size() as usize;
        let idle = self.pool.num_idle().min(size);
        PoolStatus {
            min_idle: options.get_min_connections() as usize,
            max_size: options.get_max_connections() as usize,
            acquire_timeout: options.get_acquire_timeout(),
            lock_timeout: self.settings.lock_timeout(),
            idle,
            in_use: size - idle,
            closed: self.pool.is_closed(),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

// ============================================================================
// Rows
// ============================================================================

#[derive(sqlx::FromRow)]
struct TripRow {
    id: Uuid,
    vehicle_id: Uuid,
    base_price_cents: i64,
    seat_count: i32,
}

#[derive(sqlx::FromRow)]
struct SeatRow {
    id: Uuid,
    vehicle_id: Uuid,
    seat_number: String,
    seat_type: String,
    carriage: String,
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    order_id: Uuid,
    trip_id: Uuid,
    seat_id: Uuid,
    passenger_name: String,
    identity_number: String,
    price_cents: i64,
    status: String,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    owner_id: String,
    trip_id: Uuid,
    total_cents: i64,
    ticket_count: i32,
    order_kind: String,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<TripRow> for Trip {
    fn from(row: TripRow) -> Self {
        Trip {
            id: row.id,
            vehicle_id: row.vehicle_id,
            base_price_cents: row.base_price_cents,
            seat_capacity: row.seat_count,
        }
    }
}

impl From<SeatRow> for Seat {
    fn from(row: SeatRow) -> Self {
        Seat {
            id: row.id,
            vehicle_id: row.vehicle_id,
            seat_number: row.seat_number,
            seat_type: row.seat_type,
            carriage: row.carriage,
        }
    }
}

impl TryFrom<TicketRow> for Ticket {
    type Error = StoreError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        Ok(Ticket {
            id: row.id,
            order_id: row.order_id,
            trip_id: row.trip_id,
            seat_id: row.seat_id,
            passenger_name: row.passenger_name,
            identity_number: Masked(row.identity_number),
            price_cents: row.price_cents,
            status: TicketStatus::parse(&row.status)?,
        })
    }
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            owner_id: row.owner_id,
            trip_id: row.trip_id,
            total_cents: row.total_cents,
            ticket_count: row.ticket_count,
            kind: OrderKind::parse(&row.order_kind)?,
            status: OrderStatus::parse(&row.status)?,
            created_at: row.created_at,
        })
    }
}

fn tickets_from(rows: Vec<TicketRow>) -> Result<Vec<Ticket>, StoreError> {
    rows.into_iter().map(Ticket::try_from).collect()
}

const TICKET_COLUMNS: &str =
    "t.id, t.order_id, t.trip_id, t.seat_id, t.passenger_name, t.identity_number, t.price_cents, t.status";

const ORDER_COLUMNS: &str =
    "id, owner_id, trip_id, total_cents, ticket_count, order_kind, status, created_at";

// ============================================================================
// Transaction
// ============================================================================

/// One open transaction. Dropping it unfinished lets sqlx roll it back before
/// the connection returns to the pool.
pub struct PgInventoryTx {
    tx: Option<Transaction<'static, Postgres>>,
    settings: PoolSettings,
}

impl PgInventoryTx {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| StoreError::Backend("transaction already finished".into()))
    }

    fn fail(&self, err: sqlx::Error) -> StoreError {
        classify(err, &self.settings)
    }

    async fn lock_rows(&mut self, table: &str, ids: &[Uuid]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!("SELECT id FROM {} WHERE id = ANY($1) ORDER BY id FOR UPDATE", table);
        let result = sqlx::query(&sql).bind(ids).fetch_all(self.conn()?).await;
        result.map(|_| ()).map_err(|e| self.fail(e))
    }
}

#[async_trait]
impl InventoryTx for PgInventoryTx {
    async fn acquire_locks(&mut self, keys: &LockSet) -> Result<(), StoreError> {
        // Identity and seat pairs may have no row yet, so they are held as
        // transaction-scoped advisory locks keyed on a stable hash.
        for key in keys.iter() {
            if matches!(key, LockKey::Identity { .. } | LockKey::Seat { .. }) {
                let result = sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                    .bind(key.to_string())
                    .execute(self.conn()?)
                    .await;
                result.map_err(|e| self.fail(e))?;
            }
        }

        self.lock_rows("tickets", &keys.ticket_ids()).await?;
        self.lock_rows("orders", &keys.order_ids()).await?;

        debug!(keys = keys.len(), "Inventory locks acquired");
        Ok(())
    }

    async fn trip(&mut self, trip_id: Uuid) -> Result<Option<Trip>, StoreError> {
        let result = sqlx::query_as::<_, TripRow>(
            r#"
            SELECT tr.id, tr.vehicle_id, tr.base_price_cents, v.seat_count
            FROM trips tr
            JOIN vehicles v ON v.id = tr.vehicle_id
            WHERE tr.id = $1
            "#,
        )
        .bind(trip_id)
        .fetch_optional(self.conn()?)
        .await;

        Ok(result.map_err(|e| self.fail(e))?.map(Trip::from))
    }

    async fn seats(&mut self, seat_ids: &[Uuid]) -> Result<Vec<Seat>, StoreError> {
        let result = sqlx::query_as::<_, SeatRow>(
            "SELECT id, vehicle_id, seat_number, seat_type, carriage FROM seats WHERE id = ANY($1)",
        )
        .bind(seat_ids)
        .fetch_all(self.conn()?)
        .await;

        Ok(result.map_err(|e| self.fail(e))?.into_iter().map(Seat::from).collect())
    }

    async fn vehicle_seats(&mut self, vehicle_id: Uuid) -> Result<Vec<Seat>, StoreError> {
        let result = sqlx::query_as::<_, SeatRow>(
            r#"
            SELECT id, vehicle_id, seat_number, seat_type, carriage
            FROM seats
            WHERE vehicle_id = $1
            ORDER BY carriage, seat_number
            "#,
        )
        .bind(vehicle_id)
        .fetch_all(self.conn()?)
        .await;

        Ok(result.map_err(|e| self.fail(e))?.into_iter().map(Seat::from).collect())
    }

    async fn valid_tickets_for_identities(
        &mut self,
        trip_id: Uuid,
        identities: &[IdentityNumber],
    ) -> Result<Vec<Ticket>, StoreError> {
        let raw: Vec<String> = identities.iter().map(|i| i.expose().clone()).collect();
        let sql = format!(
            "SELECT {} FROM tickets t WHERE t.trip_id = $1 AND t.identity_number = ANY($2) AND t.status = 'valid' FOR UPDATE",
            TICKET_COLUMNS
        );
        let result = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(trip_id)
            .bind(&raw)
            .fetch_all(self.conn()?)
            .await;

        tickets_from(result.map_err(|e| self.fail(e))?)
    }

    async fn valid_tickets_for_seats(
        &mut self,
        trip_id: Uuid,
        seat_ids: &[Uuid],
    ) -> Result<Vec<Ticket>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tickets t WHERE t.trip_id = $1 AND t.seat_id = ANY($2) AND t.status = 'valid' FOR UPDATE",
            TICKET_COLUMNS
        );
        let result = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(trip_id)
            .bind(seat_ids)
            .fetch_all(self.conn()?)
            .await;

        tickets_from(result.map_err(|e| self.fail(e))?)
    }

    async fn valid_tickets_for_trip(&mut self, trip_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tickets t WHERE t.trip_id = $1 AND t.status = 'valid'",
            TICKET_COLUMNS
        );
        let result = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(trip_id)
            .fetch_all(self.conn()?)
            .await;

        tickets_from(result.map_err(|e| self.fail(e))?)
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (id, owner_id, trip_id, total_cents, ticket_count, order_kind, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(order.id)
        .bind(&order.owner_id)
        .bind(order.trip_id)
        .bind(order.total_cents)
        .bind(order.ticket_count)
        .bind(order.kind.as_str())
        .bind(order.status.as_str())
        .bind(order.created_at)
        .execute(self.conn()?)
        .await;

        result.map(|_| ()).map_err(|e| self.fail(e))
    }

    async fn insert_ticket(&mut self, ticket: &Ticket) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tickets (id, order_id, trip_id, seat_id, passenger_name, identity_number, price_cents, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(ticket.id)
        .bind(ticket.order_id)
        .bind(ticket.trip_id)
        .bind(ticket.seat_id)
        .bind(&ticket.passenger_name)
        .bind(ticket.identity_number.expose())
        .bind(ticket.price_cents)
        .bind(ticket.status.as_str())
        .execute(self.conn()?)
        .await;

        result.map(|_| ()).map_err(|e| self.fail(e))
    }

    async fn owned_tickets(
        &mut self,
        owner_id: &str,
        ticket_ids: &[Uuid],
    ) -> Result<Vec<Ticket>, StoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM tickets t
            JOIN orders o ON o.id = t.order_id
            WHERE t.id = ANY($1) AND o.owner_id = $2
            ORDER BY t.id
            FOR UPDATE OF t
            "#,
            TICKET_COLUMNS
        );
        let result = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(ticket_ids)
            .bind(owner_id)
            .fetch_all(self.conn()?)
            .await;

        tickets_from(result.map_err(|e| self.fail(e))?)
    }

    async fn set_ticket_status(&mut self, ticket_id: Uuid, status: TicketStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tickets SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(ticket_id)
            .execute(self.conn()?)
            .await;

        result.map(|_| ()).map_err(|e| self.fail(e))
    }

    async fn insert_refund(&mut self, refund: &RefundRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO refunds (id, ticket_id, amount_cents, reason, refunded_at, handled_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(refund.id)
        .bind(refund.ticket_id)
        .bind(refund.amount_cents)
        .bind(&refund.reason)
        .bind(refund.refunded_at)
        .bind(&refund.handled_by)
        .execute(self.conn()?)
        .await;

        result.map(|_| ()).map_err(|e| self.fail(e))
    }

    async fn ticket_tally(&mut self, order_id: Uuid) -> Result<TicketTally, StoreError> {
        let result = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'valid') AS valid
            FROM tickets
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_one(self.conn()?)
        .await;

        let row = result.map_err(|e| self.fail(e))?;
        let total: i64 = row.try_get("total").map_err(|e| self.fail(e))?;
        let valid: i64 = row.try_get("valid").map_err(|e| self.fail(e))?;
        Ok(TicketTally { total, valid })
    }

    async fn set_order_status(&mut self, order_id: Uuid, status: OrderStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(order_id)
            .execute(self.conn()?)
            .await;

        result.map(|_| ()).map_err(|e| self.fail(e))
    }

    async fn orders_for_owner(&mut self, owner_id: &str) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {} FROM orders WHERE owner_id = $1 ORDER BY created_at DESC",
            ORDER_COLUMNS
        );
        let result = sqlx::query_as::<_, OrderRow>(&sql)
            .bind(owner_id)
            .fetch_all(self.conn()?)
            .await;

        result
            .map_err(|e| self.fail(e))?
            .into_iter()
            .map(Order::try_from)
            .collect()
    }

    async fn order_tickets(&mut self, order_id: Uuid) -> Result<Vec<Ticket>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tickets t WHERE t.order_id = $1 ORDER BY t.id",
            TICKET_COLUMNS
        );
        let result = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(order_id)
            .fetch_all(self.conn()?)
            .await;

        tickets_from(result.map_err(|e| self.fail(e))?)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.commit().await.map_err(|e| self.fail(e)),
            None => Err(StoreError::Backend("transaction already finished".into())),
        }
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(|e| self.fail(e)),
            None => Ok(()),
        }
    }
}
