pub mod error;
pub mod lock;
pub mod models;
pub mod repository;

pub use error::{EngineError, EngineResult, Rejection, RejectionKind, StoreError};
pub use lock::{LockKey, LockSet};
pub use models::{
    BookingReceipt, BookingRequest, Order, OrderDetails, OrderKind, OrderStatus, PassengerRequest,
    RefundReceipt, RefundRecord, RefundRequest, Seat, SeatAvailability, SeatMap, Ticket,
    TicketStatus, TicketTally, Trip,
};
pub use repository::{InventoryStore, InventoryTx, PoolStatus};
