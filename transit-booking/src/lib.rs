pub mod booking;
pub mod engine;
pub mod refund;
pub mod retry;

pub use engine::BookingEngine;
pub use retry::{retry_with_predicate, RetryError, RetryPolicy};
