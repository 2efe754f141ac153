pub mod pii;

pub use pii::{IdentityNumber, Masked};
