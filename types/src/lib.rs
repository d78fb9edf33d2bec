pub mod api;
pub mod error;
pub mod execution;
pub mod shuffling;

pub use error::{DataUnavailable, ProtocolViolation, TimeoutExpiry, ValidationError};
pub use execution::{transaction_namespace, NAMESPACE};
