//! Domain error types.

mod capacity_violation;
mod decode_error;
mod load_error;
mod storage_error;
mod transport_error;

pub use capacity_violation::CapacityViolation;
pub use decode_error::DecodeError;
pub use load_error::LoadError;
pub use storage_error::StorageError;
pub use transport_error::TransportError;
