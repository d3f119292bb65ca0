//! Types shared by every Vigil crate: identifiers, enumerations, constants
//! and the change-notification protocol pushed by the backend.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
