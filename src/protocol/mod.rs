//! Worker protocol: envelope codec and payload records

pub mod envelope;
pub mod types;

pub use envelope::{decode, encode, Envelope, Payload, RequestKind};
pub use types::*;
