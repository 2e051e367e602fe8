//! Wire contract of the station: identity, topics and payloads
//!
//! Everything published to the broker is shaped here. The rest of the crate
//! only ever sees `(topic, payload)` pairs.

pub mod builder;
pub mod messages;
pub mod topics;

pub use builder::*;
pub use messages::*;
pub use topics::*;
