//! Testing utilities and mock implementations
//!
//! Lets the scheduler and connection manager run without a broker, a
//! database, or real disks.

pub mod mocks;

pub use mocks::*;
