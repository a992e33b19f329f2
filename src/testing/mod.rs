//! Testing utilities and mock implementations
//!
//! Mocks for exercising the broker connection and the command router without
//! a live MQTT broker.

pub mod mocks;

pub use mocks::*;
