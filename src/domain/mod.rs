//! Domain layer - value types and port definitions
//!
//! This module defines the descriptor building blocks and the traits (ports)
//! that the storage controller and HA daemon adapters implement.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
