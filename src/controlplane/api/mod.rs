//! API Module
//!
//! REST API over the reconcilers of all endpoint types.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
