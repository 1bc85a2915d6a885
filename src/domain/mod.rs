//! Domain layer - Port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod ports;

#[cfg(test)]
pub(crate) mod fakes;

pub use ports::*;
