//! Mock implementations for testing.

pub mod fixtures;
mod network;
pub use network::{Chain, Error as ChainError, Network};
mod service;
pub use service::{Error, Service};
