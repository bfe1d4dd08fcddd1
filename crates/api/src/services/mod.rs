//! Outbound service clients.

pub mod anchor_client;

pub use anchor_client::{CircuitState, HttpAnchorClient};
