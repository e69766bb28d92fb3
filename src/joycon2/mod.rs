//! Joy-Con 2 controller support
//!
//! This module provides the controller side of the driver:
//! - BLE discovery and unbonded connection
//! - The telemetry codec
//! - Link sessions with reconnection

pub mod btle;
pub mod connection;
pub mod constants;
pub mod discovery;
pub mod mock;
pub mod protocol;
pub mod types;

// Re-export commonly used items
pub use btle::BtleplugTransport;
pub use connection::*;
pub use constants::*;
pub use discovery::*;
pub use protocol::*;
pub use types::*;
