//! Joy2-mouse: Joy-Con 2 optical mouse and gamepad driver
//!
//! This library talks to Joy-Con 2 controllers over unbonded BLE, decodes their
//! sensor reports and turns them into virtual mouse and gamepad input.

pub mod backend;
pub mod joycon2;
pub mod manager;
pub mod mapping;

// Re-export commonly used items
pub use backend::{VirtualDeviceBackend, VirtualDeviceSink};
pub use joycon2::{BleTransport, BtleplugTransport, LinkSession, Side};
pub use manager::{DriverError, JoyConManager};
pub use mapping::{Config, MappingExecutor};
