//! Mapping module - turns Joy-Con reports into mouse and gamepad events

pub mod config;
pub mod executor;
pub mod gesture;
pub mod mapper;
pub mod mode;

pub use config::{Config, ConfigError};
pub use executor::{MappingExecutor, TopologyChange};
pub use mapper::InputMapper;
pub use mode::{DeviceMode, ModeMachine, Role, Topology};
