//! Joy-Con 2 protocol constants
//!
//! This module contains the constants needed to talk to a Joy-Con 2 over an
//! unbonded BLE link:
//! - BLE UUIDs and manufacturer data used for discovery
//! - The sensor command template used to enable the telemetry stream
//! - Timing defaults for the link session

use uuid::Uuid;

// ============================================================================
// BLE Discovery Constants
// ============================================================================

/// Nintendo Co., Ltd. company ID for BLE manufacturer data
pub const NINTENDO_COMPANY_ID: u16 = 0x0553;

/// Manufacturer data prefix for Joy-Con 2 controllers
pub const JOYCON_DATA_PREFIX: [u8; 5] = [0x01, 0x00, 0x03, 0x7e, 0x05];

/// Index of the device type byte in the manufacturer data
pub const JOYCON_SIDE_BYTE_INDEX: usize = 5;

/// Device type byte advertised by a Left Joy-Con 2
pub const JOYCON_LEFT_BYTE: u8 = 0x67;

/// Device type byte advertised by a Right Joy-Con 2
pub const JOYCON_RIGHT_BYTE: u8 = 0x66;

// ============================================================================
// BLE Service & Characteristic UUIDs
// ============================================================================

/// TX characteristic UUID (controller -> host, input reports).
/// This is the NOTIFY characteristic the telemetry stream arrives on.
pub const TX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xab7de9be_89fe_49ad_828f_118f09df7fd2);

/// Command characteristic UUID (host -> controller).
pub const CMD_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x649d4ac9_8eb7_4e6c_af44_1ea54fe5f005);

/// Command response characteristic UUID (controller -> host, command acks).
/// Optional: subscribed when the peripheral exposes it.
pub const CMD_RESPONSE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xc765a961_d9d8_4d36_a20a_5315b111836a);

// ============================================================================
// Sensor Commands
// ============================================================================

/// Sensor command template, 12 bytes.
/// Format: 0C 91 01 <step> 00 04 00 00 <features> 00 00 00
pub const SENSOR_COMMAND_TEMPLATE: [u8; 12] = [0x0C, 0x91, 0x01, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
pub const SENSOR_COMMAND_STEP_INDEX: usize = 3;
pub const SENSOR_COMMAND_FEATURES_INDEX: usize = 8;

/// Step 1: configure the sensor feature set
pub const SENSOR_STEP_CONFIGURE: u8 = 0x02;

/// Step 2: start streaming the configured features
pub const SENSOR_STEP_START: u8 = 0x04;

/// Feature mask enabling every sensor, optical included.
/// The IMU-only mask (0x2F) leaves the optical counters frozen.
pub const SENSOR_FEATURES_ALL: u8 = 0xFF;

// ============================================================================
// Timing Constants
// ============================================================================

/// Delay between consecutive commands (milliseconds)
pub const COMMAND_DELAY_MS: u64 = 50;

/// Poll interval while waiting for a peripheral to show up in a scan (milliseconds)
pub const SCAN_POLL_MS: u64 = 250;
