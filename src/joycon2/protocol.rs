//! Joy-Con 2 packet codec
//!
//! Pure functions for the telemetry stream:
//! - Encoding the "enable sensor stream" command pair
//! - Decoding a fixed-layout input report into a [`SensorReport`]
//! - Signed deltas across wrapping 16-bit counters

use thiserror::Error;

use crate::joycon2::constants::*;
use crate::joycon2::types::{ButtonMask, MotionDelta, OpticalCounters, Side, StickRaw};

/// Protocol errors (malformed or unexpected payloads)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("report length {actual} outside expected {min}..={max} bytes")]
    Length { actual: usize, min: usize, max: usize },

    #[error("unsupported report layout version {0}")]
    UnsupportedLayout(u8),

    #[error("layout v{version}: field `{field}` at offset {offset} does not fit in {min_len} bytes")]
    InvalidLayout { version: u8, field: &'static str, offset: usize, min_len: usize },
}

// ============================================================================
// Report Layout
// ============================================================================

/// Byte layout of an input report, selected by version number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportLayout {
    pub version: u8,
    pub min_len: usize,
    pub max_len: usize,
    /// u16 LE packet counter
    pub sequence: usize,
    /// Three button bytes (right, shared, left)
    pub buttons: usize,
    /// 3-byte packed 12-bit stick, left controller
    pub left_stick: usize,
    /// 3-byte packed 12-bit stick, right controller
    pub right_stick: usize,
    /// Two u16 LE optical counters (x then y)
    pub optical: usize,
}

impl ReportLayout {
    pub const V1: ReportLayout = ReportLayout {
        version: 1,
        min_len: 0x3C,
        max_len: 0x40,
        sequence: 0x00,
        buttons: 0x04,
        left_stick: 0x0A,
        right_stick: 0x0D,
        optical: 0x10,
    };

    /// Look up a known layout by version number
    pub fn for_version(version: u8) -> Result<ReportLayout, ProtocolError> {
        match version {
            1 => Ok(Self::V1),
            other => Err(ProtocolError::UnsupportedLayout(other)),
        }
    }

    /// Check that every field fits inside the shortest accepted report
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let fields = [
            ("sequence", self.sequence, 2),
            ("buttons", self.buttons, 3),
            ("left_stick", self.left_stick, 3),
            ("right_stick", self.right_stick, 3),
            ("optical", self.optical, 4),
        ];

        for (field, offset, width) in fields {
            if offset + width > self.min_len {
                return Err(ProtocolError::InvalidLayout {
                    version: self.version,
                    field,
                    offset,
                    min_len: self.min_len,
                });
            }
        }

        if self.min_len > self.max_len {
            return Err(ProtocolError::Length {
                actual: self.min_len,
                min: self.min_len,
                max: self.max_len,
            });
        }

        Ok(())
    }

    fn stick_offset(&self, side: Side) -> usize {
        match side {
            Side::Left => self.left_stick,
            Side::Right => self.right_stick,
        }
    }
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self::V1
    }
}

// ============================================================================
// Decoded Report
// ============================================================================

/// One decoded telemetry sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReport {
    pub side: Side,
    pub sequence: u16,
    pub buttons: ButtonMask,
    /// The stick physically on this controller
    pub stick: StickRaw,
    pub optical: OpticalCounters,
}

// ============================================================================
// Commands
// ============================================================================

/// Build one 12-byte sensor command for a given step and feature mask
pub fn encode_sensor_command(step: u8, features: u8) -> [u8; 12] {
    let mut command = SENSOR_COMMAND_TEMPLATE;
    command[SENSOR_COMMAND_STEP_INDEX] = step;
    command[SENSOR_COMMAND_FEATURES_INDEX] = features;
    command
}

/// Commands that turn on the telemetry stream with the optical sensor enabled.
///
/// Both must be written, in order, to the command characteristic.
pub fn encode_enable_stream() -> [[u8; 12]; 2] {
    [
        encode_sensor_command(SENSOR_STEP_CONFIGURE, SENSOR_FEATURES_ALL),
        encode_sensor_command(SENSOR_STEP_START, SENSOR_FEATURES_ALL),
    ]
}

// ============================================================================
// Decoding
// ============================================================================

fn field<const N: usize>(
    layout: &ReportLayout,
    data: &[u8],
    name: &'static str,
    offset: usize,
) -> Result<[u8; N], ProtocolError> {
    data.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(ProtocolError::InvalidLayout {
            version: layout.version,
            field: name,
            offset,
            min_len: layout.min_len,
        })
}

/// Unpack a 12-bit stick pair from 3 bytes
pub fn decode_stick_12(bytes: [u8; 3]) -> StickRaw {
    let x = u16::from(bytes[0]) | ((u16::from(bytes[1]) & 0x0F) << 8);
    let y = (u16::from(bytes[1]) >> 4) | (u16::from(bytes[2]) << 4);
    StickRaw { x, y }
}

/// Decode one input report.
///
/// The payload length must fall inside the layout's accepted range.
pub fn decode_report(layout: &ReportLayout, side: Side, data: &[u8]) -> Result<SensorReport, ProtocolError> {
    if data.len() < layout.min_len || data.len() > layout.max_len {
        return Err(ProtocolError::Length {
            actual: data.len(),
            min: layout.min_len,
            max: layout.max_len,
        });
    }

    let [right, shared, left] = field::<3>(layout, data, "buttons", layout.buttons)?;
    let stick = field::<3>(layout, data, "stick", layout.stick_offset(side))?;
    let sequence = field::<2>(layout, data, "sequence", layout.sequence)?;
    let [x0, x1, y0, y1] = field::<4>(layout, data, "optical", layout.optical)?;

    Ok(SensorReport {
        side,
        sequence: u16::from_le_bytes(sequence),
        buttons: ButtonMask::from_bytes(right, shared, left),
        stick: decode_stick_12(stick),
        optical: OpticalCounters {
            x: u16::from_le_bytes([x0, x1]),
            y: u16::from_le_bytes([y0, y1]),
        },
    })
}

// ============================================================================
// Wrapping Counters
// ============================================================================

/// Signed difference between two wrapping 16-bit counter readings.
///
/// Result is in `-32768..=32767`; `signed_delta(65530, 4) == 10`.
pub fn signed_delta(previous: u16, current: u16) -> i32 {
    let raw = i32::from(current.wrapping_sub(previous));
    if raw > 0x7FFF {
        raw - 0x1_0000
    } else {
        raw
    }
}

/// Per-device last-seen counters
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaState {
    last: Option<(u16, OpticalCounters)>,
}

impl DeltaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance with a new report and return the motion since the previous one.
    ///
    /// The first report after construction or [`reset`](Self::reset) only
    /// primes the state and yields zero motion.
    pub fn update(&mut self, report: &SensorReport) -> MotionDelta {
        let delta = match self.last {
            Some((sequence, optical)) => MotionDelta {
                dx: signed_delta(optical.x, report.optical.x),
                dy: signed_delta(optical.y, report.optical.y),
                sequence_step: signed_delta(sequence, report.sequence),
            },
            None => MotionDelta { dx: 0, dy: 0, sequence_step: 1 },
        };
        self.last = Some((report.sequence, report.optical));
        delta
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
