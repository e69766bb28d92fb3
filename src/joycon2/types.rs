//! Joy-Con 2 type definitions
//!
//! This module defines the basic data types used throughout the joycon2 module:
//! controller sides, connection states, the button bitmask and raw sensor fields.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Controller side/type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// The opposite controller
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Stable index for per-side arrays (Left = 0, Right = 1)
    pub fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("Left"),
            Side::Right => f.write_str("Right"),
        }
    }
}

/// Which controllers the driver should look for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideFilter {
    Left,
    #[default]
    Right,
    Both,
}

impl SideFilter {
    /// Sides selected by this filter, Left first
    pub fn sides(self) -> Vec<Side> {
        match self {
            SideFilter::Left => vec![Side::Left],
            SideFilter::Right => vec![Side::Right],
            SideFilter::Both => vec![Side::Left, Side::Right],
        }
    }
}

/// Connection state of one physical controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Lost,
}

/// 24-bit button bitmask as reported by the controller.
///
/// Byte 4 of the report is the low byte (right cluster), byte 5 the middle
/// byte (shared system buttons), byte 6 the high byte (left cluster).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ButtonMask(pub u32);

impl ButtonMask {
    pub const NONE: ButtonMask = ButtonMask(0);

    // byte 4
    pub const Y: ButtonMask = ButtonMask(0x00_0001);
    pub const X: ButtonMask = ButtonMask(0x00_0002);
    pub const B: ButtonMask = ButtonMask(0x00_0004);
    pub const A: ButtonMask = ButtonMask(0x00_0008);
    pub const SR_RIGHT: ButtonMask = ButtonMask(0x00_0010);
    pub const SL_RIGHT: ButtonMask = ButtonMask(0x00_0020);
    pub const R: ButtonMask = ButtonMask(0x00_0040);
    pub const ZR: ButtonMask = ButtonMask(0x00_0080);

    // byte 5
    pub const MINUS: ButtonMask = ButtonMask(0x00_0100);
    pub const PLUS: ButtonMask = ButtonMask(0x00_0200);
    pub const R_STICK: ButtonMask = ButtonMask(0x00_0400);
    pub const L_STICK: ButtonMask = ButtonMask(0x00_0800);
    pub const HOME: ButtonMask = ButtonMask(0x00_1000);
    pub const CAPTURE: ButtonMask = ButtonMask(0x00_2000);
    pub const CHAT: ButtonMask = ButtonMask(0x00_4000);

    // byte 6
    pub const DOWN: ButtonMask = ButtonMask(0x01_0000);
    pub const UP: ButtonMask = ButtonMask(0x02_0000);
    pub const RIGHT: ButtonMask = ButtonMask(0x04_0000);
    pub const LEFT: ButtonMask = ButtonMask(0x08_0000);
    pub const SR_LEFT: ButtonMask = ButtonMask(0x10_0000);
    pub const SL_LEFT: ButtonMask = ButtonMask(0x20_0000);
    pub const L: ButtonMask = ButtonMask(0x40_0000);
    pub const ZL: ButtonMask = ButtonMask(0x80_0000);

    /// Build a mask from the three raw button bytes (report bytes 4, 5, 6)
    pub fn from_bytes(right: u8, shared: u8, left: u8) -> Self {
        ButtonMask(u32::from(right) | (u32::from(shared) << 8) | (u32::from(left) << 16))
    }

    /// True when every bit of `other` is set
    pub fn contains(self, other: ButtonMask) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    /// True when any bit of `other` is set
    pub fn intersects(self, other: ButtonMask) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Bits set in `self` but not in `other`
    pub fn difference(self, other: ButtonMask) -> ButtonMask {
        ButtonMask(self.0 & !other.0)
    }
}

impl BitOr for ButtonMask {
    type Output = ButtonMask;

    fn bitor(self, rhs: ButtonMask) -> ButtonMask {
        ButtonMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for ButtonMask {
    fn bitor_assign(&mut self, rhs: ButtonMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ButtonMask {
    type Output = ButtonMask;

    fn bitand(self, rhs: ButtonMask) -> ButtonMask {
        ButtonMask(self.0 & rhs.0)
    }
}

impl fmt::Debug for ButtonMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ButtonMask({:#08x})", self.0)
    }
}

/// Named controller button (used by the configuration file)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    A, B, X, Y,
    R, Zr, L, Zl,
    Plus, Minus, Home, Capture, Chat,
    RStick, LStick,
    Up, Down, Left, Right,
    // Side rail buttons
    SlLeft, SrLeft,
    SlRight, SrRight,
}

impl Button {
    /// Bit for this button in a [`ButtonMask`]
    pub fn mask(self) -> ButtonMask {
        match self {
            Button::A => ButtonMask::A,
            Button::B => ButtonMask::B,
            Button::X => ButtonMask::X,
            Button::Y => ButtonMask::Y,
            Button::R => ButtonMask::R,
            Button::Zr => ButtonMask::ZR,
            Button::L => ButtonMask::L,
            Button::Zl => ButtonMask::ZL,
            Button::Plus => ButtonMask::PLUS,
            Button::Minus => ButtonMask::MINUS,
            Button::Home => ButtonMask::HOME,
            Button::Capture => ButtonMask::CAPTURE,
            Button::Chat => ButtonMask::CHAT,
            Button::RStick => ButtonMask::R_STICK,
            Button::LStick => ButtonMask::L_STICK,
            Button::Up => ButtonMask::UP,
            Button::Down => ButtonMask::DOWN,
            Button::Left => ButtonMask::LEFT,
            Button::Right => ButtonMask::RIGHT,
            Button::SlLeft => ButtonMask::SL_LEFT,
            Button::SrLeft => ButtonMask::SR_LEFT,
            Button::SlRight => ButtonMask::SL_RIGHT,
            Button::SrRight => ButtonMask::SR_RIGHT,
        }
    }
}

/// Raw 12-bit analog stick sample (0..=4095 per axis)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StickRaw {
    pub x: u16,
    pub y: u16,
}

/// Raw optical sensor counters (wrapping 16-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpticalCounters {
    pub x: u16,
    pub y: u16,
}

/// Signed motion derived from two consecutive reports of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionDelta {
    pub dx: i32,
    pub dy: i32,
    /// Sequence counter step since the previous report (1 for a contiguous stream)
    pub sequence_step: i32,
}

impl MotionDelta {
    /// Merge motion from a report that could not be delivered
    pub fn absorb(&mut self, other: MotionDelta) {
        self.dx += other.dx;
        self.dy += other.dy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_mask_from_bytes() {
        let mask = ButtonMask::from_bytes(0x08, 0x40, 0x80);
        assert!(mask.contains(ButtonMask::A));
        assert!(mask.contains(ButtonMask::CHAT));
        assert!(mask.contains(ButtonMask::ZL));
        assert!(!mask.intersects(ButtonMask::B | ButtonMask::L));
        assert_eq!(mask, ButtonMask::A | ButtonMask::CHAT | ButtonMask::ZL);
    }

    #[test]
    fn contains_requires_every_bit() {
        let held = ButtonMask::SL_LEFT;
        assert!(!held.contains(ButtonMask::SL_LEFT | ButtonMask::SR_LEFT));
        assert!((held | ButtonMask::SR_LEFT).contains(ButtonMask::SL_LEFT | ButtonMask::SR_LEFT));
        // The empty mask is never "held"
        assert!(!held.contains(ButtonMask::NONE));
    }

    #[test]
    fn button_names_match_bits() {
        assert_eq!(Button::Zr.mask(), ButtonMask::ZR);
        assert_eq!(Button::SrLeft.mask(), ButtonMask::SR_LEFT);
        assert_eq!(Button::Chat.mask(), ButtonMask::CHAT);
    }

    #[test]
    fn side_filter_sides() {
        assert_eq!(SideFilter::Both.sides(), vec![Side::Left, Side::Right]);
        assert_eq!(SideFilter::Left.sides(), vec![Side::Left]);
        assert_eq!(Side::Left.other(), Side::Right);
    }
}
