//! Button edge tracking and toggle gestures
//!
//! [`GestureDetector`] covers both toggle gestures: a single press is a hold
//! with a zero minimum duration.

use std::time::{Duration, Instant};

use crate::joycon2::types::ButtonMask;

/// Press and release edges between two consecutive reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Edges {
    pub pressed: ButtonMask,
    pub released: ButtonMask,
}

/// Previous button state of one device
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeTracker {
    previous: ButtonMask,
}

impl EdgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, current: ButtonMask) -> Edges {
        let edges = Edges {
            pressed: current.difference(self.previous),
            released: self.previous.difference(current),
        };
        self.previous = current;
        edges
    }

    /// Forget the previous state (after a reconnect everything reads as released)
    pub fn reset(&mut self) {
        self.previous = ButtonMask::NONE;
    }
}

/// Fires once when every button in `mask` has been held for `min_hold`.
///
/// After firing it stays inhibited until one of the buttons is released.
#[derive(Debug, Clone)]
pub struct GestureDetector {
    mask: ButtonMask,
    min_hold: Duration,
    held_since: Option<Instant>,
    fired: bool,
}

impl GestureDetector {
    /// Fires on the report where `mask` becomes fully pressed
    pub fn press(mask: ButtonMask) -> Self {
        Self::hold(mask, Duration::ZERO)
    }

    pub fn hold(mask: ButtonMask, min_hold: Duration) -> Self {
        Self { mask, min_hold, held_since: None, fired: false }
    }

    pub fn mask(&self) -> ButtonMask {
        self.mask
    }

    /// Feed one report; returns true exactly when the gesture fires
    pub fn update(&mut self, current: ButtonMask, edges: &Edges, now: Instant) -> bool {
        if !current.contains(self.mask) || edges.released.intersects(self.mask) {
            self.reset();
            return false;
        }

        let since = *self.held_since.get_or_insert(now);
        if self.fired || now.saturating_duration_since(since) < self.min_hold {
            return false;
        }

        self.fired = true;
        true
    }

    pub fn reset(&mut self) {
        self.held_since = None;
        self.fired = false;
    }
}
