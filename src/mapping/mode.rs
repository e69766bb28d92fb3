//! Mode state machine
//!
//! Tracks each controller's mode (gamepad or mouse), the combined-topology
//! mouse overlay, and turns toggle gestures into [`ModeEvent`]s.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::joycon2::types::{Button, ButtonMask, Side};
use crate::mapping::gesture::{EdgeTracker, GestureDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Gamepad,
    Mouse,
}

impl DeviceMode {
    pub fn toggled(self) -> DeviceMode {
        match self {
            DeviceMode::Gamepad => DeviceMode::Mouse,
            DeviceMode::Mouse => DeviceMode::Gamepad,
        }
    }
}

/// Which controllers drive the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Single(Side),
    Combined,
}

impl Topology {
    pub fn sides(self) -> Vec<Side> {
        match self {
            Topology::Single(side) => vec![side],
            Topology::Combined => vec![Side::Left, Side::Right],
        }
    }
}

/// What one controller's reports currently drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Mouse,
    /// Whole gamepad from one controller
    Gamepad,
    /// This controller's half of the combined gamepad
    CombinedHalf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    ModeChanged { side: Side, from: DeviceMode, to: DeviceMode },
    OverlayChanged { on: bool },
}

/// Gesture bindings for the state machine
#[derive(Debug, Clone)]
pub struct GestureBindings {
    pub right_toggle: Button,
    pub left_hold: [Button; 2],
    pub left_hold_duration: Duration,
    pub default_mode: DeviceMode,
}

impl Default for GestureBindings {
    fn default() -> Self {
        Self {
            right_toggle: Button::Chat,
            left_hold: [Button::SlLeft, Button::SrLeft],
            left_hold_duration: Duration::from_millis(1000),
            default_mode: DeviceMode::Mouse,
        }
    }
}

pub struct ModeMachine {
    topology: Topology,
    modes: [DeviceMode; 2],
    overlay: bool,
    trackers: [EdgeTracker; 2],
    right_toggle: GestureDetector,
    left_hold: GestureDetector,
}

impl ModeMachine {
    pub fn new(topology: Topology, bindings: &GestureBindings) -> Self {
        let modes = match topology {
            Topology::Single(_) => [bindings.default_mode; 2],
            Topology::Combined => [DeviceMode::Gamepad; 2],
        };
        let [a, b] = bindings.left_hold;
        Self {
            topology,
            modes,
            overlay: false,
            trackers: [EdgeTracker::new(); 2],
            right_toggle: GestureDetector::press(bindings.right_toggle.mask()),
            left_hold: GestureDetector::hold(a.mask() | b.mask(), bindings.left_hold_duration),
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn overlay(&self) -> bool {
        self.overlay
    }

    /// Effective mode of a controller (combined Right follows the overlay)
    pub fn mode(&self, side: Side) -> DeviceMode {
        match self.role(side) {
            Role::Mouse => DeviceMode::Mouse,
            Role::Gamepad | Role::CombinedHalf => DeviceMode::Gamepad,
        }
    }

    pub fn role(&self, side: Side) -> Role {
        match self.topology {
            Topology::Combined => match side {
                Side::Right if self.overlay => Role::Mouse,
                _ => Role::CombinedHalf,
            },
            Topology::Single(_) => match self.modes[side.index()] {
                DeviceMode::Mouse => Role::Mouse,
                DeviceMode::Gamepad => Role::Gamepad,
            },
        }
    }

    /// Feed one report's buttons; returns the mode change it triggers, if any
    pub fn observe(&mut self, side: Side, buttons: ButtonMask, now: Instant) -> Option<ModeEvent> {
        let edges = self.trackers[side.index()].update(buttons);

        match side {
            Side::Right => {
                if !self.right_toggle.update(buttons, &edges, now) {
                    return None;
                }
                match self.topology {
                    Topology::Combined => {
                        self.overlay = !self.overlay;
                        Some(ModeEvent::OverlayChanged { on: self.overlay })
                    }
                    Topology::Single(Side::Right) => Some(self.toggle(Side::Right)),
                    Topology::Single(Side::Left) => None,
                }
            }
            Side::Left => {
                if !self.left_hold.update(buttons, &edges, now) {
                    return None;
                }
                match self.topology {
                    Topology::Single(Side::Left) => Some(self.toggle(Side::Left)),
                    _ => None,
                }
            }
        }
    }

    fn toggle(&mut self, side: Side) -> ModeEvent {
        let from = self.modes[side.index()];
        let to = from.toggled();
        self.modes[side.index()] = to;
        ModeEvent::ModeChanged { side, from, to }
    }

    /// Forget gesture progress for a controller whose link dropped
    pub fn reset_device(&mut self, side: Side) {
        self.trackers[side.index()].reset();
        match side {
            Side::Right => self.right_toggle.reset(),
            Side::Left => self.left_hold.reset(),
        }
    }

    /// Re-derive a single topology for the surviving controller.
    ///
    /// Left becomes a gamepad; Right keeps the role it had (mouse if the
    /// overlay was on, gamepad otherwise).
    pub fn fall_back_to_single(&mut self, survivor: Side) {
        let mode = match survivor {
            Side::Right if self.overlay => DeviceMode::Mouse,
            _ => DeviceMode::Gamepad,
        };
        self.topology = Topology::Single(survivor);
        self.modes[survivor.index()] = mode;
        self.overlay = false;
        self.reset_device(survivor.other());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn right_toggle_is_edge_triggered() {
        let mut machine = ModeMachine::new(Topology::Single(Side::Right), &GestureBindings::default());
        assert_eq!(machine.mode(Side::Right), DeviceMode::Mouse);
        let t0 = Instant::now();

        let events: Vec<_> = (0..5)
            .filter_map(|i| machine.observe(Side::Right, ButtonMask::CHAT, ms(t0, i * 8)))
            .collect();
        assert_eq!(
            events,
            vec![ModeEvent::ModeChanged { side: Side::Right, from: DeviceMode::Mouse, to: DeviceMode::Gamepad }]
        );
        assert_eq!(machine.role(Side::Right), Role::Gamepad);

        assert_eq!(machine.observe(Side::Right, ButtonMask::NONE, ms(t0, 50)), None);
        assert!(machine.observe(Side::Right, ButtonMask::CHAT, ms(t0, 58)).is_some());
        assert_eq!(machine.role(Side::Right), Role::Mouse);
    }

    #[test]
    fn left_hold_toggles_single_left() {
        let mut machine = ModeMachine::new(Topology::Single(Side::Left), &GestureBindings::default());
        let both = ButtonMask::SL_LEFT | ButtonMask::SR_LEFT;
        let t0 = Instant::now();

        assert_eq!(machine.observe(Side::Left, both, ms(t0, 0)), None);
        assert_eq!(machine.observe(Side::Left, both, ms(t0, 999)), None);
        assert_eq!(
            machine.observe(Side::Left, both, ms(t0, 1000)),
            Some(ModeEvent::ModeChanged { side: Side::Left, from: DeviceMode::Mouse, to: DeviceMode::Gamepad })
        );
        assert_eq!(machine.observe(Side::Left, both, ms(t0, 3000)), None);
        assert_eq!(machine.role(Side::Left), Role::Gamepad);
    }

    #[test]
    fn combined_overlay_follows_right_toggle() {
        let mut machine = ModeMachine::new(Topology::Combined, &GestureBindings::default());
        let t0 = Instant::now();
        assert_eq!(machine.role(Side::Left), Role::CombinedHalf);
        assert_eq!(machine.role(Side::Right), Role::CombinedHalf);

        assert_eq!(
            machine.observe(Side::Right, ButtonMask::CHAT, t0),
            Some(ModeEvent::OverlayChanged { on: true })
        );
        assert_eq!(machine.role(Side::Right), Role::Mouse);
        assert_eq!(machine.role(Side::Left), Role::CombinedHalf);
        assert_eq!(machine.mode(Side::Right), DeviceMode::Mouse);

        // The left hold gesture has no effect in combined topology
        let both = ButtonMask::SL_LEFT | ButtonMask::SR_LEFT;
        assert_eq!(machine.observe(Side::Left, both, t0), None);
        assert_eq!(machine.observe(Side::Left, both, ms(t0, 5000)), None);
    }

    #[test]
    fn fallback_keeps_survivor_role() {
        let t0 = Instant::now();

        let mut machine = ModeMachine::new(Topology::Combined, &GestureBindings::default());
        machine.fall_back_to_single(Side::Left);
        assert_eq!(machine.topology(), Topology::Single(Side::Left));
        assert_eq!(machine.role(Side::Left), Role::Gamepad);

        let mut machine = ModeMachine::new(Topology::Combined, &GestureBindings::default());
        machine.observe(Side::Right, ButtonMask::CHAT, t0);
        machine.fall_back_to_single(Side::Right);
        assert_eq!(machine.role(Side::Right), Role::Mouse);
        assert!(!machine.overlay());
    }
}
