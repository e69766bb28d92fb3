//! Input mapper
//!
//! Turns one decoded report, given the role its controller currently plays,
//! into a batch of semantic input events for one virtual device.
//!
//! Gamepad batches always carry the full pad state, so replaying a report
//! yields the same batch. Mouse batches carry the full click-button state
//! plus whatever motion and scroll the report produced.

use crate::backend::{DeviceKind, InputEvent, MouseButton, PadAxis, PadButton};
use crate::joycon2::protocol::SensorReport;
use crate::joycon2::types::{ButtonMask, MotionDelta, Side, StickRaw};
use crate::mapping::config::{ClickMap, Config, GamepadSettings, MouseSettings};
use crate::mapping::mode::Role;

/// Half range of a 12-bit stick axis
const STICK_HALF_RANGE: f32 = 2048.0;

const AXIS_MAX: f32 = 32767.0;
const TRIGGER_MAX: i32 = 255;

// ============================================================================
// Scroll
// ============================================================================

/// Fractional scroll accumulator with carry
#[derive(Debug, Clone)]
pub struct ScrollAccumulator {
    threshold: f32,
    max_step: i32,
    accumulated: f32,
}

impl ScrollAccumulator {
    pub fn new(threshold: f32, max_step: i32) -> Self {
        Self { threshold, max_step, accumulated: 0.0 }
    }

    /// Add `amount` and return the whole ticks it completes.
    ///
    /// The remainder is kept for the next report. At most `max_step` ticks are
    /// returned; excess beyond one further tick is discarded.
    pub fn feed(&mut self, amount: f32) -> i32 {
        self.accumulated += amount;

        let whole = (self.accumulated / self.threshold).trunc();
        let ticks = (whole as i32).clamp(-self.max_step, self.max_step);
        self.accumulated -= ticks as f32 * self.threshold;
        self.accumulated = self.accumulated.clamp(-self.threshold, self.threshold);
        ticks
    }

    pub fn pending(&self) -> f32 {
        self.accumulated
    }

    pub fn reset(&mut self) {
        self.accumulated = 0.0;
    }
}

/// Scroll contributed by one report's stick Y offset from centre.
///
/// Returns `None` when the stick is inside the deadzone.
pub fn scroll_amount(offset_y: f32, settings: &MouseSettings) -> Option<f32> {
    let deadzone = f32::from(settings.scroll_deadzone);
    let magnitude = offset_y.abs().min(STICK_HALF_RANGE);
    if magnitude <= deadzone {
        return None;
    }

    let norm = ((magnitude - deadzone) / (STICK_HALF_RANGE - deadzone).max(1.0)).clamp(0.0, 1.0);
    let amount = settings.scroll_speed * norm.powf(settings.scroll_curve) * offset_y.signum();
    Some(if settings.invert_scroll { -amount } else { amount })
}

// ============================================================================
// Pointer
// ============================================================================

/// Optical counts to pointer motion: deadzone, scaling with sub-pixel carry.
///
/// Spikes are clamped per raw report by the link session, so the delta seen
/// here may already include motion carried over from dropped reports.
#[derive(Debug, Clone)]
pub struct PointerFilter {
    sensitivity: f32,
    deadzone: i32,
    invert_x: bool,
    invert_y: bool,
    carry: (f32, f32),
}

impl PointerFilter {
    pub fn new(settings: &MouseSettings) -> Self {
        Self {
            sensitivity: settings.sensitivity,
            deadzone: settings.deadzone,
            invert_x: settings.invert_x,
            invert_y: settings.invert_y,
            carry: (0.0, 0.0),
        }
    }

    fn axis(&self, delta: i32, invert: bool, carry: &mut f32) -> i32 {
        let mut d = if invert { -delta } else { delta };
        if self.deadzone > 0 && d.abs() <= self.deadzone {
            d = 0;
        }

        let scaled = d as f32 * self.sensitivity + *carry;
        let whole = scaled.trunc();
        *carry = scaled - whole;
        whole as i32
    }

    pub fn apply(&mut self, dx: i32, dy: i32) -> (i32, i32) {
        let (mut cx, mut cy) = self.carry;
        let x = self.axis(dx, self.invert_x, &mut cx);
        let y = self.axis(dy, self.invert_y, &mut cy);
        self.carry = (cx, cy);
        (x, y)
    }

    pub fn reset(&mut self) {
        self.carry = (0.0, 0.0);
    }
}

// ============================================================================
// Stick Calibration
// ============================================================================

/// Stick offset from its calibrated centre, in raw counts
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StickOffset {
    pub x: f32,
    pub y: f32,
}

/// Auto-centring stick calibration.
///
/// The centre is the median of the first N samples after a (re)connect. It then
/// drifts slowly towards samples that land within a small radius of it.
#[derive(Debug, Clone)]
pub struct StickCalibration {
    samples: usize,
    radius: f32,
    alpha: f32,
    pending: Vec<StickRaw>,
    center: Option<(f32, f32)>,
}

impl StickCalibration {
    pub fn new(settings: &GamepadSettings) -> Self {
        Self {
            samples: settings.calibration_samples.max(1),
            radius: f32::from(settings.recenter_radius),
            alpha: settings.recenter_alpha,
            pending: Vec::with_capacity(settings.calibration_samples),
            center: None,
        }
    }

    pub fn center(&self) -> Option<(f32, f32)> {
        self.center
    }

    /// Feed one sample. `None` until calibration has completed.
    pub fn observe(&mut self, raw: StickRaw) -> Option<StickOffset> {
        let (cx, cy) = match self.center {
            Some(center) => center,
            None => {
                self.pending.push(raw);
                if self.pending.len() >= self.samples {
                    let center = (median(self.pending.iter().map(|s| s.x)), median(self.pending.iter().map(|s| s.y)));
                    self.center = Some(center);
                    self.pending.clear();
                }
                return None;
            }
        };

        let x = f32::from(raw.x);
        let y = f32::from(raw.y);
        let offset = StickOffset { x: x - cx, y: y - cy };

        if offset.x.abs() <= self.radius && offset.y.abs() <= self.radius {
            self.center = Some((cx + (x - cx) * self.alpha, cy + (y - cy) * self.alpha));
        }

        Some(offset)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.center = None;
    }
}

fn median(values: impl Iterator<Item = u16>) -> f32 {
    let mut sorted: Vec<u16> = values.collect();
    sorted.sort_unstable();
    match sorted.len() {
        0 => STICK_HALF_RANGE,
        n if n % 2 == 1 => f32::from(sorted[n / 2]),
        n => (f32::from(sorted[n / 2 - 1]) + f32::from(sorted[n / 2])) / 2.0,
    }
}

/// Calibrated offset to a gamepad axis value (-32768..=32767), up positive
fn axis_value(offset: f32, center: f32, range: [u16; 2], deadzone: f32) -> i32 {
    let span = if offset >= 0.0 {
        f32::from(range[1]) - center
    } else {
        center - f32::from(range[0])
    };
    let normalized = (offset / span.max(1.0)).clamp(-1.0, 1.0);

    let magnitude = normalized.abs();
    if magnitude <= deadzone {
        return 0;
    }
    let scaled = (magnitude - deadzone) / (1.0 - deadzone);
    (scaled * AXIS_MAX).round().copysign(normalized) as i32
}

// ============================================================================
// Gamepad State
// ============================================================================

fn button_slot(button: PadButton) -> usize {
    PadButton::ALL.iter().position(|b| *b == button).unwrap_or(0)
}

fn axis_slot(axis: PadAxis) -> usize {
    PadAxis::ALL.iter().position(|a| *a == axis).unwrap_or(0)
}

/// Full state of the virtual gamepad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadState {
    buttons: [bool; 11],
    axes: [i32; 8],
}

impl PadState {
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn set_button(&mut self, button: PadButton, pressed: bool) {
        self.buttons[button_slot(button)] = pressed;
    }

    pub fn set_axis(&mut self, axis: PadAxis, value: i32) {
        let (min, max, _) = axis.range();
        self.axes[axis_slot(axis)] = value.clamp(min, max);
    }

    pub fn button(&self, button: PadButton) -> bool {
        self.buttons[button_slot(button)]
    }

    pub fn axis(&self, axis: PadAxis) -> i32 {
        self.axes[axis_slot(axis)]
    }

    /// Every button and axis, in a fixed order
    pub fn events(&self) -> Vec<InputEvent> {
        let buttons = PadButton::ALL
            .iter()
            .map(|&button| InputEvent::PadButton { button, pressed: self.button(button) });
        let axes = PadAxis::ALL
            .iter()
            .map(|&axis| InputEvent::PadAxis { axis, value: self.axis(axis) });
        buttons.chain(axes).collect()
    }
}

/// Which part of the pad a controller drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PadLayout {
    Single(Side),
    CombinedHalf(Side),
}

/// One controller's latest input as seen by the gamepad mapping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfInput {
    pub buttons: ButtonMask,
    /// Stick axis values (x, y), already scaled; y positive up
    pub stick: (i32, i32),
}

fn apply_layout(pad: &mut PadState, layout: PadLayout, input: &HalfInput) {
    let held = |mask: ButtonMask| input.buttons.contains(mask);
    let trigger = |mask: ButtonMask| if held(mask) { TRIGGER_MAX } else { 0 };
    let (sx, sy) = input.stick;
    // evdev Y axes grow downwards
    let sy = -sy;

    match layout {
        PadLayout::Single(Side::Right) => {
            pad.set_axis(PadAxis::X, sx);
            pad.set_axis(PadAxis::Y, sy);
            apply_face_buttons(pad, input);
            pad.set_button(PadButton::TR, held(ButtonMask::R));
            pad.set_axis(PadAxis::RZ, trigger(ButtonMask::ZR));
            pad.set_button(PadButton::Start, held(ButtonMask::PLUS));
            pad.set_button(PadButton::Mode, held(ButtonMask::HOME));
            pad.set_button(PadButton::ThumbL, held(ButtonMask::R_STICK));
        }
        PadLayout::Single(Side::Left) | PadLayout::CombinedHalf(Side::Left) => {
            pad.set_axis(PadAxis::X, sx);
            pad.set_axis(PadAxis::Y, sy);
            apply_dpad(pad, input);
            pad.set_button(PadButton::TL, held(ButtonMask::L));
            pad.set_axis(PadAxis::Z, trigger(ButtonMask::ZL));
            pad.set_button(PadButton::Select, held(ButtonMask::MINUS));
            pad.set_button(PadButton::Mode, held(ButtonMask::CAPTURE));
            pad.set_button(PadButton::ThumbL, held(ButtonMask::L_STICK));
        }
        // Home stays unmapped so the pad has a single Mode button
        PadLayout::CombinedHalf(Side::Right) => {
            pad.set_axis(PadAxis::RX, sx);
            pad.set_axis(PadAxis::RY, sy);
            apply_face_buttons(pad, input);
            pad.set_button(PadButton::TR, held(ButtonMask::R));
            pad.set_axis(PadAxis::RZ, trigger(ButtonMask::ZR));
            pad.set_button(PadButton::Start, held(ButtonMask::PLUS));
            pad.set_button(PadButton::ThumbR, held(ButtonMask::R_STICK));
        }
    }
}

// Physical positions: A right, B bottom, X top, Y left
fn apply_face_buttons(pad: &mut PadState, input: &HalfInput) {
    pad.set_button(PadButton::East, input.buttons.contains(ButtonMask::A));
    pad.set_button(PadButton::South, input.buttons.contains(ButtonMask::B));
    pad.set_button(PadButton::North, input.buttons.contains(ButtonMask::X));
    pad.set_button(PadButton::West, input.buttons.contains(ButtonMask::Y));
}

fn apply_dpad(pad: &mut PadState, input: &HalfInput) {
    let axis = |negative: ButtonMask, positive: ButtonMask| {
        i32::from(input.buttons.contains(positive)) - i32::from(input.buttons.contains(negative))
    };
    pad.set_axis(PadAxis::HatX, axis(ButtonMask::LEFT, ButtonMask::RIGHT));
    pad.set_axis(PadAxis::HatY, axis(ButtonMask::UP, ButtonMask::DOWN));
}

/// Joint gamepad state while both controllers are active
#[derive(Debug, Clone, Default)]
pub struct CombinedState {
    left: Option<HalfInput>,
    right: Option<HalfInput>,
    overlay: bool,
}

impl CombinedState {
    pub fn overlay(&self) -> bool {
        self.overlay
    }

    /// Turning the overlay on withholds the Right half
    pub fn set_overlay(&mut self, on: bool) {
        self.overlay = on;
        if on {
            self.right = None;
        }
    }

    pub fn update(&mut self, side: Side, input: HalfInput) {
        if side == Side::Right && self.overlay {
            return;
        }
        match side {
            Side::Left => self.left = Some(input),
            Side::Right => self.right = Some(input),
        }
    }

    /// Drop one controller's contribution (released/neutral)
    pub fn clear(&mut self, side: Side) {
        match side {
            Side::Left => self.left = None,
            Side::Right => self.right = None,
        }
    }

    pub fn pad(&self) -> PadState {
        let mut pad = PadState::neutral();
        if let Some(left) = &self.left {
            apply_layout(&mut pad, PadLayout::CombinedHalf(Side::Left), left);
        }
        if let (Some(right), false) = (&self.right, self.overlay) {
            apply_layout(&mut pad, PadLayout::CombinedHalf(Side::Right), right);
        }
        pad
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Mapper
// ============================================================================

/// Events for one virtual device, committed as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedBatch {
    pub kind: DeviceKind,
    pub events: Vec<InputEvent>,
}

#[derive(Debug, Clone)]
struct DeviceMapState {
    pointer: PointerFilter,
    scroll: ScrollAccumulator,
    stick: StickCalibration,
}

pub struct InputMapper {
    mouse: MouseSettings,
    gamepad: GamepadSettings,
    devices: [DeviceMapState; 2],
    combined: CombinedState,
}

impl InputMapper {
    pub fn new(config: &Config) -> Self {
        let device = DeviceMapState {
            pointer: PointerFilter::new(&config.mouse),
            scroll: ScrollAccumulator::new(config.mouse.scroll_threshold, config.mouse.scroll_max_step),
            stick: StickCalibration::new(&config.gamepad),
        };
        Self {
            mouse: config.mouse.clone(),
            gamepad: config.gamepad.clone(),
            devices: [device.clone(), device],
            combined: CombinedState::default(),
        }
    }

    pub fn combined(&self) -> &CombinedState {
        &self.combined
    }

    /// Map one report for a controller playing `role`
    pub fn map(&mut self, role: Role, report: &SensorReport, motion: MotionDelta) -> MappedBatch {
        let side = report.side;
        let offset = self.devices[side.index()].stick.observe(report.stick);

        match role {
            Role::Mouse => self.map_mouse(side, report.buttons, offset, motion),
            Role::Gamepad => {
                let input = self.half_input(side, report.buttons, offset);
                let mut pad = PadState::neutral();
                apply_layout(&mut pad, PadLayout::Single(side), &input);
                MappedBatch { kind: DeviceKind::Gamepad, events: pad.events() }
            }
            Role::CombinedHalf => {
                let input = self.half_input(side, report.buttons, offset);
                self.combined.update(side, input);
                MappedBatch { kind: DeviceKind::Gamepad, events: self.combined.pad().events() }
            }
        }
    }

    fn half_input(&self, side: Side, buttons: ButtonMask, offset: Option<StickOffset>) -> HalfInput {
        let stick = match (offset, self.devices[side.index()].stick.center()) {
            (Some(offset), Some((cx, cy))) => (
                axis_value(offset.x, cx, self.gamepad.range_x, self.gamepad.stick_deadzone),
                axis_value(offset.y, cy, self.gamepad.range_y, self.gamepad.stick_deadzone),
            ),
            _ => (0, 0),
        };
        HalfInput { buttons, stick }
    }

    fn map_mouse(&mut self, side: Side, buttons: ButtonMask, offset: Option<StickOffset>, motion: MotionDelta) -> MappedBatch {
        let mut events = Vec::with_capacity(5);
        let state = &mut self.devices[side.index()];

        let (dx, dy) = state.pointer.apply(motion.dx, motion.dy);
        if dx != 0 || dy != 0 {
            events.push(InputEvent::PointerMotion { dx, dy });
        }

        match offset.and_then(|o| scroll_amount(o.y, &self.mouse)) {
            Some(amount) => {
                let ticks = state.scroll.feed(amount);
                if ticks != 0 {
                    events.push(InputEvent::Scroll { ticks });
                }
            }
            None => state.scroll.reset(),
        }

        events.extend(click_events(self.mouse.clicks(side), buttons));
        MappedBatch { kind: DeviceKind::Mouse, events }
    }

    /// Batch that releases everything a controller contributes in `role`.
    ///
    /// For a combined half this is the pad state without that half.
    pub fn release(&mut self, side: Side, role: Role) -> MappedBatch {
        let state = &mut self.devices[side.index()];
        state.pointer.reset();
        state.scroll.reset();

        match role {
            Role::Mouse => MappedBatch {
                kind: DeviceKind::Mouse,
                events: click_events(self.mouse.clicks(side), ButtonMask::NONE).collect(),
            },
            Role::Gamepad => MappedBatch { kind: DeviceKind::Gamepad, events: PadState::neutral().events() },
            Role::CombinedHalf => {
                self.combined.clear(side);
                MappedBatch { kind: DeviceKind::Gamepad, events: self.combined.pad().events() }
            }
        }
    }

    pub fn set_overlay(&mut self, on: bool) {
        self.combined.set_overlay(on);
    }

    /// Start a controller over after a (re)connect: recalibrate, drop carries
    pub fn reset_device(&mut self, side: Side) {
        let state = &mut self.devices[side.index()];
        state.pointer.reset();
        state.scroll.reset();
        state.stick.reset();
    }

    /// Leave combined topology
    pub fn clear_combined(&mut self) {
        self.combined.reset();
    }
}

fn click_events(clicks: &ClickMap, buttons: ButtonMask) -> impl Iterator<Item = InputEvent> {
    let assignments = [
        (MouseButton::Left, clicks.left),
        (MouseButton::Right, clicks.right),
        (MouseButton::Middle, clicks.middle),
    ];
    assignments.into_iter().filter_map(move |(button, source)| {
        source.map(|source| InputEvent::MouseButton { button, pressed: buttons.contains(source.mask()) })
    })
}
