//! Linux uinput backend
//!
//! Creates virtual devices through `/dev/uinput` with the evdev crate. The
//! gamepad uses the xpad (Xbox 360) layout so games pick it up without
//! remapping. `VirtualDevice::emit` appends the SYN_REPORT, so one call per
//! batch is one atomic update for readers.

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisType, AttributeSet, BusType, EventType, InputEvent as EvdevEvent, InputId, Key,
    RelativeAxisType, UinputAbsSetup,
};
use std::io;

use super::{BackendError, Capabilities, DeviceKind, InputEvent, MouseButton, PadAxis, PadButton, VirtualDeviceBackend};

// Microsoft Xbox 360 controller
const XBOX_VENDOR: u16 = 0x045e;
const XBOX_PRODUCT: u16 = 0x028e;

// Hi-res wheel units per detent
const WHEEL_HI_RES_UNITS: i32 = 120;

/// uinput backend; stateless apart from the devices it hands out
#[derive(Debug, Default)]
pub struct UinputBackend;

impl UinputBackend {
    pub fn new() -> Self {
        Self
    }
}

fn mouse_key(button: MouseButton) -> Key {
    match button {
        MouseButton::Left => Key::BTN_LEFT,
        MouseButton::Right => Key::BTN_RIGHT,
        MouseButton::Middle => Key::BTN_MIDDLE,
    }
}

fn pad_key(button: PadButton) -> Key {
    match button {
        PadButton::South => Key::BTN_SOUTH,
        PadButton::East => Key::BTN_EAST,
        PadButton::North => Key::BTN_NORTH,
        PadButton::West => Key::BTN_WEST,
        PadButton::TL => Key::BTN_TL,
        PadButton::TR => Key::BTN_TR,
        PadButton::Select => Key::BTN_SELECT,
        PadButton::Start => Key::BTN_START,
        PadButton::Mode => Key::BTN_MODE,
        PadButton::ThumbL => Key::BTN_THUMBL,
        PadButton::ThumbR => Key::BTN_THUMBR,
    }
}

fn pad_abs(axis: PadAxis) -> AbsoluteAxisType {
    match axis {
        PadAxis::X => AbsoluteAxisType::ABS_X,
        PadAxis::Y => AbsoluteAxisType::ABS_Y,
        PadAxis::RX => AbsoluteAxisType::ABS_RX,
        PadAxis::RY => AbsoluteAxisType::ABS_RY,
        PadAxis::Z => AbsoluteAxisType::ABS_Z,
        PadAxis::RZ => AbsoluteAxisType::ABS_RZ,
        PadAxis::HatX => AbsoluteAxisType::ABS_HAT0X,
        PadAxis::HatY => AbsoluteAxisType::ABS_HAT0Y,
    }
}

fn build_mouse(name: &str) -> io::Result<VirtualDevice> {
    let mut keys = AttributeSet::<Key>::new();
    for button in [MouseButton::Left, MouseButton::Right, MouseButton::Middle] {
        keys.insert(mouse_key(button));
    }

    let mut axes = AttributeSet::<RelativeAxisType>::new();
    axes.insert(RelativeAxisType::REL_X);
    axes.insert(RelativeAxisType::REL_Y);
    axes.insert(RelativeAxisType::REL_WHEEL);
    axes.insert(RelativeAxisType::REL_WHEEL_HI_RES);

    VirtualDeviceBuilder::new()?
        .name(name)
        .with_keys(&keys)?
        .with_relative_axes(&axes)?
        .build()
}

fn build_gamepad(name: &str) -> io::Result<VirtualDevice> {
    let mut keys = AttributeSet::<Key>::new();
    for button in PadButton::ALL {
        keys.insert(pad_key(button));
    }

    let mut builder = VirtualDeviceBuilder::new()?
        .name(name)
        .input_id(InputId::new(BusType::BUS_USB, XBOX_VENDOR, XBOX_PRODUCT, 0x0110))
        .with_keys(&keys)?;

    for axis in PadAxis::ALL {
        let (min, max, neutral) = axis.range();
        let (fuzz, flat) = match axis {
            PadAxis::X | PadAxis::Y | PadAxis::RX | PadAxis::RY => (16, 128),
            _ => (0, 0),
        };
        let setup = UinputAbsSetup::new(pad_abs(axis), AbsInfo::new(neutral, min, max, fuzz, flat, 0));
        builder = builder.with_absolute_axis(&setup)?;
    }

    builder.build()
}

fn translate(event: &InputEvent, out: &mut Vec<EvdevEvent>) {
    match *event {
        InputEvent::PointerMotion { dx, dy } => {
            if dx != 0 {
                out.push(EvdevEvent::new(EventType::RELATIVE, RelativeAxisType::REL_X.0, dx));
            }
            if dy != 0 {
                out.push(EvdevEvent::new(EventType::RELATIVE, RelativeAxisType::REL_Y.0, dy));
            }
        }
        InputEvent::Scroll { ticks } => {
            out.push(EvdevEvent::new(EventType::RELATIVE, RelativeAxisType::REL_WHEEL.0, ticks));
            out.push(EvdevEvent::new(
                EventType::RELATIVE,
                RelativeAxisType::REL_WHEEL_HI_RES.0,
                ticks * WHEEL_HI_RES_UNITS,
            ));
        }
        InputEvent::MouseButton { button, pressed } => {
            out.push(EvdevEvent::new(EventType::KEY, mouse_key(button).code(), i32::from(pressed)));
        }
        InputEvent::PadButton { button, pressed } => {
            out.push(EvdevEvent::new(EventType::KEY, pad_key(button).code(), i32::from(pressed)));
        }
        InputEvent::PadAxis { axis, value } => {
            out.push(EvdevEvent::new(EventType::ABSOLUTE, pad_abs(axis).0, value));
        }
    }
}

impl VirtualDeviceBackend for UinputBackend {
    type Device = VirtualDevice;

    fn create(&mut self, caps: &Capabilities) -> Result<VirtualDevice, BackendError> {
        let built = match caps.kind {
            DeviceKind::Mouse => build_mouse(&caps.name),
            DeviceKind::Gamepad => build_gamepad(&caps.name),
        };
        built.map_err(|e| BackendError::Create { kind: caps.kind, reason: e.to_string() })
    }

    fn commit(&mut self, device: &mut VirtualDevice, events: &[InputEvent]) -> Result<(), BackendError> {
        let mut raw = Vec::with_capacity(events.len() + 1);
        for event in events {
            translate(event, &mut raw);
        }
        if raw.is_empty() {
            return Ok(());
        }
        let kind = events.first().map_or(DeviceKind::Mouse, InputEvent::kind);
        device
            .emit(&raw)
            .map_err(|e| BackendError::Commit { kind, reason: e.to_string() })
    }

    fn destroy(&mut self, device: VirtualDevice) -> Result<(), BackendError> {
        // Closing the uinput fd removes the device node
        drop(device);
        Ok(())
    }
}
