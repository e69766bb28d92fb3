//! Virtual device backends
//!
//! This module provides the OS-facing end of the pipeline: a small event
//! vocabulary, the [`VirtualDeviceBackend`] trait implemented per platform,
//! and [`VirtualDeviceSink`], which owns at most one mouse and one gamepad
//! device and commits each event batch atomically.

pub mod mock;
#[cfg(target_os = "linux")]
pub mod uinput;

pub use mock::{MockBackend, SinkRecord};
#[cfg(target_os = "linux")]
pub use uinput::UinputBackend;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to create virtual {kind} device: {reason}")]
    Create { kind: DeviceKind, reason: String },

    #[error("failed to emit events to virtual {kind} device: {reason}")]
    Commit { kind: DeviceKind, reason: String },

    #[error("failed to destroy virtual {kind} device: {reason}")]
    Destroy { kind: DeviceKind, reason: String },

    #[error("no virtual {0} device")]
    NoDevice(DeviceKind),

    #[error("Platform not supported")]
    PlatformNotSupported,
}

// ============================================================================
// Event Vocabulary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Xbox 360 style gamepad buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadButton {
    South,
    East,
    North,
    West,
    TL,
    TR,
    Select,
    Start,
    Mode,
    ThumbL,
    ThumbR,
}

impl PadButton {
    pub const ALL: [PadButton; 11] = [
        PadButton::South,
        PadButton::East,
        PadButton::North,
        PadButton::West,
        PadButton::TL,
        PadButton::TR,
        PadButton::Select,
        PadButton::Start,
        PadButton::Mode,
        PadButton::ThumbL,
        PadButton::ThumbR,
    ];
}

/// Gamepad absolute axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadAxis {
    /// Left stick
    X,
    Y,
    /// Right stick
    RX,
    RY,
    /// Left trigger (0..=255)
    Z,
    /// Right trigger (0..=255)
    RZ,
    /// D-pad (-1..=1)
    HatX,
    HatY,
}

impl PadAxis {
    pub const ALL: [PadAxis; 8] = [
        PadAxis::X,
        PadAxis::Y,
        PadAxis::RX,
        PadAxis::RY,
        PadAxis::Z,
        PadAxis::RZ,
        PadAxis::HatX,
        PadAxis::HatY,
    ];

    /// Value range as (min, max, neutral)
    pub fn range(self) -> (i32, i32, i32) {
        match self {
            PadAxis::X | PadAxis::Y | PadAxis::RX | PadAxis::RY => (-32768, 32767, 0),
            PadAxis::Z | PadAxis::RZ => (0, 255, 0),
            PadAxis::HatX | PadAxis::HatY => (-1, 1, 0),
        }
    }
}

/// One semantic input event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    PointerMotion { dx: i32, dy: i32 },
    /// Positive ticks scroll up
    Scroll { ticks: i32 },
    MouseButton { button: MouseButton, pressed: bool },
    PadButton { button: PadButton, pressed: bool },
    PadAxis { axis: PadAxis, value: i32 },
}

impl InputEvent {
    pub fn kind(&self) -> DeviceKind {
        match self {
            InputEvent::PointerMotion { .. } | InputEvent::Scroll { .. } | InputEvent::MouseButton { .. } => {
                DeviceKind::Mouse
            }
            InputEvent::PadButton { .. } | InputEvent::PadAxis { .. } => DeviceKind::Gamepad,
        }
    }
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Mouse,
    Gamepad,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Mouse => f.write_str("mouse"),
            DeviceKind::Gamepad => f.write_str("gamepad"),
        }
    }
}

/// What a virtual device is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub kind: DeviceKind,
    pub name: String,
}

impl Capabilities {
    pub fn mouse() -> Self {
        Self { kind: DeviceKind::Mouse, name: "Joy-Con 2 Mouse".to_string() }
    }

    pub fn gamepad(name: impl Into<String>) -> Self {
        Self { kind: DeviceKind::Gamepad, name: name.into() }
    }
}

/// Platform input-injection backend
pub trait VirtualDeviceBackend {
    type Device;

    fn create(&mut self, caps: &Capabilities) -> Result<Self::Device, BackendError>;

    /// Apply a batch as one update (a single sync report)
    fn commit(&mut self, device: &mut Self::Device, events: &[InputEvent]) -> Result<(), BackendError>;

    fn destroy(&mut self, device: Self::Device) -> Result<(), BackendError>;
}

struct Slot<D> {
    caps: Capabilities,
    device: D,
}

/// Owns the virtual devices: at most one of each [`DeviceKind`]
pub struct VirtualDeviceSink<B: VirtualDeviceBackend> {
    backend: B,
    mouse: Option<Slot<B::Device>>,
    gamepad: Option<Slot<B::Device>>,
}

impl<B: VirtualDeviceBackend> VirtualDeviceSink<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, mouse: None, gamepad: None }
    }

    fn slot(&mut self, kind: DeviceKind) -> &mut Option<Slot<B::Device>> {
        match kind {
            DeviceKind::Mouse => &mut self.mouse,
            DeviceKind::Gamepad => &mut self.gamepad,
        }
    }

    pub fn has(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Mouse => self.mouse.is_some(),
            DeviceKind::Gamepad => self.gamepad.is_some(),
        }
    }

    /// Name of the live device of this kind
    pub fn device_name(&self, kind: DeviceKind) -> Option<&str> {
        let slot = match kind {
            DeviceKind::Mouse => &self.mouse,
            DeviceKind::Gamepad => &self.gamepad,
        };
        slot.as_ref().map(|s| s.caps.name.as_str())
    }

    /// Make sure a device with exactly these capabilities exists.
    ///
    /// A live device of the same kind with different capabilities is destroyed
    /// and replaced.
    pub fn ensure_device(&mut self, caps: &Capabilities) -> Result<(), BackendError> {
        if let Some(slot) = self.slot(caps.kind) {
            if slot.caps == *caps {
                return Ok(());
            }
        }

        if self.has(caps.kind) {
            self.destroy(caps.kind)?;
        }

        let device = self.backend.create(caps)?;
        info!("✓ Created virtual {} device \"{}\"", caps.kind, caps.name);
        *self.slot(caps.kind) = Some(Slot { caps: caps.clone(), device });
        Ok(())
    }

    /// Commit one batch to the device of the given kind
    pub fn commit(&mut self, kind: DeviceKind, events: &[InputEvent]) -> Result<(), BackendError> {
        if events.is_empty() {
            return Ok(());
        }
        let slot = match kind {
            DeviceKind::Mouse => self.mouse.as_mut(),
            DeviceKind::Gamepad => self.gamepad.as_mut(),
        };
        match slot {
            Some(slot) => self.backend.commit(&mut slot.device, events),
            None => Err(BackendError::NoDevice(kind)),
        }
    }

    pub fn destroy(&mut self, kind: DeviceKind) -> Result<(), BackendError> {
        match self.slot(kind).take() {
            Some(slot) => {
                info!("Destroying virtual {} device \"{}\"", kind, slot.caps.name);
                self.backend.destroy(slot.device)
            }
            None => Ok(()),
        }
    }

    /// Destroy every device, attempting all of them even if one fails
    pub fn destroy_all(&mut self) -> Result<(), BackendError> {
        let mut first_error = None;
        for kind in [DeviceKind::Gamepad, DeviceKind::Mouse] {
            if let Err(e) = self.destroy(kind) {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_device_is_lazy_and_reuses() {
        let backend = MockBackend::new();
        let mut sink = VirtualDeviceSink::new(backend.clone());
        assert!(!sink.has(DeviceKind::Mouse));

        sink.ensure_device(&Capabilities::mouse()).unwrap();
        sink.ensure_device(&Capabilities::mouse()).unwrap();
        assert_eq!(backend.created(), vec![Capabilities::mouse()]);
    }

    #[test]
    fn ensure_device_replaces_on_capability_change() {
        let backend = MockBackend::new();
        let mut sink = VirtualDeviceSink::new(backend.clone());

        sink.ensure_device(&Capabilities::gamepad("Joy-Con 2 (L+R)")).unwrap();
        sink.ensure_device(&Capabilities::gamepad("Joy-Con 2 (L)")).unwrap();

        assert_eq!(
            backend.records(),
            vec![
                SinkRecord::Create(Capabilities::gamepad("Joy-Con 2 (L+R)")),
                SinkRecord::Destroy(DeviceKind::Gamepad, "Joy-Con 2 (L+R)".to_string()),
                SinkRecord::Create(Capabilities::gamepad("Joy-Con 2 (L)")),
            ]
        );
        assert_eq!(sink.device_name(DeviceKind::Gamepad), Some("Joy-Con 2 (L)"));
    }

    #[test]
    fn commit_requires_device() {
        let mut sink = VirtualDeviceSink::new(MockBackend::new());
        let batch = [InputEvent::PointerMotion { dx: 1, dy: 0 }];
        assert!(matches!(sink.commit(DeviceKind::Mouse, &batch), Err(BackendError::NoDevice(DeviceKind::Mouse))));
        // Empty batches never touch the backend
        assert!(sink.commit(DeviceKind::Mouse, &[]).is_ok());
    }

    #[test]
    fn destroy_all_attempts_every_device() {
        let backend = MockBackend::new();
        let mut sink = VirtualDeviceSink::new(backend.clone());
        sink.ensure_device(&Capabilities::mouse()).unwrap();
        sink.ensure_device(&Capabilities::gamepad("Joy-Con 2 (R)")).unwrap();

        backend.fail_destroy(DeviceKind::Gamepad);
        assert!(sink.destroy_all().is_err());
        assert!(!sink.has(DeviceKind::Mouse));
        assert!(!sink.has(DeviceKind::Gamepad));
        assert!(backend
            .records()
            .contains(&SinkRecord::Destroy(DeviceKind::Mouse, "Joy-Con 2 Mouse".to_string())));
    }
}
