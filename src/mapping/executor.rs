//! Mapping executor - the single consumer of link events
//!
//! Every event from every link session passes through [`MappingExecutor::handle`]
//! on one task. For a report, the mode update, the mapping and the sink commit
//! happen in one call, so the other controller's report can never land between
//! a combined-state update and the batch derived from it.

use log::{debug, info, warn};
use std::time::{Duration, Instant};

use crate::backend::{Capabilities, DeviceKind, VirtualDeviceBackend, VirtualDeviceSink};
use crate::joycon2::connection::{LinkEvent, LinkEventKind};
use crate::joycon2::types::Side;
use crate::manager::{DriverError, TopologyError};
use crate::mapping::config::Config;
use crate::mapping::mapper::{InputMapper, MappedBatch};
use crate::mapping::mode::{ModeEvent, ModeMachine, Role, Topology};

pub const MOUSE_NAME: &str = "Joy-Con 2 Mouse";

/// Gamepad device name for a topology
pub fn gamepad_name(topology: Topology) -> &'static str {
    match topology {
        Topology::Single(Side::Left) => "Joy-Con 2 (L)",
        Topology::Single(Side::Right) => "Joy-Con 2 (R)",
        Topology::Combined => "Joy-Con 2 (L+R)",
    }
}

/// The combined topology was reduced to one controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyChange {
    /// Controller whose session should be stopped
    pub dropped: Side,
    pub survivor: Side,
}

/// Counters for the executor's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub reports: u64,
    pub batches: u64,
    pub commit_failures: u64,
    pub ignored: u64,
}

pub struct MappingExecutor<B: VirtualDeviceBackend> {
    modes: ModeMachine,
    mapper: InputMapper,
    sink: VirtualDeviceSink<B>,
    streaming: [bool; 2],
    ever_streamed: [bool; 2],
    started: Instant,
    combined_wait: Duration,
    stats: ExecutorStats,
}

impl<B: VirtualDeviceBackend> MappingExecutor<B> {
    pub fn new(config: &Config, backend: B, now: Instant) -> Result<Self, DriverError> {
        let topology = config.topology();
        let bindings = config.gesture_bindings()?;
        info!("Pipeline topology: {:?}", topology);

        Ok(Self {
            modes: ModeMachine::new(topology, &bindings),
            mapper: InputMapper::new(config),
            sink: VirtualDeviceSink::new(backend),
            streaming: [false; 2],
            ever_streamed: [false; 2],
            started: now,
            combined_wait: config.combined_wait(),
            stats: ExecutorStats::default(),
        })
    }

    pub fn topology(&self) -> Topology {
        self.modes.topology()
    }

    pub fn modes(&self) -> &ModeMachine {
        &self.modes
    }

    pub fn sink(&self) -> &VirtualDeviceSink<B> {
        &self.sink
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
    }

    pub fn is_streaming(&self, side: Side) -> bool {
        self.streaming[side.index()]
    }

    /// Process one link event.
    ///
    /// Returns a [`TopologyChange`] when the combined topology had to fall back
    /// to a single controller. A device loss in single topology and a failure
    /// to create a virtual device are fatal.
    pub fn handle(&mut self, event: LinkEvent, now: Instant) -> Result<Option<TopologyChange>, DriverError> {
        let side = event.side;
        if !self.topology().sides().contains(&side) {
            // Late events from a session that was dropped
            self.stats.ignored += 1;
            return Ok(None);
        }

        match event.kind {
            LinkEventKind::Streaming => {
                self.streaming[side.index()] = true;
                self.ever_streamed[side.index()] = true;
                self.mapper.reset_device(side);
                self.modes.reset_device(side);
                Ok(None)
            }
            LinkEventKind::Report { report, motion } => {
                self.stats.reports += 1;
                let role = self.modes.role(side);
                if let Some(change) = self.modes.observe(side, report.buttons, now) {
                    self.on_mode_event(change, role)?;
                }

                let batch = self.mapper.map(self.modes.role(side), &report, motion);
                self.deliver(batch)?;
                Ok(None)
            }
            LinkEventKind::Lost(error) => {
                debug!("{} Joy-Con lost ({}), releasing its inputs", side, error);
                self.streaming[side.index()] = false;
                let batch = self.mapper.release(side, self.modes.role(side));
                self.deliver_if_present(batch);
                self.mapper.reset_device(side);
                self.modes.reset_device(side);
                Ok(None)
            }
            LinkEventKind::Failed(lost) => {
                self.streaming[side.index()] = false;
                match self.topology() {
                    Topology::Combined => {
                        let survivor = side.other();
                        warn!("{}; continuing with the {} Joy-Con only", lost, survivor);
                        self.fall_back(survivor)?;
                        Ok(Some(TopologyChange { dropped: side, survivor }))
                    }
                    Topology::Single(_) => Err(DriverError::DeviceLost(lost)),
                }
            }
        }
    }

    /// Periodic check of the combined-topology wait
    pub fn tick(&mut self, now: Instant) -> Result<Option<TopologyChange>, DriverError> {
        if self.topology() != Topology::Combined {
            return Ok(None);
        }
        let waited = now.saturating_duration_since(self.started);
        if waited < self.combined_wait {
            return Ok(None);
        }

        let survivor = match self.ever_streamed {
            [true, false] => Side::Left,
            [false, true] => Side::Right,
            _ => return Ok(None),
        };
        if !self.streaming[survivor.index()] {
            return Ok(None);
        }

        warn!("{}", TopologyError { streaming: survivor, waited: self.combined_wait });
        self.fall_back(survivor)?;
        Ok(Some(TopologyChange { dropped: survivor.other(), survivor }))
    }

    /// Destroy every virtual device
    pub fn shutdown(&mut self) -> Result<(), DriverError> {
        info!(
            "Pipeline stopping: {} report(s), {} batch(es), {} commit failure(s)",
            self.stats.reports, self.stats.batches, self.stats.commit_failures
        );
        self.sink.destroy_all()?;
        Ok(())
    }

    fn on_mode_event(&mut self, change: ModeEvent, previous_role: Role) -> Result<(), DriverError> {
        match change {
            ModeEvent::ModeChanged { side, from, to } => {
                info!("{} Joy-Con: {:?} -> {:?}", side, from, to);
                let batch = self.mapper.release(side, previous_role);
                self.deliver_if_present(batch);
            }
            ModeEvent::OverlayChanged { on } => {
                info!("Mouse overlay {}", if on { "on" } else { "off" });
                let batch = self.mapper.release(Side::Right, previous_role);
                self.mapper.set_overlay(on);
                self.deliver_if_present(batch);
            }
        }
        Ok(())
    }

    /// Reduce the combined topology to `survivor` and swap the virtual devices to match
    fn fall_back(&mut self, survivor: Side) -> Result<(), DriverError> {
        let dropped = survivor.other();
        let released = self.mapper.release(dropped, self.modes.role(dropped));
        self.deliver_if_present(released);

        self.modes.fall_back_to_single(survivor);
        self.mapper.clear_combined();
        self.mapper.reset_device(dropped);
        self.streaming[dropped.index()] = false;

        let topology = self.topology();
        info!("Topology changed to {:?}", topology);

        match self.modes.role(survivor) {
            Role::Gamepad => {
                if self.sink.has(DeviceKind::Gamepad) {
                    self.sink.ensure_device(&Capabilities::gamepad(gamepad_name(topology)))?;
                }
                self.release_device(DeviceKind::Mouse);
            }
            Role::Mouse | Role::CombinedHalf => self.release_device(DeviceKind::Gamepad),
        }
        Ok(())
    }

    fn release_device(&mut self, kind: DeviceKind) {
        if let Err(e) = self.sink.destroy(kind) {
            warn!("{}", e);
        }
    }

    fn capabilities(&self, kind: DeviceKind) -> Capabilities {
        match kind {
            DeviceKind::Mouse => Capabilities::mouse(),
            DeviceKind::Gamepad => Capabilities::gamepad(gamepad_name(self.topology())),
        }
    }

    /// Create the device if needed and commit the batch
    fn deliver(&mut self, batch: MappedBatch) -> Result<(), DriverError> {
        if batch.events.is_empty() {
            return Ok(());
        }
        let caps = self.capabilities(batch.kind);
        self.sink.ensure_device(&caps)?;
        self.commit(batch);
        Ok(())
    }

    /// Commit only to a device that already exists (neutral batches)
    fn deliver_if_present(&mut self, batch: MappedBatch) {
        if self.sink.has(batch.kind) {
            self.commit(batch);
        }
    }

    fn commit(&mut self, batch: MappedBatch) {
        match self.sink.commit(batch.kind, &batch.events) {
            Ok(()) => self.stats.batches += 1,
            Err(e) => {
                self.stats.commit_failures += 1;
                warn!("Dropping {} batch: {}", batch.kind, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InputEvent, MockBackend, MouseButton, PadButton, SinkRecord};
    use crate::joycon2::connection::{ConnectionError, DeviceLostError};
    use crate::joycon2::protocol::SensorReport;
    use crate::joycon2::types::{ButtonMask, MotionDelta, OpticalCounters, SideFilter, StickRaw};
    use crate::mapping::config::TopologyKind;

    fn combined_config() -> Config {
        let mut config = Config::default();
        config.session.sides = SideFilter::Both;
        config.session.topology = TopologyKind::Combined;
        config.gamepad.calibration_samples = 1;
        config
    }

    fn single_config(side: Side) -> Config {
        let mut config = Config::default();
        config.session.sides = match side {
            Side::Left => SideFilter::Left,
            Side::Right => SideFilter::Right,
        };
        config.gamepad.calibration_samples = 1;
        config
    }

    fn event(side: Side, kind: LinkEventKind) -> LinkEvent {
        LinkEvent { side, kind }
    }

    fn report(side: Side, buttons: ButtonMask, dx: i32) -> LinkEvent {
        let report = SensorReport {
            side,
            sequence: 0,
            buttons,
            stick: StickRaw { x: 2048, y: 2048 },
            optical: OpticalCounters::default(),
        };
        event(side, LinkEventKind::Report { report, motion: MotionDelta { dx, dy: 0, sequence_step: 1 } })
    }

    fn failed(side: Side) -> LinkEvent {
        event(
            side,
            LinkEventKind::Failed(DeviceLostError { side, attempts: 6, last_error: ConnectionError::Timeout }),
        )
    }

    fn pressed(events: &[InputEvent], button: PadButton) -> Option<bool> {
        events.iter().find_map(|e| match *e {
            InputEvent::PadButton { button: b, pressed } if b == button => Some(pressed),
            _ => None,
        })
    }

    #[test]
    fn mouse_device_is_created_lazily() {
        let backend = MockBackend::new();
        let t0 = Instant::now();
        let mut executor = MappingExecutor::new(&single_config(Side::Right), backend.clone(), t0).unwrap();

        executor.handle(event(Side::Right, LinkEventKind::Streaming), t0).unwrap();
        assert!(backend.created().is_empty());

        executor.handle(report(Side::Right, ButtonMask::R, 5), t0).unwrap();
        assert_eq!(backend.created(), vec![Capabilities::mouse()]);

        let batches = backend.batches(DeviceKind::Mouse);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].contains(&InputEvent::PointerMotion { dx: 5, dy: 0 }));
        assert!(batches[0].contains(&InputEvent::MouseButton { button: MouseButton::Left, pressed: true }));
    }

    #[test]
    fn mode_change_releases_the_device_left_behind() {
        let backend = MockBackend::new();
        let t0 = Instant::now();
        let mut executor = MappingExecutor::new(&single_config(Side::Right), backend.clone(), t0).unwrap();

        executor.handle(report(Side::Right, ButtonMask::R, 0), t0).unwrap();
        executor.handle(report(Side::Right, ButtonMask::R | ButtonMask::CHAT, 0), t0).unwrap();

        let mouse = backend.batches(DeviceKind::Mouse);
        let last = mouse.last().unwrap();
        assert!(last.contains(&InputEvent::MouseButton { button: MouseButton::Left, pressed: false }));

        let pad = backend.batches(DeviceKind::Gamepad);
        assert_eq!(pad.len(), 1);
        assert_eq!(backend.created()[1], Capabilities::gamepad("Joy-Con 2 (R)"));
    }

    #[test]
    fn loss_releases_held_buttons() {
        let backend = MockBackend::new();
        let t0 = Instant::now();
        let mut executor = MappingExecutor::new(&combined_config(), backend.clone(), t0).unwrap();

        executor.handle(report(Side::Right, ButtonMask::B, 0), t0).unwrap();
        executor.handle(report(Side::Right, ButtonMask::B, 0), t0).unwrap();
        assert_eq!(pressed(backend.batches(DeviceKind::Gamepad).last().unwrap(), PadButton::South), Some(true));

        executor
            .handle(event(Side::Right, LinkEventKind::Lost(ConnectionError::StreamClosed)), t0)
            .unwrap();
        assert_eq!(pressed(backend.batches(DeviceKind::Gamepad).last().unwrap(), PadButton::South), Some(false));
        assert!(!executor.is_streaming(Side::Right));
    }

    #[test]
    fn combined_failure_falls_back_to_survivor() {
        let backend = MockBackend::new();
        let t0 = Instant::now();
        let mut executor = MappingExecutor::new(&combined_config(), backend.clone(), t0).unwrap();

        executor.handle(report(Side::Left, ButtonMask::L, 0), t0).unwrap();
        executor.handle(report(Side::Right, ButtonMask::A, 0), t0).unwrap();
        assert_eq!(backend.created(), vec![Capabilities::gamepad("Joy-Con 2 (L+R)")]);

        let change = executor.handle(failed(Side::Right), t0).unwrap();
        assert_eq!(change, Some(TopologyChange { dropped: Side::Right, survivor: Side::Left }));
        assert_eq!(executor.topology(), Topology::Single(Side::Left));
        assert_eq!(executor.sink().device_name(DeviceKind::Gamepad), Some("Joy-Con 2 (L)"));

        // Right events after the fallback are ignored
        backend.clear();
        executor.handle(report(Side::Right, ButtonMask::A, 0), t0).unwrap();
        assert!(backend.records().is_empty());

        executor.handle(report(Side::Left, ButtonMask::L, 0), t0).unwrap();
        let last = backend.batches(DeviceKind::Gamepad).pop().unwrap();
        assert_eq!(pressed(&last, PadButton::TL), Some(true));
        assert_eq!(pressed(&last, PadButton::East), Some(false));
    }

    #[test]
    fn single_failure_is_fatal() {
        let t0 = Instant::now();
        let mut executor = MappingExecutor::new(&single_config(Side::Left), MockBackend::new(), t0).unwrap();
        let err = executor.handle(failed(Side::Left), t0).unwrap_err();
        assert!(matches!(err, DriverError::DeviceLost(_)));
    }

    #[test]
    fn combined_wait_falls_back_when_partner_never_streams() {
        let backend = MockBackend::new();
        let t0 = Instant::now();
        let mut executor = MappingExecutor::new(&combined_config(), backend.clone(), t0).unwrap();
        executor.handle(event(Side::Left, LinkEventKind::Streaming), t0).unwrap();

        assert_eq!(executor.tick(t0 + Duration::from_secs(19)).unwrap(), None);
        let change = executor.tick(t0 + Duration::from_secs(20)).unwrap();
        assert_eq!(change, Some(TopologyChange { dropped: Side::Right, survivor: Side::Left }));
        assert_eq!(executor.topology(), Topology::Single(Side::Left));
        assert_eq!(executor.tick(t0 + Duration::from_secs(40)).unwrap(), None);
    }

    #[test]
    fn overlay_routes_right_to_mouse() {
        let backend = MockBackend::new();
        let t0 = Instant::now();
        let mut executor = MappingExecutor::new(&combined_config(), backend.clone(), t0).unwrap();

        executor.handle(report(Side::Right, ButtonMask::B, 0), t0).unwrap();
        executor.handle(report(Side::Right, ButtonMask::B | ButtonMask::CHAT, 3), t0).unwrap();
        assert!(executor.modes().overlay());

        // The neutral pad batch withdraws Right's South press
        let pad = backend.batches(DeviceKind::Gamepad);
        assert_eq!(pressed(pad.last().unwrap(), PadButton::South), Some(false));

        let mouse = backend.batches(DeviceKind::Mouse);
        assert_eq!(mouse.len(), 1);
        assert!(mouse[0].contains(&InputEvent::PointerMotion { dx: 3, dy: 0 }));
    }

    #[test]
    fn create_failure_is_fatal_and_commit_failure_is_not() {
        let t0 = Instant::now();
        let backend = MockBackend::new();
        backend.fail_create(DeviceKind::Mouse);
        let mut executor = MappingExecutor::new(&single_config(Side::Right), backend, t0).unwrap();
        assert!(matches!(
            executor.handle(report(Side::Right, ButtonMask::NONE, 1), t0),
            Err(DriverError::Backend(_))
        ));

        let backend = MockBackend::new();
        backend.fail_commit(DeviceKind::Mouse, true);
        let mut executor = MappingExecutor::new(&single_config(Side::Right), backend.clone(), t0).unwrap();
        executor.handle(report(Side::Right, ButtonMask::NONE, 1), t0).unwrap();
        assert_eq!(executor.stats().commit_failures, 1);

        backend.fail_commit(DeviceKind::Mouse, false);
        executor.handle(report(Side::Right, ButtonMask::NONE, 1), t0).unwrap();
        assert_eq!(executor.stats().batches, 1);
    }

    #[test]
    fn shutdown_destroys_every_device() {
        let backend = MockBackend::new();
        let t0 = Instant::now();
        let mut executor = MappingExecutor::new(&combined_config(), backend.clone(), t0).unwrap();
        executor.handle(report(Side::Left, ButtonMask::NONE, 0), t0).unwrap();
        executor.handle(report(Side::Right, ButtonMask::CHAT, 2), t0).unwrap();

        executor.shutdown().unwrap();
        let destroyed = backend
            .records()
            .into_iter()
            .filter(|r| matches!(r, SinkRecord::Destroy(..)))
            .count();
        assert_eq!(destroyed, 2);
    }
}
