//! Mock virtual device backend for testing.
//!
//! This backend logs and records every operation instead of creating OS
//! devices. Clones share one record, so a test can keep a handle while the
//! pipeline owns the backend.

use log::info;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BackendError, Capabilities, DeviceKind, InputEvent, VirtualDeviceBackend};

/// One recorded backend operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkRecord {
    Create(Capabilities),
    Commit(DeviceKind, Vec<InputEvent>),
    Destroy(DeviceKind, String),
}

#[derive(Default)]
struct MockBackendState {
    records: Vec<SinkRecord>,
    fail_create: HashSet<DeviceKind>,
    fail_commit: HashSet<DeviceKind>,
    fail_destroy: HashSet<DeviceKind>,
}

/// Mock backend that records events instead of sending them.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockBackendState>>,
}

/// Device handle created by [`MockBackend`]
#[derive(Debug)]
pub struct MockDevice {
    caps: Capabilities,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockBackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.lock().records.clone()
    }

    /// Capabilities of every device created so far, in order
    pub fn created(&self) -> Vec<Capabilities> {
        self.lock()
            .records
            .iter()
            .filter_map(|r| match r {
                SinkRecord::Create(caps) => Some(caps.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every batch committed to devices of one kind, in order
    pub fn batches(&self, kind: DeviceKind) -> Vec<Vec<InputEvent>> {
        self.lock()
            .records
            .iter()
            .filter_map(|r| match r {
                SinkRecord::Commit(k, events) if *k == kind => Some(events.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().records.clear();
    }

    pub fn fail_create(&self, kind: DeviceKind) {
        self.lock().fail_create.insert(kind);
    }

    pub fn fail_commit(&self, kind: DeviceKind, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.fail_commit.insert(kind);
        } else {
            state.fail_commit.remove(&kind);
        }
    }

    pub fn fail_destroy(&self, kind: DeviceKind) {
        self.lock().fail_destroy.insert(kind);
    }
}

impl VirtualDeviceBackend for MockBackend {
    type Device = MockDevice;

    fn create(&mut self, caps: &Capabilities) -> Result<MockDevice, BackendError> {
        let mut state = self.lock();
        if state.fail_create.contains(&caps.kind) {
            return Err(BackendError::Create {
                kind: caps.kind,
                reason: "permission denied (mock)".to_string(),
            });
        }
        info!("[MOCK SINK] Create {} \"{}\"", caps.kind, caps.name);
        state.records.push(SinkRecord::Create(caps.clone()));
        Ok(MockDevice { caps: caps.clone() })
    }

    fn commit(&mut self, device: &mut MockDevice, events: &[InputEvent]) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.fail_commit.contains(&device.caps.kind) {
            return Err(BackendError::Commit {
                kind: device.caps.kind,
                reason: "write failed (mock)".to_string(),
            });
        }
        info!("[MOCK SINK] Commit {} x{}", device.caps.kind, events.len());
        state.records.push(SinkRecord::Commit(device.caps.kind, events.to_vec()));
        Ok(())
    }

    fn destroy(&mut self, device: MockDevice) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.fail_destroy.contains(&device.caps.kind) {
            return Err(BackendError::Destroy {
                kind: device.caps.kind,
                reason: "destroy failed (mock)".to_string(),
            });
        }
        info!("[MOCK SINK] Destroy {} \"{}\"", device.caps.kind, device.caps.name);
        state.records.push(SinkRecord::Destroy(device.caps.kind, device.caps.name));
        Ok(())
    }
}
