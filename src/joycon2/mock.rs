//! Scriptable in-memory BLE transport
//!
//! Each address gets a queue of scripted connect outcomes. An accepted
//! connection hands out a notification stream fed through a [`MockRemote`];
//! closing or dropping the remote ends the stream like a BLE disconnect.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use log::info;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::joycon2::connection::{BleLink, BleTransport, ConnectionError};
use crate::joycon2::types::Side;

/// Outcome of one scripted connect attempt
pub enum MockConnect {
    Fail(ConnectionError),
    Accept(MockPeripheral),
}

/// Operations recorded by the mock, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Connect(String),
    Subscribe(String),
    Write(String, Vec<u8>),
    Unsubscribe(String),
    Disconnect(String),
}

/// Peripheral side of an accepted connection
pub struct MockPeripheral {
    notifications: UnboundedReceiver<Vec<u8>>,
    /// Successful writes before every further write fails
    writes_allowed: Option<usize>,
}

impl MockPeripheral {
    pub fn new() -> (MockPeripheral, MockRemote) {
        let (tx, rx) = unbounded();
        (
            MockPeripheral { notifications: rx, writes_allowed: None },
            MockRemote { tx: Some(tx) },
        )
    }

    /// Make every command write fail with `ConnectionError::Aborted`
    pub fn failing_writes(self) -> Self {
        self.failing_writes_after(0)
    }

    /// Let `count` writes through, then fail every later one
    pub fn failing_writes_after(mut self, count: usize) -> Self {
        self.writes_allowed = Some(count);
        self
    }
}

/// Test handle that plays the controller
pub struct MockRemote {
    tx: Option<UnboundedSender<Vec<u8>>>,
}

impl MockRemote {
    /// Push one notification payload. Returns false once the link is gone.
    pub fn send(&self, payload: Vec<u8>) -> bool {
        match &self.tx {
            Some(tx) => tx.unbounded_send(payload).is_ok(),
            None => false,
        }
    }

    /// Simulate the controller dropping the link
    pub fn close(&mut self) {
        self.tx = None;
    }
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<MockConnect>>,
    adverts: HashMap<Side, String>,
    calls: Vec<MockCall>,
}

/// In-memory [`BleTransport`]
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the outcome of the next connect attempt to `address`
    pub fn script(&self, address: &str, outcome: MockConnect) {
        self.lock()
            .scripts
            .entry(address.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Make `discover(side)` find `address`
    pub fn advertise(&self, side: Side, address: &str) {
        self.lock().adverts.insert(side, address.to_string());
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| matches!(call, MockCall::Connect(a) if a == address))
            .count()
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, ConnectionError> {
        self.record(MockCall::Connect(address.to_string()));

        let outcome = self.lock().scripts.get_mut(address).and_then(|queue| queue.pop_front());
        match outcome {
            Some(MockConnect::Accept(peripheral)) => {
                info!("[MOCK BLE] connected to {}", address);
                Ok(Box::new(MockLink {
                    address: address.to_string(),
                    peripheral: Some(peripheral),
                    writes_allowed: None,
                    transport: self.clone(),
                }))
            }
            Some(MockConnect::Fail(err)) => Err(err),
            None => Err(ConnectionError::NotFound),
        }
    }

    async fn discover(&self, side: Side, timeout: Duration) -> Result<String, ConnectionError> {
        let found = self.lock().adverts.get(&side).cloned();
        match found {
            Some(address) => Ok(address),
            None => {
                tokio::time::sleep(timeout).await;
                Err(ConnectionError::Timeout)
            }
        }
    }
}

struct MockLink {
    address: String,
    peripheral: Option<MockPeripheral>,
    writes_allowed: Option<usize>,
    transport: MockTransport,
}

#[async_trait]
impl BleLink for MockLink {
    async fn subscribe(&mut self) -> Result<BoxStream<'static, Vec<u8>>, ConnectionError> {
        self.transport.record(MockCall::Subscribe(self.address.clone()));
        let peripheral = self.peripheral.take().ok_or(ConnectionError::StreamClosed)?;
        self.writes_allowed = peripheral.writes_allowed;
        Ok(peripheral.notifications.boxed())
    }

    async fn write_command(&mut self, command: &[u8]) -> Result<(), ConnectionError> {
        self.transport.record(MockCall::Write(self.address.clone(), command.to_vec()));
        match &mut self.writes_allowed {
            Some(0) => Err(ConnectionError::Aborted),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), ConnectionError> {
        self.transport.record(MockCall::Unsubscribe(self.address.clone()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        self.transport.record(MockCall::Disconnect(self.address.clone()));
        Ok(())
    }
}
