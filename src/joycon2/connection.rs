//! Joy-Con connection management
//!
//! This module owns the BLE link to one controller: unbonded connect,
//! notification subscription, the enable-stream handshake, disconnect
//! detection and reconnection with bounded exponential backoff.
//!
//! The BLE stack itself sits behind the [`BleTransport`] / [`BleLink`] seam so
//! the session logic runs unchanged against btleplug or the in-memory mock.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::joycon2::constants::COMMAND_DELAY_MS;
use crate::joycon2::protocol::{decode_report, encode_enable_stream, DeltaState, ReportLayout, SensorReport};
use crate::joycon2::types::{ConnectionState, MotionDelta, Side};

// ============================================================================
// Errors
// ============================================================================

/// Transient link failures. Retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("peripheral not found")]
    NotFound,

    #[error("connection aborted")]
    Aborted,

    #[error("timed out")]
    Timeout,

    #[error("no Bluetooth adapter available")]
    NoAdapter,

    #[error("required characteristic {0} not found")]
    MissingCharacteristic(Uuid),

    #[error("notification stream closed")]
    StreamClosed,

    #[error("no notifications within the stall timeout")]
    Stalled,

    #[error("BLE error: {0}")]
    Ble(String),
}

impl From<btleplug::Error> for ConnectionError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => ConnectionError::NotFound,
            btleplug::Error::NotConnected => ConnectionError::Aborted,
            btleplug::Error::TimedOut(_) => ConnectionError::Timeout,
            other => ConnectionError::Ble(other.to_string()),
        }
    }
}

/// A device that could not be (re)connected within the retry budget
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{side} Joy-Con lost after {attempts} attempt(s): {last_error}")]
pub struct DeviceLostError {
    pub side: Side,
    pub attempts: u32,
    pub last_error: ConnectionError,
}

// ============================================================================
// BLE Seam
// ============================================================================

/// Access to a BLE stack that permits unbonded connections
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Connect to a peripheral by address. Must not pair or bond.
    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, ConnectionError>;

    /// Scan for a Joy-Con 2 of the given side and return its address
    async fn discover(&self, side: Side, timeout: Duration) -> Result<String, ConnectionError>;
}

/// One open connection to a controller
#[async_trait]
pub trait BleLink: Send {
    /// Subscribe to input reports. The stream ends when the link drops.
    async fn subscribe(&mut self) -> Result<BoxStream<'static, Vec<u8>>, ConnectionError>;

    /// Write a command to the command characteristic
    async fn write_command(&mut self, command: &[u8]) -> Result<(), ConnectionError>;

    /// Stop notifications on the input and command-response characteristics
    async fn unsubscribe(&mut self) -> Result<(), ConnectionError>;

    async fn disconnect(&mut self) -> Result<(), ConnectionError>;
}

// ============================================================================
// Reconnect Policy
// ============================================================================

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures before the device is given up.
    /// A mid-stream loss counts as the first failure of its reconnect cycle.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
            max_attempts: 6,
        }
    }
}

/// Per-session timing and layout settings
#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub layout: ReportLayout,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
    /// Largest optical step accepted from one raw report, per axis
    pub motion_clamp: i32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            layout: ReportLayout::V1,
            policy: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(15),
            stall_timeout: Duration::from_secs(2),
            motion_clamp: 200,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Message from a link session to the supervisor, tagged with its side
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub side: Side,
    pub kind: LinkEventKind,
}

#[derive(Debug, Clone)]
pub enum LinkEventKind {
    /// Subscribed and enable-stream acknowledged
    Streaming,
    /// One decoded report with the motion since the previous delivered one
    Report { report: SensorReport, motion: MotionDelta },
    /// Mid-stream loss; reconnection is in progress
    Lost(ConnectionError),
    /// Retries exhausted; the session has ended
    Failed(DeviceLostError),
}

/// Counters logged when a session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connections: u32,
    pub reports: u64,
    pub protocol_errors: u64,
    pub dropped: u64,
    pub stale_sequence: u64,
}

enum StreamEnd {
    Cancelled,
    Ended { error: ConnectionError, delivered: u64 },
}

// ============================================================================
// Link Session
// ============================================================================

/// Owns one controller's connection for the lifetime of the driver
pub struct LinkSession {
    side: Side,
    address: String,
    transport: Arc<dyn BleTransport>,
    settings: LinkSettings,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
    state: ConnectionState,
    delta: DeltaState,
    carried: MotionDelta,
    stats: SessionStats,
}

impl LinkSession {
    pub fn new(
        side: Side,
        address: impl Into<String>,
        transport: Arc<dyn BleTransport>,
        settings: LinkSettings,
        events: mpsc::Sender<LinkEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            side,
            address: address.into(),
            transport,
            settings,
            events,
            cancel,
            state: ConnectionState::Disconnected,
            delta: DeltaState::new(),
            carried: MotionDelta::default(),
            stats: SessionStats::default(),
        }
    }

    /// Run until cancelled or until the retry budget is exhausted.
    ///
    /// Exhaustion is reported both as a [`LinkEventKind::Failed`] event and as
    /// the returned error.
    pub async fn run(mut self) -> Result<SessionStats, DeviceLostError> {
        let cancel = self.cancel.clone();
        let mut failures: u32 = 0;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let established = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                result = tokio::time::timeout(self.settings.connect_timeout, self.establish()) => {
                    result.unwrap_or(Err(ConnectionError::Timeout))
                }
            };

            let error = match established {
                Ok((mut link, stream)) => {
                    self.stats.connections += 1;
                    self.delta.reset();
                    self.carried = MotionDelta::default();
                    self.set_state(ConnectionState::Streaming);
                    info!("✓ {} Joy-Con streaming ({})", self.side, self.address);
                    self.emit(LinkEventKind::Streaming).await;

                    let end = self.pump(link.as_mut(), stream).await;
                    self.close(link.as_mut()).await;

                    match end {
                        StreamEnd::Cancelled => break Ok(()),
                        StreamEnd::Ended { error, delivered } => {
                            self.set_state(ConnectionState::Lost);
                            warn!("{} Joy-Con link lost: {}", self.side, error);
                            self.emit(LinkEventKind::Lost(error.clone())).await;
                            if delivered > 0 {
                                failures = 0;
                            }
                            error
                        }
                    }
                }
                Err(error) => error,
            };

            failures += 1;
            if self.settings.policy.exhausted(failures) {
                break Err(DeviceLostError {
                    side: self.side,
                    attempts: failures,
                    last_error: error,
                });
            }

            let delay = self.settings.policy.delay(failures);
            debug!(
                "{} Joy-Con: attempt {}/{} failed ({}), retrying in {:?}",
                self.side, failures, self.settings.policy.max_attempts, error, delay
            );
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = sleep(delay) => {}
            }
        };

        self.set_state(ConnectionState::Disconnected);
        info!(
            "{} Joy-Con session ended: {} connection(s), {} report(s), {} protocol error(s), {} dropped, {} stale sequence",
            self.side,
            self.stats.connections,
            self.stats.reports,
            self.stats.protocol_errors,
            self.stats.dropped,
            self.stats.stale_sequence
        );

        match outcome {
            Ok(()) => Ok(self.stats),
            Err(lost) => {
                error!("{}", lost);
                self.emit(LinkEventKind::Failed(lost.clone())).await;
                Err(lost)
            }
        }
    }

    /// Connect, subscribe and switch the sensor stream on
    async fn establish(&mut self) -> Result<(Box<dyn BleLink>, BoxStream<'static, Vec<u8>>), ConnectionError> {
        debug!("{} Joy-Con: connecting to {}", self.side, self.address);
        let mut link = self.transport.connect(&self.address).await?;

        let stream = match link.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = link.disconnect().await;
                return Err(e);
            }
        };

        if let Err(e) = Self::write_enable(link.as_mut()).await {
            warn!("{} Joy-Con: enable-stream write failed: {}", self.side, e);
            self.close(link.as_mut()).await;
            return Err(e);
        }

        Ok((link, stream))
    }

    /// Unsubscribe then disconnect; both steps always run
    async fn close(&self, link: &mut dyn BleLink) {
        if let Err(e) = link.unsubscribe().await {
            debug!("{} Joy-Con: unsubscribe failed: {}", self.side, e);
        }
        if let Err(e) = link.disconnect().await {
            debug!("{} Joy-Con: disconnect failed: {}", self.side, e);
        }
    }

    async fn write_enable(link: &mut dyn BleLink) -> Result<(), ConnectionError> {
        for (i, command) in encode_enable_stream().iter().enumerate() {
            if i > 0 {
                sleep(Duration::from_millis(COMMAND_DELAY_MS)).await;
            }
            link.write_command(command).await?;
        }
        Ok(())
    }

    /// Forward reports until the stream ends, stalls twice, or the session is cancelled
    async fn pump(&mut self, link: &mut dyn BleLink, mut stream: BoxStream<'static, Vec<u8>>) -> StreamEnd {
        let mut delivered: u64 = 0;
        let mut stalled = false;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                next = tokio::time::timeout(self.settings.stall_timeout, stream.next()) => next,
            };

            match next {
                Ok(Some(payload)) => {
                    stalled = false;
                    match self.forward(&payload) {
                        Some(true) => delivered += 1,
                        Some(false) => {}
                        // Supervisor is gone
                        None => return StreamEnd::Cancelled,
                    }
                }
                Ok(None) => {
                    return StreamEnd::Ended { error: ConnectionError::StreamClosed, delivered };
                }
                Err(_) if stalled => {
                    return StreamEnd::Ended { error: ConnectionError::Stalled, delivered };
                }
                Err(_) => {
                    warn!(
                        "{} Joy-Con: no reports for {:?}, re-sending enable commands",
                        self.side, self.settings.stall_timeout
                    );
                    stalled = true;
                    if let Err(error) = Self::write_enable(link).await {
                        return StreamEnd::Ended { error, delivered };
                    }
                }
            }
        }
    }

    /// Decode one payload and queue it.
    ///
    /// Returns `Some(true)` when delivered, `Some(false)` when dropped and
    /// `None` when the receiving side has closed.
    fn forward(&mut self, payload: &[u8]) -> Option<bool> {
        let report = match decode_report(&self.settings.layout, self.side, payload) {
            Ok(report) => report,
            Err(e) => {
                self.stats.protocol_errors += 1;
                if self.stats.protocol_errors == 1 {
                    warn!("{} Joy-Con: dropping malformed report: {}", self.side, e);
                } else {
                    debug!("{} Joy-Con: dropping malformed report: {}", self.side, e);
                }
                return Some(false);
            }
        };

        self.stats.reports += 1;
        let mut motion = self.delta.update(&report);
        if motion.sequence_step <= 0 {
            self.stats.stale_sequence += 1;
        }
        // Spike guard applies per raw report, never to carried motion
        let clamp = self.settings.motion_clamp;
        motion.dx = motion.dx.clamp(-clamp, clamp);
        motion.dy = motion.dy.clamp(-clamp, clamp);
        motion.absorb(std::mem::take(&mut self.carried));

        let event = LinkEvent {
            side: self.side,
            kind: LinkEventKind::Report { report, motion },
        };

        match self.events.try_send(event) {
            Ok(()) => Some(true),
            Err(TrySendError::Full(_)) => {
                self.stats.dropped += 1;
                debug!("{} Joy-Con: queue full, report dropped", self.side);
                self.carried = motion;
                Some(false)
            }
            Err(TrySendError::Closed(_)) => None,
        }
    }

    async fn emit(&self, kind: LinkEventKind) {
        let event = LinkEvent { side: self.side, kind };
        if self.events.send(event).await.is_err() {
            debug!("{} Joy-Con: supervisor gone, event discarded", self.side);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{} Joy-Con: {:?} -> {:?}", self.side, self.state, state);
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joycon2::mock::{MockCall, MockConnect, MockPeripheral, MockTransport};

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    fn report(sequence: u16, optical_x: u16) -> Vec<u8> {
        let mut data = vec![0u8; 0x3F];
        data[0..2].copy_from_slice(&sequence.to_le_bytes());
        data[16..18].copy_from_slice(&optical_x.to_le_bytes());
        data
    }

    fn settings(max_attempts: u32) -> LinkSettings {
        LinkSettings {
            layout: ReportLayout::V1,
            policy: ReconnectPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(1000),
                max_attempts,
            },
            connect_timeout: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(3600),
            motion_clamp: 200,
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            max_attempts: 5,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_millis(3000));
        assert_eq!(policy.delay(60), Duration::from_millis(3000));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_device_lost() {
        let transport = MockTransport::new();
        for _ in 0..3 {
            transport.script(ADDR, MockConnect::Fail(ConnectionError::Aborted));
        }
        let (tx, mut rx) = mpsc::channel(16);
        let session = LinkSession::new(Side::Right, ADDR, Arc::new(transport.clone()), settings(3), tx, CancellationToken::new());

        let started = tokio::time::Instant::now();
        let err = session.run().await.unwrap_err();
        assert_eq!(err.side, Side::Right);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, ConnectionError::Aborted);
        // 100ms + 200ms between the three attempts
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, LinkEventKind::Failed(ref lost) if lost.attempts == 3));
        assert_eq!(transport.connect_count(ADDR), 3);
    }

    #[tokio::test]
    async fn test_streams_reports_with_wrapping_motion() {
        let transport = MockTransport::new();
        let (peripheral, remote) = MockPeripheral::new();
        transport.script(ADDR, MockConnect::Accept(peripheral));

        remote.send(report(1, 65530));
        remote.send(report(2, 4));
        remote.send(vec![0u8; 8]);
        remote.send(report(3, 6));

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let session = LinkSession::new(Side::Right, ADDR, Arc::new(transport.clone()), settings(1), tx, cancel.clone());
        let handle = tokio::spawn(session.run());

        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Streaming));
        let mut dx = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap().kind {
                LinkEventKind::Report { motion, .. } => dx.push(motion.dx),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(dx, vec![0, 10, 2]);

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.reports, 3);
        assert_eq!(stats.protocol_errors, 1);

        let calls = transport.calls();
        let [configure, start] = encode_enable_stream();
        assert_eq!(
            calls,
            vec![
                MockCall::Connect(ADDR.to_string()),
                MockCall::Subscribe(ADDR.to_string()),
                MockCall::Write(ADDR.to_string(), configure.to_vec()),
                MockCall::Write(ADDR.to_string(), start.to_vec()),
                MockCall::Unsubscribe(ADDR.to_string()),
                MockCall::Disconnect(ADDR.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_reconnects_after_loss() {
        let transport = MockTransport::new();
        let (first, mut first_remote) = MockPeripheral::new();
        let (second, second_remote) = MockPeripheral::new();
        transport.script(ADDR, MockConnect::Accept(first));
        transport.script(ADDR, MockConnect::Accept(second));

        first_remote.send(report(1, 100));
        first_remote.close();
        second_remote.send(report(50, 9000));

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let session = LinkSession::new(Side::Left, ADDR, Arc::new(transport.clone()), settings(2), tx, cancel.clone());
        let handle = tokio::spawn(session.run());

        let mut kinds = Vec::new();
        while kinds.len() < 5 {
            kinds.push(rx.recv().await.unwrap().kind);
        }
        assert!(matches!(kinds[0], LinkEventKind::Streaming));
        assert!(matches!(kinds[1], LinkEventKind::Report { .. }));
        assert!(matches!(kinds[2], LinkEventKind::Lost(ConnectionError::StreamClosed)));
        assert!(matches!(kinds[3], LinkEventKind::Streaming));
        // Delta state starts over on the new connection
        assert!(matches!(kinds[4], LinkEventKind::Report { motion, .. } if motion.dx == 0));

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_resends_enable_then_gives_up() {
        let transport = MockTransport::new();
        let (peripheral, remote) = MockPeripheral::new();
        transport.script(ADDR, MockConnect::Accept(peripheral));

        let (tx, mut rx) = mpsc::channel(16);
        let mut settings = settings(1);
        settings.stall_timeout = Duration::from_secs(2);
        let session = LinkSession::new(Side::Right, ADDR, Arc::new(transport.clone()), settings, tx, CancellationToken::new());

        let err = session.run().await.unwrap_err();
        assert_eq!(err.last_error, ConnectionError::Stalled);
        drop(remote);

        let writes = transport
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::Write(..)))
            .count();
        // Initial handshake plus one re-send
        assert_eq!(writes, 4);

        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Streaming));
        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Lost(ConnectionError::Stalled)));
        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Failed(_)));
    }

    #[tokio::test]
    async fn test_full_queue_carries_motion() {
        let transport = MockTransport::new();
        let (peripheral, remote) = MockPeripheral::new();
        transport.script(ADDR, MockConnect::Accept(peripheral));

        // One slot: a second report queued before the first is read gets dropped
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let session = LinkSession::new(Side::Right, ADDR, Arc::new(transport.clone()), settings(1), tx, cancel.clone());
        let handle = tokio::spawn(session.run());

        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Streaming));
        remote.send(report(1, 0));
        match rx.recv().await.unwrap().kind {
            LinkEventKind::Report { motion, .. } => assert_eq!(motion.dx, 0),
            other => panic!("unexpected event {:?}", other),
        }

        remote.send(report(2, 5));
        remote.send(report(3, 12));
        // Let the session drain the mock stream into the one-slot queue
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut total = 0;
        while let Ok(event) = rx.try_recv() {
            if let LinkEventKind::Report { motion, .. } = event.kind {
                total += motion.dx;
            }
        }
        remote.send(report(4, 20));
        if let LinkEventKind::Report { motion, .. } = rx.recv().await.unwrap().kind {
            total += motion.dx;
        }
        assert_eq!(total, 20);

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_dropped_reports_deliver_full_motion() {
        let transport = MockTransport::new();
        let (peripheral, remote) = MockPeripheral::new();
        transport.script(ADDR, MockConnect::Accept(peripheral));

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let session = LinkSession::new(Side::Right, ADDR, Arc::new(transport.clone()), settings(1), tx, cancel.clone());
        let handle = tokio::spawn(session.run());

        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Streaming));
        // Report 1 takes the only slot; the next three 150-count steps are dropped
        remote.send(report(1, 0));
        remote.send(report(2, 150));
        remote.send(report(3, 300));
        remote.send(report(4, 450));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut delivered = Vec::new();
        delivered.push(rx.recv().await.unwrap().kind);
        remote.send(report(5, 450));
        delivered.push(rx.recv().await.unwrap().kind);
        // A single jump is still clamped
        remote.send(report(6, 1450));
        delivered.push(rx.recv().await.unwrap().kind);

        let dx: Vec<i32> = delivered
            .into_iter()
            .map(|kind| match kind {
                LinkEventKind::Report { motion, .. } => motion.dx,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(dx, vec![0, 450, 200]);

        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.dropped, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failures_count_as_attempts() {
        let transport = MockTransport::new();
        // Handshake succeeds, the stall re-send fails
        let (first, _first_remote) = MockPeripheral::new();
        transport.script(ADDR, MockConnect::Accept(first.failing_writes_after(2)));
        // Handshake fails outright
        let (second, _second_remote) = MockPeripheral::new();
        transport.script(ADDR, MockConnect::Accept(second.failing_writes()));

        let (tx, mut rx) = mpsc::channel(16);
        let mut settings = settings(2);
        settings.stall_timeout = Duration::from_secs(2);
        let session = LinkSession::new(Side::Left, ADDR, Arc::new(transport.clone()), settings, tx, CancellationToken::new());

        let err = session.run().await.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_error, ConnectionError::Aborted);
        assert_eq!(transport.connect_count(ADDR), 2);

        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Streaming));
        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Lost(ConnectionError::Aborted)));
        assert!(matches!(rx.recv().await.unwrap().kind, LinkEventKind::Failed(ref lost) if lost.attempts == 2));

        // Both links were released after their failed write
        let closes = transport
            .calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::Unsubscribe(_)))
            .count();
        assert_eq!(closes, 2);
    }
}
