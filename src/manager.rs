//! High-level Joy-Con 2 Manager
//!
//! The session supervisor: resolves controller addresses, runs one
//! [`LinkSession`] task per controller and drains their events into the single
//! [`MappingExecutor`]. Shutdown stops the sessions first and destroys the
//! virtual devices last.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, VirtualDeviceBackend};
use crate::joycon2::connection::{BleTransport, ConnectionError, DeviceLostError, LinkSession, SessionStats};
use crate::joycon2::types::Side;
use crate::mapping::config::{Config, ConfigError, RunMode};
use crate::mapping::executor::{MappingExecutor, TopologyChange};

/// How often the supervisor re-checks the combined-topology wait
const SUPERVISOR_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("virtual device error: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    DeviceLost(#[from] DeviceLostError),

    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
}

/// Combined topology requested but only one controller ever streamed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("combined topology requested but only the {streaming} Joy-Con reached streaming within {waited:?}")]
pub struct TopologyError {
    pub streaming: Side,
    pub waited: Duration,
}

struct SessionHandle {
    side: Side,
    cancel: CancellationToken,
    task: JoinHandle<Result<SessionStats, DeviceLostError>>,
}

/// Manager for handling Joy-Con 2 controllers
pub struct JoyConManager<B: VirtualDeviceBackend> {
    config: Config,
    transport: Arc<dyn BleTransport>,
    backend: B,
}

impl<B: VirtualDeviceBackend> JoyConManager<B> {
    pub fn new(config: Config, transport: Arc<dyn BleTransport>, backend: B) -> Self {
        Self { config, transport, backend }
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Teardown always runs: every session is cancelled and awaited, then every
    /// virtual device is destroyed.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DriverError> {
        self.config.validate()?;
        let link = self.config.link_settings()?;
        let topology = self.config.topology();
        info!("Starting Joy-Con Manager ({:?})...", topology);

        let addresses = match self.resolve_addresses(&shutdown).await? {
            Some(addresses) => addresses,
            None => {
                info!("Shutdown requested during discovery");
                return Ok(());
            }
        };
        ensure_distinct(&addresses)?;

        let (tx, mut rx) = mpsc::channel(self.config.session.queue_capacity);
        let mut executor = MappingExecutor::new(&self.config, self.backend, now())?;

        let mut sessions: Vec<SessionHandle> = addresses
            .into_iter()
            .map(|(side, address)| {
                info!("Starting {} Joy-Con session for {}", side, address);
                let cancel = shutdown.child_token();
                let session = LinkSession::new(
                    side,
                    address,
                    Arc::clone(&self.transport),
                    link,
                    tx.clone(),
                    cancel.clone(),
                );
                SessionHandle { side, cancel, task: tokio::spawn(session.run()) }
            })
            .collect();
        drop(tx);

        let mut ticker = tokio::time::interval(SUPERVISOR_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                event = rx.recv() => match event {
                    Some(event) => match executor.handle(event, now()) {
                        Ok(change) => stop_dropped(&sessions, change),
                        Err(e) => break Err(e),
                    },
                    None => {
                        info!("All Joy-Con sessions ended");
                        break Ok(());
                    }
                },
                _ = ticker.tick() => match executor.tick(now()) {
                    Ok(change) => stop_dropped(&sessions, change),
                    Err(e) => break Err(e),
                },
            }
        };

        // Sessions first, devices last; every step runs regardless of earlier failures
        drop(rx);
        for session in &sessions {
            session.cancel.cancel();
        }
        for session in sessions.drain(..) {
            match session.task.await {
                Ok(Ok(stats)) => debug!("{} Joy-Con session stopped after {} report(s)", session.side, stats.reports),
                Ok(Err(lost)) => debug!("{} Joy-Con session had ended: {}", session.side, lost),
                Err(e) => warn!("{} Joy-Con session task failed: {}", session.side, e),
            }
        }

        let teardown = executor.shutdown();
        if let Err(e) = &teardown {
            warn!("Virtual device teardown: {}", e);
        }
        info!("✓ Manager stopped");

        result.and(teardown)
    }

    /// Address per needed side. `None` if shutdown arrived while scanning.
    async fn resolve_addresses(&self, shutdown: &CancellationToken) -> Result<Option<Vec<(Side, String)>>, DriverError> {
        let mut addresses = Vec::new();

        for side in self.config.topology().sides() {
            if let Some(address) = self.config.address_for(side) {
                addresses.push((side, address.to_string()));
                continue;
            }
            if self.config.session.run_mode == RunMode::Address {
                return Err(ConfigError::Invalid(format!("no address configured for the {} Joy-Con", side)).into());
            }

            info!("Scanning for the {} Joy-Con, press its sync button...", side);
            let found = tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                found = self.transport.discover(side, self.config.discovery_timeout()) => found?,
            };
            info!("✓ Found {} Joy-Con: {}", side, found);
            addresses.push((side, found));
        }

        Ok(Some(addresses))
    }
}

/// At most one session per BLE address
fn ensure_distinct(addresses: &[(Side, String)]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for (_, address) in addresses {
        if !seen.insert(address.to_ascii_uppercase()) {
            return Err(ConfigError::Invalid(format!("address {} requested for more than one Joy-Con", address)));
        }
    }
    Ok(())
}

fn stop_dropped(sessions: &[SessionHandle], change: Option<TopologyChange>) {
    let Some(change) = change else { return };
    for session in sessions.iter().filter(|s| s.side == change.dropped) {
        session.cancel.cancel();
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_addresses_are_refused() {
        let addresses = vec![
            (Side::Left, "98:E2:55:00:00:01".to_string()),
            (Side::Right, "98:e2:55:00:00:01".to_string()),
        ];
        assert!(matches!(ensure_distinct(&addresses), Err(ConfigError::Invalid(_))));

        let addresses = vec![
            (Side::Left, "98:E2:55:00:00:01".to_string()),
            (Side::Right, "98:E2:55:00:00:02".to_string()),
        ];
        assert!(ensure_distinct(&addresses).is_ok());
    }

    #[test]
    fn topology_error_names_the_streaming_side() {
        let err = TopologyError { streaming: Side::Left, waited: Duration::from_secs(20) };
        assert!(err.to_string().contains("Left"));
    }
}
