//! btleplug implementation of the BLE seam
//!
//! Connections are opened directly (no pairing). The host Bluetooth stack must
//! already accept unauthenticated LE connections from the controller.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, info, warn};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;

use crate::joycon2::connection::{BleLink, BleTransport, ConnectionError};
use crate::joycon2::constants::*;
use crate::joycon2::discovery::classify_advertisement;
use crate::joycon2::types::Side;

/// BLE transport backed by the first system adapter
pub struct BtleplugTransport {
    _manager: Manager,
    adapter: Adapter,
}

impl BtleplugTransport {
    pub async fn new() -> Result<Self, ConnectionError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ConnectionError::NoAdapter)?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        Ok(Self { _manager: manager, adapter })
    }

    async fn start_scan(&self) -> Result<ScanStop, ConnectionError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        let adapter = self.adapter.clone();
        Ok(ScanStop::new(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("stop_scan failed: {}", e);
            }
        }))
    }

    /// Scan until a peripheral with the given address shows up.
    /// Bounded by the caller's connect timeout.
    async fn find_peripheral(&self, address: BDAddr) -> Result<Peripheral, ConnectionError> {
        let scan = self.start_scan().await?;

        let found = loop {
            match self.adapter.peripherals().await {
                Ok(peripherals) => {
                    if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == address) {
                        break Ok(peripheral);
                    }
                }
                Err(e) => break Err(e.into()),
            }
            sleep(Duration::from_millis(SCAN_POLL_MS)).await;
        };

        scan.finish().await;
        found
    }
}

/// Stops an active scan exactly once.
///
/// `finish` stops it inline. If the scanning future is dropped first (connect
/// timeout, cancellation) the stop is spawned onto the runtime instead, so the
/// adapter never keeps scanning next to a live link.
pub(crate) struct ScanStop {
    stop: Option<BoxFuture<'static, ()>>,
}

impl ScanStop {
    pub(crate) fn new(stop: impl std::future::Future<Output = ()> + Send + 'static) -> Self {
        Self { stop: Some(stop.boxed()) }
    }

    pub(crate) async fn finish(mut self) {
        if let Some(stop) = self.stop.take() {
            stop.await;
        }
    }
}

impl Drop for ScanStop {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(stop);
                }
                Err(_) => warn!("scan left running: no runtime to stop it"),
            }
        }
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn BleLink>, ConnectionError> {
        let bd_addr = BDAddr::from_str(address).map_err(|e| ConnectionError::Ble(e.to_string()))?;
        let peripheral = self.find_peripheral(bd_addr).await?;

        debug!("Connecting to {}...", address);
        peripheral.connect().await?;

        debug!("Discovering services...");
        peripheral.discover_services().await?;

        let mut tx_char = None;
        let mut cmd_char = None;
        let mut cmd_response_char = None;

        for characteristic in peripheral.characteristics() {
            if characteristic.uuid == TX_CHARACTERISTIC_UUID {
                debug!("Found TX characteristic (input data)");
                tx_char = Some(characteristic);
            } else if characteristic.uuid == CMD_CHARACTERISTIC_UUID {
                debug!("Found CMD characteristic (send commands)");
                cmd_char = Some(characteristic);
            } else if characteristic.uuid == CMD_RESPONSE_CHARACTERISTIC_UUID {
                debug!("Found CMD_RESPONSE characteristic (command acks)");
                cmd_response_char = Some(characteristic);
            }
        }

        let (tx_char, cmd_char) = match (tx_char, cmd_char) {
            (Some(tx), Some(cmd)) => (tx, cmd),
            (None, _) => {
                let _ = peripheral.disconnect().await;
                return Err(ConnectionError::MissingCharacteristic(TX_CHARACTERISTIC_UUID));
            }
            (_, None) => {
                let _ = peripheral.disconnect().await;
                return Err(ConnectionError::MissingCharacteristic(CMD_CHARACTERISTIC_UUID));
            }
        };

        info!("✓ Connected to {}", address);
        Ok(Box::new(BtleplugLink {
            adapter: self.adapter.clone(),
            peripheral,
            tx_char,
            cmd_char,
            cmd_response_char,
        }))
    }

    async fn discover(&self, side: Side, timeout: Duration) -> Result<String, ConnectionError> {
        info!("Scanning for {} Joy-Con 2...", side);

        let mut events = self.adapter.events().await?;
        let active = self.start_scan().await?;

        let scan = async {
            while let Some(event) = events.next().await {
                if let CentralEvent::ManufacturerDataAdvertisement { id, manufacturer_data } = event {
                    match classify_advertisement(&manufacturer_data) {
                        Some(found) if found == side => {
                            let peripheral = self.adapter.peripheral(&id).await?;
                            return Ok(peripheral.address().to_string());
                        }
                        Some(other) => debug!("Skipping {} Joy-Con 2 ({:?})", other, id),
                        None => {}
                    }
                }
            }
            Err(ConnectionError::Aborted)
        };

        let result = tokio::time::timeout(timeout, scan)
            .await
            .unwrap_or(Err(ConnectionError::Timeout));

        active.finish().await;

        if let Ok(address) = &result {
            info!("✓ {} Joy-Con 2 found at {}", side, address);
        }
        result
    }
}

struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
    tx_char: Characteristic,
    cmd_char: Characteristic,
    cmd_response_char: Option<Characteristic>,
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn subscribe(&mut self) -> Result<BoxStream<'static, Vec<u8>>, ConnectionError> {
        if let Some(cmd_response_char) = &self.cmd_response_char {
            self.peripheral.subscribe(cmd_response_char).await?;
            debug!("Subscribed to CMD_RESPONSE notifications");
        }

        self.peripheral.subscribe(&self.tx_char).await?;
        debug!("Subscribed to TX notifications (input data)");

        // Notifications end the stream with `None` when the adapter reports
        // this peripheral disconnected.
        let reports = self
            .peripheral
            .notifications()
            .await?
            .filter(|n| future::ready(n.uuid == TX_CHARACTERISTIC_UUID))
            .map(|n| Some(n.value));

        let id = self.peripheral.id();
        let disconnects = self.adapter.events().await?.filter_map(move |event| {
            let gone = matches!(event, CentralEvent::DeviceDisconnected(ref lost) if *lost == id);
            future::ready(if gone { Some(None::<Vec<u8>>) } else { None })
        });

        Ok(stream::select(reports, disconnects)
            .take_while(|item| future::ready(item.is_some()))
            .filter_map(future::ready)
            .boxed())
    }

    async fn write_command(&mut self, command: &[u8]) -> Result<(), ConnectionError> {
        self.peripheral
            .write(&self.cmd_char, command, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<(), ConnectionError> {
        self.peripheral.unsubscribe(&self.tx_char).await?;
        if let Some(cmd_response_char) = &self.cmd_response_char {
            self.peripheral.unsubscribe(cmd_response_char).await?;
        }
        debug!("Unsubscribed from notifications");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
