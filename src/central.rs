//! btleplug-backed implementation of the central-role capability traits.

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ble::{CentralAdapter, CentralLink, DiscoveredDevice};
use crate::error::{GatewayError, Result};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 32;

/// Central adapter over the host's first btleplug Bluetooth adapter
pub struct BtleplugCentral {
    adapter: Adapter,
    seen: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugCentral {
    /// Bind to the host's first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BleAdapterUnavailable`] when the host has no
    /// adapter and [`GatewayError::Ble`] when the backend fails to
    /// initialise.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(GatewayError::BleAdapterUnavailable)?;

        Ok(Self {
            adapter,
            seen: Mutex::new(HashMap::new()),
        })
    }

    async fn lookup(&self, device_id: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.seen.lock().await.get(device_id) {
            return Ok(peripheral.clone());
        }
        // not seen by one of our scans; ask the adapter cache directly
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.id().to_string() == device_id {
                return Ok(peripheral);
            }
        }
        Err(GatewayError::NoDeviceFound)
    }
}

#[async_trait]
impl CentralAdapter for BtleplugCentral {
    type Link = BtleplugLink;

    async fn wait_powered_on(&self) -> Result<()> {
        // btleplug has no portable power-state event; an adapter that
        // answers is treated as powered on
        self.adapter
            .adapter_info()
            .await
            .map_err(|_| GatewayError::BleAdapterUnavailable)?;
        Ok(())
    }

    async fn scan(&self, service: Uuid, window: Duration) -> Result<Vec<DiscoveredDevice>> {
        let filter = ScanFilter {
            services: vec![service],
        };
        self.adapter.start_scan(filter).await?;
        tokio::time::sleep(window).await;
        self.adapter.stop_scan().await?;

        let mut devices = Vec::new();
        let mut seen = self.seen.lock().await;
        for peripheral in self.adapter.peripherals().await? {
            let id = peripheral.id().to_string();
            let name = match peripheral.properties().await {
                Ok(Some(properties)) => properties.local_name,
                _ => None,
            };
            debug!("discovered {id} ({name:?})");
            devices.push(DiscoveredDevice {
                id: id.clone(),
                name,
            });
            seen.insert(id, peripheral);
        }
        Ok(devices)
    }

    async fn connect(&self, device_id: &str) -> Result<Self::Link> {
        let peripheral = self.lookup(device_id).await?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok(BtleplugLink { peripheral })
    }
}

/// An established btleplug connection
pub struct BtleplugLink {
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<btleplug::api::Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
    }
}

#[async_trait]
impl CentralLink for BtleplugLink {
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Option<Vec<u8>>> {
        let Some(target) = self.find_characteristic(service, characteristic) else {
            return Ok(None);
        };
        Ok(Some(self.peripheral.read(&target).await?))
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let target = self
            .find_characteristic(service, characteristic)
            .ok_or(GatewayError::BleServiceNotFound(characteristic))?;

        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| GatewayError::BleSubscribeFailed(e.to_string()))?;

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| GatewayError::BleSubscribeFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            debug!("notification stream for {characteristic} ended");
        });

        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.is_connected().await {
            return Ok(());
        }
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("disconnect failed: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}
