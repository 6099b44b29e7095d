//! FTMS peripheral: advertises the rower as a Fitness Machine and pushes
//! Indoor Bike Data notifications driven by the S4 datapoint stream.
//!
//! Fitness apps overwhelmingly speak the indoor-bike flavour of FTMS, so
//! the rower is presented as one: stroke rate maps onto cadence and the
//! power figure rides along unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::{
    AdapterState, CharacteristicDefinition, PeripheralAdapter, ServiceDefinition,
    FITNESS_MACHINE_FEATURE, FITNESS_MACHINE_SERVICE, INDOOR_BIKE_DATA,
};
use crate::config::FtmsConfig;
use crate::error::Result;
use crate::types::DataPoint;

/// Fitness Machine Feature bit: cadence supported
pub const FEATURE_CADENCE_SUPPORTED: u32 = 1 << 1;

/// Fitness Machine Feature bit: power measurement supported
pub const FEATURE_POWER_MEASUREMENT_SUPPORTED: u32 = 1 << 14;

/// Indoor Bike Data flag: instantaneous cadence present
pub const FLAG_INSTANTANEOUS_CADENCE: u16 = 1 << 2;

/// Indoor Bike Data flag: instantaneous power present
pub const FLAG_INSTANTANEOUS_POWER: u16 = 1 << 6;

/// Encode the Fitness Machine Feature value: two little-endian u32 words
///
/// Word one advertises cadence and power measurement; word two (target
/// setting features) is zero; the rower accepts no targets over FTMS.
#[must_use]
pub fn encode_feature() -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(FEATURE_CADENCE_SUPPORTED | FEATURE_POWER_MEASUREMENT_SUPPORTED);
    buf.put_u32_le(0);
    buf.freeze()
}

/// Encode one Indoor Bike Data notification
///
/// Fixed 6-byte little-endian layout: flags, cadence, power. Cadence is
/// carried at the FTMS 0.5 rpm resolution, so the stroke rate doubles on
/// the wire.
#[must_use]
pub fn encode_indoor_bike_data(stroke_rate: u16, power_w: i16) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16_le(FLAG_INSTANTANEOUS_CADENCE | FLAG_INSTANTANEOUS_POWER);
    buf.put_u16_le(stroke_rate.saturating_mul(2));
    buf.put_i16_le(power_w);
    buf.freeze()
}

#[derive(Debug, Default, Clone, Copy)]
struct BikeData {
    stroke_rate: u16,
    power_w: i16,
}

/// The Fitness Machine peripheral
///
/// Generic over the [`PeripheralAdapter`] so the whole notification path
/// runs against an in-memory adapter in tests; production uses
/// [`crate::peripheral::BluezPeripheral`] on Linux.
pub struct FtmsPeripheral<P: PeripheralAdapter> {
    adapter: Arc<P>,
    config: FtmsConfig,
    cached: Arc<Mutex<BikeData>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: PeripheralAdapter> FtmsPeripheral<P> {
    /// Create the peripheral over the given adapter
    #[must_use]
    pub fn new(adapter: P, config: FtmsConfig) -> Self {
        Self {
            adapter: Arc::new(adapter),
            config,
            cached: Arc::new(Mutex::new(BikeData::default())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The GATT service served to centrals
    #[must_use]
    pub fn service_definition() -> ServiceDefinition {
        ServiceDefinition {
            uuid: FITNESS_MACHINE_SERVICE,
            characteristics: vec![
                CharacteristicDefinition {
                    uuid: FITNESS_MACHINE_FEATURE,
                    read_value: Some(encode_feature().to_vec()),
                    notify: false,
                },
                CharacteristicDefinition {
                    uuid: INDOOR_BIKE_DATA,
                    read_value: None,
                    notify: true,
                },
            ],
        }
    }

    /// Follow the adapter power state: advertise and serve while powered
    /// on, stop advertising otherwise
    ///
    /// Advertising and service registration are idempotent across
    /// duplicate power events.
    ///
    /// # Errors
    ///
    /// Returns the adapter's error if the power-state stream cannot be
    /// opened.
    pub async fn run(&self) -> Result<()> {
        let mut states = self.adapter.adapter_states().await?;
        let adapter = Arc::clone(&self.adapter);
        let name = self.config.local_name.clone();

        let task = tokio::spawn(async move {
            while let Some(state) = states.recv().await {
                match state {
                    AdapterState::PoweredOn => {
                        debug!("adapter powered on");
                        if let Err(e) = adapter
                            .start_advertising(&name, FITNESS_MACHINE_SERVICE)
                            .await
                        {
                            warn!("failed to start advertising: {e}");
                            continue;
                        }
                        if let Err(e) = adapter.register_service(Self::service_definition()).await
                        {
                            warn!("failed to register service: {e}");
                        }
                    }
                    AdapterState::PoweredOff | AdapterState::Unknown => {
                        debug!("adapter left powered-on, stopping advertising");
                        if let Err(e) = adapter.stop_advertising().await {
                            warn!("failed to stop advertising: {e}");
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(task);
        info!("FTMS peripheral running as {:?}", self.config.local_name);
        Ok(())
    }

    /// Feed the peripheral from an S4 datapoint subscription
    ///
    /// `stroke_rate` samples update cadence, `kcal_watts` samples update
    /// power; every arrival pushes one notification.
    pub async fn attach(&self, mut datapoints: broadcast::Receiver<DataPoint>) {
        let adapter = Arc::clone(&self.adapter);
        let cached = Arc::clone(&self.cached);

        let task = tokio::spawn(async move {
            loop {
                match datapoints.recv().await {
                    Ok(point) => {
                        let (power, cadence) = match point.name {
                            "stroke_rate" => (None, Some(clamp_u16(point.value))),
                            "kcal_watts" => (Some(clamp_i16(point.value)), None),
                            _ => continue,
                        };
                        if let Err(e) = push_update(&adapter, &cached, power, cadence).await {
                            warn!("indoor bike data notification failed: {e}");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("FTMS feed lagged, {missed} samples dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("FTMS datapoint feed ended");
        });
        self.tasks.lock().await.push(task);
    }

    /// Update the cached bike data and notify subscribed centrals
    ///
    /// Absent fields keep their most recent value. With no subscribers the
    /// update is a no-op beyond the cache.
    ///
    /// # Errors
    ///
    /// Returns the adapter's error when pushing the notification fails.
    pub async fn update(&self, power_w: Option<i16>, cadence: Option<u16>) -> Result<()> {
        push_update(&self.adapter, &self.cached, power_w, cadence).await
    }

    /// Stop the feed and lifecycle tasks and cease advertising
    pub async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(e) = self.adapter.stop_advertising().await {
            warn!("failed to stop advertising: {e}");
        }
    }
}

fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

fn clamp_i16(value: u32) -> i16 {
    i16::try_from(value).unwrap_or(i16::MAX)
}

async fn push_update<P: PeripheralAdapter>(
    adapter: &Arc<P>,
    cached: &Arc<Mutex<BikeData>>,
    power_w: Option<i16>,
    cadence: Option<u16>,
) -> Result<()> {
    let data = {
        let mut cache = cached.lock().await;
        if let Some(power) = power_w {
            cache.power_w = power;
        }
        if let Some(rate) = cadence {
            cache.stroke_rate = rate;
        }
        *cache
    };

    let payload = encode_indoor_bike_data(data.stroke_rate, data.power_w);
    let delivered = adapter.notify(INDOOR_BIKE_DATA, payload.to_vec()).await?;
    debug!(
        "indoor bike data cadence={} power={} delivered to {delivered} central(s)",
        data.stroke_rate, data.power_w
    );
    Ok(())
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_indoor_bike_data_layout(stroke_rate in 0u16..=300, power in 0i16..=2000) {
            let payload = encode_indoor_bike_data(stroke_rate, power);
            let cadence = stroke_rate * 2;

            prop_assert_eq!(payload.len(), 6);
            prop_assert_eq!(payload[0], 0x44);
            prop_assert_eq!(payload[1], 0x00);
            let cadence_bytes = cadence.to_le_bytes();
            let power_bytes = power.to_le_bytes();
            prop_assert_eq!(&payload[2..4], cadence_bytes.as_slice());
            prop_assert_eq!(&payload[4..6], power_bytes.as_slice());
        }
    }
}
