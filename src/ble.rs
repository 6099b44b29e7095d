//! Typed capability seam over the host Bluetooth stack.
//!
//! The HRM client and FTMS peripheral are written against these traits
//! rather than a concrete stack, so every protocol scenario runs against
//! in-memory adapters in tests and the OS backends stay swappable.
//! [`crate::central`] provides the btleplug-backed central; on Linux,
//! [`crate::peripheral`] provides the BlueZ-backed peripheral.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Heart Rate service (assigned number 0x180D)
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000_180D_0000_1000_8000_0080_5F9B_34FB);

/// Heart Rate Measurement characteristic (0x2A37, notify)
pub const HEART_RATE_MEASUREMENT: Uuid =
    Uuid::from_u128(0x0000_2A37_0000_1000_8000_0080_5F9B_34FB);

/// Generic Access service (0x1800)
pub const GENERIC_ACCESS_SERVICE: Uuid =
    Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5F9B_34FB);

/// Device Name characteristic (0x2A00, read)
pub const DEVICE_NAME_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000_2A00_0000_1000_8000_0080_5F9B_34FB);

/// Battery service (0x180F)
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000_180F_0000_1000_8000_0080_5F9B_34FB);

/// Battery Level characteristic (0x2A19, read)
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000_2A19_0000_1000_8000_0080_5F9B_34FB);

/// Fitness Machine service (0x1826)
pub const FITNESS_MACHINE_SERVICE: Uuid =
    Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5F9B_34FB);

/// Fitness Machine Feature characteristic (0x2ACC, read)
pub const FITNESS_MACHINE_FEATURE: Uuid =
    Uuid::from_u128(0x0000_2ACC_0000_1000_8000_0080_5F9B_34FB);

/// Indoor Bike Data characteristic (0x2AD2, notify)
pub const INDOOR_BIKE_DATA: Uuid = Uuid::from_u128(0x0000_2AD2_0000_1000_8000_0080_5F9B_34FB);

/// Power state of a host Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// The radio is up and usable
    PoweredOn,
    /// The radio is down
    PoweredOff,
    /// The backend reported something it could not map
    Unknown,
}

/// A peripheral seen during a discovery scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Backend-stable device identifier
    pub id: String,
    /// Advertised local name, when the advertisement carried one
    pub name: Option<String>,
}

/// Central-role capabilities: power state, scanning and connecting
#[async_trait]
pub trait CentralAdapter: Send + Sync + 'static {
    /// Connection type produced by [`CentralAdapter::connect`]
    type Link: CentralLink;

    /// Resolve once the adapter is powered on and usable
    ///
    /// # Errors
    ///
    /// Returns [`crate::GatewayError::BleAdapterUnavailable`] if the host
    /// has no usable adapter.
    async fn wait_powered_on(&self) -> Result<()>;

    /// Scan for peripherals advertising `service` for the given window
    ///
    /// Implementations stop scanning before returning. Duplicates may be
    /// present; callers deduplicate by id.
    async fn scan(&self, service: Uuid, window: Duration) -> Result<Vec<DiscoveredDevice>>;

    /// Connect to a previously seen peripheral by id, without scanning,
    /// and run full service/characteristic discovery
    async fn connect(&self, device_id: &str) -> Result<Self::Link>;
}

/// An established central-role connection to one peripheral
#[async_trait]
pub trait CentralLink: Send + Sync + 'static {
    /// Read a characteristic value
    ///
    /// Returns `Ok(None)` when the peer does not offer the characteristic;
    /// optional reads are not errors.
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Option<Vec<u8>>>;

    /// Enable notifications and return the stream of raw payloads
    ///
    /// The channel ends when the peer disconnects.
    ///
    /// # Errors
    ///
    /// Returns [`crate::GatewayError::BleServiceNotFound`] when the
    /// characteristic is absent and
    /// [`crate::GatewayError::BleSubscribeFailed`] when enabling
    /// notifications fails.
    async fn subscribe(&self, service: Uuid, characteristic: Uuid)
        -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Whether the transport is still up
    async fn is_connected(&self) -> bool;

    /// Drop the connection; idempotent
    async fn disconnect(&self) -> Result<()>;
}

/// A characteristic served by the peripheral role
#[derive(Debug, Clone)]
pub struct CharacteristicDefinition {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Fixed value answered to reads, for read characteristics
    pub read_value: Option<Vec<u8>>,
    /// Whether centrals may subscribe for notifications
    pub notify: bool,
}

/// A GATT service served by the peripheral role
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics under the service
    pub characteristics: Vec<CharacteristicDefinition>,
}

/// Peripheral-role capabilities: advertising, serving, notifying
#[async_trait]
pub trait PeripheralAdapter: Send + Sync + 'static {
    /// Stream of adapter power-state changes
    ///
    /// Implementations emit the current state first, then every change.
    async fn adapter_states(&self) -> Result<mpsc::Receiver<AdapterState>>;

    /// Start advertising `service` under the given local name; idempotent
    async fn start_advertising(&self, name: &str, service: Uuid) -> Result<()>;

    /// Stop advertising; idempotent
    async fn stop_advertising(&self) -> Result<()>;

    /// Register the GATT application; idempotent
    async fn register_service(&self, service: ServiceDefinition) -> Result<()>;

    /// Push a notification to every subscribed central
    ///
    /// Returns the number of centrals notified; zero when nobody is
    /// subscribed, which is not an error.
    async fn notify(&self, characteristic: Uuid, payload: Vec<u8>) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants_are_sig_expansions() {
        // all assigned numbers expand onto the Bluetooth base UUID
        for (uuid, short) in [
            (HEART_RATE_SERVICE, 0x180D_u32),
            (HEART_RATE_MEASUREMENT, 0x2A37),
            (GENERIC_ACCESS_SERVICE, 0x1800),
            (DEVICE_NAME_CHARACTERISTIC, 0x2A00),
            (BATTERY_SERVICE, 0x180F),
            (BATTERY_LEVEL_CHARACTERISTIC, 0x2A19),
            (FITNESS_MACHINE_SERVICE, 0x1826),
            (FITNESS_MACHINE_FEATURE, 0x2ACC),
            (INDOOR_BIKE_DATA, 0x2AD2),
        ] {
            let fields = uuid.as_fields();
            assert_eq!(fields.0, short, "short part of {uuid}");
            assert_eq!(fields.1, 0x0000);
            assert_eq!(fields.2, 0x1000);
            assert_eq!(fields.3, &[0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB]);
        }
    }
}
