//! BLE heart-rate monitor client: scan, connect, subscribe, survive.
//!
//! State machine: `idle → waiting_for_adapter → scanning` for discovery,
//! `idle/disconnected → waiting_for_adapter → connecting → connected →
//! subscribed` for a session, and `disconnected` whenever the transport
//! drops. Once subscribed, a drop surfaces as the `disconnected` state and
//! the end of the sample stream, never as an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::{
    CentralAdapter, CentralLink, DiscoveredDevice, BATTERY_LEVEL_CHARACTERISTIC, BATTERY_SERVICE,
    DEVICE_NAME_CHARACTERISTIC, GENERIC_ACCESS_SERVICE, HEART_RATE_MEASUREMENT,
    HEART_RATE_SERVICE,
};
use crate::config::HrmConfig;
use crate::error::{GatewayError, Result};
use crate::session::HeartRateSource;
use crate::types::{HeartRateSample, HrmState};

const HEART_RATE_CAPACITY: usize = 64;

/// Name reported when the peer offers no Device Name characteristic
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// Parse a Heart Rate Measurement PDU into beats per minute
///
/// Byte 0 is a flags byte; bit 0 selects 16-bit little-endian (set) versus
/// 8-bit (clear) rate encoding. The remaining flag bits (sensor contact,
/// energy expended, RR intervals) do not affect the rate and are ignored.
/// Returns `None` for a payload too short to carry its declared rate.
#[must_use]
pub fn parse_heart_rate_measurement(payload: &[u8]) -> Option<u16> {
    let flags = *payload.first()?;
    if flags & 0x01 == 0 {
        payload.get(1).map(|&bpm| u16::from(bpm))
    } else {
        let bytes: [u8; 2] = payload.get(1..3)?.try_into().ok()?;
        Some(u16::from_le_bytes(bytes))
    }
}

/// Client for one BLE heart-rate monitor
///
/// Generic over the [`CentralAdapter`] so scenarios run against in-memory
/// adapters; production uses [`crate::central::BtleplugCentral`].
///
/// # Examples
///
/// ```no_run
/// use rowgate::central::BtleplugCentral;
/// use rowgate::{HrmClient, HrmConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HrmClient::new(BtleplugCentral::new().await?, HrmConfig::default());
/// let devices = client.discover().await?;
/// if let Some(device) = devices.first() {
///     client.connect(&device.id).await?;
///     println!("wearing {:?}", client.device_name().await);
/// }
/// # Ok(())
/// # }
/// ```
pub struct HrmClient<A: CentralAdapter> {
    adapter: A,
    config: HrmConfig,
    shared: Arc<HrmShared<A::Link>>,
}

struct HrmShared<L> {
    state: RwLock<HrmState>,
    device_name: RwLock<Option<String>>,
    battery_level: RwLock<Option<u8>>,
    hr_tx: broadcast::Sender<HeartRateSample>,
    link: Mutex<Option<L>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl<A: CentralAdapter> HrmClient<A> {
    /// Create a client over the given adapter
    #[must_use]
    pub fn new(adapter: A, config: HrmConfig) -> Self {
        let (hr_tx, _) = broadcast::channel(HEART_RATE_CAPACITY);
        Self {
            adapter,
            config,
            shared: Arc::new(HrmShared {
                state: RwLock::new(HrmState::Idle),
                device_name: RwLock::new(None),
                battery_level: RwLock::new(None),
                hr_tx,
                link: Mutex::new(None),
                pump_task: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to the hot heart-rate sample stream
    #[must_use]
    pub fn subscribe_heart_rate(&self) -> broadcast::Receiver<HeartRateSample> {
        self.shared.hr_tx.subscribe()
    }

    /// Current client state
    pub async fn state(&self) -> HrmState {
        *self.shared.state.read().await
    }

    /// Whether a monitor is connected (subscribed or mid-setup)
    pub async fn is_connected(&self) -> bool {
        matches!(
            self.state().await,
            HrmState::Connected | HrmState::Subscribed
        )
    }

    /// Device name read at connect time, if any
    pub async fn device_name(&self) -> Option<String> {
        self.shared.device_name.read().await.clone()
    }

    /// Battery level read at connect time, if the peer reported one
    pub async fn battery_level(&self) -> Option<u8> {
        *self.shared.battery_level.read().await
    }

    /// Scan for heart-rate monitors
    ///
    /// Waits for the adapter, scans with a Heart Rate service filter for
    /// the configured window, and returns the peripherals seen,
    /// deduplicated by device id.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::BleAdapterUnavailable`] when the host has no
    /// usable adapter, [`GatewayError::IllegalState`] while connected, and
    /// backend errors from the scan itself.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        self.ensure_not_connected("discover").await?;

        *self.shared.state.write().await = HrmState::WaitingForAdapter;
        if let Err(e) = self.adapter.wait_powered_on().await {
            *self.shared.state.write().await = HrmState::Idle;
            return Err(e);
        }

        *self.shared.state.write().await = HrmState::Scanning;
        let window = Duration::from_millis(self.config.scan_window_ms);
        let scanned = self.adapter.scan(HEART_RATE_SERVICE, window).await;
        *self.shared.state.write().await = HrmState::Idle;
        let scanned = scanned?;

        let mut seen = HashSet::new();
        let devices: Vec<DiscoveredDevice> = scanned
            .into_iter()
            .filter(|device| seen.insert(device.id.clone()))
            .collect();
        info!("discovery found {} heart-rate monitor(s)", devices.len());
        Ok(devices)
    }

    /// Connect to a monitor by id and subscribe to heart-rate notifications
    ///
    /// On transport connect the peer's services are discovered, the device
    /// name (`0x2A00`) and battery level (`0x2A19`) are read when offered,
    /// and Heart Rate Measurement (`0x2A37`) notifications are enabled.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] while already connected,
    /// [`GatewayError::BleConnectTimeout`] when the transport connect
    /// exceeds its deadline, and [`GatewayError::BleServiceNotFound`] when
    /// the peer offers no Heart Rate Measurement characteristic.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        self.ensure_not_connected("connect").await?;

        *self.shared.state.write().await = HrmState::WaitingForAdapter;
        if let Err(e) = self.adapter.wait_powered_on().await {
            *self.shared.state.write().await = HrmState::Disconnected;
            return Err(e);
        }

        *self.shared.state.write().await = HrmState::Connecting;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let link = match tokio::time::timeout(timeout, self.adapter.connect(device_id)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                *self.shared.state.write().await = HrmState::Disconnected;
                return Err(e);
            }
            Err(_) => {
                *self.shared.state.write().await = HrmState::Disconnected;
                return Err(GatewayError::BleConnectTimeout {
                    timeout_ms: self.config.connect_timeout_ms,
                });
            }
        };
        *self.shared.state.write().await = HrmState::Connected;

        let device_name = match link
            .read(GENERIC_ACCESS_SERVICE, DEVICE_NAME_CHARACTERISTIC)
            .await
        {
            Ok(Some(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => UNKNOWN_DEVICE_NAME.to_string(),
        };
        info!("connected to heart-rate monitor {device_name:?}");
        *self.shared.device_name.write().await = Some(device_name);

        // battery level is a nicety; absence is not an error
        let battery = match link.read(BATTERY_SERVICE, BATTERY_LEVEL_CHARACTERISTIC).await {
            Ok(Some(bytes)) => bytes.first().map(|&level| level.min(100)),
            _ => None,
        };
        *self.shared.battery_level.write().await = battery;

        let notifications = match link
            .subscribe(HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                let _ = link.disconnect().await;
                *self.shared.state.write().await = HrmState::Disconnected;
                return Err(e);
            }
        };

        *self.shared.link.lock().await = Some(link);
        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(async move {
            pump_notifications(shared, notifications).await;
        });
        *self.shared.pump_task.lock().await = Some(pump);
        *self.shared.state.write().await = HrmState::Subscribed;

        Ok(())
    }

    /// Retry [`HrmClient::connect`] until it succeeds or attempts run out
    ///
    /// Each attempt is bounded by the configured connect timeout; failures
    /// are logged and the next attempt starts immediately.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error after the configured number of
    /// failures.
    pub async fn reconnect(&self, device_id: &str) -> Result<()> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connect(device_id).await {
                Ok(()) => {
                    info!("reconnected to {device_id} on attempt {attempt}");
                    return Ok(());
                }
                Err(e) => {
                    warn!("reconnect attempt {attempt}/{attempts} failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(GatewayError::BleConnectTimeout {
            timeout_ms: self.config.connect_timeout_ms,
        }))
    }

    /// Drop the connection and stop the sample stream; idempotent
    pub async fn disconnect(&self) {
        if let Some(pump) = self.shared.pump_task.lock().await.take() {
            pump.abort();
            let _ = pump.await;
        }
        if let Some(link) = self.shared.link.lock().await.take() {
            let _ = link.disconnect().await;
        }
        *self.shared.state.write().await = HrmState::Disconnected;
        debug!("heart-rate monitor disconnected");
    }

    async fn ensure_not_connected(&self, operation: &'static str) -> Result<()> {
        let state = self.state().await;
        if matches!(state, HrmState::Connected | HrmState::Subscribed) {
            return Err(GatewayError::IllegalState {
                operation,
                state: state.to_string(),
            });
        }
        Ok(())
    }
}

async fn pump_notifications<L>(
    shared: Arc<HrmShared<L>>,
    mut notifications: tokio::sync::mpsc::Receiver<Vec<u8>>,
) {
    while let Some(payload) = notifications.recv().await {
        match parse_heart_rate_measurement(&payload) {
            Some(bpm) => {
                let _ = shared.hr_tx.send(HeartRateSample {
                    time: Utc::now(),
                    bpm,
                });
            }
            None => warn!("dropping malformed heart-rate payload {payload:02X?}"),
        }
    }
    // the peer is gone; this is the disconnected event, not an error
    info!("heart-rate notification stream ended");
    *shared.state.write().await = HrmState::Disconnected;
    shared.link.lock().await.take();
}

#[async_trait::async_trait]
impl<A: CentralAdapter> HeartRateSource for HrmClient<A> {
    fn heart_rate_stream(&self) -> broadcast::Receiver<HeartRateSample> {
        self.subscribe_heart_rate()
    }

    async fn is_connected(&self) -> bool {
        Self::is_connected(self).await
    }

    async fn shutdown(&self) {
        self.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// In-memory central adapter with scriptable behaviour
    struct MockCentral {
        scan_results: Vec<DiscoveredDevice>,
        connect_attempts: Arc<AtomicU32>,
        refuse_connects: bool,
        offer_heart_rate: bool,
        offer_name: bool,
        offer_battery: bool,
        payload_feed: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    }

    impl MockCentral {
        fn new() -> Self {
            Self {
                scan_results: Vec::new(),
                connect_attempts: Arc::new(AtomicU32::new(0)),
                refuse_connects: false,
                offer_heart_rate: true,
                offer_name: true,
                offer_battery: true,
                payload_feed: Mutex::new(None),
            }
        }

        fn with_feed(feed: mpsc::Receiver<Vec<u8>>) -> Self {
            let mock = Self::new();
            *mock.payload_feed.try_lock().unwrap() = Some(feed);
            mock
        }
    }

    struct MockLink {
        offer_heart_rate: bool,
        offer_name: bool,
        offer_battery: bool,
        feed: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    }

    #[async_trait]
    impl CentralAdapter for MockCentral {
        type Link = MockLink;

        async fn wait_powered_on(&self) -> Result<()> {
            Ok(())
        }

        async fn scan(&self, _service: Uuid, _window: Duration) -> Result<Vec<DiscoveredDevice>> {
            Ok(self.scan_results.clone())
        }

        async fn connect(&self, _device_id: &str) -> Result<Self::Link> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connects {
                return Err(GatewayError::NoDeviceFound);
            }
            Ok(MockLink {
                offer_heart_rate: self.offer_heart_rate,
                offer_name: self.offer_name,
                offer_battery: self.offer_battery,
                feed: Mutex::new(self.payload_feed.lock().await.take()),
            })
        }
    }

    #[async_trait]
    impl CentralLink for MockLink {
        async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Option<Vec<u8>>> {
            if service == GENERIC_ACCESS_SERVICE && characteristic == DEVICE_NAME_CHARACTERISTIC {
                return Ok(self.offer_name.then(|| b"Polar H10".to_vec()));
            }
            if service == BATTERY_SERVICE && characteristic == BATTERY_LEVEL_CHARACTERISTIC {
                return Ok(self.offer_battery.then(|| vec![87]));
            }
            Ok(None)
        }

        async fn subscribe(
            &self,
            _service: Uuid,
            characteristic: Uuid,
        ) -> Result<mpsc::Receiver<Vec<u8>>> {
            if !self.offer_heart_rate {
                return Err(GatewayError::BleServiceNotFound(characteristic));
            }
            match self.feed.lock().await.take() {
                Some(rx) => Ok(rx),
                None => {
                    let (_tx, rx) = mpsc::channel(1);
                    Ok(rx)
                }
            }
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn device(id: &str, name: Option<&str>) -> DiscoveredDevice {
        DiscoveredDevice {
            id: id.to_string(),
            name: name.map(ToString::to_string),
        }
    }

    fn fast_config() -> HrmConfig {
        HrmConfig {
            scan_window_ms: 1,
            connect_timeout_ms: 1_000,
            reconnect_attempts: 30,
        }
    }

    #[test]
    fn test_parse_heart_rate_u8() {
        assert_eq!(parse_heart_rate_measurement(&[0x00, 0x50]), Some(80));
        assert_eq!(parse_heart_rate_measurement(&[0x00, 0xFF]), Some(255));
    }

    #[test]
    fn test_parse_heart_rate_u16() {
        assert_eq!(
            parse_heart_rate_measurement(&[0x01, 0x30, 0x01]),
            Some(304)
        );
    }

    #[test]
    fn test_parse_heart_rate_ignores_high_flag_bits() {
        // sensor contact + energy expended + RR bits must not move the rate
        assert_eq!(parse_heart_rate_measurement(&[0x16, 0x50, 0x10]), Some(80));
        assert_eq!(
            parse_heart_rate_measurement(&[0x1F, 0x30, 0x01, 0xAA]),
            Some(304)
        );
    }

    #[test]
    fn test_parse_heart_rate_truncated() {
        assert_eq!(parse_heart_rate_measurement(&[]), None);
        assert_eq!(parse_heart_rate_measurement(&[0x00]), None);
        assert_eq!(parse_heart_rate_measurement(&[0x01, 0x30]), None);
    }

    #[tokio::test]
    async fn test_discover_dedups_by_id() {
        let mut mock = MockCentral::new();
        mock.scan_results = vec![
            device("aa", Some("Polar")),
            device("bb", None),
            device("aa", Some("Polar")),
        ];
        let client = HrmClient::new(mock, fast_config());

        let devices = client.discover().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "aa");
        assert_eq!(devices[1].id, "bb");
        assert_eq!(client.state().await, HrmState::Idle);
    }

    #[tokio::test]
    async fn test_connect_reads_name_battery_and_streams_samples() {
        let (tx, rx) = mpsc::channel(8);
        let client = HrmClient::new(MockCentral::with_feed(rx), fast_config());
        let mut samples = client.subscribe_heart_rate();

        client.connect("aa").await.unwrap();
        assert_eq!(client.state().await, HrmState::Subscribed);
        assert!(client.is_connected().await);
        assert_eq!(client.device_name().await.as_deref(), Some("Polar H10"));
        assert_eq!(client.battery_level().await, Some(87));

        tx.send(vec![0x00, 0x50]).await.unwrap();
        tx.send(vec![0x01, 0x30, 0x01]).await.unwrap();
        assert_eq!(samples.recv().await.unwrap().bpm, 80);
        assert_eq!(samples.recv().await.unwrap().bpm, 304);

        // feed ends: the transport drop surfaces as the disconnected state
        drop(tx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.state().await, HrmState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_without_name_characteristic() {
        let mut mock = MockCentral::new();
        mock.offer_name = false;
        mock.offer_battery = false;
        let client = HrmClient::new(mock, fast_config());

        client.connect("aa").await.unwrap();
        assert_eq!(
            client.device_name().await.as_deref(),
            Some(UNKNOWN_DEVICE_NAME)
        );
        assert_eq!(client.battery_level().await, None);
    }

    #[tokio::test]
    async fn test_connect_without_heart_rate_service() {
        let mut mock = MockCentral::new();
        mock.offer_heart_rate = false;
        let client = HrmClient::new(mock, fast_config());

        let err = client.connect("aa").await.unwrap_err();
        assert!(matches!(err, GatewayError::BleServiceNotFound(_)));
        assert_eq!(client.state().await, HrmState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_while_connected_is_illegal() {
        let client = HrmClient::new(MockCentral::new(), fast_config());
        client.connect("aa").await.unwrap();
        let err = client.connect("aa").await.unwrap_err();
        assert!(matches!(err, GatewayError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_after_configured_attempts() {
        let mut mock = MockCentral::new();
        mock.refuse_connects = true;
        let attempts = Arc::clone(&mock.connect_attempts);
        let client = HrmClient::new(mock, fast_config());

        let err = client.reconnect("never-there").await.unwrap_err();
        assert!(matches!(err, GatewayError::NoDeviceFound));
        assert_eq!(attempts.load(Ordering::SeqCst), 30);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = HrmClient::new(MockCentral::new(), fast_config());
        client.connect("aa").await.unwrap();
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state().await, HrmState::Disconnected);
        assert!(!client.is_connected().await);
    }
}
