//! The S4 serial driver: owns the port, speaks the wire protocol, and fans
//! decoded telemetry out as hot broadcast streams.
//!
//! Lifecycle is `disconnected → opening → initialising → ready → closing`.
//! `ready` is entered when the rower answers the `USB` handshake with its
//! hardware-type frame and holds for the service lifetime; it is left on a
//! serial fault, peer hang-up, or an explicit [`S4Driver::close`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};
use tracing::{debug, info, warn};

use crate::config::S4Config;
use crate::error::{GatewayError, Result};
use crate::protocol::{classify, command, Frame, RawRead, Width};
use crate::recording::{self, Recorder};
use crate::registers::{spec_by_name, RegisterTable};
use crate::types::{
    AverageIntensityDisplay, DataPoint, DistanceUnit, DriverState, IntensityDisplay,
};

/// USB manufacturer strings the S4's CDC ACM bridge reports as
pub const WATERROWER_VENDORS: [&str; 2] =
    ["Microchip Technology, Inc.", "Microchip Technology Inc."];

const READS_CAPACITY: usize = 256;
const DATAPOINTS_CAPACITY: usize = 256;
const EVENTS_CAPACITY: usize = 16;

/// Lifecycle notifications emitted by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// The rower answered the streaming handshake
    Initialised,
    /// A serial fault occurred; a close follows
    Error(String),
    /// The port was released
    Closed,
}

/// Driver for the WaterRower S4 performance monitor
///
/// All methods take `&self`; the driver is cheap to clone and safe to share
/// between tasks. It exclusively owns the serial handle and the register
/// table; subscribers only ever see decoded samples.
///
/// # Examples
///
/// ```no_run
/// use rowgate::{S4Config, S4Driver};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let driver = S4Driver::new(S4Config::default());
/// driver.connect().await?;
///
/// let mut datapoints = driver.subscribe_datapoints();
/// while let Ok(point) = datapoints.recv().await {
///     println!("{} = {}", point.name, point.value);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct S4Driver {
    shared: Arc<DriverShared>,
}

struct DriverShared {
    config: S4Config,
    state: RwLock<DriverState>,
    port_name: RwLock<Option<String>>,
    registers: RwLock<RegisterTable>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    reads_tx: broadcast::Sender<RawRead>,
    datapoints_tx: broadcast::Sender<DataPoint>,
    events_tx: broadcast::Sender<DriverEvent>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    recorder: Mutex<Option<Recorder>>,
}

impl S4Driver {
    /// Create a driver with the given configuration; nothing is opened yet
    #[must_use]
    pub fn new(config: S4Config) -> Self {
        let (reads_tx, _) = broadcast::channel(READS_CAPACITY);
        let (datapoints_tx, _) = broadcast::channel(DATAPOINTS_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);

        Self {
            shared: Arc::new(DriverShared {
                config,
                state: RwLock::new(DriverState::Disconnected),
                port_name: RwLock::new(None),
                registers: RwLock::new(RegisterTable::new()),
                writer: Mutex::new(None),
                reads_tx,
                datapoints_tx,
                events_tx,
                reader_task: Mutex::new(None),
                poll_task: Mutex::new(None),
                recorder: Mutex::new(None),
            }),
        }
    }

    /// Create a driver with the default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(S4Config::default())
    }

    /// Subscribe to every classified inbound frame
    #[must_use]
    pub fn subscribe_reads(&self) -> broadcast::Receiver<RawRead> {
        self.shared.reads_tx.subscribe()
    }

    /// Subscribe to decoded register samples
    #[must_use]
    pub fn subscribe_datapoints(&self) -> broadcast::Receiver<DataPoint> {
        self.shared.datapoints_tx.subscribe()
    }

    /// Subscribe to driver lifecycle events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> DriverState {
        *self.shared.state.read().await
    }

    /// Whether the serial port is open and usable
    pub async fn is_connected(&self) -> bool {
        matches!(
            self.state().await,
            DriverState::Initialising | DriverState::Ready
        )
    }

    /// Name of the open serial port, if any
    pub async fn port_name(&self) -> Option<String> {
        self.shared.port_name.read().await.clone()
    }

    /// Open the serial port and start the streaming handshake
    ///
    /// With no configured port, available USB serial ports are enumerated
    /// and the first whose manufacturer descriptor matches a WaterRower
    /// vendor string is chosen. The port is opened at 19200 baud 8-N-1, the
    /// `USB` handshake is written, and polling arms once the rower answers.
    ///
    /// A repeated `connect` while ready is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoDeviceFound`] if enumeration finds no
    /// matching port, [`GatewayError::Serial`] if the open or handshake
    /// write fails, and [`GatewayError::IllegalState`] if a connect attempt
    /// is already in flight or the driver is closing.
    pub async fn connect(&self) -> Result<()> {
        {
            let state = self.shared.state.read().await;
            match *state {
                DriverState::Ready => {
                    debug!("connect ignored, already ready");
                    return Ok(());
                }
                DriverState::Disconnected => {}
                other => {
                    return Err(GatewayError::IllegalState {
                        operation: "connect",
                        state: other.to_string(),
                    });
                }
            }
        }

        let path = match &self.shared.config.port {
            Some(path) => path.clone(),
            None => find_waterrower_port()?,
        };

        *self.shared.state.write().await = DriverState::Opening;
        info!("opening {path} at {} baud", self.shared.config.baud_rate);

        let stream = match tokio_serial::new(&path, self.shared.config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async()
        {
            Ok(stream) => stream,
            Err(e) => {
                *self.shared.state.write().await = DriverState::Disconnected;
                return Err(e.into());
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        *self.shared.writer.lock().await = Some(write_half);
        *self.shared.port_name.write().await = Some(path);
        *self.shared.state.write().await = DriverState::Initialising;

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            read_loop(shared, read_half).await;
        });
        *self.shared.reader_task.lock().await = Some(handle);

        self.shared
            .write_command(&command::start_streaming())
            .await?;

        Ok(())
    }

    /// Reset the performance monitor and re-issue the streaming handshake
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] if the driver is not
    /// connected and [`GatewayError::Serial`] if either write fails.
    pub async fn reset(&self) -> Result<()> {
        self.ensure_connected("reset").await?;
        info!("resetting S4 monitor");
        self.shared.write_command(&command::reset()).await?;
        self.shared
            .write_command(&command::start_streaming())
            .await?;
        Ok(())
    }

    /// Stop streaming and release the serial handle; idempotent
    pub async fn close(&self) {
        self.shared.shutdown(true, true).await;
    }

    /// Schedule register read requests, spaced to avoid flooding the S4
    ///
    /// Each target register gets an `IR{width}{addr}` request at its
    /// declared width. With `subset` absent, the configured poll list is
    /// requested. Unknown names are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] unless the driver is ready.
    pub async fn request_datapoints(&self, subset: Option<&[String]>) -> Result<()> {
        let state = self.state().await;
        if state != DriverState::Ready {
            return Err(GatewayError::IllegalState {
                operation: "request_datapoints",
                state: state.to_string(),
            });
        }
        self.shared.request_batch(subset).await;
        Ok(())
    }

    /// Read last decoded values straight from the register table
    ///
    /// Synchronous with respect to the wire: no request is issued.
    /// Registers that have never been decoded are absent from the result.
    pub async fn read_datapoints(&self, subset: Option<&[String]>) -> Vec<(&'static str, u32)> {
        self.shared.registers.read().await.snapshot(subset)
    }

    /// Last decoded value of one register
    pub async fn read_current(&self, name: &str) -> Option<u32> {
        self.shared.registers.read().await.current(name)
    }

    /// Programme a distance workout on the monitor
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] if not connected and
    /// [`GatewayError::Serial`] if the write fails.
    pub async fn define_distance_workout(&self, unit: DistanceUnit, amount: u16) -> Result<()> {
        self.ensure_connected("define_distance_workout").await?;
        self.shared
            .write_command(&command::define_distance_workout(unit, amount))
            .await
    }

    /// Programme a duration workout on the monitor
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] if not connected and
    /// [`GatewayError::Serial`] if the write fails.
    pub async fn define_duration_workout(&self, seconds: u16) -> Result<()> {
        self.ensure_connected("define_duration_workout").await?;
        self.shared
            .write_command(&command::define_duration_workout(seconds))
            .await
    }

    /// Switch the front display's distance figure
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] if not connected and
    /// [`GatewayError::Serial`] if the write fails.
    pub async fn display_set_distance(&self, unit: DistanceUnit) -> Result<()> {
        self.ensure_connected("display_set_distance").await?;
        self.shared
            .write_command(&command::display_set_distance(unit))
            .await
    }

    /// Switch the front display's intensity figure
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] if not connected and
    /// [`GatewayError::Serial`] if the write fails.
    pub async fn display_set_intensity(&self, figure: IntensityDisplay) -> Result<()> {
        self.ensure_connected("display_set_intensity").await?;
        self.shared
            .write_command(&command::display_set_intensity(figure))
            .await
    }

    /// Switch the front display's average-intensity figure
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] if not connected and
    /// [`GatewayError::Serial`] if the write fails.
    pub async fn display_set_average_intensity(
        &self,
        figure: AverageIntensityDisplay,
    ) -> Result<()> {
        self.ensure_connected("display_set_average_intensity").await?;
        self.shared
            .write_command(&command::display_set_average_intensity(figure))
            .await
    }

    /// Start recording non-pulse frames to a file in the data directory
    ///
    /// An existing file of the same name is truncated.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] if a recording is already
    /// running and [`GatewayError::Io`] if the file cannot be created.
    pub async fn start_recording(&self, name: Option<&str>) -> Result<()> {
        let mut slot = self.shared.recorder.lock().await;
        if slot.is_some() {
            return Err(GatewayError::IllegalState {
                operation: "start_recording",
                state: "recording".to_string(),
            });
        }
        let path = recording::recording_path(&self.shared.config.data_dir, name);
        let recorder = Recorder::start(path, self.shared.reads_tx.subscribe()).await?;
        *slot = Some(recorder);
        Ok(())
    }

    /// Detach the recording subscription; idempotent
    pub async fn stop_recording(&self) {
        if let Some(recorder) = self.shared.recorder.lock().await.take() {
            recorder.stop().await;
        }
    }

    /// Replay a recording onto the read streams, preserving inter-arrival
    /// gaps
    ///
    /// Each read is delayed by the difference between successive recorded
    /// timestamps; the first read is republished immediately. Replayed
    /// datapoint frames run through the same decode path as live traffic,
    /// so `datapoints$` fires too. Resolves once the last read has been
    /// replayed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Io`]/[`GatewayError::Recording`] if the file
    /// cannot be loaded, and [`GatewayError::Cancelled`] if the driver is
    /// closed mid-replay.
    pub async fn play_recording(&self, name: Option<&str>) -> Result<()> {
        let path = recording::recording_path(&self.shared.config.data_dir, name);
        let reads = recording::load(&path).await?;
        info!("replaying {} reads from {}", reads.len(), path.display());

        let mut events = self.shared.events_tx.subscribe();
        let mut previous_time: Option<i64> = None;

        for read in reads {
            let gap_ms = previous_time
                .map(|prev| (read.time - prev).max(0) as u64)
                .unwrap_or(0);
            previous_time = Some(read.time);

            if gap_ms > 0 {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(gap_ms)) => {}
                    () = wait_for_close(&mut events) => {
                        return Err(GatewayError::Cancelled);
                    }
                }
            }

            self.shared.ingest(read).await;
        }

        Ok(())
    }

    async fn ensure_connected(&self, operation: &'static str) -> Result<()> {
        let state = self.state().await;
        if matches!(state, DriverState::Initialising | DriverState::Ready) {
            Ok(())
        } else {
            Err(GatewayError::IllegalState {
                operation,
                state: state.to_string(),
            })
        }
    }
}

impl DriverShared {
    /// Write one command line; a write after close is a silent no-op
    async fn write_command(self: &Arc<Self>, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!("write after close dropped: {}", line.trim_end());
            return Ok(());
        };
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            drop(guard);
            self.fail(&format!("serial write failed: {e}")).await;
            return Err(e.into());
        }
        if let Err(e) = writer.flush().await {
            drop(guard);
            self.fail(&format!("serial flush failed: {e}")).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Issue one spaced batch of register requests
    async fn request_batch(self: &Arc<Self>, subset: Option<&[String]>) {
        let names: Vec<String> = match subset {
            Some(names) => names.to_vec(),
            None => self.config.poll_registers.clone(),
        };

        let mut first = true;
        for name in names {
            let Some(spec) = spec_by_name(&name) else {
                warn!("not requesting unknown register {name}");
                continue;
            };
            if !first {
                tokio::time::sleep(Duration::from_millis(self.config.request_spacing_ms)).await;
            }
            first = false;
            if self
                .write_command(&command::read_register(spec.width, spec.address))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    /// Publish one raw read and run datapoint frames through decode
    async fn ingest(self: &Arc<Self>, read: RawRead) {
        let frame = classify(&read.data);

        let _ = self.reads_tx.send(read.clone());

        match frame {
            Frame::Datapoint {
                width,
                address,
                digits,
            } => {
                self.decode_datapoint(read.time, width, &address, &digits)
                    .await;
            }
            Frame::HardwareType { model } => {
                self.mark_ready(&model).await;
            }
            Frame::Pulse | Frame::Other => {}
        }
    }

    async fn decode_datapoint(&self, time_ms: i64, width: Width, address: &str, digits: &str) {
        let time = chrono::DateTime::from_timestamp_millis(time_ms).unwrap_or_else(Utc::now);
        let decoded = self
            .registers
            .write()
            .await
            .decode(time, width, address, digits);
        match decoded {
            Ok(point) => {
                let _ = self.datapoints_tx.send(point);
            }
            Err(e) => warn!("dropping datapoint frame: {e}"),
        }
    }

    /// Handshake answered: enter `ready` and arm the polling timer
    async fn mark_ready(self: &Arc<Self>, model: &str) {
        {
            let mut state = self.state.write().await;
            if *state != DriverState::Initialising {
                return;
            }
            *state = DriverState::Ready;
        }
        info!("S4 initialised (hardware type {model:?})");
        let _ = self.events_tx.send(DriverEvent::Initialised);

        if self.config.refresh_interval_ms == 0 {
            debug!("polling disabled by configuration");
            return;
        }
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            poll_loop(shared).await;
        });
        *self.poll_task.lock().await = Some(handle);
    }

    /// Serial fault: emit the error event, then close
    ///
    /// Teardown runs on its own task so that a fault raised from inside the
    /// reader or polling task never has to abort the task it is running on.
    async fn fail(self: &Arc<Self>, message: &str) {
        {
            let state = self.state.read().await;
            if matches!(*state, DriverState::Closing | DriverState::Disconnected) {
                return;
            }
        }
        warn!("{message}");
        let _ = self.events_tx.send(DriverEvent::Error(message.to_string()));
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.shutdown(false, true).await;
        });
    }

    /// Tear down the port; `send_exit` writes `EXIT` first, `abort_reader`
    /// must be false when called from inside the reader task itself
    async fn shutdown(self: &Arc<Self>, send_exit: bool, abort_reader: bool) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, DriverState::Closing | DriverState::Disconnected) {
                return;
            }
            *state = DriverState::Closing;
        }

        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }

        if send_exit {
            let mut guard = self.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                let _ = writer.write_all(command::stop_streaming().as_bytes()).await;
                let _ = writer.flush().await;
            }
        }
        *self.writer.lock().await = None;

        if abort_reader {
            if let Some(handle) = self.reader_task.lock().await.take() {
                handle.abort();
            }
        } else {
            // the reader task observes the state change and unwinds itself
            self.reader_task.lock().await.take();
        }

        *self.port_name.write().await = None;
        *self.state.write().await = DriverState::Disconnected;
        info!("S4 driver closed");
        let _ = self.events_tx.send(DriverEvent::Closed);
    }
}

#[async_trait::async_trait]
impl crate::session::TelemetrySource for S4Driver {
    fn datapoint_stream(&self) -> broadcast::Receiver<DataPoint> {
        self.subscribe_datapoints()
    }

    fn event_stream(&self) -> broadcast::Receiver<DriverEvent> {
        self.subscribe_events()
    }

    async fn is_connected(&self) -> bool {
        Self::is_connected(self).await
    }

    async fn reset(&self) -> Result<()> {
        Self::reset(self).await
    }

    async fn close(&self) {
        Self::close(self).await;
    }
}

/// Pick the first USB serial port whose manufacturer matches a WaterRower
/// vendor string
fn find_waterrower_port() -> Result<String> {
    let ports = tokio_serial::available_ports()?;
    for port in ports {
        if let SerialPortType::UsbPort(usb) = &port.port_type {
            let manufacturer = usb.manufacturer.as_deref().unwrap_or_default();
            if WATERROWER_VENDORS.contains(&manufacturer) {
                info!("found WaterRower S4 on {}", port.port_name);
                return Ok(port.port_name);
            }
            debug!(
                "skipping {} (manufacturer {manufacturer:?})",
                port.port_name
            );
        }
    }
    Err(GatewayError::NoDeviceFound)
}

/// Resolve only when the driver announces `Closed`; other events pass by
async fn wait_for_close(events: &mut broadcast::Receiver<DriverEvent>) {
    loop {
        match events.recv().await {
            Ok(DriverEvent::Closed) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                std::future::pending::<()>().await;
            }
        }
    }
}

async fn read_loop(shared: Arc<DriverShared>, read_half: ReadHalf<SerialStream>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        {
            let state = shared.state.read().await;
            if matches!(*state, DriverState::Closing | DriverState::Disconnected) {
                break;
            }
        }
        match lines.next_line().await {
            Ok(Some(line)) => {
                let read = RawRead {
                    time: Utc::now().timestamp_millis(),
                    kind: classify(&line).kind(),
                    data: line,
                };
                shared.ingest(read).await;
            }
            Ok(None) => {
                shared.fail("serial peer hung up").await;
                break;
            }
            Err(e) => {
                shared.fail(&format!("serial read failed: {e}")).await;
                break;
            }
        }
    }
}

async fn poll_loop(shared: Arc<DriverShared>) {
    let mut ticker =
        tokio::time::interval(Duration::from_millis(shared.config.refresh_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if *shared.state.read().await != DriverState::Ready {
            break;
        }
        shared.request_batch(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameKind;

    fn driver() -> S4Driver {
        S4Driver::new(S4Config {
            data_dir: std::env::temp_dir().join("rowgate-driver-tests"),
            ..S4Config::default()
        })
    }

    #[tokio::test]
    async fn test_initial_state() {
        let driver = driver();
        assert_eq!(driver.state().await, DriverState::Disconnected);
        assert!(!driver.is_connected().await);
        assert!(driver.port_name().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_when_disconnected() {
        let driver = driver();
        driver.close().await;
        driver.close().await;
        assert_eq!(driver.state().await, DriverState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_batch_spacing() {
        let driver = driver();
        let started = tokio::time::Instant::now();
        // six configured registers, so five 50 ms gaps
        driver.shared.request_batch(None).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_request_datapoints_guarded_by_state() {
        let driver = driver();
        let err = driver.request_datapoints(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn test_commands_guarded_by_state() {
        let driver = driver();
        assert!(matches!(
            driver.reset().await.unwrap_err(),
            GatewayError::IllegalState { .. }
        ));
        assert!(matches!(
            driver
                .define_distance_workout(DistanceUnit::Meters, 2000)
                .await
                .unwrap_err(),
            GatewayError::IllegalState { .. }
        ));
        assert!(matches!(
            driver
                .display_set_intensity(IntensityDisplay::Watts)
                .await
                .unwrap_err(),
            GatewayError::IllegalState { .. }
        ));
    }

    #[tokio::test]
    async fn test_ingest_decodes_live_lines() {
        let driver = driver();
        let mut datapoints = driver.subscribe_datapoints();
        let mut reads = driver.subscribe_reads();

        for line in ["IDS1A912", "IDD08800C8"] {
            driver
                .shared
                .ingest(RawRead {
                    time: Utc::now().timestamp_millis(),
                    kind: classify(line).kind(),
                    data: line.to_string(),
                })
                .await;
        }

        let first = datapoints.recv().await.unwrap();
        assert_eq!(first.name, "stroke_rate");
        assert_eq!(first.value, 18);

        let second = datapoints.recv().await.unwrap();
        assert_eq!(second.name, "kcal_watts");
        assert_eq!(second.value, 200);

        assert_eq!(reads.recv().await.unwrap().kind, FrameKind::Datapoint);
    }

    #[tokio::test]
    async fn test_ingest_drops_unknown_addresses() {
        let driver = driver();
        let mut datapoints = driver.subscribe_datapoints();

        driver
            .shared
            .ingest(RawRead {
                time: 0,
                kind: FrameKind::Datapoint,
                data: "IDSFFF12".to_string(),
            })
            .await;
        driver
            .shared
            .ingest(RawRead {
                time: 1,
                kind: FrameKind::Datapoint,
                data: "IDS1A90F".to_string(),
            })
            .await;

        // only the known register came through
        let point = datapoints.recv().await.unwrap();
        assert_eq!(point.name, "stroke_rate");
        assert_eq!(point.value, 15);
    }

    #[tokio::test]
    async fn test_read_datapoints_snapshot() {
        let driver = driver();
        driver
            .shared
            .ingest(RawRead {
                time: 0,
                kind: FrameKind::Datapoint,
                data: "IDD08A07D0".to_string(),
            })
            .await;

        assert_eq!(driver.read_current("total_kcal").await, Some(2000));
        let snapshot = driver
            .read_datapoints(Some(&["total_kcal".to_string()]))
            .await;
        assert_eq!(snapshot, vec![("total_kcal", 2000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_preserves_gaps_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let driver = S4Driver::new(S4Config {
            data_dir: dir.path().to_path_buf(),
            ..S4Config::default()
        });

        let lines = [
            (0i64, "IDS1A912"),
            (400, "IDS1A914"),
            (1_000, "IDD08800C8"),
        ];
        let body: String = lines
            .iter()
            .map(|(t, d)| {
                format!("{{\"time\":{t},\"type\":\"datapoint\",\"data\":\"{d}\"}}\n")
            })
            .collect();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("run.ndjson"), body)
            .await
            .unwrap();

        let mut datapoints = driver.subscribe_datapoints();
        let started = tokio::time::Instant::now();
        driver.play_recording(Some("run")).await.unwrap();
        let elapsed = started.elapsed();

        // replay time is the sum of the recorded gaps
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed < Duration::from_millis(1_100));

        let values: Vec<u32> = [
            datapoints.recv().await.unwrap(),
            datapoints.recv().await.unwrap(),
            datapoints.recv().await.unwrap(),
        ]
        .iter()
        .map(|p| p.value)
        .collect();
        assert_eq!(values, vec![0x12, 0x14, 0xC8]);
    }

    #[tokio::test]
    async fn test_record_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let driver = S4Driver::new(S4Config {
            data_dir: dir.path().to_path_buf(),
            ..S4Config::default()
        });

        driver.start_recording(Some("loop")).await.unwrap();
        for (time, line) in [(10i64, "_WR_S4.2"), (20, "P0F"), (30, "IDS1A912")] {
            driver
                .shared
                .ingest(RawRead {
                    time,
                    kind: classify(line).kind(),
                    data: line.to_string(),
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        driver.stop_recording().await;

        let reads =
            recording::load(&recording::recording_path(dir.path(), Some("loop")))
                .await
                .unwrap();
        // the pulse frame is not written
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].data, "_WR_S4.2");
        assert_eq!(reads[1].data, "IDS1A912");
    }

    #[tokio::test]
    async fn test_start_recording_twice_is_illegal() {
        let dir = tempfile::tempdir().unwrap();
        let driver = S4Driver::new(S4Config {
            data_dir: dir.path().to_path_buf(),
            ..S4Config::default()
        });

        driver.start_recording(None).await.unwrap();
        let err = driver.start_recording(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::IllegalState { .. }));
        driver.stop_recording().await;
        driver.stop_recording().await;
    }
}
