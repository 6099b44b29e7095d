//! The training session: merges S4 telemetry and heart-rate samples into a
//! time-ordered per-second series with pause accounting and summary
//! statistics.
//!
//! State machine: `idle → active ⇄ paused → finished`, with `finished`
//! terminal. Samples are emitted to subscribers every second while active;
//! the session vector keeps one sample per minute plus the terminal
//! snapshot, which is what the activity-file encoder consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::driver::DriverEvent;
use crate::error::{GatewayError, Result};
use crate::types::{DataPoint, HeartRateSample, SessionState, SessionSummary, TrainingSample};

const EVENTS_CAPACITY: usize = 64;

/// Empirical rowing power model coefficient: `P = 2.8 · v³`
pub const POWER_MODEL_COEFFICIENT: f64 = 2.8;

/// What the session needs from the S4 driver
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Fresh subscription to decoded register samples
    fn datapoint_stream(&self) -> broadcast::Receiver<DataPoint>;

    /// Fresh subscription to driver lifecycle events
    fn event_stream(&self) -> broadcast::Receiver<DriverEvent>;

    /// Whether the serial link is up
    async fn is_connected(&self) -> bool;

    /// Reset the monitor's counters
    async fn reset(&self) -> Result<()>;

    /// Release the serial link
    async fn close(&self);
}

/// What the session needs from the heart-rate client
#[async_trait]
pub trait HeartRateSource: Send + Sync {
    /// Fresh subscription to heart-rate samples
    fn heart_rate_stream(&self) -> broadcast::Receiver<HeartRateSample>;

    /// Whether a monitor is connected
    async fn is_connected(&self) -> bool;

    /// Drop the monitor connection
    async fn shutdown(&self);
}

/// Notifications emitted by the session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session entered `active`
    Started,
    /// The session entered `paused`
    Paused,
    /// The session re-entered `active`
    Resumed,
    /// The session finished; carries the final summary
    Stopped(SessionSummary),
    /// A per-second sample, emitted while active
    Datapoint(TrainingSample),
    /// An upstream stream surfaced an error; the session continues
    Error(String),
}

#[derive(Debug, Default, Clone)]
struct Scratchpad {
    stroke_rate: Option<u32>,
    distance_m: Option<u32>,
    calories: Option<u32>,
    total_strokes: Option<u32>,
    speed_mps: Option<f64>,
    power_w: Option<f64>,
    heart_rate: Option<u16>,
}

impl Scratchpad {
    fn apply_datapoint(&mut self, point: &DataPoint) {
        match point.name {
            "stroke_rate" => self.stroke_rate = Some(point.value),
            // the register occasionally steps backwards around resets;
            // session distance is monotone
            "distance" => {
                let best = self.distance_m.map_or(point.value, |d| d.max(point.value));
                self.distance_m = Some(best);
            }
            "total_kcal" => {
                let kcal = point.value / 1_000;
                let best = self.calories.map_or(kcal, |c| c.max(kcal));
                self.calories = Some(best);
            }
            "strokes_cnt" => self.total_strokes = Some(point.value),
            "m_s_total" => {
                let speed = f64::from(point.value) / 100.0;
                self.speed_mps = Some(speed);
                if speed > 0.0 {
                    self.power_w = Some(POWER_MODEL_COEFFICIENT * speed.powi(3));
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
struct SessionClock {
    started_wall: DateTime<Utc>,
    started: Instant,
    paused_at: Option<Instant>,
    total_paused: Duration,
    ended_wall: Option<DateTime<Utc>>,
    final_elapsed: Option<Duration>,
}

impl SessionClock {
    fn new() -> Self {
        Self {
            started_wall: Utc::now(),
            started: Instant::now(),
            paused_at: None,
            total_paused: Duration::ZERO,
            ended_wall: None,
            final_elapsed: None,
        }
    }

    /// Active time so far; monotonic, paused spans excluded
    fn elapsed(&self) -> Duration {
        if let Some(fixed) = self.final_elapsed {
            return fixed;
        }
        let gross = self.started.elapsed();
        let paused = self.total_paused
            + self
                .paused_at
                .map_or(Duration::ZERO, |at| at.elapsed());
        gross.saturating_sub(paused)
    }

    fn elapsed_s(&self) -> u64 {
        self.elapsed().as_secs()
    }

    fn freeze(&mut self) {
        self.final_elapsed = Some(self.elapsed());
        self.ended_wall = Some(Utc::now());
    }
}

/// A rowing session over one S4 driver and an optional heart-rate monitor
pub struct TrainingSession {
    config: SessionConfig,
    shared: Arc<SessionShared>,
}

struct SessionShared {
    id: Uuid,
    state: RwLock<SessionState>,
    clock: RwLock<Option<SessionClock>>,
    scratchpad: RwLock<Scratchpad>,
    samples: RwLock<Vec<TrainingSample>>,
    events_tx: broadcast::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tick_count: AtomicU64,
    keep_every_ticks: u64,
    driver: Mutex<Option<Arc<dyn TelemetrySource>>>,
    hrm: Mutex<Option<Arc<dyn HeartRateSource>>>,
}

impl TrainingSession {
    /// Create an idle session
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);
        let keep_every_ticks = config.keep_every_ticks.max(1);
        Self {
            config,
            shared: Arc::new(SessionShared {
                id: Uuid::new_v4(),
                state: RwLock::new(SessionState::Idle),
                clock: RwLock::new(None),
                scratchpad: RwLock::new(Scratchpad::default()),
                samples: RwLock::new(Vec::new()),
                events_tx,
                tasks: Mutex::new(Vec::new()),
                tick_count: AtomicU64::new(0),
                keep_every_ticks,
                driver: Mutex::new(None),
                hrm: Mutex::new(None),
            }),
        }
    }

    /// Create an idle session with the default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(SessionConfig::default())
    }

    /// Unique session id, assigned on construction
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current session state
    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    /// Wall-clock start time, once started
    pub async fn start_time(&self) -> Option<DateTime<Utc>> {
        self.shared.clock.read().await.as_ref().map(|c| c.started_wall)
    }

    /// Wall-clock end time, once finished
    pub async fn end_time(&self) -> Option<DateTime<Utc>> {
        self.shared
            .clock
            .read()
            .await
            .as_ref()
            .and_then(|c| c.ended_wall)
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Copy of the session sample vector
    pub async fn samples(&self) -> Vec<TrainingSample> {
        self.shared.samples.read().await.clone()
    }

    /// Whole seconds of active time, paused spans excluded
    pub async fn calculate_duration(&self) -> u64 {
        self.shared
            .clock
            .read()
            .await
            .as_ref()
            .map_or(0, SessionClock::elapsed_s)
    }

    /// Start collecting
    ///
    /// Requires the session to be idle and the driver connected. Resets
    /// the monitor, subscribes to the telemetry stream (and the heart-rate
    /// stream when a monitor is connected) and arms the per-second
    /// emission timer.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] when not idle or when the
    /// driver is disconnected, and propagates the driver's reset error.
    pub async fn start(
        &self,
        driver: Arc<dyn TelemetrySource>,
        hrm: Option<Arc<dyn HeartRateSource>>,
    ) -> Result<()> {
        {
            let state = self.shared.state.read().await;
            if *state != SessionState::Idle {
                return Err(GatewayError::IllegalState {
                    operation: "start",
                    state: state.to_string(),
                });
            }
        }
        if !driver.is_connected().await {
            return Err(GatewayError::IllegalState {
                operation: "start",
                state: "driver disconnected".to_string(),
            });
        }

        self.shared.samples.write().await.clear();
        *self.shared.scratchpad.write().await = Scratchpad::default();
        self.shared.tick_count.store(0, Ordering::SeqCst);

        driver.reset().await?;

        let datapoints = driver.datapoint_stream();
        let driver_events = driver.event_stream();
        let mut heart_rate = None;
        if let Some(source) = &hrm {
            if source.is_connected().await {
                heart_rate = Some(source.heart_rate_stream());
            } else {
                debug!("no heart-rate monitor connected, session runs without");
            }
        }

        *self.shared.driver.lock().await = Some(driver);
        *self.shared.hrm.lock().await = hrm;
        *self.shared.clock.write().await = Some(SessionClock::new());
        *self.shared.state.write().await = SessionState::Active;

        let mut tasks = self.shared.tasks.lock().await;
        tasks.push(tokio::spawn(ingest_datapoints(
            Arc::clone(&self.shared),
            datapoints,
        )));
        tasks.push(tokio::spawn(watch_driver(
            Arc::clone(&self.shared),
            driver_events,
        )));
        if let Some(stream) = heart_rate {
            tasks.push(tokio::spawn(ingest_heart_rate(
                Arc::clone(&self.shared),
                stream,
            )));
        }
        tasks.push(tokio::spawn(emit_samples(
            Arc::clone(&self.shared),
            Duration::from_millis(self.config.emit_interval_ms.max(1)),
        )));
        drop(tasks);

        info!("session {} started", self.shared.id);
        let _ = self.shared.events_tx.send(SessionEvent::Started);
        Ok(())
    }

    /// Suspend collection
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] unless active.
    pub async fn pause(&self) -> Result<()> {
        {
            let state = self.shared.state.read().await;
            if *state != SessionState::Active {
                return Err(GatewayError::IllegalState {
                    operation: "pause",
                    state: state.to_string(),
                });
            }
        }
        if let Some(clock) = self.shared.clock.write().await.as_mut() {
            clock.paused_at = Some(Instant::now());
        }
        *self.shared.state.write().await = SessionState::Paused;
        info!("session {} paused", self.shared.id);
        let _ = self.shared.events_tx.send(SessionEvent::Paused);
        Ok(())
    }

    /// Resume collection, accounting the paused span
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] unless paused.
    pub async fn resume(&self) -> Result<()> {
        {
            let state = self.shared.state.read().await;
            if *state != SessionState::Paused {
                return Err(GatewayError::IllegalState {
                    operation: "resume",
                    state: state.to_string(),
                });
            }
        }
        if let Some(clock) = self.shared.clock.write().await.as_mut() {
            if let Some(paused_at) = clock.paused_at.take() {
                clock.total_paused += paused_at.elapsed();
            }
        }
        *self.shared.state.write().await = SessionState::Active;
        info!("session {} resumed", self.shared.id);
        let _ = self.shared.events_tx.send(SessionEvent::Resumed);
        Ok(())
    }

    /// Finish the session and return its sample vector
    ///
    /// Unsubscribes from all streams, closes the driver, disconnects the
    /// heart-rate monitor, appends one terminal sample and emits
    /// `Stopped` with the summary.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::IllegalState`] unless active or paused.
    pub async fn stop(&self) -> Result<Vec<TrainingSample>> {
        {
            let state = self.shared.state.read().await;
            if !matches!(*state, SessionState::Active | SessionState::Paused) {
                return Err(GatewayError::IllegalState {
                    operation: "stop",
                    state: state.to_string(),
                });
            }
        }

        if let Some(clock) = self.shared.clock.write().await.as_mut() {
            if let Some(paused_at) = clock.paused_at.take() {
                clock.total_paused += paused_at.elapsed();
            }
            clock.freeze();
        }
        *self.shared.state.write().await = SessionState::Finished;

        for task in self.shared.tasks.lock().await.drain(..) {
            task.abort();
        }

        if let Some(driver) = self.shared.driver.lock().await.take() {
            driver.close().await;
        }
        if let Some(hrm) = self.shared.hrm.lock().await.take() {
            hrm.shutdown().await;
        }

        let final_sample = self.shared.build_sample().await;
        self.shared.samples.write().await.push(final_sample.clone());
        let _ = self
            .shared
            .events_tx
            .send(SessionEvent::Datapoint(final_sample));

        let summary = self.summary().await;
        info!(
            "session {} stopped after {}s, {} sample(s)",
            self.shared.id, summary.duration_s, summary.sample_count
        );
        let _ = self.shared.events_tx.send(SessionEvent::Stopped(summary));

        Ok(self.samples().await)
    }

    /// Compute the summary from the current sample vector
    pub async fn summary(&self) -> SessionSummary {
        summarize(&self.shared).await
    }
}

impl SessionShared {
    async fn build_sample(&self) -> TrainingSample {
        let scratchpad = self.scratchpad.read().await.clone();
        let elapsed_s = self
            .clock
            .read()
            .await
            .as_ref()
            .map_or(0, SessionClock::elapsed_s);

        TrainingSample {
            timestamp: Utc::now(),
            elapsed_s,
            distance_m: scratchpad.distance_m,
            stroke_rate: scratchpad.stroke_rate,
            power_w: scratchpad.power_w,
            calories: scratchpad.calories,
            heart_rate: scratchpad.heart_rate,
            speed_mps: scratchpad.speed_mps,
            total_strokes: scratchpad.total_strokes,
        }
    }

    /// Driver closed underneath an active session: finish in place
    ///
    /// Tasks are not aborted here; each observes the state change and
    /// unwinds on its own, which keeps this callable from inside them.
    async fn finish_on_driver_close(&self) {
        {
            let state = self.state.read().await;
            if !matches!(*state, SessionState::Active | SessionState::Paused) {
                return;
            }
        }
        warn!("driver closed mid-session, finishing");

        if let Some(clock) = self.clock.write().await.as_mut() {
            if let Some(paused_at) = clock.paused_at.take() {
                clock.total_paused += paused_at.elapsed();
            }
            clock.freeze();
        }
        *self.state.write().await = SessionState::Finished;
        self.driver.lock().await.take();

        if let Some(hrm) = self.hrm.lock().await.take() {
            hrm.shutdown().await;
        }

        let final_sample = self.build_sample().await;
        self.samples.write().await.push(final_sample.clone());
        let _ = self.events_tx.send(SessionEvent::Datapoint(final_sample));

        let summary = summarize(self).await;
        let _ = self.events_tx.send(SessionEvent::Stopped(summary));
    }
}

async fn summarize(shared: &SessionShared) -> SessionSummary {
    let samples = shared.samples.read().await;
    let duration_s = shared
        .clock
        .read()
        .await
        .as_ref()
        .map_or(0, SessionClock::elapsed_s);

    let heart_rates: Vec<u16> = samples.iter().filter_map(|s| s.heart_rate).collect();
    let powers: Vec<f64> = samples.iter().filter_map(|s| s.power_w).collect();

    #[allow(clippy::cast_precision_loss)]
    let avg_heart_rate = (!heart_rates.is_empty()).then(|| {
        heart_rates.iter().map(|&hr| f64::from(hr)).sum::<f64>() / heart_rates.len() as f64
    });
    #[allow(clippy::cast_precision_loss)]
    let avg_power_w =
        (!powers.is_empty()).then(|| powers.iter().sum::<f64>() / powers.len() as f64);

    SessionSummary {
        duration_s,
        distance_m: samples.iter().filter_map(|s| s.distance_m).last().unwrap_or(0),
        avg_heart_rate,
        max_heart_rate: heart_rates.iter().copied().max(),
        avg_power_w,
        max_power_w: powers
            .iter()
            .copied()
            .fold(None, |best, p| Some(best.map_or(p, |b: f64| b.max(p)))),
        total_calories: samples.iter().filter_map(|s| s.calories).last().unwrap_or(0),
        total_strokes: samples
            .iter()
            .filter_map(|s| s.total_strokes)
            .last()
            .unwrap_or(0),
        sample_count: samples.len(),
    }
}

async fn ingest_datapoints(
    shared: Arc<SessionShared>,
    mut datapoints: broadcast::Receiver<DataPoint>,
) {
    loop {
        match datapoints.recv().await {
            Ok(point) => {
                let state = *shared.state.read().await;
                match state {
                    SessionState::Active => {
                        shared.scratchpad.write().await.apply_datapoint(&point);
                    }
                    SessionState::Paused => {}
                    SessionState::Idle | SessionState::Finished => break,
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("session datapoint feed lagged, {missed} samples dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                let _ = shared
                    .events_tx
                    .send(SessionEvent::Error("telemetry stream ended".to_string()));
                break;
            }
        }
    }
}

async fn ingest_heart_rate(
    shared: Arc<SessionShared>,
    mut heart_rate: broadcast::Receiver<HeartRateSample>,
) {
    loop {
        match heart_rate.recv().await {
            Ok(sample) => {
                let state = *shared.state.read().await;
                match state {
                    SessionState::Active => {
                        shared.scratchpad.write().await.heart_rate = Some(sample.bpm);
                    }
                    SessionState::Paused => {}
                    SessionState::Idle | SessionState::Finished => break,
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!("session heart-rate feed lagged, {missed} samples dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                let _ = shared
                    .events_tx
                    .send(SessionEvent::Error("heart-rate stream ended".to_string()));
                break;
            }
        }
    }
}

async fn watch_driver(shared: Arc<SessionShared>, mut events: broadcast::Receiver<DriverEvent>) {
    loop {
        match events.recv().await {
            Ok(DriverEvent::Closed) => {
                shared.finish_on_driver_close().await;
                break;
            }
            Ok(DriverEvent::Error(message)) => {
                let _ = shared.events_tx.send(SessionEvent::Error(message));
            }
            Ok(DriverEvent::Initialised) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn emit_samples(shared: Arc<SessionShared>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let state = *shared.state.read().await;
        match state {
            SessionState::Active => {}
            SessionState::Paused => continue,
            SessionState::Idle | SessionState::Finished => break,
        }

        let sample = shared.build_sample().await;
        let tick = shared.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        if tick % shared.keep_every_ticks == 0 {
            shared.samples.write().await.push(sample.clone());
        }
        let _ = shared.events_tx.send(SessionEvent::Datapoint(sample));
    }
}
