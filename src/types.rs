use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::Width;

/// S4 driver connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    /// No serial port is open
    Disconnected,
    /// The serial port is being opened
    Opening,
    /// The port is open and the streaming handshake is in flight
    Initialising,
    /// The rower answered the handshake; polling is active
    Ready,
    /// The port is being torn down
    Closing,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Opening => write!(f, "opening"),
            Self::Initialising => write!(f, "initialising"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Heart-rate monitor client state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HrmState {
    /// Nothing in flight
    Idle,
    /// Waiting for the host adapter to become usable
    WaitingForAdapter,
    /// Discovery scan in progress
    Scanning,
    /// Transport connect in progress
    Connecting,
    /// Transport is up, GATT discovery done
    Connected,
    /// Heart-rate notifications are flowing
    Subscribed,
    /// The peripheral is gone; the client may be asked to reconnect
    Disconnected,
}

impl fmt::Display for HrmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WaitingForAdapter => write!(f, "waiting for adapter"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Training session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Constructed but not started
    Idle,
    /// Samples are being collected
    Active,
    /// Collection suspended; paused time is accounted separately
    Paused,
    /// Terminal; no transition leaves this state
    Finished,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// A decoded register sample from the S4
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataPoint {
    /// Decode timestamp
    pub time: DateTime<Utc>,
    /// Register name from the static table
    pub name: &'static str,
    /// Three-hex-digit register address
    pub address: &'static str,
    /// Reply width the value was carried in
    pub width: Width,
    /// Radix-parsed integer value; no unit conversion at this layer
    pub value: u32,
}

/// A heart-rate sample from the HRM client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Arrival timestamp
    pub time: DateTime<Utc>,
    /// Heart rate in beats per minute
    pub bpm: u16,
}

/// A per-second snapshot of the training session scratchpad
///
/// Optional fields stay absent until the corresponding source has produced
/// at least one value during the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    /// Wall-clock emission timestamp
    pub timestamp: DateTime<Utc>,
    /// Whole seconds since start, paused time excluded
    pub elapsed_s: u64,
    /// Total distance in meters
    pub distance_m: Option<u32>,
    /// Strokes per minute
    pub stroke_rate: Option<u32>,
    /// Instantaneous power in watts
    pub power_w: Option<f64>,
    /// Total energy in kcal
    pub calories: Option<u32>,
    /// Heart rate in beats per minute
    pub heart_rate: Option<u16>,
    /// Instantaneous speed in meters per second
    pub speed_mps: Option<f64>,
    /// Total stroke count
    pub total_strokes: Option<u32>,
}

/// Summary statistics derived from a session's sample vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session duration in seconds, paused time excluded
    pub duration_s: u64,
    /// Final distance in meters
    pub distance_m: u32,
    /// Mean heart rate over samples that carried one
    pub avg_heart_rate: Option<f64>,
    /// Peak heart rate
    pub max_heart_rate: Option<u16>,
    /// Mean power over samples that carried one
    pub avg_power_w: Option<f64>,
    /// Peak power
    pub max_power_w: Option<f64>,
    /// Total energy in kcal
    pub total_calories: u32,
    /// Total stroke count
    pub total_strokes: u32,
    /// Number of samples in the vector
    pub sample_count: usize,
}

/// Distance units accepted by the S4 for workouts and the distance display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceUnit {
    /// Meters
    Meters,
    /// Miles
    Miles,
    /// Kilometers
    Kilometers,
    /// Strokes
    Strokes,
}

impl DistanceUnit {
    /// Unit digit used by the `WSI` distance-workout command
    #[must_use]
    pub const fn workout_code(self) -> char {
        match self {
            Self::Meters => '1',
            Self::Miles => '2',
            Self::Kilometers => '3',
            Self::Strokes => '4',
        }
    }

    /// Two-letter code used by the `DD` display command
    #[must_use]
    pub const fn display_code(self) -> &'static str {
        match self {
            Self::Meters => "ME",
            Self::Miles => "MI",
            Self::Kilometers => "KM",
            Self::Strokes => "ST",
        }
    }
}

impl fmt::Display for DistanceUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Meters => write!(f, "meters"),
            Self::Miles => write!(f, "miles"),
            Self::Kilometers => write!(f, "km"),
            Self::Strokes => write!(f, "strokes"),
        }
    }
}

/// Intensity figures the S4 front display can show
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntensityDisplay {
    /// Meters per second
    MetersPerSecond,
    /// Miles per hour
    Mph,
    /// Seconds per 500 m split
    Per500m,
    /// Seconds per 2 km split
    Per2km,
    /// Watts
    Watts,
    /// Calories per hour
    CaloriesPerHour,
}

impl IntensityDisplay {
    /// Code used by the `DD` display command
    #[must_use]
    pub const fn display_code(self) -> &'static str {
        match self {
            Self::MetersPerSecond => "MS",
            Self::Mph => "MPH",
            Self::Per500m => "500",
            Self::Per2km => "2KM",
            Self::Watts => "WA",
            Self::CaloriesPerHour => "CH",
        }
    }
}

/// Average-intensity figures the S4 front display can show
///
/// Same wire codes as [`IntensityDisplay`] minus the instantaneous-only
/// watts and cal/h figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AverageIntensityDisplay {
    /// Meters per second
    MetersPerSecond,
    /// Miles per hour
    Mph,
    /// Seconds per 500 m split
    Per500m,
    /// Seconds per 2 km split
    Per2km,
}

impl AverageIntensityDisplay {
    /// Code used by the `DD` display command
    #[must_use]
    pub const fn display_code(self) -> &'static str {
        match self {
            Self::MetersPerSecond => "MS",
            Self::Mph => "MPH",
            Self::Per500m => "500",
            Self::Per2km => "2KM",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(DriverState::Ready.to_string(), "ready");
        assert_eq!(HrmState::WaitingForAdapter.to_string(), "waiting for adapter");
        assert_eq!(SessionState::Paused.to_string(), "paused");
    }

    #[test]
    fn test_distance_unit_codes() {
        assert_eq!(DistanceUnit::Meters.workout_code(), '1');
        assert_eq!(DistanceUnit::Strokes.workout_code(), '4');
        assert_eq!(DistanceUnit::Kilometers.display_code(), "KM");
    }

    #[test]
    fn test_intensity_codes() {
        assert_eq!(IntensityDisplay::Per500m.display_code(), "500");
        assert_eq!(IntensityDisplay::CaloriesPerHour.display_code(), "CH");
        assert_eq!(AverageIntensityDisplay::Per2km.display_code(), "2KM");
    }
}
