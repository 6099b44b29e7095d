use std::path::PathBuf;

/// S4 serial driver configuration
#[derive(Debug, Clone)]
pub struct S4Config {
    /// Serial port path; when `None` the driver enumerates USB ports and
    /// picks the first WaterRower vendor match
    pub port: Option<String>,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Register polling interval in milliseconds; 0 disables polling
    pub refresh_interval_ms: u64,
    /// Delay between the requests of one polling batch in milliseconds
    pub request_spacing_ms: u64,
    /// Register names polled on each refresh tick
    pub poll_registers: Vec<String>,
    /// Directory recordings are written to and replayed from
    pub data_dir: PathBuf,
}

impl Default for S4Config {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 19_200,
            refresh_interval_ms: 200,
            request_spacing_ms: 50,
            poll_registers: [
                "stroke_rate",
                "kcal_watts",
                "strokes_cnt",
                "m_s_total",
                "total_kcal",
                "m_s_average",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Heart-rate monitor client configuration
#[derive(Debug, Clone)]
pub struct HrmConfig {
    /// Peripheral discovery window in milliseconds
    pub scan_window_ms: u64,
    /// Deadline for one connect attempt in milliseconds
    pub connect_timeout_ms: u64,
    /// Number of connect attempts made by `reconnect` before giving up
    pub reconnect_attempts: u32,
}

impl Default for HrmConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: 10_000,
            connect_timeout_ms: 30_000,
            reconnect_attempts: 30,
        }
    }
}

/// Fitness Machine peripheral configuration
#[derive(Debug, Clone)]
pub struct FtmsConfig {
    /// Local name used in the advertisement
    pub local_name: String,
}

impl Default for FtmsConfig {
    fn default() -> Self {
        Self {
            local_name: "WaterRower".to_string(),
        }
    }
}

/// Training session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sample emission interval in milliseconds
    pub emit_interval_ms: u64,
    /// Every how many emission ticks a sample is appended to the session
    /// vector; live subscribers still see every tick
    pub keep_every_ticks: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            emit_interval_ms: 1_000,
            keep_every_ticks: 60,
        }
    }
}
