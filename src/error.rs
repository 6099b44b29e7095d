use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when working with the S4 gateway core
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Serial transport errors from the S4 link
    #[error("serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// No device matching the wanted descriptor was found
    #[error("no matching device found")]
    NoDeviceFound,

    /// A wire payload could not be decoded; logged and dropped, never fatal
    #[error("malformed payload: {0}")]
    ParseMalformed(String),

    /// Bluetooth Low Energy central errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// BlueZ peripheral-role errors
    #[cfg(target_os = "linux")]
    #[error("BlueZ error: {0}")]
    Bluez(#[from] bluer::Error),

    /// No usable Bluetooth adapter on the host
    #[error("Bluetooth adapter unavailable")]
    BleAdapterUnavailable,

    /// A BLE connect attempt exceeded its deadline
    #[error("BLE connect timed out after {timeout_ms}ms")]
    BleConnectTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A required GATT service or characteristic was not offered by the peer
    #[error("BLE service or characteristic {0} not found")]
    BleServiceNotFound(Uuid),

    /// Enabling notifications on a characteristic failed
    #[error("BLE subscribe failed: {0}")]
    BleSubscribeFailed(String),

    /// A public operation was called outside its legal state
    #[error("{operation} is not legal while {state}")]
    IllegalState {
        /// The operation that was refused
        operation: &'static str,
        /// The state the component was in
        state: String,
    },

    /// The operation's owning resource was closed while it was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// Filesystem errors from recording and replay
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Recording line (de)serialisation errors
    #[error("recording format error: {0}")]
    Recording(#[from] serde_json::Error),
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Check if this error indicates a lost or unusable transport
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Serial(_)
                | Self::NoDeviceFound
                | Self::Ble(_)
                | Self::BleAdapterUnavailable
                | Self::BleConnectTimeout { .. }
        )
    }

    /// Check if this error is recoverable by retrying the operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BleConnectTimeout { .. } | Self::ParseMalformed(_) | Self::Cancelled
        )
    }

    /// Check if this error is a caller contract violation rather than a fault
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = GatewayError::NoDeviceFound;
        assert!(not_found.is_connection_error());
        assert!(!not_found.is_recoverable());
        assert!(!not_found.is_caller_error());

        let timeout = GatewayError::BleConnectTimeout { timeout_ms: 30_000 };
        assert!(timeout.is_connection_error());
        assert!(timeout.is_recoverable());

        let illegal = GatewayError::IllegalState {
            operation: "start",
            state: "active".to_string(),
        };
        assert!(!illegal.is_connection_error());
        assert!(illegal.is_caller_error());
    }

    #[test]
    fn test_error_display() {
        let error = GatewayError::IllegalState {
            operation: "pause",
            state: "idle".to_string(),
        };
        let rendered = format!("{error}");
        assert!(rendered.contains("pause"));
        assert!(rendered.contains("idle"));

        let timeout = GatewayError::BleConnectTimeout { timeout_ms: 1_500 };
        assert!(format!("{timeout}").contains("1500ms"));
    }
}
