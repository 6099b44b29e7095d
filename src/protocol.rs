//! S4 serial wire protocol: frame classification and command construction.
//!
//! The S4 speaks CR/LF-terminated ASCII both ways. Replies form a small
//! closed family: a hardware-type handshake answer, register value
//! frames, high-frequency stroke pulses, and a tail of frames this crate
//! carries opaquely. Classification is pure: no I/O, no state, and a line
//! that does not parse is `Other`, never an error.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GatewayError, Result};

/// Line terminator for every command sent to the S4
pub const LINE_ENDING: &str = "\r\n";

/// Prefix of the hardware-type reply to the streaming handshake
pub const HARDWARE_TYPE_PREFIX: &str = "_WR_";

/// Baud rate of the S4 USB CDC ACM interface
pub const BAUD_RATE: u32 = 19_200;

/// Width of a register reply payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Width {
    /// One byte, two hex digits (`S` tag)
    Single,
    /// Two bytes, four hex digits (`D` tag)
    Double,
    /// Three bytes, six hex digits (`T` tag)
    Triple,
}

impl Width {
    /// Wire tag selecting this width in `IR` requests and `ID` replies
    #[must_use]
    pub const fn tag(self) -> char {
        match self {
            Self::Single => 'S',
            Self::Double => 'D',
            Self::Triple => 'T',
        }
    }

    /// Number of payload hex digits carried at this width
    #[must_use]
    pub const fn hex_digits(self) -> usize {
        match self {
            Self::Single => 2,
            Self::Double => 4,
            Self::Triple => 6,
        }
    }

    /// Number of bytes carried at this width
    #[must_use]
    pub const fn byte_count(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Double => 2,
            Self::Triple => 3,
        }
    }

    /// Map a wire tag back to its width
    #[must_use]
    pub const fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'S' => Some(Self::Single),
            'D' => Some(Self::Double),
            'T' => Some(Self::Triple),
            _ => None,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Coarse classification of one inbound serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Register value reply
    Datapoint,
    /// "I am alive" answer to the streaming handshake
    HardwareType,
    /// Stroke pulse notification; never recorded
    Pulse,
    /// Anything else; kept for logging and replay fidelity
    Other,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datapoint => write!(f, "datapoint"),
            Self::HardwareType => write!(f, "hardwaretype"),
            Self::Pulse => write!(f, "pulse"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A classified inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Hardware-type handshake reply; the payload after `_WR_` is opaque
    HardwareType {
        /// Raw payload after the prefix
        model: String,
    },
    /// Register value reply `ID{S|D|T}{addr}{digits}`
    Datapoint {
        /// Payload width selected by the tag
        width: Width,
        /// Three-hex-digit register address, as sent
        address: String,
        /// Raw value digits; radix interpretation belongs to the register
        digits: String,
    },
    /// Stroke pulse `P{n}`
    Pulse,
    /// Unrecognised or truncated line
    Other,
}

impl Frame {
    /// Kind of this frame
    #[must_use]
    pub const fn kind(&self) -> FrameKind {
        match self {
            Self::HardwareType { .. } => FrameKind::HardwareType,
            Self::Datapoint { .. } => FrameKind::Datapoint,
            Self::Pulse => FrameKind::Pulse,
            Self::Other => FrameKind::Other,
        }
    }
}

/// A raw timestamped read, the unit of the `reads$` stream and of recordings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRead {
    /// Arrival time as epoch milliseconds
    pub time: i64,
    /// Frame classification
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// The line as received, without its CR/LF terminator
    pub data: String,
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Classify one inbound line (without its CR/LF terminator)
///
/// Invalid or truncated lines classify as [`Frame::Other`]; this function
/// never fails.
#[must_use]
pub fn classify(line: &str) -> Frame {
    if let Some(model) = line.strip_prefix(HARDWARE_TYPE_PREFIX) {
        return Frame::HardwareType {
            model: model.to_string(),
        };
    }

    if let Some(rest) = line.strip_prefix("ID") {
        let mut chars = rest.chars();
        let Some(width) = chars.next().and_then(Width::from_tag) else {
            return Frame::Other;
        };
        let body = &rest[1..];
        if !body.is_ascii() || body.len() != 3 + width.hex_digits() {
            return Frame::Other;
        }
        let (address, digits) = body.split_at(3);
        if !is_hex(address) || !is_hex(digits) {
            return Frame::Other;
        }
        return Frame::Datapoint {
            width,
            address: address.to_string(),
            digits: digits.to_string(),
        };
    }

    if let Some(rest) = line.strip_prefix('P') {
        if is_hex(rest) {
            return Frame::Pulse;
        }
    }

    Frame::Other
}

/// Synthesise the wire line for a datapoint frame
///
/// The inverse of [`classify`] for the datapoint family; used by the driver
/// tests and by anything that needs canned S4 traffic.
#[must_use]
pub fn encode_datapoint(width: Width, address: &str, value: u32) -> String {
    format!(
        "ID{}{}{:0digits$X}",
        width.tag(),
        address,
        value,
        digits = width.hex_digits()
    )
}

/// Parse the value digits of a datapoint reply under a register's radix
///
/// # Errors
///
/// Returns [`GatewayError::ParseMalformed`] if the digits are not valid in
/// the given radix, such as a decimal register replying `1A` for instance.
pub fn parse_value(digits: &str, radix: u32) -> Result<u32> {
    u32::from_str_radix(digits, radix)
        .map_err(|e| GatewayError::ParseMalformed(format!("value digits {digits:?}: {e}")))
}

/// Commands sent to the S4, CR/LF-terminated ASCII
pub mod command {
    use crate::types::{AverageIntensityDisplay, DistanceUnit, IntensityDisplay};

    use super::{Width, LINE_ENDING};

    /// Request the S4 to begin streaming; doubles as the handshake
    #[must_use]
    pub fn start_streaming() -> String {
        format!("USB{LINE_ENDING}")
    }

    /// Request the S4 to stop streaming
    #[must_use]
    pub fn stop_streaming() -> String {
        format!("EXIT{LINE_ENDING}")
    }

    /// Reset the performance monitor
    #[must_use]
    pub fn reset() -> String {
        format!("RESET{LINE_ENDING}")
    }

    /// Request one register read at the given width
    #[must_use]
    pub fn read_register(width: Width, address: &str) -> String {
        format!("IR{}{address}{LINE_ENDING}", width.tag())
    }

    /// Programme a distance workout; the value is 4-digit uppercase hex
    #[must_use]
    pub fn define_distance_workout(unit: DistanceUnit, amount: u16) -> String {
        format!("WSI{}{amount:04X}{LINE_ENDING}", unit.workout_code())
    }

    /// Programme a duration workout in seconds
    #[must_use]
    pub fn define_duration_workout(seconds: u16) -> String {
        format!("WSU{seconds:04X}{LINE_ENDING}")
    }

    /// Switch the front display's distance figure
    #[must_use]
    pub fn display_set_distance(unit: DistanceUnit) -> String {
        format!("DD{}{LINE_ENDING}", unit.display_code())
    }

    /// Switch the front display's intensity figure
    #[must_use]
    pub fn display_set_intensity(figure: IntensityDisplay) -> String {
        format!("DD{}{LINE_ENDING}", figure.display_code())
    }

    /// Switch the front display's average-intensity figure
    #[must_use]
    pub fn display_set_average_intensity(figure: AverageIntensityDisplay) -> String {
        format!("DD{}{LINE_ENDING}", figure.display_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_hardware_type() {
        let frame = classify("_WR_S4.2");
        assert_eq!(
            frame,
            Frame::HardwareType {
                model: "S4.2".to_string()
            }
        );
        assert_eq!(frame.kind(), FrameKind::HardwareType);
    }

    #[test]
    fn test_classify_single_datapoint() {
        // stroke_rate register, value 0x12
        let frame = classify("IDS1A912");
        assert_eq!(
            frame,
            Frame::Datapoint {
                width: Width::Single,
                address: "1A9".to_string(),
                digits: "12".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_double_datapoint() {
        // kcal_watts register, value 0x00C8
        let frame = classify("IDD08800C8");
        assert_eq!(
            frame,
            Frame::Datapoint {
                width: Width::Double,
                address: "088".to_string(),
                digits: "00C8".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_triple_datapoint() {
        let frame = classify("IDT057000123");
        assert_eq!(
            frame,
            Frame::Datapoint {
                width: Width::Triple,
                address: "057".to_string(),
                digits: "000123".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_pulse() {
        assert_eq!(classify("P05"), Frame::Pulse);
        assert_eq!(classify("P1F"), Frame::Pulse);
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(classify(""), Frame::Other);
        assert_eq!(classify("OK"), Frame::Other);
        assert_eq!(classify("PING!"), Frame::Other);
        assert_eq!(classify("ERROR"), Frame::Other);
        // wrong payload length for the S tag
        assert_eq!(classify("IDS1A9123"), Frame::Other);
        // truncated: address only
        assert_eq!(classify("IDD088"), Frame::Other);
        // unknown width tag
        assert_eq!(classify("IDX1A912"), Frame::Other);
        // non-hex address
        assert_eq!(classify("IDS1GZ12"), Frame::Other);
    }

    #[test]
    fn test_parse_value_radix() {
        assert_eq!(parse_value("12", 16).unwrap(), 18);
        assert_eq!(parse_value("12", 10).unwrap(), 12);
        assert_eq!(parse_value("00C8", 16).unwrap(), 200);
        assert!(parse_value("1A", 10).is_err());
    }

    #[test]
    fn test_encode_datapoint_padding() {
        assert_eq!(encode_datapoint(Width::Single, "1A9", 0x12), "IDS1A912");
        assert_eq!(encode_datapoint(Width::Double, "088", 200), "IDD08800C8");
        assert_eq!(encode_datapoint(Width::Triple, "057", 1), "IDT057000001");
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(command::start_streaming(), "USB\r\n");
        assert_eq!(command::stop_streaming(), "EXIT\r\n");
        assert_eq!(command::reset(), "RESET\r\n");
        assert_eq!(command::read_register(Width::Single, "1A9"), "IRS1A9\r\n");
        assert_eq!(command::read_register(Width::Double, "088"), "IRD088\r\n");
    }

    #[test]
    fn test_workout_commands() {
        use crate::types::DistanceUnit;

        assert_eq!(
            command::define_distance_workout(DistanceUnit::Meters, 2000),
            "WSI107D0\r\n"
        );
        assert_eq!(command::define_duration_workout(1200), "WSU04B0\r\n");
    }

    #[test]
    fn test_display_commands() {
        use crate::types::{AverageIntensityDisplay, DistanceUnit, IntensityDisplay};

        assert_eq!(
            command::display_set_distance(DistanceUnit::Meters),
            "DDME\r\n"
        );
        assert_eq!(
            command::display_set_intensity(IntensityDisplay::Watts),
            "DDWA\r\n"
        );
        assert_eq!(
            command::display_set_average_intensity(AverageIntensityDisplay::Per500m),
            "DD500\r\n"
        );
    }

    #[test]
    fn test_raw_read_wire_format() {
        let read = RawRead {
            time: 1_700_000_000_123,
            kind: FrameKind::Datapoint,
            data: "IDS1A912".to_string(),
        };
        let json = serde_json::to_string(&read).unwrap();
        assert_eq!(
            json,
            r#"{"time":1700000000123,"type":"datapoint","data":"IDS1A912"}"#
        );

        let back: RawRead = serde_json::from_str(&json).unwrap();
        assert_eq!(back, read);
    }
}
