//! FIT activity encoding for the finished session.
//!
//! The session hands over its summary and minute-resolution sample vector;
//! everything unit-shaped happens here at the boundary: meters become
//! centimeters, m/s becomes mm/s, kcal round to whole calories, stroke
//! rate maps onto cadence one-to-one. Timestamps count seconds from the
//! FIT epoch, 1989-12-31T00:00:00Z.

use chrono::{DateTime, Utc};

use crate::types::{SessionSummary, TrainingSample};

/// Seconds between the Unix epoch and the FIT epoch (1989-12-31T00:00:00Z)
pub const FIT_EPOCH_OFFSET: i64 = 631_065_600;

const HEADER_SIZE: u8 = 14;
const PROTOCOL_VERSION: u8 = 0x20;
const PROFILE_VERSION: u16 = 2100;

/// Sport number for rowing in the FIT profile
const SPORT_ROWING: u8 = 15;

mod message {
    pub const FILE_ID: u16 = 0;
    pub const RECORD: u16 = 20;
    pub const SESSION: u16 = 18;
    pub const ACTIVITY: u16 = 34;
}

mod base_type {
    pub const ENUM: u8 = 0x00;
    pub const UINT8: u8 = 0x02;
    pub const UINT16: u8 = 0x84;
    pub const UINT32: u8 = 0x86;
}

/// Convert a wall-clock time to a FIT timestamp
#[must_use]
pub fn fit_timestamp(time: DateTime<Utc>) -> u32 {
    u32::try_from(time.timestamp() - FIT_EPOCH_OFFSET).unwrap_or(0)
}

/// Distance boundary conversion: meters to centimeters
#[must_use]
pub const fn distance_to_cm(meters: u32) -> u32 {
    meters * 100
}

/// Speed boundary conversion: m/s to mm/s
#[must_use]
pub fn speed_to_mm_s(meters_per_second: f64) -> u16 {
    let mm_s = (meters_per_second * 1_000.0).round();
    if mm_s < 0.0 {
        0
    } else if mm_s > f64::from(u16::MAX) {
        u16::MAX
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            mm_s as u16
        }
    }
}

/// Power boundary conversion: watts rounded to the wire integer
#[must_use]
pub fn power_to_watts(power: f64) -> u16 {
    let watts = power.round();
    if watts < 0.0 {
        0
    } else if watts > f64::from(u16::MAX) {
        u16::MAX
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            watts as u16
        }
    }
}

/// Cadence boundary conversion: stroke rate carries over one-to-one
#[must_use]
pub fn stroke_rate_to_cadence(stroke_rate: u32) -> u8 {
    u8::try_from(stroke_rate).unwrap_or(u8::MAX)
}

fn round_to_u8(value: f64) -> u8 {
    let rounded = value.round();
    if rounded < 0.0 {
        0
    } else if rounded > f64::from(u8::MAX) {
        u8::MAX
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            rounded as u8
        }
    }
}

struct FitWriter {
    buffer: Vec<u8>,
}

impl FitWriter {
    fn new() -> Self {
        let mut buffer = Vec::with_capacity(1_024);
        buffer.push(HEADER_SIZE);
        buffer.push(PROTOCOL_VERSION);
        buffer.extend_from_slice(&PROFILE_VERSION.to_le_bytes());
        buffer.extend_from_slice(&0u32.to_le_bytes()); // data size, patched later
        buffer.extend_from_slice(b".FIT");
        let header_crc = crc16(&buffer[0..12]);
        buffer.extend_from_slice(&header_crc.to_le_bytes());
        Self { buffer }
    }

    /// Definition message: bit 6 set in the record header
    fn definition(&mut self, local: u8, global: u16, fields: &[(u8, u8, u8)]) {
        self.buffer.push(0x40 | (local & 0x0F));
        self.buffer.push(0); // reserved
        self.buffer.push(0); // little endian
        self.buffer.extend_from_slice(&global.to_le_bytes());
        self.buffer.push(fields.len() as u8);
        for (number, size, base) in fields {
            self.buffer.push(*number);
            self.buffer.push(*size);
            self.buffer.push(*base);
        }
    }

    fn data_header(&mut self, local: u8) {
        self.buffer.push(local & 0x0F);
    }

    fn u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    fn finalize(mut self) -> Vec<u8> {
        let data_size = (self.buffer.len() - usize::from(HEADER_SIZE)) as u32;
        self.buffer[4..8].copy_from_slice(&data_size.to_le_bytes());
        let crc = crc16(&self.buffer);
        self.buffer.extend_from_slice(&crc.to_le_bytes());
        self.buffer
    }
}

/// FIT CRC-16, nibble table algorithm from the SDK
fn crc16(data: &[u8]) -> u16 {
    const TABLE: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];

    let mut crc: u16 = 0;
    for byte in data {
        let tmp = TABLE[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ TABLE[(*byte & 0xF) as usize];

        let tmp = TABLE[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ TABLE[((*byte >> 4) & 0xF) as usize];
    }
    crc
}

/// Encode a finished session as a FIT activity file
///
/// One record message per training sample, then a session and an activity
/// message built from the summary. An empty sample vector still produces a
/// structurally valid file.
#[must_use]
pub fn encode_activity(
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    summary: &SessionSummary,
    samples: &[TrainingSample],
) -> Vec<u8> {
    let mut writer = FitWriter::new();

    // file id (local 0)
    writer.definition(
        0,
        message::FILE_ID,
        &[
            (0, 1, base_type::ENUM),   // type
            (1, 2, base_type::UINT16), // manufacturer
            (4, 4, base_type::UINT32), // time_created
        ],
    );
    writer.data_header(0);
    writer.u8(4); // activity file
    writer.u16(255); // development manufacturer
    writer.u32(fit_timestamp(start_time));

    // records (local 1)
    writer.definition(
        1,
        message::RECORD,
        &[
            (253, 4, base_type::UINT32), // timestamp
            (5, 4, base_type::UINT32),   // distance, cm
            (6, 2, base_type::UINT16),   // speed, mm/s
            (7, 2, base_type::UINT16),   // power, W
            (3, 1, base_type::UINT8),    // heart rate, bpm
            (4, 1, base_type::UINT8),    // cadence
        ],
    );
    for sample in samples {
        writer.data_header(1);
        writer.u32(fit_timestamp(sample.timestamp));
        writer.u32(distance_to_cm(sample.distance_m.unwrap_or(0)));
        writer.u16(sample.speed_mps.map_or(0, speed_to_mm_s));
        writer.u16(sample.power_w.map_or(0, power_to_watts));
        writer.u8(u8::try_from(sample.heart_rate.unwrap_or(0)).unwrap_or(u8::MAX));
        writer.u8(sample.stroke_rate.map_or(0, stroke_rate_to_cadence));
    }

    // session (local 2)
    writer.definition(
        2,
        message::SESSION,
        &[
            (253, 4, base_type::UINT32), // timestamp
            (2, 4, base_type::UINT32),   // start_time
            (7, 4, base_type::UINT32),   // total_elapsed_time, ms
            (9, 4, base_type::UINT32),   // total_distance, cm
            (10, 4, base_type::UINT32),  // total_cycles (strokes)
            (11, 2, base_type::UINT16),  // total_calories
            (20, 2, base_type::UINT16),  // avg_power
            (21, 2, base_type::UINT16),  // max_power
            (16, 1, base_type::UINT8),   // avg_heart_rate
            (17, 1, base_type::UINT8),   // max_heart_rate
            (5, 1, base_type::ENUM),     // sport
        ],
    );
    writer.data_header(2);
    writer.u32(fit_timestamp(end_time));
    writer.u32(fit_timestamp(start_time));
    writer.u32(u32::try_from(summary.duration_s.saturating_mul(1_000)).unwrap_or(u32::MAX));
    writer.u32(distance_to_cm(summary.distance_m));
    writer.u32(summary.total_strokes);
    writer.u16(u16::try_from(summary.total_calories).unwrap_or(u16::MAX));
    writer.u16(summary.avg_power_w.map_or(0, power_to_watts));
    writer.u16(summary.max_power_w.map_or(0, power_to_watts));
    writer.u8(summary.avg_heart_rate.map_or(0, round_to_u8));
    writer.u8(summary
        .max_heart_rate
        .map_or(0, |hr| u8::try_from(hr).unwrap_or(u8::MAX)));
    writer.u8(SPORT_ROWING);

    // activity (local 3)
    writer.definition(
        3,
        message::ACTIVITY,
        &[
            (253, 4, base_type::UINT32), // timestamp
            (1, 2, base_type::UINT16),   // num_sessions
            (2, 1, base_type::ENUM),     // type: manual
        ],
    );
    writer.data_header(3);
    writer.u32(fit_timestamp(end_time));
    writer.u16(1);
    writer.u8(0);

    writer.finalize()
}
