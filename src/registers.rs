//! The S4 memory map: named registers, their addresses, reply widths and
//! payload radixes, plus the driver-owned current-value table.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::{GatewayError, Result};
use crate::protocol::{parse_value, Width};
use crate::types::DataPoint;

/// One entry of the static S4 register map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    /// Stable identifier
    pub name: &'static str,
    /// Three-hex-digit memory address
    pub address: &'static str,
    /// Reply width the register is requested and reported at
    pub width: Width,
    /// Radix the ASCII payload digits are parsed under
    pub radix: u32,
}

/// The S4 registers this crate knows how to request and decode
///
/// Addresses and widths follow the Water Rower serial-interface memory map.
/// The table is immutable; per-register current values live in
/// [`RegisterTable`].
pub const REGISTERS: &[RegisterSpec] = &[
    RegisterSpec { name: "mph", address: "1A3", width: Width::Double, radix: 10 },
    RegisterSpec { name: "stroke_rate", address: "1A9", width: Width::Single, radix: 16 },
    RegisterSpec { name: "distance", address: "057", width: Width::Double, radix: 16 },
    RegisterSpec { name: "m_s_distance_dec", address: "054", width: Width::Single, radix: 16 },
    RegisterSpec { name: "m_s_distance", address: "055", width: Width::Double, radix: 16 },
    RegisterSpec { name: "clock_down_dec", address: "05A", width: Width::Single, radix: 16 },
    RegisterSpec { name: "clock_down", address: "05B", width: Width::Double, radix: 16 },
    RegisterSpec { name: "total_dis", address: "081", width: Width::Double, radix: 16 },
    RegisterSpec { name: "kcal_watts", address: "088", width: Width::Double, radix: 16 },
    RegisterSpec { name: "total_kcal", address: "08A", width: Width::Double, radix: 16 },
    RegisterSpec { name: "tank_volume", address: "0A9", width: Width::Single, radix: 16 },
    RegisterSpec { name: "strokes_cnt", address: "140", width: Width::Double, radix: 16 },
    RegisterSpec { name: "stroke_average", address: "142", width: Width::Single, radix: 16 },
    RegisterSpec { name: "stroke_pull", address: "143", width: Width::Single, radix: 16 },
    RegisterSpec { name: "m_s_total", address: "148", width: Width::Double, radix: 16 },
    RegisterSpec { name: "m_s_average", address: "14A", width: Width::Double, radix: 16 },
    RegisterSpec { name: "display_sec", address: "1E1", width: Width::Single, radix: 10 },
    RegisterSpec { name: "display_min", address: "1E2", width: Width::Single, radix: 10 },
    RegisterSpec { name: "display_hr", address: "1E3", width: Width::Single, radix: 10 },
];

/// Look up a register by its stable name
#[must_use]
pub fn spec_by_name(name: &str) -> Option<&'static RegisterSpec> {
    REGISTERS.iter().find(|spec| spec.name == name)
}

/// Look up a register by its three-hex-digit address
#[must_use]
pub fn spec_by_address(address: &str) -> Option<&'static RegisterSpec> {
    REGISTERS
        .iter()
        .find(|spec| spec.address.eq_ignore_ascii_case(address))
}

/// Driver-owned store of the last decoded value per register
///
/// The driver's ingest path is the single writer; reads go through the
/// driver's snapshot API.
#[derive(Debug, Default)]
pub struct RegisterTable {
    values: HashMap<&'static str, u32>,
}

impl RegisterTable {
    /// Create an empty table; registers hold no value until first decode
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a datapoint reply against the register map and record it
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ParseMalformed`] for an address outside the
    /// map or digits that do not parse under the register's radix. Callers
    /// log and drop; neither case interrupts the stream.
    pub fn decode(
        &mut self,
        time: DateTime<Utc>,
        width: Width,
        address: &str,
        digits: &str,
    ) -> Result<DataPoint> {
        let spec = spec_by_address(address).ok_or_else(|| {
            GatewayError::ParseMalformed(format!("unknown register address {address}"))
        })?;

        if width != spec.width {
            return Err(GatewayError::ParseMalformed(format!(
                "register {} replied at width {width} but is declared {}",
                spec.name, spec.width
            )));
        }

        let value = parse_value(digits, spec.radix)?;
        self.values.insert(spec.name, value);

        Ok(DataPoint {
            time,
            name: spec.name,
            address: spec.address,
            width: spec.width,
            value,
        })
    }

    /// Last decoded value of one register, if it has been seen
    #[must_use]
    pub fn current(&self, name: &str) -> Option<u32> {
        self.values.get(name).copied()
    }

    /// Snapshot of the named registers that have been decoded at least once
    ///
    /// When `subset` is `None` the whole map is walked in table order.
    #[must_use]
    pub fn snapshot(&self, subset: Option<&[String]>) -> Vec<(&'static str, u32)> {
        let in_subset = |name: &str| {
            subset.map_or(true, |names| names.iter().any(|n| n == name))
        };
        REGISTERS
            .iter()
            .filter(|spec| in_subset(spec.name))
            .filter_map(|spec| self.values.get(spec.name).map(|v| (spec.name, *v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_covers_reference_poll_set() {
        for name in [
            "stroke_rate",
            "kcal_watts",
            "strokes_cnt",
            "m_s_total",
            "total_kcal",
            "m_s_average",
        ] {
            assert!(spec_by_name(name).is_some(), "missing register {name}");
        }
    }

    #[test]
    fn test_address_lookup_is_case_insensitive() {
        assert_eq!(spec_by_address("1a9").unwrap().name, "stroke_rate");
        assert_eq!(spec_by_address("1A9").unwrap().name, "stroke_rate");
    }

    #[test]
    fn test_decode_updates_current_value() {
        let mut table = RegisterTable::new();
        assert_eq!(table.current("stroke_rate"), None);

        let point = table
            .decode(Utc::now(), Width::Single, "1A9", "12")
            .unwrap();
        assert_eq!(point.name, "stroke_rate");
        assert_eq!(point.value, 18);
        assert_eq!(table.current("stroke_rate"), Some(18));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let mut table = RegisterTable::new();
        let time = Utc::now();
        let a = table.decode(time, Width::Double, "088", "00C8").unwrap();
        let b = table.decode(time, Width::Double, "088", "00C8").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.value, 200);
    }

    #[test]
    fn test_decode_unknown_address() {
        let mut table = RegisterTable::new();
        let err = table
            .decode(Utc::now(), Width::Single, "FFF", "12")
            .unwrap_err();
        assert!(matches!(err, GatewayError::ParseMalformed(_)));
    }

    #[test]
    fn test_decode_width_mismatch() {
        let mut table = RegisterTable::new();
        let err = table
            .decode(Utc::now(), Width::Double, "1A9", "0012")
            .unwrap_err();
        assert!(matches!(err, GatewayError::ParseMalformed(_)));
        assert_eq!(table.current("stroke_rate"), None);
    }

    #[test]
    fn test_decimal_register_radix() {
        let mut table = RegisterTable::new();
        let point = table
            .decode(Utc::now(), Width::Single, "1E2", "45")
            .unwrap();
        assert_eq!(point.name, "display_min");
        assert_eq!(point.value, 45);
    }

    #[test]
    fn test_snapshot_subset() {
        let mut table = RegisterTable::new();
        table
            .decode(Utc::now(), Width::Single, "1A9", "18")
            .unwrap();
        table
            .decode(Utc::now(), Width::Double, "088", "00B4")
            .unwrap();

        let all = table.snapshot(None);
        assert_eq!(all.len(), 2);

        let subset = table.snapshot(Some(&["kcal_watts".to_string()]));
        assert_eq!(subset, vec![("kcal_watts", 180)]);
    }
}
