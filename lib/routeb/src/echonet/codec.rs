//! Per-property (EPC) codecs for the low-voltage smart meter object.
//!
//! Codecs translate between EDT bytes and raw domain values. Scaling by
//! coefficient and unit happens in the façade; nothing here produces kWh.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Property codes of the smart meter object handled by this client.
pub mod epc {
    pub const OPERATION_STATUS: u8 = 0x80;
    pub const INSTALLATION_LOCATION: u8 = 0x81;
    pub const STANDARD_VERSION: u8 = 0x82;
    pub const FAULT_STATUS: u8 = 0x88;
    pub const MANUFACTURER_CODE: u8 = 0x8A;
    pub const SERIAL_NUMBER: u8 = 0x8D;
    pub const CURRENT_TIME: u8 = 0x97;
    pub const CURRENT_DATE: u8 = 0x98;
    pub const COEFFICIENT: u8 = 0xD3;
    pub const EFFECTIVE_DIGITS: u8 = 0xD7;
    pub const CUMULATIVE_ENERGY: u8 = 0xE0;
    pub const CUMULATIVE_ENERGY_UNIT: u8 = 0xE1;
    pub const CUMULATIVE_HISTORY_1: u8 = 0xE2;
    pub const CUMULATIVE_ENERGY_REVERSE: u8 = 0xE3;
    pub const CUMULATIVE_HISTORY_1_REVERSE: u8 = 0xE4;
    pub const HISTORY_1_DAY: u8 = 0xE5;
    pub const INSTANTANEOUS_POWER: u8 = 0xE7;
    pub const INSTANTANEOUS_CURRENT: u8 = 0xE8;
    pub const FIXED_TIME_ENERGY: u8 = 0xEA;
    pub const FIXED_TIME_ENERGY_REVERSE: u8 = 0xEB;
    pub const CUMULATIVE_HISTORY_2: u8 = 0xEC;
    pub const HISTORY_2_TIME: u8 = 0xED;
    pub const CUMULATIVE_HISTORY_3: u8 = 0xEE;
    pub const HISTORY_3_TIME: u8 = 0xEF;
}

/// "No measurement" sentinel for cumulative-energy registers.
pub const NO_DATA_U32: u32 = 0xFFFF_FFFE;
/// Largest valid raw value in a historical slot.
pub const MAX_SLOT_VALUE: u32 = 0xFFFF_FFFD;

/// Half-hour slot count in a one-day historical series.
pub const HISTORY_1_SLOTS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstantaneousCurrent {
    /// R-phase current in amperes.
    pub r: f64,
    /// T-phase current in amperes.
    pub t: f64,
}

/// One day of half-hour cumulative readings, raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct History1 {
    /// How many days ago the series was measured (0 = today).
    pub day: u16,
    pub values: Vec<Option<u32>>,
}

/// Cumulative reading latched at a fixed time (top of the half hour), raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTimeEnergy {
    pub at: NaiveDateTime,
    pub raw: Option<u32>,
}

/// Historical series 2/3: interleaved normal/reverse raw readings anchored
/// at a timestamp and running backwards in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySeries {
    pub at: NaiveDateTime,
    pub slots: Vec<(Option<u32>, Option<u32>)>,
}

/// Retrieval cursor for historical series 2/3 (EPC 0xED / 0xEF).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCursor {
    pub at: NaiveDateTime,
    pub count: u8,
}

#[inline]
fn ensure_len(epc: u8, edt: &[u8], len: usize) -> Result<()> {
    if edt.len() != len {
        return Err(Error::MalformedResponse { epc });
    }

    Ok(())
}

#[inline]
fn slot_value(raw: u32) -> Option<u32> {
    if raw <= MAX_SLOT_VALUE {
        Some(raw)
    } else {
        None
    }
}

pub fn decode_operation_status(edt: &[u8]) -> Result<bool> {
    ensure_len(epc::OPERATION_STATUS, edt, 1)?;

    match edt[0] {
        0x30 => Ok(true),
        0x31 => Ok(false),
        _ => Err(Error::MalformedResponse { epc: epc::OPERATION_STATUS }),
    }
}

pub fn encode_operation_status(on: bool) -> Vec<u8> {
    vec![if on { 0x30 } else { 0x31 }]
}

/// Installation location per the ECHONET Lite place-code table: bits 7..3
/// select the place, bits 2..0 the place number.
pub fn decode_installation_location(edt: &[u8]) -> Result<String> {
    ensure_len(epc::INSTALLATION_LOCATION, edt, 1)?;

    let byte = edt[0];

    if byte == 0x00 {
        return Ok("not specified".to_string());
    }

    let place = (byte >> 3) & 0x1F;
    let number = byte & 0x07;

    let name = match place {
        1 => "living room",
        2 => "dining room",
        3 => "kitchen",
        4 => "bathroom",
        5 => "lavatory",
        6 => "washroom",
        7 => "passageway",
        8 => "room",
        9 => "stairway",
        10 => "front door",
        11 => "storeroom",
        12 => "garden",
        13 => "garage",
        14 => "balcony",
        15 => "others",
        _ => return Ok(format!("location {:#04X}", byte)),
    };

    Ok(format!("{} {}", name, number))
}

/// Standard version information: the third byte carries the release order
/// as an ASCII letter.
pub fn decode_standard_version(edt: &[u8]) -> Result<String> {
    ensure_len(epc::STANDARD_VERSION, edt, 4)?;

    Ok((edt[2] as char).to_string())
}

pub fn decode_fault_status(edt: &[u8]) -> Result<bool> {
    ensure_len(epc::FAULT_STATUS, edt, 1)?;

    match edt[0] {
        0x41 => Ok(true),
        0x42 => Ok(false),
        _ => Err(Error::MalformedResponse { epc: epc::FAULT_STATUS }),
    }
}

pub fn decode_manufacturer_code(edt: &[u8]) -> Result<[u8; 3]> {
    ensure_len(epc::MANUFACTURER_CODE, edt, 3)?;

    Ok([edt[0], edt[1], edt[2]])
}

pub fn decode_serial_number(edt: &[u8]) -> Result<String> {
    if edt.is_empty() {
        return Err(Error::MalformedResponse { epc: epc::SERIAL_NUMBER });
    }

    Ok(String::from_utf8_lossy(edt)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string())
}

pub fn decode_current_time(edt: &[u8]) -> Result<NaiveTime> {
    ensure_len(epc::CURRENT_TIME, edt, 2)?;

    NaiveTime::from_hms_opt(edt[0] as u32, edt[1] as u32, 0)
        .ok_or(Error::MalformedResponse { epc: epc::CURRENT_TIME })
}

pub fn decode_current_date(edt: &[u8]) -> Result<NaiveDate> {
    ensure_len(epc::CURRENT_DATE, edt, 4)?;

    let year = BigEndian::read_u16(&edt[0..2]) as i32;

    NaiveDate::from_ymd_opt(year, edt[2] as u32, edt[3] as u32)
        .ok_or(Error::MalformedResponse { epc: epc::CURRENT_DATE })
}

pub fn decode_coefficient(edt: &[u8]) -> Result<u32> {
    ensure_len(epc::COEFFICIENT, edt, 4)?;

    Ok(BigEndian::read_u32(edt))
}

pub fn decode_effective_digits(edt: &[u8]) -> Result<u8> {
    ensure_len(epc::EFFECTIVE_DIGITS, edt, 1)?;

    Ok(edt[0])
}

/// Cumulative energy register, raw. The sentinel decodes to `None`.
pub fn decode_cumulative_energy(which: u8, edt: &[u8]) -> Result<Option<u32>> {
    ensure_len(which, edt, 4)?;

    let raw = BigEndian::read_u32(edt);

    if raw == NO_DATA_U32 {
        return Ok(None);
    }

    Ok(Some(raw))
}

/// Unit for cumulative energy, as a multiplier onto the raw register.
pub fn decode_unit_multiplier(edt: &[u8]) -> Result<f64> {
    ensure_len(epc::CUMULATIVE_ENERGY_UNIT, edt, 1)?;

    let multiplier = match edt[0] {
        0x00 => 1.0,
        0x01 => 0.1,
        0x02 => 0.01,
        0x03 => 0.001,
        0x04 => 0.0001,
        0x0A => 10.0,
        0x0B => 100.0,
        0x0C => 1000.0,
        0x0D => 10000.0,
        _ => return Err(Error::MalformedResponse { epc: epc::CUMULATIVE_ENERGY_UNIT }),
    };

    Ok(multiplier)
}

/// One-day historical series: day offset (u16) followed by 48 half-hour
/// slots of raw u32.
pub fn decode_history_1(which: u8, edt: &[u8]) -> Result<History1> {
    ensure_len(which, edt, 2 + HISTORY_1_SLOTS * 4)?;

    let day = BigEndian::read_u16(&edt[0..2]);

    let values = edt[2..]
        .chunks(4)
        .map(|chunk| slot_value(BigEndian::read_u32(chunk)))
        .collect();

    Ok(History1 { day, values })
}

pub fn encode_history_1_day(day: u8) -> Vec<u8> {
    vec![day]
}

pub fn decode_history_1_day(edt: &[u8]) -> Result<u8> {
    ensure_len(epc::HISTORY_1_DAY, edt, 1)?;

    Ok(edt[0])
}

pub fn decode_instantaneous_power(edt: &[u8]) -> Result<i32> {
    ensure_len(epc::INSTANTANEOUS_POWER, edt, 4)?;

    Ok(BigEndian::read_i32(edt))
}

/// Instantaneous current: two signed 16-bit deciampere channels.
pub fn decode_instantaneous_current(edt: &[u8]) -> Result<InstantaneousCurrent> {
    ensure_len(epc::INSTANTANEOUS_CURRENT, edt, 4)?;

    let r = BigEndian::read_i16(&edt[0..2]);
    let t = BigEndian::read_i16(&edt[2..4]);

    Ok(InstantaneousCurrent {
        r: f64::from(r) * 0.1,
        t: f64::from(t) * 0.1,
    })
}

/// Fixed-time cumulative reading: 7-byte timestamp plus the raw register.
pub fn decode_fixed_time_energy(which: u8, edt: &[u8]) -> Result<FixedTimeEnergy> {
    ensure_len(which, edt, 11)?;

    let at = read_timestamp(which, &edt[0..7])?;
    let raw = BigEndian::read_u32(&edt[7..11]);

    Ok(FixedTimeEnergy {
        at,
        raw: if raw == NO_DATA_U32 { None } else { Some(raw) },
    })
}

/// Historical series 2/3: anchor timestamp, slot count, then per slot a
/// normal/reverse pair of raw registers.
pub fn decode_history_series(which: u8, edt: &[u8]) -> Result<HistorySeries> {
    if edt.len() < 8 {
        return Err(Error::MalformedResponse { epc: which });
    }

    let at = read_timestamp(which, &edt[0..7])?;
    let count = edt[7] as usize;

    if edt.len() != 8 + count * 8 {
        return Err(Error::MalformedResponse { epc: which });
    }

    let slots = edt[8..]
        .chunks(8)
        .map(|chunk| {
            let normal = slot_value(BigEndian::read_u32(&chunk[0..4]));
            let reverse = slot_value(BigEndian::read_u32(&chunk[4..8]));
            (normal, reverse)
        })
        .collect();

    Ok(HistorySeries { at, slots })
}

/// Retrieval cursor for historical series 2/3: timestamp plus slot count.
pub fn encode_history_cursor(cursor: &HistoryCursor) -> Vec<u8> {
    let mut edt = Vec::with_capacity(8);
    write_timestamp(&mut edt, &cursor.at);
    edt.push(cursor.count);
    edt
}

pub fn decode_history_cursor(which: u8, edt: &[u8]) -> Result<HistoryCursor> {
    ensure_len(which, edt, 8)?;

    Ok(HistoryCursor {
        at: read_timestamp(which, &edt[0..7])?,
        count: edt[7],
    })
}

fn read_timestamp(which: u8, bytes: &[u8]) -> Result<NaiveDateTime> {
    let year = BigEndian::read_u16(&bytes[0..2]) as i32;

    NaiveDate::from_ymd_opt(year, bytes[2] as u32, bytes[3] as u32)
        .and_then(|date| {
            date.and_hms_opt(bytes[4] as u32, bytes[5] as u32, bytes[6] as u32)
        })
        .ok_or(Error::MalformedResponse { epc: which })
}

fn write_timestamp(edt: &mut Vec<u8>, at: &NaiveDateTime) {
    use chrono::{Datelike, Timelike};

    let year = at.year() as u16;
    edt.push((year >> 8) as u8);
    edt.push(year as u8);
    edt.push(at.month() as u8);
    edt.push(at.day() as u8);
    edt.push(at.hour() as u8);
    edt.push(at.minute() as u8);
    edt.push(at.second() as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_status_roundtrip() {
        assert_eq!(decode_operation_status(&encode_operation_status(true)).unwrap(), true);
        assert_eq!(decode_operation_status(&encode_operation_status(false)).unwrap(), false);
        assert!(decode_operation_status(&[0x42]).is_err());
    }

    #[test]
    fn test_installation_location_names() {
        assert_eq!(decode_installation_location(&[0x00]).unwrap(), "not specified");
        assert_eq!(decode_installation_location(&[0x08 | 0x01]).unwrap(), "living room 1");
        assert_eq!(decode_installation_location(&[0x18 | 0x02]).unwrap(), "kitchen 2");
    }

    #[test]
    fn test_standard_version_release_letter() {
        assert_eq!(decode_standard_version(&[0x00, 0x00, b'E', 0x00]).unwrap(), "E");
    }

    #[test]
    fn test_current_date_and_time() {
        assert_eq!(
            decode_current_date(&[0x07, 0xE8, 0x05, 0x01]).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
        assert_eq!(
            decode_current_time(&[0x0C, 0x1E]).unwrap(),
            NaiveTime::from_hms_opt(12, 30, 0).unwrap()
        );
        assert!(decode_current_time(&[0x19, 0x00]).is_err());
    }

    #[test]
    fn test_cumulative_energy_sentinel() {
        assert_eq!(
            decode_cumulative_energy(epc::CUMULATIVE_ENERGY, &[0x00, 0x01, 0x86, 0xA0]).unwrap(),
            Some(100_000)
        );
        assert_eq!(
            decode_cumulative_energy(epc::CUMULATIVE_ENERGY, &[0xFF, 0xFF, 0xFF, 0xFE]).unwrap(),
            None
        );
    }

    #[test]
    fn test_unit_multiplier_table() {
        let table = [
            (0x00, 1.0),
            (0x01, 0.1),
            (0x02, 0.01),
            (0x03, 0.001),
            (0x04, 0.0001),
            (0x0A, 10.0),
            (0x0B, 100.0),
            (0x0C, 1000.0),
            (0x0D, 10000.0),
        ];

        for (code, expected) in table.iter() {
            assert_eq!(decode_unit_multiplier(&[*code]).unwrap(), *expected);
        }

        assert!(decode_unit_multiplier(&[0x05]).is_err());
    }

    #[test]
    fn test_history_1_with_sentinel_slots() {
        let mut edt = vec![0x00, 0x03];
        for index in 0..HISTORY_1_SLOTS {
            let raw: u32 = if index % 2 == 0 { index as u32 } else { 0xFFFF_FFFE };
            edt.extend_from_slice(&raw.to_be_bytes());
        }

        let history = decode_history_1(epc::CUMULATIVE_HISTORY_1, &edt).unwrap();

        assert_eq!(history.day, 3);
        assert_eq!(history.values.len(), HISTORY_1_SLOTS);
        assert_eq!(history.values[0], Some(0));
        assert_eq!(history.values[1], None);
        assert_eq!(history.values[2], Some(2));
    }

    #[test]
    fn test_history_1_all_sentinels_decode_to_none() {
        let mut edt = vec![0x00, 0x00];
        for _ in 0..HISTORY_1_SLOTS {
            edt.extend_from_slice(&0xFFFF_FFFEu32.to_be_bytes());
        }

        let history = decode_history_1(epc::CUMULATIVE_HISTORY_1, &edt).unwrap();

        assert!(history.values.iter().all(Option::is_none));
    }

    #[test]
    fn test_history_1_rejects_short_payload() {
        assert!(decode_history_1(epc::CUMULATIVE_HISTORY_1, &[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_instantaneous_power() {
        assert_eq!(
            decode_instantaneous_power(&[0x00, 0x00, 0x01, 0xF4]).unwrap(),
            500
        );
        assert_eq!(
            decode_instantaneous_power(&[0xFF, 0xFF, 0xFE, 0x0C]).unwrap(),
            -500
        );
    }

    #[test]
    fn test_instantaneous_current_deciamps() {
        let current = decode_instantaneous_current(&[0x00, 0x6F, 0xFF, 0x9C]).unwrap();

        assert!((current.r - 11.1).abs() < 1e-9);
        assert!((current.t + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_time_energy() {
        let edt = [0x07, 0xE8, 0x05, 0x01, 0x0C, 0x00, 0x00, 0x00, 0x01, 0x86, 0xA0];

        let fixed = decode_fixed_time_energy(epc::FIXED_TIME_ENERGY, &edt).unwrap();

        assert_eq!(
            fixed.at,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(12, 0, 0).unwrap()
        );
        assert_eq!(fixed.raw, Some(100_000));
    }

    #[test]
    fn test_history_cursor_roundtrip() {
        let cursor = HistoryCursor {
            at: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(12, 0, 0).unwrap(),
            count: 6,
        };

        let edt = encode_history_cursor(&cursor);

        assert_eq!(edt, vec![0x07, 0xE8, 0x05, 0x01, 0x0C, 0x00, 0x00, 0x06]);
        assert_eq!(decode_history_cursor(epc::HISTORY_2_TIME, &edt).unwrap(), cursor);
    }

    #[test]
    fn test_history_series_interleaving() {
        let mut edt = vec![0x07, 0xE8, 0x05, 0x01, 0x0C, 0x00, 0x00, 0x02];
        edt.extend_from_slice(&100u32.to_be_bytes());
        edt.extend_from_slice(&1u32.to_be_bytes());
        edt.extend_from_slice(&0xFFFF_FFFEu32.to_be_bytes());
        edt.extend_from_slice(&2u32.to_be_bytes());

        let series = decode_history_series(epc::CUMULATIVE_HISTORY_2, &edt).unwrap();

        assert_eq!(series.slots.len(), 2);
        assert_eq!(series.slots[0], (Some(100), Some(1)));
        assert_eq!(series.slots[1], (None, Some(2)));
    }

    #[test]
    fn test_history_series_rejects_count_mismatch() {
        let mut edt = vec![0x07, 0xE8, 0x05, 0x01, 0x0C, 0x00, 0x00, 0x03];
        edt.extend_from_slice(&[0u8; 16]);

        assert!(decode_history_series(epc::CUMULATIVE_HISTORY_2, &edt).is_err());
    }
}
