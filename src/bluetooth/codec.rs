/// Decoding of logger UART payloads
use log::warn;

use super::DeviceError;
use crate::models::{DeviceInfo, RawSample};

/// Command that makes the logger stream its whole ring buffer
pub const LOG_DUMP_COMMAND: &[u8] = b"*logall";
/// Command that makes the logger report its status text
pub const INFO_COMMAND: &[u8] = b"*info";
/// Notification marking the end of a log dump
pub const END_OF_DUMP: &[u8] = b":";
/// Marker preceding the battery percentage in the info text
const BATTERY_MARKER: &str = "Batt lvl:";
/// Raw readings are signed tenths of a degree
const TEMPERATURE_DIVISOR: f64 = 10.0;

/// Decode concatenated log dump notifications into samples
///
/// The payload is a sequence of big-endian signed 16-bit integers, one per
/// sample, in device order (oldest first). Each unit is 0.1°C.
pub fn decode_log_payload(data: &[u8]) -> Result<Vec<RawSample>, DeviceError> {
    if data.len() % 2 != 0 {
        warn!("Log payload has odd length {}", data.len());
        return Err(DeviceError::Decode(format!(
            "odd payload length {}",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| RawSample {
            temperature: i16::from_be_bytes([pair[0], pair[1]]) as f64 / TEMPERATURE_DIVISOR,
        })
        .collect())
}

/// Parse the battery level out of the info response text
///
/// The response is a set of `Key: value` lines, e.g. `Batt lvl: 87`.
pub fn decode_device_info(data: &[u8]) -> Result<DeviceInfo, DeviceError> {
    let text = String::from_utf8_lossy(data);

    let battery = text
        .lines()
        .find_map(|line| line.trim().strip_prefix(BATTERY_MARKER))
        .ok_or_else(|| DeviceError::Decode("battery level missing from info".into()))?;

    let battery_level: i32 = battery
        .trim()
        .trim_end_matches('%')
        .parse()
        .map_err(|_| DeviceError::Decode(format!("bad battery level '{}'", battery.trim())))?;

    if !(0..=100).contains(&battery_level) {
        return Err(DeviceError::Decode(format!(
            "battery level {} out of range",
            battery_level
        )));
    }

    Ok(DeviceInfo { battery_level })
}
