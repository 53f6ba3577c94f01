use std::fmt;
use std::str::FromStr;

use time::OffsetDateTime;
use uuid::Uuid;

/// Default rolling window for cumulative breach types (24 hours)
pub const DEFAULT_CUMULATIVE_WINDOW_SECS: i64 = 24 * 60 * 60;

/// A BLE temperature logger assigned to a fridge
#[derive(Debug, Clone)]
pub struct Sensor {
    pub id: Uuid,
    pub name: String,
    pub mac_address: String,
    /// Seconds between on-device samples
    pub log_interval: i64,
    /// Downloads are skipped until this moment
    pub log_delay: OffsetDateTime,
    pub is_paused: bool,
    pub is_active: bool,
    pub battery_level: Option<i32>,
    pub location_id: Option<Uuid>,
    /// Most recent per-sensor sync error code, shown next to the sensor
    pub last_sync_error: Option<String>,
}

/// One raw value pulled from the device ring buffer, oldest first
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub battery_level: i32,
}

/// A reconstructed, timestamped sample
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureLog {
    pub id: Uuid,
    pub sensor_id: Uuid,
    pub timestamp: OffsetDateTime,
    pub temperature: f64,
    /// Interval in force when this log was recorded
    pub log_interval: i64,
    /// Set once the log has been evaluated against breach rules
    pub breach_reconciled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreachType {
    HotConsecutive,
    ColdConsecutive,
    HotCumulative,
    ColdCumulative,
}

impl BreachType {
    pub const ALL: [BreachType; 4] = [
        BreachType::HotConsecutive,
        BreachType::ColdConsecutive,
        BreachType::HotCumulative,
        BreachType::ColdCumulative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BreachType::HotConsecutive => "HOT_CONSECUTIVE",
            BreachType::ColdConsecutive => "COLD_CONSECUTIVE",
            BreachType::HotCumulative => "HOT_CUMULATIVE",
            BreachType::ColdCumulative => "COLD_CUMULATIVE",
        }
    }

    pub fn is_hot(&self) -> bool {
        matches!(self, BreachType::HotConsecutive | BreachType::HotCumulative)
    }

    pub fn is_cumulative(&self) -> bool {
        matches!(self, BreachType::HotCumulative | BreachType::ColdCumulative)
    }
}

impl fmt::Display for BreachType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BreachType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BreachType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown breach type: {}", s))
    }
}

/// Threshold rule attached to a location
#[derive(Debug, Clone, PartialEq)]
pub struct BreachConfig {
    pub id: Uuid,
    pub location_id: Uuid,
    pub breach_type: BreachType,
    /// Maximum for hot types, minimum for cold types
    pub temperature_threshold: f64,
    /// Seconds a run or accumulation must reach before it counts
    pub duration_threshold: i64,
    /// Rolling accumulation window for cumulative types
    pub window: Option<i64>,
}

impl BreachConfig {
    /// Whether a temperature is on the excursion side of the threshold
    pub fn qualifies(&self, temperature: f64) -> bool {
        if self.breach_type.is_hot() {
            temperature > self.temperature_threshold
        } else {
            temperature < self.temperature_threshold
        }
    }

    pub fn cumulative_window(&self) -> i64 {
        self.window.unwrap_or(DEFAULT_CUMULATIVE_WINDOW_SECS)
    }
}

/// A detected excursion window. `end_timestamp == None` means still open.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureBreach {
    pub id: Uuid,
    pub sensor_id: Uuid,
    pub breach_type: BreachType,
    pub start_timestamp: OffsetDateTime,
    pub end_timestamp: Option<OffsetDateTime>,
    pub minimum_temperature: f64,
    pub maximum_temperature: f64,
}

impl TemperatureBreach {
    pub fn is_open(&self) -> bool {
        self.end_timestamp.is_none()
    }

    pub fn record(&mut self, temperature: f64) {
        self.minimum_temperature = self.minimum_temperature.min(temperature);
        self.maximum_temperature = self.maximum_temperature.max(temperature);
    }
}
