pub mod codec;
pub mod device;

use async_trait::async_trait;

use crate::models::{DeviceInfo, RawSample};

pub use device::BluerDevice;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),
    #[error("Device {0} not found during discovery")]
    NotFound(String),
    #[error("Device session timed out")]
    Timeout,
    #[error("Characteristic {0} not exposed by device")]
    MissingCharacteristic(String),
    #[error("Malformed device payload: {0}")]
    Decode(String),
}

/// BLE transport for temperature loggers
///
/// One call is one device session. Callers must not run sessions
/// concurrently: the radio sustains a single active connection.
#[async_trait]
pub trait SensorDevice: Send + Sync {
    /// Download the full on-device ring buffer, oldest sample first
    async fn download_logs(&self, mac_address: &str) -> Result<Vec<RawSample>, DeviceError>;

    /// Read device status (battery level)
    async fn read_device_info(&self, mac_address: &str) -> Result<DeviceInfo, DeviceError>;
}
