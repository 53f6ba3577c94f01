/// Bluetooth Low Energy sessions with UART-style temperature loggers
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Uuid};
use futures_util::{pin_mut, StreamExt};
use log::{debug, info, warn};
use tokio::time::{timeout, Duration};

use super::codec::{
    decode_device_info, decode_log_payload, END_OF_DUMP, INFO_COMMAND, LOG_DUMP_COMMAND,
};
use super::{DeviceError, SensorDevice};
use crate::models::{DeviceInfo, RawSample};

// Nordic UART service used by the loggers
const UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
const UART_RX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e); // we write here
const UART_TX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e); // device notifies here

/// Silence after which a response is considered complete
const IDLE_GAP: Duration = Duration::from_millis(1500);

/// Device transport backed by the BlueZ default adapter
pub struct BluerDevice {
    adapter: Adapter,
    session_timeout: Duration,
}

impl BluerDevice {
    /// Open a Bluetooth session and power on the default adapter
    pub async fn new(session_timeout: Duration) -> Result<Self, DeviceError> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(Self {
            adapter,
            session_timeout,
        })
    }

    /// Send one command and collect the device's response, bounded by the session timeout
    async fn exchange(&self, mac_address: &str, command: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let address: Address = mac_address
            .parse()
            .map_err(|_| DeviceError::InvalidAddress(mac_address.to_string()))?;

        match timeout(self.session_timeout, self.run_session(address, command)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout),
        }
    }

    async fn run_session(&self, address: Address, command: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let device = self.find_device(address).await?;

        if !device.is_connected().await? {
            debug!("Connecting to {}", address);
            device.connect().await?;
        }

        let result = exchange_over_uart(&device, command).await;

        if let Err(e) = device.disconnect().await {
            warn!("Failed to disconnect from {}: {}", address, e);
        }

        result
    }

    /// Resolve a device handle, running discovery if BlueZ has not seen it yet
    async fn find_device(&self, address: Address) -> Result<Device, DeviceError> {
        if self.adapter.device_addresses().await?.contains(&address) {
            return Ok(self.adapter.device(address)?);
        }

        debug!("{} unknown to adapter, starting discovery", address);
        let events = self.adapter.discover_devices().await?;
        pin_mut!(events);

        while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(found) = event {
                if found == address {
                    return Ok(self.adapter.device(address)?);
                }
            }
        }

        Err(DeviceError::NotFound(address.to_string()))
    }
}

async fn uart_characteristics(
    device: &Device,
) -> Result<(Characteristic, Characteristic), DeviceError> {
    let mut rx = None;
    let mut tx = None;

    for service in device.services().await? {
        if service.uuid().await? != UART_SERVICE {
            continue;
        }
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            if uuid == UART_RX {
                rx = Some(characteristic);
            } else if uuid == UART_TX {
                tx = Some(characteristic);
            }
        }
    }

    match (rx, tx) {
        (Some(rx), Some(tx)) => Ok((rx, tx)),
        (None, _) => Err(DeviceError::MissingCharacteristic(UART_RX.to_string())),
        (_, None) => Err(DeviceError::MissingCharacteristic(UART_TX.to_string())),
    }
}

async fn exchange_over_uart(device: &Device, command: &[u8]) -> Result<Vec<u8>, DeviceError> {
    let (rx, tx) = uart_characteristics(device).await?;

    // Subscribe before writing so the first notification is not lost
    let notifications = tx.notify().await?;
    pin_mut!(notifications);
    rx.write(command).await?;

    let mut payload = Vec::new();
    loop {
        match timeout(IDLE_GAP, notifications.next()).await {
            Ok(Some(chunk)) if chunk.as_slice() == END_OF_DUMP => break,
            Ok(Some(chunk)) => payload.extend_from_slice(&chunk),
            // Stream closed or device went quiet
            Ok(None) | Err(_) => break,
        }
    }

    debug!("Received {} bytes from {}", payload.len(), device.address());
    Ok(payload)
}

#[async_trait]
impl SensorDevice for BluerDevice {
    async fn download_logs(&self, mac_address: &str) -> Result<Vec<RawSample>, DeviceError> {
        let payload = self.exchange(mac_address, LOG_DUMP_COMMAND).await?;
        decode_log_payload(&payload)
    }

    async fn read_device_info(&self, mac_address: &str) -> Result<DeviceInfo, DeviceError> {
        let payload = self.exchange(mac_address, INFO_COMMAND).await?;
        decode_device_info(&payload)
    }
}
