//! BLE Connection Module
//!
//! Async GATT operations on one peripheral: open the device, enumerate the
//! characteristics of a service, enable indications and write values.

use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{EventSender, TransportEvent};
use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

/// An opened peripheral
pub struct Link {
    pub device: BluetoothLEDevice,
    session: Option<GattSession>,
    status_token: i64,
}

impl Link {
    /// Open the device at `address` and report link loss on `events`
    pub async fn open(address: u64, events: EventSender) -> Result<Self> {
        info!("Opening Bluetooth device {:#X}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;

        // Keeps Windows from dropping the link between GATT requests
        let session = match GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await {
            Ok(session) => {
                session.SetMaintainConnection(true)?;
                Some(session)
            }
            Err(e) => {
                warn!("No GATT session, continuing without one: {}", e);
                None
            }
        };

        let handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = events.send(TransportEvent::LinkLost(
                            "device reported disconnected".to_string(),
                        ));
                    }
                }
                Ok(())
            });
        let status_token = device.ConnectionStatusChanged(&handler)?;

        Ok(Self {
            device,
            session,
            status_token,
        })
    }

    pub fn close(self) {
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        if let Some(session) = self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
    }
}

/// Characteristics of `service`, empty when the service is absent
pub async fn characteristics(
    device: &BluetoothLEDevice,
    service: Uuid,
) -> Result<Vec<GattCharacteristic>> {
    let services = device
        .GetGattServicesForUuidWithCacheModeAsync(
            protocol::to_guid(service),
            BluetoothCacheMode::Uncached,
        )?
        .await?;
    if services.Status()? != GattCommunicationStatus::Success {
        anyhow::bail!("GATT services unavailable: {:?}", services.Status()?);
    }

    let services = services.Services()?;
    if services.Size()? == 0 {
        debug!("Service {} not present", service);
        return Ok(Vec::new());
    }

    let result = services
        .GetAt(0)?
        .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
        .await?;
    if result.Status()? != GattCommunicationStatus::Success {
        anyhow::bail!("Characteristics unavailable: {:?}", result.Status()?);
    }

    let list = result.Characteristics()?;
    let mut found = Vec::with_capacity(list.Size()? as usize);
    for i in 0..list.Size()? {
        found.push(list.GetAt(i)?);
    }
    info!("Found {} characteristics", found.len());
    Ok(found)
}

/// Register the value handler for `characteristic`. Returns the handler token.
pub fn forward_indications(characteristic: &GattCharacteristic, events: EventSender) -> Result<i64> {
    let handler = TypedEventHandler::new(
        move |_: windows::core::Ref<GattCharacteristic>,
              args: windows::core::Ref<GattValueChangedEventArgs>| {
            if let Some(args) = args.as_ref() {
                let reader = DataReader::FromBuffer(&args.CharacteristicValue()?)?;
                let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                reader.ReadBytes(&mut bytes)?;
                let _ = events.send(TransportEvent::Indication(bytes));
            }
            Ok(())
        },
    );
    Ok(characteristic.ValueChanged(&handler)?)
}

/// Write the CCCD. `enable` selects indications or none.
pub async fn configure_indications(characteristic: &GattCharacteristic, enable: bool) -> Result<()> {
    let value = if enable {
        GattClientCharacteristicConfigurationDescriptorValue::Indicate
    } else {
        GattClientCharacteristicConfigurationDescriptorValue::None
    };
    let status = characteristic
        .WriteClientCharacteristicConfigurationDescriptorAsync(value)?
        .await?;
    if status != GattCommunicationStatus::Success {
        anyhow::bail!("CCCD write returned {:?}", status);
    }
    Ok(())
}

pub async fn write_value(
    characteristic: &GattCharacteristic,
    payload: &[u8],
    with_response: bool,
) -> Result<()> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(payload)?;
    let buffer = writer.DetachBuffer()?;
    let option = if with_response {
        GattWriteOption::WriteWithResponse
    } else {
        GattWriteOption::WriteWithoutResponse
    };
    let status = characteristic
        .WriteValueWithOptionAsync(&buffer, option)?
        .await?;
    if status != GattCommunicationStatus::Success {
        anyhow::bail!("write returned {:?}", status);
    }
    Ok(())
}
